//! Agent roster — personas, registry, and the runner seam.
//!
//! The engine coordinates a fixed troupe of software-delivery personas:
//! analyst, pm, architect, developer, qa, and orchestrator. Each ships
//! with a built-in persona prompt; projects can override any of them
//! with YAML definitions:
//!
//! ```yaml
//! id: "developer"
//! name: "James"
//! title: "Full Stack Developer"
//! icon: "💻"
//! persona: |
//!   ## Developer
//!   Implement exactly what the story asks for...
//! principles:
//!   - "Keep changes minimal"
//! ```
//!
//! How agent output is actually produced is behind [`AgentRunner`]; the
//! engine ships a deterministic [`StubRunner`] and leaves model-backed
//! runners to embedders.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::CoreError;

// ─── Agent Definitions ────────────────────────────────────────────────────

/// One persona in the troupe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Canonical id used by workflow steps (e.g. "developer").
    pub id: String,

    /// Display name of the persona.
    pub name: String,

    /// Role title shown in prompts and CLI listings.
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// The persona system prompt.
    pub persona: String,

    /// Working principles appended to every step prompt.
    #[serde(default)]
    pub principles: Vec<String>,
}

impl AgentDefinition {
    pub fn analyst() -> Self {
        Self {
            id: "analyst".into(),
            name: "Mary".into(),
            title: "Business Analyst".into(),
            icon: Some("📊".into()),
            description: Some("Research, discovery, and project briefs".into()),
            persona: ANALYST_PERSONA.into(),
            principles: vec![
                "Ground every claim in stated project facts".into(),
                "Surface unknowns as explicit questions".into(),
            ],
        }
    }

    pub fn pm() -> Self {
        Self {
            id: "pm".into(),
            name: "John".into(),
            title: "Product Manager".into(),
            icon: Some("📋".into()),
            description: Some("Requirements and PRDs".into()),
            persona: PM_PERSONA.into(),
            principles: vec![
                "Every requirement gets an id and a priority".into(),
                "Scope cuts are recorded, not silently dropped".into(),
            ],
        }
    }

    pub fn architect() -> Self {
        Self {
            id: "architect".into(),
            name: "Winston".into(),
            title: "Architect".into(),
            icon: Some("🏗️".into()),
            description: Some("System design and technology selection".into()),
            persona: ARCHITECT_PERSONA.into(),
            principles: vec![
                "Name a concrete technology for every component".into(),
                "Record trade-offs as decisions".into(),
            ],
        }
    }

    pub fn developer() -> Self {
        Self {
            id: "developer".into(),
            name: "James".into(),
            title: "Full Stack Developer".into(),
            icon: Some("💻".into()),
            description: Some("Implementation against approved designs".into()),
            persona: DEVELOPER_PERSONA.into(),
            principles: vec![
                "No scope creep beyond the current step".into(),
                "Report blocking constraints upstream instead of working around them".into(),
            ],
        }
    }

    pub fn qa() -> Self {
        Self {
            id: "qa".into(),
            name: "Quinn".into(),
            title: "QA Engineer".into(),
            icon: Some("🧪".into()),
            description: Some("Test plans and quality gates".into()),
            persona: QA_PERSONA.into(),
            principles: vec![
                "Every requirement maps to at least one test case".into(),
                "Quality thresholds are numbers, not adjectives".into(),
            ],
        }
    }

    pub fn orchestrator() -> Self {
        Self {
            id: "orchestrator".into(),
            name: "Alex".into(),
            title: "Workflow Orchestrator".into(),
            icon: Some("🎯".into()),
            description: Some("Cross-agent consistency and coordination".into()),
            persona: ORCHESTRATOR_PERSONA.into(),
            principles: vec![
                "Flag inconsistencies between artifacts as soon as they appear".into(),
            ],
        }
    }

    /// Lookup by id, accepting the common short aliases.
    pub fn by_id(id: &str) -> Option<Self> {
        match id.to_lowercase().as_str() {
            "analyst" => Some(Self::analyst()),
            "pm" => Some(Self::pm()),
            "architect" => Some(Self::architect()),
            "developer" | "dev" => Some(Self::developer()),
            "qa" => Some(Self::qa()),
            "orchestrator" => Some(Self::orchestrator()),
            _ => None,
        }
    }

    /// The full built-in troupe, in delivery order.
    pub fn roster() -> Vec<Self> {
        vec![
            Self::analyst(),
            Self::pm(),
            Self::architect(),
            Self::developer(),
            Self::qa(),
            Self::orchestrator(),
        ]
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::Definition(format!("agent YAML: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Definition(format!("agent file '{}': {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }
}

// ─── Personas ─────────────────────────────────────────────────────────────

const ANALYST_PERSONA: &str = r#"## Business Analyst

You turn fuzzy project ideas into a concrete project brief. Work from what
is actually known about the project; where nothing is known, write the open
question down instead of inventing an answer.

Produce: problem statement, measurable goals, stakeholders, constraints."#;

const PM_PERSONA: &str = r#"## Product Manager

You turn the project brief into a PRD the rest of the troupe can build
against. Requirements are numbered, testable, and prioritized. If the brief
and reality disagree, raise it — do not paper over it."#;

const ARCHITECT_PERSONA: &str = r#"## Architect

You design the system that satisfies the PRD. Name concrete components and
the technology behind each one, and record why. Constraints reported by the
developer override elegance."#;

const DEVELOPER_PERSONA: &str = r#"## Full Stack Developer

Implement the current step against the approved architecture — nothing
more. When a design decision cannot be implemented as specified, report the
constraint upstream rather than silently deviating."#;

const QA_PERSONA: &str = r#"## QA Engineer

You own the quality gate. Derive test cases from the PRD, score what the
developer produced, and fail loudly when the score is below threshold."#;

const ORCHESTRATOR_PERSONA: &str = r#"## Workflow Orchestrator

You watch the whole board: artifact consistency, cross-agent handoffs,
and unresolved feedback. You never produce delivery artifacts yourself."#;

// ─── Registry ─────────────────────────────────────────────────────────────

/// Roster lookup table, seeded with the built-ins and optionally
/// patched from a directory of YAML overrides.
pub struct AgentRegistry {
    agents: HashMap<String, AgentDefinition>,
}

impl AgentRegistry {
    /// Registry holding the built-in troupe.
    pub fn builtin() -> Self {
        let mut agents = HashMap::new();
        for agent in AgentDefinition::roster() {
            agents.insert(agent.id.clone(), agent);
        }
        Self { agents }
    }

    /// Loads `*.agent.yaml` files from `dir`, replacing built-ins with
    /// the same id and adding any new ones. Returns how many files were
    /// applied.
    pub fn load_overrides(&mut self, dir: &Path) -> Result<usize, CoreError> {
        let pattern = dir.join("*.agent.yaml");
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern)
            .map_err(|e| CoreError::Definition(format!("agent glob '{pattern}': {e}")))?;
        let mut applied = 0;
        for entry in paths {
            let path =
                entry.map_err(|e| CoreError::Definition(format!("agent glob entry: {e}")))?;
            let agent = AgentDefinition::from_file(&path)?;
            info!("[Agents] Override loaded for '{}' from {}", agent.id, path.display());
            self.agents.insert(agent.id.clone(), agent);
            applied += 1;
        }
        Ok(applied)
    }

    pub fn get(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// All definitions, sorted by id for stable listings.
    pub fn all(&self) -> Vec<&AgentDefinition> {
        let mut list: Vec<&AgentDefinition> = self.agents.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

// ─── Prompt assembly ──────────────────────────────────────────────────────

/// Builds the prompt an agent receives for one workflow step: persona,
/// the step task, a context excerpt, and the persona's principles.
pub fn build_step_prompt(
    agent: &AgentDefinition,
    step: u32,
    description: &str,
    context_excerpt: &Value,
) -> String {
    let mut prompt = format!("{}\n\n## Step {step}\n\n{description}\n", agent.persona.trim());
    if !context_excerpt.is_null() {
        prompt.push_str(&format!(
            "\n## Context\n\n```json\n{}\n```\n",
            serde_json::to_string_pretty(context_excerpt).unwrap_or_else(|_| "{}".into())
        ));
    }
    if !agent.principles.is_empty() {
        prompt.push_str("\n## Principles\n\n");
        for principle in &agent.principles {
            prompt.push_str(&format!("- {principle}\n"));
        }
    }
    prompt
}

// ─── Runner seam ──────────────────────────────────────────────────────────

/// What a runner hands back for one step.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    /// Structured output document, if the step produced one.
    pub payload: Option<Value>,
    pub model: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// QA-style score in `0.0..=1.0`, when the runner reports one.
    pub quality_score: Option<f64>,
}

/// Produces agent output for a step. Implementations decide what
/// "running an agent" means — a model call, a subprocess, or a script.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_step(
        &self,
        agent: &AgentDefinition,
        step: u32,
        prompt: &str,
    ) -> Result<AgentOutput, CoreError>;
}

/// Deterministic no-model runner: echoes a summary document per step.
/// Useful for dry runs and tests.
#[derive(Debug, Default)]
pub struct StubRunner;

#[async_trait]
impl AgentRunner for StubRunner {
    async fn run_step(
        &self,
        agent: &AgentDefinition,
        step: u32,
        prompt: &str,
    ) -> Result<AgentOutput, CoreError> {
        let payload = serde_json::json!({
            "agent": agent.id,
            "step": step,
            "summary": format!("{} ({}) completed step {step}", agent.name, agent.title),
        });
        let output_len = payload.to_string().len() as u64;
        Ok(AgentOutput {
            payload: Some(payload),
            model: Some("stub".into()),
            input_tokens: Some(prompt.len() as u64 / 4),
            output_tokens: Some(output_len / 4),
            quality_score: Some(0.95),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_roster_covers_the_six_personas() {
        let registry = AgentRegistry::builtin();
        assert_eq!(registry.len(), 6);
        for id in ["analyst", "pm", "architect", "developer", "qa", "orchestrator"] {
            assert!(registry.contains(id), "missing {id}");
        }
        let ids: Vec<&str> = registry.all().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["analyst", "architect", "developer", "orchestrator", "pm", "qa"]);
    }

    #[test]
    fn test_by_id_accepts_dev_alias() {
        assert_eq!(AgentDefinition::by_id("dev").unwrap().id, "developer");
        assert_eq!(AgentDefinition::by_id("QA").unwrap().id, "qa");
        assert!(AgentDefinition::by_id("intern").is_none());
    }

    #[test]
    fn test_yaml_override_replaces_builtin_persona() {
        let yaml = r#"
id: "qa"
name: "Dana"
title: "Quality Lead"
persona: |
  ## Quality Lead
  Exploratory testing first.
"#;
        let mut registry = AgentRegistry::builtin();
        let agent = AgentDefinition::from_yaml(yaml).unwrap();
        registry.agents.insert(agent.id.clone(), agent);
        let qa = registry.get("qa").unwrap();
        assert_eq!(qa.name, "Dana");
        assert!(qa.persona.contains("Exploratory"));
        assert!(qa.principles.is_empty());
    }

    #[test]
    fn test_load_overrides_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pm.agent.yaml"),
            "id: pm\nname: Petra\ntitle: Product Manager\npersona: custom\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = AgentRegistry::builtin();
        let applied = registry.load_overrides(dir.path()).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(registry.get("pm").unwrap().name, "Petra");
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn test_invalid_yaml_is_a_definition_error() {
        let err = AgentDefinition::from_yaml("id: [broken").unwrap_err();
        assert!(matches!(err, CoreError::Definition(_)));
    }

    #[test]
    fn test_step_prompt_contains_persona_task_and_context() {
        let agent = AgentDefinition::developer();
        let prompt = build_step_prompt(&agent, 4, "Implement the login form", &json!({"k": 1}));
        assert!(prompt.starts_with("## Full Stack Developer"));
        assert!(prompt.contains("## Step 4"));
        assert!(prompt.contains("Implement the login form"));
        assert!(prompt.contains("\"k\": 1"));
        assert!(prompt.contains("- No scope creep beyond the current step"));
    }

    #[tokio::test]
    async fn test_stub_runner_is_deterministic() {
        let runner = StubRunner;
        let agent = AgentDefinition::pm();
        let first = runner.run_step(&agent, 2, "prompt").await.unwrap();
        let second = runner.run_step(&agent, 2, "prompt").await.unwrap();
        assert_eq!(first.payload, second.payload);
        assert_eq!(first.payload.unwrap()["agent"], json!("pm"));
    }
}
