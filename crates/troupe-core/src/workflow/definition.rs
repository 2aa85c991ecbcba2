//! YAML schema types for workflow definitions.
//!
//! A workflow YAML names the personas to run and how. Two execution
//! formats exist and exactly one must be present: a flat `sequence`,
//! or `parallel_groups` where each group's agents run concurrently:
//!
//! ```yaml
//! name: "greenfield-fullstack"
//! description: "Idea to implemented project"
//! version: "1.0"
//!
//! execution:
//!   retry_on_failure: true
//!   max_attempts: 2
//!   backoff_ms: 1000
//!
//! sequence:
//!   - step: 1
//!     agent: analyst
//!     description: "Create the project brief"
//!     schema: project-brief
//!     render:
//!       renderer: project-brief
//!       from: "docs/project-brief.json"
//!       to: "docs/project-brief.md"
//!     creates: "docs/project-brief.md"
//!
//!   - step: 2
//!     agent: pm
//!     description: "Write the PRD from the brief"
//!     depends_on: [1]
//!     schema: prd
//!
//! propagation:
//!   - source: analyst
//!     target: pm
//!     fields:
//!       "outputs.brief": "inputs.brief"
//! ```
//!
//! Group format, with synchronization policy:
//!
//! ```yaml
//! parallel_groups:
//!   - name: "design"
//!     parallel: true
//!     synchronization:
//!       timeout_secs: 900
//!       partial_completion: allow_with_one_success
//!     agents:
//!       - step: 3
//!         agent: architect
//!         description: "System architecture"
//!       - step: 4
//!         agent: qa
//!         description: "Test strategy"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_GROUP_TIMEOUT_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MS};
use crate::error::CoreError;

/// Top-level workflow definition loaded from a YAML file.
///
/// Read-only for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name (keys the gates store and trace records)
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Version string
    #[serde(default = "default_version")]
    pub version: String,

    /// Flat ordered step list (legacy format)
    #[serde(default)]
    pub sequence: Option<Vec<StepConfig>>,

    /// Grouped format: groups run in order, agents within a group
    /// concurrently when `parallel: true`
    #[serde(default)]
    pub parallel_groups: Option<Vec<GroupConfig>>,

    /// Retry policy applied to every step
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Context propagation rules applied after each step completes
    #[serde(default)]
    pub propagation: Vec<PropagationRule>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A single agent step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Step ordinal — unique within the workflow, used for dependency
    /// references and completion tracking
    pub step: u32,

    /// Agent persona id (e.g. "analyst", "pm")
    pub agent: String,

    /// What the agent is asked to do this step
    #[serde(default)]
    pub description: String,

    /// Ordinals that must be in `completed_steps` before this step runs
    #[serde(default)]
    pub depends_on: Option<Vec<u32>>,

    /// Optional steps skip instead of aborting the run on failure or
    /// unmet dependencies
    #[serde(default)]
    pub optional: bool,

    /// Schema name the step output must pass through the gate
    #[serde(default)]
    pub schema: Option<String>,

    /// Markdown rendering of the validated output
    #[serde(default)]
    pub render: Option<RenderConfig>,

    /// Artifact path this step is expected to produce
    #[serde(default)]
    pub creates: Option<String>,
}

/// Render block: which renderer, where the JSON lands, where the
/// Markdown goes. Both paths are relative to the session artifact dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    pub renderer: String,
    pub from: String,
    pub to: String,
}

/// A group of steps in the `parallel_groups` format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,

    /// Steps in this group
    pub agents: Vec<StepConfig>,

    /// Run the group's agents concurrently (sequential when false)
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    #[serde(default)]
    pub synchronization: SyncConfig,
}

fn default_parallel() -> bool {
    true
}

/// How a parallel group settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// The whole group must settle within this window
    #[serde(default = "default_group_timeout")]
    pub timeout_secs: u64,

    /// Relaxed failure policy; absent means any failure aborts
    #[serde(default)]
    pub partial_completion: Option<PartialCompletion>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_group_timeout(),
            partial_completion: None,
        }
    }
}

fn default_group_timeout() -> u64 {
    DEFAULT_GROUP_TIMEOUT_SECS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialCompletion {
    /// The group succeeds as long as at least one agent succeeded
    AllowWithOneSuccess,
}

/// Retry policy for failed steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Retry a failed step before recording it failed
    #[serde(default)]
    pub retry_on_failure: bool,

    /// Retry budget per step: a step runs at most `1 + max_attempts`
    /// times
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed backoff between attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            retry_on_failure: false,
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

/// Copies fields between agent contexts after the source agent's steps
/// complete. Keys are paths under `agent_contexts.<source>`, values
/// are paths under `agent_contexts.<target>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationRule {
    pub source: String,
    pub target: String,
    pub fields: BTreeMap<String, String>,
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::Definition(format!("failed to parse workflow YAML: {e}")))
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Definition(format!(
                "failed to read workflow file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Definition(
                "workflow name must not be empty".to_string(),
            ));
        }
        match (&self.sequence, &self.parallel_groups) {
            (None, None) => {
                return Err(CoreError::Definition(
                    "workflow must define either 'sequence' or 'parallel_groups'".to_string(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(CoreError::Definition(
                    "workflow cannot define both 'sequence' and 'parallel_groups'".to_string(),
                ));
            }
            _ => {}
        }
        let mut seen: HashSet<u32> = HashSet::new();
        for step in self.all_steps() {
            if !seen.insert(step.step) {
                return Err(CoreError::Definition(format!(
                    "duplicate step ordinal {} in workflow '{}'",
                    step.step, self.name
                )));
            }
            if step.agent.trim().is_empty() {
                return Err(CoreError::Definition(format!(
                    "step {} has no agent",
                    step.step
                )));
            }
        }
        Ok(())
    }

    /// Every agent step regardless of format, in definition order.
    pub fn all_steps(&self) -> Vec<&StepConfig> {
        if let Some(sequence) = &self.sequence {
            sequence.iter().collect()
        } else if let Some(groups) = &self.parallel_groups {
            groups.iter().flat_map(|g| g.agents.iter()).collect()
        } else {
            Vec::new()
        }
    }

    /// Total agent-step count — the trace's completion threshold.
    pub fn total_agent_steps(&self) -> usize {
        self.all_steps().len()
    }

    /// Propagation rules whose `source` matches the given agent.
    pub fn propagation_rules_for(&self, source: &str) -> Vec<&PropagationRule> {
        self.propagation
            .iter()
            .filter(|rule| rule.source == source)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_sequence() {
        let yaml = r#"
name: "mini"
sequence:
  - step: 1
    agent: analyst
    description: "Brief"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        wf.validate().unwrap();
        assert_eq!(wf.name, "mini");
        assert_eq!(wf.version, "1.0");
        assert!(!wf.execution.retry_on_failure);
        assert_eq!(wf.execution.max_attempts, 2);
        let steps = wf.all_steps();
        assert_eq!(steps.len(), 1);
        assert!(!steps[0].optional);
        assert!(steps[0].depends_on.is_none());
    }

    #[test]
    fn test_parse_parallel_groups() {
        let yaml = r#"
name: "design-and-test"
parallel_groups:
  - name: "planning"
    parallel: false
    agents:
      - step: 1
        agent: pm
        description: "PRD"
  - name: "design"
    synchronization:
      timeout_secs: 60
      partial_completion: allow_with_one_success
    agents:
      - step: 2
        agent: architect
        description: "Architecture"
        depends_on: [1]
      - step: 3
        agent: qa
        description: "Test plan"
        depends_on: [1]
propagation:
  - source: pm
    target: architect
    fields:
      "outputs.prd": "inputs.prd"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        wf.validate().unwrap();
        let groups = wf.parallel_groups.as_ref().unwrap();
        assert!(!groups[0].parallel);
        assert!(groups[1].parallel);
        assert_eq!(groups[0].synchronization.timeout_secs, 900);
        assert_eq!(groups[1].synchronization.timeout_secs, 60);
        assert_eq!(
            groups[1].synchronization.partial_completion,
            Some(PartialCompletion::AllowWithOneSuccess)
        );
        assert_eq!(wf.total_agent_steps(), 3);
        assert_eq!(wf.propagation_rules_for("pm").len(), 1);
        assert!(wf.propagation_rules_for("qa").is_empty());
    }

    #[test]
    fn test_render_block() {
        let yaml = r#"
name: "rendered"
sequence:
  - step: 1
    agent: analyst
    description: "Brief"
    schema: project-brief
    render:
      renderer: project-brief
      from: "docs/brief.json"
      to: "docs/brief.md"
    creates: "docs/brief.md"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        let render = wf.all_steps()[0].render.as_ref().unwrap();
        assert_eq!(render.renderer, "project-brief");
        assert_eq!(render.to, "docs/brief.md");
    }

    #[test]
    fn test_exactly_one_format_required() {
        let neither = WorkflowDefinition::from_yaml("name: empty\n").unwrap();
        assert!(matches!(
            neither.validate(),
            Err(CoreError::Definition(msg)) if msg.contains("either")
        ));

        let both = WorkflowDefinition::from_yaml(
            r#"
name: both
sequence:
  - step: 1
    agent: pm
parallel_groups:
  - name: g
    agents:
      - step: 2
        agent: qa
"#,
        )
        .unwrap();
        assert!(matches!(
            both.validate(),
            Err(CoreError::Definition(msg)) if msg.contains("both")
        ));
    }

    #[test]
    fn test_duplicate_ordinals_rejected() {
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: dup
sequence:
  - step: 1
    agent: pm
  - step: 1
    agent: qa
"#,
        )
        .unwrap();
        assert!(matches!(
            wf.validate(),
            Err(CoreError::Definition(msg)) if msg.contains("duplicate step ordinal 1")
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        let wf = WorkflowDefinition::from_yaml("name: \"  \"\nsequence: []\n").unwrap();
        assert!(wf.validate().is_err());
    }
}
