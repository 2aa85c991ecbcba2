//! Static checks for workflow projects.
//!
//! Walks a project directory before anything runs and reports broken
//! references: steps that name unknown agents, dependencies on steps
//! that do not exist (or cannot have completed yet), schemas without a
//! backing file, unknown renderer types, and placeholder typos in step
//! descriptions. Errors block a run; warnings do not.
//!
//! Expected project layout:
//!
//! ```text
//! <project>/
//!   workflows/*.yaml        workflow definitions
//!   agents/*.agent.yaml     persona overrides (optional)
//!   schemas/*.json          output schemas (optional)
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::agents::AgentRegistry;
use crate::error::CoreError;
use crate::render::RendererRegistry;
use crate::workflow::definition::WorkflowDefinition;

/// Placeholders the engine resolves at run time; anything else in
/// `{braces}` is suspect.
pub const RUNTIME_PLACEHOLDERS: &[&str] = &[
    "project_name",
    "session_id",
    "workflow_name",
    "date",
    "version",
    "output_folder",
    "user_name",
    "communication_language",
];

#[derive(Debug, Clone, Serialize)]
pub struct LintIssue {
    pub file: String,
    /// Where in the file, e.g. `step 3`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub message: String,
}

impl std::fmt::Display for LintIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{} ({context}): {}", self.file, self.message),
            None => write!(f, "{}: {}", self.file, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LintStats {
    pub agents: usize,
    pub workflows: usize,
    pub references: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct LintReport {
    pub errors: Vec<LintIssue>,
    pub warnings: Vec<LintIssue>,
    pub stats: LintStats,
}

impl LintReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct ProjectLinter {
    project_dir: PathBuf,
    known_agents: HashSet<String>,
    known_renderers: HashSet<String>,
    schema_names: Option<HashSet<String>>,
    report: LintReport,
}

impl ProjectLinter {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let known_agents = AgentRegistry::builtin()
            .all()
            .into_iter()
            .map(|a| a.id.clone())
            .collect();
        let known_renderers = RendererRegistry::with_builtins()
            .types()
            .into_iter()
            .collect();
        Self {
            project_dir: project_dir.into(),
            known_agents,
            known_renderers,
            schema_names: None,
            report: LintReport::default(),
        }
    }

    /// Lints the whole project and consumes the linter.
    pub fn lint_all(mut self) -> Result<LintReport, CoreError> {
        self.collect_schemas()?;
        self.lint_agents()?;
        self.lint_workflows()?;
        info!(
            "[Lint] {} workflow(s), {} agent file(s), {} reference(s): {} error(s), {} warning(s)",
            self.report.stats.workflows,
            self.report.stats.agents,
            self.report.stats.references,
            self.report.errors.len(),
            self.report.warnings.len()
        );
        Ok(self.report)
    }

    fn glob_files(&self, pattern: &str) -> Result<Vec<PathBuf>, CoreError> {
        let full = self.project_dir.join(pattern);
        let full = full.to_string_lossy();
        let mut paths: Vec<PathBuf> = glob::glob(&full)
            .map_err(|e| CoreError::Definition(format!("lint glob '{full}': {e}")))?
            .filter_map(Result::ok)
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn rel(&self, path: &Path) -> String {
        path.strip_prefix(&self.project_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    fn error(&mut self, file: &Path, context: Option<String>, message: impl Into<String>) {
        self.report.errors.push(LintIssue {
            file: self.rel(file),
            context,
            message: message.into(),
        });
    }

    fn warning(&mut self, file: &Path, context: Option<String>, message: impl Into<String>) {
        self.report.warnings.push(LintIssue {
            file: self.rel(file),
            context,
            message: message.into(),
        });
    }

    fn collect_schemas(&mut self) -> Result<(), CoreError> {
        let schema_dir = self.project_dir.join("schemas");
        if !schema_dir.is_dir() {
            return Ok(());
        }
        let mut names = HashSet::new();
        for path in self.glob_files("schemas/*.json")? {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.insert(stem.to_string());
            }
        }
        self.schema_names = Some(names);
        Ok(())
    }

    fn lint_agents(&mut self) -> Result<(), CoreError> {
        for path in self.glob_files("agents/*.agent.yaml")? {
            self.report.stats.agents += 1;
            match crate::agents::AgentDefinition::from_file(&path) {
                Ok(agent) => {
                    if !self.known_agents.contains(&agent.id) {
                        self.warning(
                            &path,
                            None,
                            format!("agent id '{}' is not in the built-in roster; this override adds a new persona", agent.id),
                        );
                        // New personas are still referencable from workflows.
                        self.known_agents.insert(agent.id);
                    }
                    if agent.persona.trim().is_empty() {
                        self.error(&path, None, "persona must not be empty");
                    }
                }
                Err(e) => self.error(&path, None, e.to_string()),
            }
        }
        Ok(())
    }

    fn lint_workflows(&mut self) -> Result<(), CoreError> {
        let mut paths = self.glob_files("workflows/*.yaml")?;
        paths.extend(self.glob_files("workflows/*.yml")?);
        for path in paths {
            self.report.stats.workflows += 1;
            match WorkflowDefinition::from_file(&path) {
                Ok(definition) => self.lint_workflow(&path, &definition),
                Err(e) => self.error(&path, None, e.to_string()),
            }
        }
        Ok(())
    }

    fn lint_workflow(&mut self, path: &Path, definition: &WorkflowDefinition) {
        if let Err(e) = definition.validate() {
            self.error(path, None, e.to_string());
        }

        let mut ordinals: HashSet<u32> = HashSet::new();
        for step in definition.all_steps() {
            ordinals.insert(step.step);
        }

        // Sequence steps can only depend on earlier ordinals; group
        // members can depend on anything outside their own group.
        let mut group_of: std::collections::HashMap<u32, usize> = std::collections::HashMap::new();
        if let Some(groups) = &definition.parallel_groups {
            for (index, group) in groups.iter().enumerate() {
                for step in &group.agents {
                    group_of.insert(step.step, index);
                }
            }
        }

        for step in definition.all_steps() {
            let context = Some(format!("step {}", step.step));

            self.report.stats.references += 1;
            if !self.known_agents.contains(&step.agent) {
                self.error(
                    path,
                    context.clone(),
                    format!("unknown agent '{}'", step.agent),
                );
            }

            if let Some(deps) = &step.depends_on {
                for dep in deps {
                    self.report.stats.references += 1;
                    if !ordinals.contains(dep) {
                        self.error(
                            path,
                            context.clone(),
                            format!("depends on step {dep}, which does not exist"),
                        );
                    } else if definition.parallel_groups.is_none() && *dep >= step.step {
                        self.error(
                            path,
                            context.clone(),
                            format!("depends on step {dep}, which runs later in the sequence"),
                        );
                    } else if group_of.get(dep).is_some() && group_of.get(dep) == group_of.get(&step.step)
                    {
                        self.warning(
                            path,
                            context.clone(),
                            format!("depends on step {dep} in the same parallel group; it may not have completed"),
                        );
                    }
                }
            }

            if let Some(schema) = &step.schema {
                self.report.stats.references += 1;
                match &self.schema_names {
                    Some(names) if !names.contains(schema) => {
                        self.error(
                            path,
                            context.clone(),
                            format!("schema '{schema}' has no file under schemas/"),
                        );
                    }
                    None => {
                        self.warning(
                            path,
                            context.clone(),
                            format!("schema '{schema}' cannot be resolved (no schemas/ directory)"),
                        );
                    }
                    _ => {}
                }
            }

            if let Some(render) = &step.render {
                self.report.stats.references += 1;
                if !self.known_renderers.contains(&render.renderer) {
                    self.warning(
                        path,
                        context.clone(),
                        format!("renderer '{}' is not built in; it must be registered before running", render.renderer),
                    );
                }
                if Path::new(&render.to).is_absolute() {
                    self.error(
                        path,
                        context.clone(),
                        format!("artifact path '{}' must be relative", render.to),
                    );
                }
            }

            self.check_placeholders(path, context, &step.description);
        }
    }

    fn check_placeholders(&mut self, path: &Path, context: Option<String>, text: &str) {
        for placeholder in extract_placeholders(text) {
            self.report.stats.references += 1;
            if placeholder.contains('*') || placeholder.contains('/') {
                self.warning(
                    path,
                    context.clone(),
                    format!("template pattern '{{{placeholder}}}' is resolved per run; cannot verify statically"),
                );
            } else if !RUNTIME_PLACEHOLDERS.contains(&placeholder.as_str()) {
                self.warning(
                    path,
                    context.clone(),
                    format!("unknown placeholder '{{{placeholder}}}'"),
                );
            }
        }
    }
}

fn extract_placeholders(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start + 1..].find('}') else {
            break;
        };
        let inner = &rest[start + 1..start + 1 + end];
        if !inner.is_empty() && !inner.contains('{') {
            out.push(inner.to_string());
        }
        rest = &rest[start + 1 + end + 1..];
    }
    out
}
