//! Markdown projections of structured artifacts.
//!
//! Each renderer takes a validated artifact document and produces a
//! deterministic markdown view: same document in, same text out. The
//! registry ships projections for the artifact types the built-in
//! workflows create, and accepts replacements or additions under any
//! type name.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::error::CoreError;

type RenderFn = Box<dyn Fn(&Value) -> Result<String, String> + Send + Sync>;

pub struct RendererRegistry {
    renderers: HashMap<String, RenderFn>,
}

impl RendererRegistry {
    /// An empty registry. Most callers want [`with_builtins`](Self::with_builtins).
    pub fn new() -> Self {
        Self {
            renderers: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("project-brief", render_project_brief);
        registry.register("prd", render_prd);
        registry.register("architecture", render_architecture);
        registry.register("frontend-spec", render_frontend_spec);
        registry.register("qa-plan", render_qa_plan);
        registry
    }

    pub fn register(
        &mut self,
        artifact_type: &str,
        renderer: impl Fn(&Value) -> Result<String, String> + Send + Sync + 'static,
    ) {
        self.renderers
            .insert(artifact_type.to_string(), Box::new(renderer));
    }

    pub fn contains(&self, artifact_type: &str) -> bool {
        self.renderers.contains_key(artifact_type)
    }

    pub fn types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.renderers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn render(&self, artifact_type: &str, document: &Value) -> Result<String, CoreError> {
        let renderer = self
            .renderers
            .get(artifact_type)
            .ok_or_else(|| CoreError::UnknownRenderer(artifact_type.to_string()))?;
        debug!("[Render] Rendering artifact type '{artifact_type}'");
        renderer(document).map_err(|reason| CoreError::Render {
            artifact_type: artifact_type.to_string(),
            reason,
        })
    }
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in projections
// ─────────────────────────────────────────────────────────────────────────────

fn require_str<'a>(doc: &'a Value, field: &str) -> Result<&'a str, String> {
    doc.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing string field '{field}'"))
}

fn require_object(doc: &Value) -> Result<&serde_json::Map<String, Value>, String> {
    doc.as_object()
        .ok_or_else(|| "document must be a JSON object".to_string())
}

fn str_items(doc: &Value, field: &str) -> Vec<String> {
    doc.get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn bullet_section(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n## {heading}\n\n"));
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
}

fn text_section(out: &mut String, heading: &str, doc: &Value, field: &str) {
    if let Some(text) = doc.get(field).and_then(Value::as_str) {
        out.push_str(&format!("\n## {heading}\n\n{text}\n"));
    }
}

fn render_project_brief(doc: &Value) -> Result<String, String> {
    require_object(doc)?;
    let title = require_str(doc, "title")?;
    let mut out = format!("# Project Brief: {title}\n");
    text_section(&mut out, "Problem Statement", doc, "problem_statement");
    bullet_section(&mut out, "Goals", &str_items(doc, "goals"));
    bullet_section(&mut out, "Stakeholders", &str_items(doc, "stakeholders"));
    bullet_section(&mut out, "Constraints", &str_items(doc, "constraints"));
    Ok(out)
}

fn render_prd(doc: &Value) -> Result<String, String> {
    require_object(doc)?;
    let title = require_str(doc, "title")?;
    let requirements = doc
        .get("requirements")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing array field 'requirements'".to_string())?;
    let mut out = format!("# PRD: {title}\n");
    text_section(&mut out, "Overview", doc, "overview");
    out.push_str("\n## Requirements\n\n");
    for (i, req) in requirements.iter().enumerate() {
        let id = req
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("R{}", i + 1));
        let description = req
            .get("description")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("requirement {i} is missing 'description'"))?;
        match req.get("priority").and_then(Value::as_str) {
            Some(priority) => out.push_str(&format!("- **{id}** ({priority}): {description}\n")),
            None => out.push_str(&format!("- **{id}**: {description}\n")),
        }
    }
    bullet_section(&mut out, "Out of Scope", &str_items(doc, "out_of_scope"));
    Ok(out)
}

fn render_architecture(doc: &Value) -> Result<String, String> {
    require_object(doc)?;
    let title = doc
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("System Architecture");
    let components = doc
        .get("components")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing array field 'components'".to_string())?;
    let mut out = format!("# {title}\n");
    text_section(&mut out, "Summary", doc, "summary");
    out.push_str("\n## Components\n\n| Component | Technology | Responsibility |\n|---|---|---|\n");
    for (i, component) in components.iter().enumerate() {
        let name = component
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("component {i} is missing 'name'"))?;
        let technology = component.get("technology").and_then(Value::as_str).unwrap_or("—");
        let responsibility = component
            .get("responsibility")
            .and_then(Value::as_str)
            .unwrap_or("—");
        out.push_str(&format!("| {name} | {technology} | {responsibility} |\n"));
    }
    bullet_section(&mut out, "Decisions", &str_items(doc, "decisions"));
    Ok(out)
}

fn render_frontend_spec(doc: &Value) -> Result<String, String> {
    require_object(doc)?;
    let title = doc
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Frontend Specification");
    let mut out = format!("# {title}\n");
    let screens = doc.get("screens").and_then(Value::as_array);
    let Some(screens) = screens else {
        return Err("missing array field 'screens'".to_string());
    };
    out.push_str("\n## Screens\n");
    for (i, screen) in screens.iter().enumerate() {
        let name = screen
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("screen {i} is missing 'name'"))?;
        out.push_str(&format!("\n### {name}\n\n"));
        if let Some(purpose) = screen.get("purpose").and_then(Value::as_str) {
            out.push_str(&format!("{purpose}\n"));
        }
        for element in str_items(screen, "elements") {
            out.push_str(&format!("- {element}\n"));
        }
    }
    bullet_section(&mut out, "Design Notes", &str_items(doc, "notes"));
    Ok(out)
}

fn render_qa_plan(doc: &Value) -> Result<String, String> {
    require_object(doc)?;
    let title = doc
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("QA Plan");
    let cases = doc
        .get("cases")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing array field 'cases'".to_string())?;
    let mut out = format!("# {title}\n");
    text_section(&mut out, "Strategy", doc, "strategy");
    out.push_str("\n## Test Cases\n\n| Case | Description | Expected |\n|---|---|---|\n");
    for (i, case) in cases.iter().enumerate() {
        let id = case
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("TC{}", i + 1));
        let description = case
            .get("description")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("case {i} is missing 'description'"))?;
        let expected = case.get("expected").and_then(Value::as_str).unwrap_or("—");
        out.push_str(&format!("| {id} | {description} | {expected} |\n"));
    }
    Ok(out)
}
