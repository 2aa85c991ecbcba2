//! `troupe render` — render a structured artifact to Markdown.

use troupe_core::error::CoreError;
use troupe_core::render::RendererRegistry;

use super::{describe, read_json};

pub async fn run(
    artifact_type: &str,
    input_file: &str,
    out: Option<&str>,
) -> Result<(), String> {
    let document = read_json(input_file)?;
    let registry = RendererRegistry::with_builtins();

    let markdown = registry.render(artifact_type, &document).map_err(|e| {
        if matches!(e, CoreError::UnknownRenderer(_)) {
            format!("{e}\n  available: {}", registry.types().join(", "))
        } else {
            describe(e)
        }
    })?;

    match out {
        Some(path) => {
            std::fs::write(path, &markdown)
                .map_err(|e| format!("failed to write '{path}': {e}"))?;
            println!("📄 Wrote {}", path);
        }
        None => print!("{}", markdown),
    }
    Ok(())
}
