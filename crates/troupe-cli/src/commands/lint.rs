//! `troupe lint` — static checks for a workflow project directory.

use troupe_core::lint::ProjectLinter;

use super::describe;

/// Lint the project and report. Errors make the command fail; warnings
/// are informational.
pub async fn run(dir: &str) -> Result<(), String> {
    let report = ProjectLinter::new(dir).lint_all().map_err(describe)?;

    for issue in &report.errors {
        println!("❌ {}", issue);
    }
    for issue in &report.warnings {
        println!("⚠️  {}", issue);
    }
    if !report.errors.is_empty() || !report.warnings.is_empty() {
        println!();
    }

    println!(
        "{} workflow(s), {} agent file(s), {} reference(s) checked",
        report.stats.workflows, report.stats.agents, report.stats.references
    );

    if report.success() {
        println!("✅ No blocking issues");
        Ok(())
    } else {
        Err(format!("{} lint error(s)", report.errors.len()))
    }
}
