//! `troupe agents` — inspect the persona roster.

use std::path::Path;

use troupe_core::agents::AgentRegistry;

use super::{describe, truncate};

fn registry_with_overrides(agents_dir: Option<&str>) -> Result<AgentRegistry, String> {
    let mut registry = AgentRegistry::builtin();
    if let Some(dir) = agents_dir {
        let count = registry.load_overrides(Path::new(dir)).map_err(describe)?;
        println!("Loaded {} persona override(s) from '{}'", count, dir);
        println!();
    }
    Ok(registry)
}

/// List the roster (builtins plus any overrides).
pub async fn list(agents_dir: Option<&str>) -> Result<(), String> {
    let registry = registry_with_overrides(agents_dir)?;

    println!("┌──────────────┬─────────────────────┬────────────────────────────────┐");
    println!("│ ID           │ Name                │ Title                          │");
    println!("├──────────────┼─────────────────────┼────────────────────────────────┤");
    for agent in registry.all() {
        let icon = agent.icon.as_deref().unwrap_or("·");
        let name = format!("{} {}", icon, agent.name);
        println!(
            "│ {:<12} │ {:<19} │ {:<30} │",
            truncate(&agent.id, 12),
            truncate(&name, 19),
            truncate(&agent.title, 30),
        );
    }
    println!("└──────────────┴─────────────────────┴────────────────────────────────┘");
    Ok(())
}

/// Show one persona in full.
pub async fn show(id: &str, agents_dir: Option<&str>) -> Result<(), String> {
    let registry = registry_with_overrides(agents_dir)?;
    let agent = registry
        .get(id)
        .ok_or_else(|| format!("unknown agent '{id}'; run `troupe agents list`"))?;

    let icon = agent.icon.as_deref().unwrap_or("·");
    println!("{} {} — {}", icon, agent.name, agent.title);
    println!("   id: {}", agent.id);
    if let Some(description) = &agent.description {
        println!("   {}", description);
    }
    println!();
    println!("{}", agent.persona);
    if !agent.principles.is_empty() {
        println!();
        println!("Principles:");
        for principle in &agent.principles {
            println!("  • {}", principle);
        }
    }
    Ok(())
}
