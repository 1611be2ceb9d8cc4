//! `sweteam plan`: the planned directory structure.

use anyhow::{Context, Result};

use sweteam::config::Config;
use sweteam::planner::DirectoryPlanner;

use super::super::PlanCommands;

pub fn cmd_plan(config: &Config, command: PlanCommands) -> Result<()> {
    let settings = &config.settings;
    let planner = DirectoryPlanner::new(
        settings.project.name.clone(),
        config.code_dir(),
        config.dir_structure_file(),
        &settings.project.excludes,
    );

    match command {
        PlanCommands::Show { actual_only } => {
            let yaml = if actual_only {
                planner.actual_yaml()?
            } else {
                planner.reconciled_yaml()?
            };
            print!("{}", yaml);
        }
        PlanCommands::Update { patch } => {
            let text = std::fs::read_to_string(&patch)
                .with_context(|| format!("Failed to read plan patch {}", patch.display()))?;
            let plan = planner.update_from_str(&text)?;
            let nodes: usize = plan.values().map(|node| node.count()).sum();
            println!("Updated {} ({} planned entries)", planner.plan_file().display(), nodes);
        }
    }
    Ok(())
}
