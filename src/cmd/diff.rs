//! `sweteam diff apply`.

use anyhow::{Context, Result};
use std::io::Read;

use sweteam::patch::apply_unified_diff;

use super::super::DiffCommands;

pub fn cmd_diff(command: DiffCommands) -> Result<()> {
    match command {
        DiffCommands::Apply { file, diff } => {
            let diff = match diff {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read diff {}", path.display()))?,
                None => {
                    let mut text = String::new();
                    std::io::stdin()
                        .read_to_string(&mut text)
                        .context("Failed to read diff from stdin")?;
                    text
                }
            };
            let summary = apply_unified_diff(&file, &diff)
                .with_context(|| format!("Diff not applied to {}; the file was not changed", file.display()))?;
            println!("{}", summary.describe());
        }
    }
    Ok(())
}
