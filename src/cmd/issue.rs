//! `sweteam issue`: direct access to the issue board.

use anyhow::{Result, bail};
use console::style;
use serde_json::Value;

use sweteam::config::Config;
use sweteam::issues::{IssueDetail, IssueStore, IssueSummary, ListFilter, NewIssue, Status, UpdateDraft};

use super::super::IssueCommands;

/// Author recorded on updates made from the command line.
const CLI_CALLER: &str = "user";

pub fn cmd_issue(config: &Config, command: IssueCommands) -> Result<()> {
    let store = IssueStore::new(config.issue_board_dir());

    match command {
        IssueCommands::List {
            root,
            statuses,
            all,
            json,
        } => {
            let filter = if all {
                ListFilter::default()
            } else if statuses.is_empty() {
                ListFilter::open()
            } else {
                ListFilter::with_statuses(statuses.into_iter().map(Status::from).collect())
            };
            let issues = store.list(&root, &filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&issues)?);
            } else {
                print_table(&issues);
            }
        }
        IssueCommands::Create {
            parent,
            title,
            description,
            assignee,
            priority,
        } => {
            let issue = NewIssue {
                assignee,
                priority,
                ..NewIssue::titled(title, description)
            };
            let path = store.create(&parent, issue, CLI_CALLER)?;
            println!("Created issue {}", path);
        }
        IssueCommands::Read { issue, json } => {
            let detail = store.read(&issue)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                print_detail(&detail);
            }
        }
        IssueCommands::Update {
            issue,
            status,
            priority,
            details,
        } => {
            let draft = UpdateDraft {
                status: status.map(Status::from),
                priority,
                details: details.map(|d| serde_json::from_str(&d).unwrap_or(Value::String(d))),
                ..UpdateDraft::default()
            };
            if draft.is_empty() {
                bail!("Nothing to update: pass --status, --priority or --details");
            }
            store.update(&issue, draft, CLI_CALLER)?;
            println!("Updated issue {}", issue);
        }
        IssueCommands::Assign { issue, assignee } => {
            let roster: Vec<String> = config.roster().into_iter().map(|w| w.name).collect();
            store.assign(&issue, &assignee, &roster, CLI_CALLER)?;
            println!("Assigned issue {} to {}", issue, assignee);
        }
    }

    Ok(())
}

fn print_table(issues: &[IssueSummary]) {
    if issues.is_empty() {
        println!("No matching issues.");
        return;
    }
    println!(
        "{}",
        style(format!("{:<10} {:<12} {:<12} {:<14} {}", "ISSUE", "PRIORITY", "STATUS", "ASSIGNEE", "TITLE")).bold()
    );
    for issue in issues {
        println!(
            "{:<10} {:<12} {:<12} {:<14} {}",
            issue.issue, issue.priority, issue.status, issue.assignee, issue.title
        );
    }
}

fn print_detail(detail: &IssueDetail) {
    println!("{} {}", style(format!("#{}", detail.issue)).bold(), style(&detail.record.title).bold());
    println!(
        "status: {}  priority: {}  assignee: {}  created: {}",
        detail.status,
        detail.priority,
        detail.assignee,
        detail.record.created_at.format("%Y-%m-%d %H:%M")
    );
    if !detail.record.description.trim().is_empty() {
        println!();
        for line in textwrap::wrap(&detail.record.description, 88) {
            println!("{}", line);
        }
    }
    println!();
    println!("{}", style("Updates").underlined());
    for update in &detail.record.updates {
        let mut changes = Vec::new();
        if let Some(status) = &update.status {
            changes.push(format!("status={}", status));
        }
        if let Some(priority) = &update.priority {
            changes.push(format!("priority={}", priority));
        }
        if let Some(assignee) = &update.assignee {
            changes.push(format!("assignee={}", assignee));
        }
        println!(
            "  {} {} {}",
            update.updated_at.format("%Y-%m-%d %H:%M"),
            style(&update.updated_by).cyan(),
            changes.join(" ")
        );
        if let Some(details) = &update.details {
            let text = match details {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            for line in textwrap::wrap(&text, 84) {
                println!("    {}", line);
            }
        }
    }
}
