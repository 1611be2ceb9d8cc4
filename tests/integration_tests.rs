//! Integration tests for the sweteam CLI.
//!
//! Everything here runs offline: the issue board, diff engine, planner and
//! configuration commands need no worker backend.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A sweteam command rooted in `dir`, isolated from the caller's environment.
fn sweteam(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("sweteam");
    cmd.current_dir(dir.path())
        .env_remove("SWETEAM_PROJECT_NAME")
        .env_remove("SWETEAM_ISSUE_BOARD_DIR")
        .env_remove("SWETEAM_RETRY_COUNT")
        .env_remove("SWETEAM_LOG_LEVEL")
        .env_remove("RUST_LOG");
    cmd
}

fn workspace() -> TempDir {
    TempDir::new().unwrap()
}

fn create_issue(dir: &TempDir, args: &[&str]) {
    sweteam(dir).args(["issue", "create"]).args(args).assert().success();
}

fn write_config(dir: &TempDir, content: &str) {
    fs::create_dir_all(dir.path().join(".sweteam")).unwrap();
    fs::write(dir.path().join(".sweteam/sweteam.toml"), content).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = workspace();
        sweteam(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("orchestrate"))
            .stdout(predicate::str::contains("issue"));
    }

    #[test]
    fn test_version() {
        let dir = workspace();
        sweteam(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = workspace();
        sweteam(&dir).arg("create-project").assert().failure();
    }
}

// =============================================================================
// Issue board
// =============================================================================

mod issues {
    use super::*;

    #[test]
    fn test_create_and_list() {
        let dir = workspace();
        sweteam(&dir)
            .args(["issue", "create", "--title", "Build login page", "--assignee", "frontend_dev"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created issue 1"));

        assert!(dir.path().join("issue_board/1/1.json").is_file());
        sweteam(&dir)
            .args(["issue", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Build login page"))
            .stdout(predicate::str::contains("frontend_dev"));
    }

    #[test]
    fn test_sub_issues_are_numbered_in_order() {
        let dir = workspace();
        create_issue(&dir, &["--title", "Shop"]);
        for (title, expected) in [("Cart", "1/1"), ("Checkout", "1/2"), ("Search", "1/3")] {
            sweteam(&dir)
                .args(["issue", "create", "--parent", "1", "--title", title])
                .assert()
                .success()
                .stdout(predicate::str::contains(format!("Created issue {}", expected)));
        }
        assert!(dir.path().join("issue_board/1/3/1.3.json").is_file());
    }

    #[test]
    fn test_list_orders_by_priority() {
        let dir = workspace();
        create_issue(&dir, &["--title", "Add login", "--priority", "2 - High"]);
        create_issue(&dir, &["--title", "Fix crash", "--priority", "1 - Critical"]);

        let output = sweteam(&dir).args(["issue", "list", "--json"]).output().unwrap();
        assert!(output.status.success());
        let issues: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let order: Vec<&str> = issues
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["issue"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["2", "1"]);
    }

    #[test]
    fn test_completed_issue_rejects_updates() {
        let dir = workspace();
        create_issue(&dir, &["--title", "Write docs"]);
        sweteam(&dir)
            .args(["issue", "update", "1", "--status", "in progress"])
            .assert()
            .success();
        sweteam(&dir)
            .args(["issue", "update", "1", "--status", "completed", "--details", "docs written"])
            .assert()
            .success();

        sweteam(&dir)
            .args(["issue", "update", "1", "--details", "one more thing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already completed"));

        // sub-issues under a completed issue are still allowed
        create_issue(&dir, &["--parent", "1", "--title", "Docs follow-up"]);
        sweteam(&dir)
            .args(["issue", "list", "--status", "completed"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Write docs"))
            .stdout(predicate::str::contains("Docs follow-up").not());
    }

    #[test]
    fn test_read_shows_resolved_fields() {
        let dir = workspace();
        create_issue(&dir, &["--title", "Payment API", "--description", "Stripe checkout"]);
        sweteam(&dir)
            .args(["issue", "update", "1", "--priority", "high"])
            .assert()
            .success();

        let output = sweteam(&dir).args(["issue", "read", "1", "--json"]).output().unwrap();
        let detail: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(detail["status"], "new");
        assert_eq!(detail["priority"], "high");
        assert_eq!(detail["title"], "Payment API");

        sweteam(&dir)
            .args(["issue", "read", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Stripe checkout"));
    }

    #[test]
    fn test_update_without_fields_fails() {
        let dir = workspace();
        create_issue(&dir, &["--title", "Anything"]);
        sweteam(&dir)
            .args(["issue", "update", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Nothing to update"));
    }

    #[test]
    fn test_assign_validates_roster() {
        let dir = workspace();
        create_issue(&dir, &["--title", "Set up CI"]);
        sweteam(&dir)
            .args(["issue", "assign", "1", "sre"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Assigned issue 1 to sre"));
        sweteam(&dir)
            .args(["issue", "assign", "1", "intern"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not a valid worker"));
    }

    #[test]
    fn test_read_missing_issue_fails() {
        let dir = workspace();
        sweteam(&dir)
            .args(["issue", "read", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Issue 42 not found"));
    }

    #[test]
    fn test_board_dir_from_environment() {
        let dir = workspace();
        sweteam(&dir)
            .env("SWETEAM_ISSUE_BOARD_DIR", "board2")
            .args(["issue", "create", "--title", "Elsewhere"])
            .assert()
            .success();
        assert!(dir.path().join("board2/1/1.json").is_file());
    }
}

// =============================================================================
// Diffs
// =============================================================================

mod diffs {
    use super::*;

    const DIFF: &str = "--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n import sys\n-print('hi')\n+print('hello')\n";

    #[test]
    fn test_apply_from_file() {
        let dir = workspace();
        fs::write(dir.path().join("app.py"), "import sys\nprint('hi')\n").unwrap();
        fs::write(dir.path().join("fix.diff"), DIFF).unwrap();

        sweteam(&dir)
            .args(["diff", "apply", "app.py", "--diff", "fix.diff"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Diff successfully applied"));
        assert_eq!(
            fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "import sys\nprint('hello')\n"
        );
    }

    #[test]
    fn test_apply_from_stdin() {
        let dir = workspace();
        fs::write(dir.path().join("app.py"), "import sys\nprint('hi')\n").unwrap();
        sweteam(&dir)
            .args(["diff", "apply", "app.py"])
            .write_stdin(DIFF)
            .assert()
            .success();
        assert!(fs::read_to_string(dir.path().join("app.py")).unwrap().contains("hello"));
    }

    #[test]
    fn test_mismatched_diff_leaves_file_unchanged() {
        let dir = workspace();
        fs::write(dir.path().join("app.py"), "import os\nprint('hi')\n").unwrap();
        sweteam(&dir)
            .args(["diff", "apply", "app.py"])
            .write_stdin(DIFF)
            .assert()
            .failure()
            .stderr(predicate::str::contains("the file was not changed"));
        assert_eq!(
            fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "import os\nprint('hi')\n"
        );
    }
}

// =============================================================================
// Directory plan
// =============================================================================

mod plan {
    use super::*;

    #[test]
    fn test_update_then_show() {
        let dir = workspace();
        fs::create_dir_all(dir.path().join("default_project/src")).unwrap();
        fs::write(dir.path().join("default_project/src/main.py"), "print(1)\n").unwrap();
        fs::write(
            dir.path().join("patch.yaml"),
            "src:\n  type: directory\n  contents:\n    api.py:\n      type: file\n      description: REST handlers\n",
        )
        .unwrap();

        sweteam(&dir)
            .args(["plan", "update", "patch.yaml"])
            .assert()
            .success()
            .stdout(predicate::str::contains("dir_structure.yaml"));
        assert!(dir.path().join("dir_structure.yaml").is_file());

        sweteam(&dir)
            .args(["plan", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("api.py"))
            .stdout(predicate::str::contains("main.py"));

        sweteam(&dir)
            .args(["plan", "show", "--actual-only"])
            .assert()
            .success()
            .stdout(predicate::str::contains("main.py"))
            .stdout(predicate::str::contains("api.py").not());
    }

    #[test]
    fn test_bad_patch_fails() {
        let dir = workspace();
        fs::write(dir.path().join("patch.yaml"), "- just\n- a list\n").unwrap();
        sweteam(&dir).args(["plan", "update", "patch.yaml"]).assert().failure();
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_show_defaults() {
        let dir = workspace();
        sweteam(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No sweteam.toml"))
            .stdout(predicate::str::contains("default_project"));
    }

    #[test]
    fn test_init_then_validate() {
        let dir = workspace();
        sweteam(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created sweteam.toml"));
        assert!(dir.path().join(".sweteam/sweteam.toml").is_file());

        sweteam(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));

        sweteam(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = workspace();
        write_config(&dir, "[project]\nname = \"shop\"\n");
        sweteam(&dir)
            .env("SWETEAM_PROJECT_NAME", "blog")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("name = \"blog\""));
    }

    #[test]
    fn test_invalid_values_fail() {
        let dir = workspace();
        sweteam(&dir)
            .env("SWETEAM_RETRY_COUNT", "lots")
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("must be an integer"));

        write_config(&dir, "[project]\nname = \"my project\"\n");
        sweteam(&dir)
            .args(["issue", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("project.name"));
    }

    #[test]
    fn test_validate_reports_warnings() {
        let dir = workspace();
        write_config(
            &dir,
            "[[workers]]\nname = \"qa\"\nrole = \"tests\"\ntools = [\"read_file\", \"teleport\"]\n",
        );
        sweteam(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings:"))
            .stdout(predicate::str::contains("teleport"));
    }

    #[test]
    fn test_custom_roster_drives_assignment() {
        let dir = workspace();
        write_config(&dir, "[[workers]]\nname = \"qa\"\nrole = \"tests\"\n");
        create_issue(&dir, &["--title", "Regression suite"]);
        sweteam(&dir).args(["issue", "assign", "1", "qa"]).assert().success();
        sweteam(&dir).args(["issue", "assign", "1", "backend_dev"]).assert().failure();
    }
}

// =============================================================================
// Orchestration setup
// =============================================================================

mod orchestrate {
    use super::*;

    #[test]
    fn test_missing_api_key_is_a_setup_failure() {
        let dir = workspace();
        write_config(&dir, "[backend]\napi_key_env = \"SWETEAM_TEST_UNSET_KEY\"\n\n[logging]\nfile = false\n");
        sweteam(&dir)
            .env_remove("SWETEAM_TEST_UNSET_KEY")
            .args(["orchestrate", "--retry-count", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("SWETEAM_TEST_UNSET_KEY is not set"));
    }
}
