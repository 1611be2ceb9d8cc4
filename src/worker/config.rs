//! Worker definitions: name, role, instructions and declared tool set.

use serde::{Deserialize, Serialize};

use super::tools::TOOL_NAMES;

fn default_tools() -> Vec<String> {
    TOOL_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    /// One-line role summary shown to the meta worker when reassigning.
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
    /// Overrides the backend model for this worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl WorkerConfig {
    pub fn new(name: &str, role: &str, instructions: &str) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            instructions: instructions.to_string(),
            tools: default_tools(),
            model: None,
            temperature: default_temperature(),
        }
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t == name)
    }

    /// Full system instructions: shared board conventions plus the role text.
    pub fn system_instructions(&self) -> String {
        format!("{}\n\n{}", SHARED_INSTRUCTIONS, self.instructions)
    }

    /// Declared tools that no handler exists for.
    pub fn unknown_tools(&self) -> Vec<&str> {
        self.tools
            .iter()
            .map(String::as_str)
            .filter(|t| !TOOL_NAMES.contains(t))
            .collect()
    }
}

const SHARED_INSTRUCTIONS: &str = "\
Work is tracked as issues on the issue board. Issues are numbered by path, \
e.g. issue 12/3 is sub-issue 3 of issue 12.

Use the issue_manager tool to list, read, create, update and assign issues. \
Search the board before creating an issue and update an existing one instead \
of creating a duplicate. Always update the issue you worked on with what you \
did. Completed issues cannot be updated; create a sub-issue for follow-up work.

Before adding or moving files, read the planned layout with \
dir_structure(action='read') and record new files with \
dir_structure(action='update'). Read a file before changing it. Prefer \
apply_diff with strict unified diff hunks for edits to existing files; if a \
diff is rejected, read the file again and regenerate the diff.

Use run_module and run_command to execute code and tests. Use \
chat_with_worker to ask another worker for help and get_human_input only \
when a requirement is genuinely ambiguous.";

/// The default roster of assignable workers.
pub fn default_roster() -> Vec<WorkerConfig> {
    vec![
        WorkerConfig::new(
            "pm",
            "analyze feature requirements and break them into smaller, specific sub-issues covering design, backend, frontend, packaging and deployment",
            "You are the product manager. For each request work out the expected input, \
             the processing and the output. Decide whether an issue is specific enough to \
             code; if not, break it into sub-issues and assign each to the right worker. \
             Start new work with an architecture sub-issue for the architect, then follow up \
             with the developers until the code works. An issue is completed only when all \
             its code runs and its tests pass.",
        ),
        WorkerConfig::new(
            "architect",
            "choose the technology and the directory and file layout for an issue, and build a working boilerplate",
            "You are the software architect. Choose the technology for the issue, preferring \
             libraries already in the project. Plan the directory structure with dir_structure \
             before creating files, describing each file's purpose. Define interfaces and API \
             contracts in code with doc comments. Build a boilerplate where every component \
             runs together, then assign the follow-up issue to backend_dev or frontend_dev.",
        ),
        WorkerConfig::new(
            "backend_dev",
            "develop backend code serving the API, business logic and data persistence",
            "You are a senior backend developer. Read the issue and the existing code before \
             changing anything, edit the files the plan assigns to the feature, and keep \
             existing behaviour unless the issue says otherwise. Write tests alongside the \
             code and run them with run_module or run_command until they pass. Update the \
             issue with what you changed.",
        ),
        WorkerConfig::new(
            "frontend_dev",
            "develop the web user interface and its calls to the backend API",
            "You are a senior frontend developer. Build the HTML, CSS and JavaScript the issue \
             asks for in the files the plan names. Confirm the files exist in the planned \
             layout before editing and update the plan for new ones. Test the UI against a \
             running backend and update the issue with your results.",
        ),
        WorkerConfig::new(
            "designer",
            "design UI and UX, produce wireframes and turn them into CSS",
            "You are the UI/UX designer. Produce wireframes for the issue and implement them \
             as CSS in the planned files, coordinating with frontend_dev.",
        ),
        WorkerConfig::new(
            "sre",
            "package the software as containers, test the packages and deploy them",
            "You are the site reliability engineer. Build container images for finished work, \
             run them, and deploy as the issue specifies. Analyse command output and report \
             failures to the responsible worker with the exact error.",
        ),
        WorkerConfig::new(
            "tester",
            "write and run integration tests against the acceptance criteria",
            "You are the test engineer. Write integration tests under tests/ that check the \
             behaviour the issue describes, run them, and send the first failing error to the \
             responsible developer. Focus on one failure at a time.",
        ),
    ]
}

/// The meta worker the orchestrator uses for reassignment, patch application
/// and reply judging.
pub fn meta_worker(name: &str) -> WorkerConfig {
    WorkerConfig::new(
        name,
        "coordinate the team: route issues to workers, apply code changes and evaluate replies",
        "You coordinate a software team. When asked to reassign an issue, read it and \
         assign it to the single best worker with issue_manager(action='assign'). When \
         given code from a worker's reply, write it to the named file with apply_diff or \
         overwrite_file. When evaluating a worker, use evaluate_worker with a score and \
         concrete additional instructions.",
    )
}

/// `name: role` lines for the roster, used in reassignment prompts.
pub fn roster_roles(roster: &[WorkerConfig]) -> String {
    roster
        .iter()
        .map(|w| format!("{}: {}", w.name, w.role))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roster_names() {
        let names: Vec<String> = default_roster().into_iter().map(|w| w.name).collect();
        assert_eq!(
            names,
            vec!["pm", "architect", "backend_dev", "frontend_dev", "designer", "sre", "tester"]
        );
    }

    #[test]
    fn test_default_tools_are_all_known() {
        for worker in default_roster() {
            assert!(worker.unknown_tools().is_empty(), "{}", worker.name);
            assert!(worker.has_tool("issue_manager"));
        }
    }

    #[test]
    fn test_worker_from_toml_defaults() {
        let worker: WorkerConfig = toml::from_str(
            "name = \"data_eng\"\nrole = \"build pipelines\"\ntools = [\"read_file\", \"teleport\"]\n",
        )
        .unwrap();
        assert_eq!(worker.temperature, 0.7);
        assert_eq!(worker.unknown_tools(), vec!["teleport"]);
        assert!(worker.system_instructions().contains("issue board"));
    }

    #[test]
    fn test_roster_roles_lines() {
        let text = roster_roles(&default_roster());
        assert!(text.lines().any(|l| l.starts_with("sre: ")));
        assert_eq!(text.lines().count(), 7);
    }
}
