//! Planned vs. actual project layout.
//!
//! The planned tree is a YAML document workers maintain before writing files.
//! The actual tree is always scanned live from the project directory and never
//! cached.

pub mod scan;
pub mod tree;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::util::write_atomic;

pub use scan::{DEFAULT_EXCLUDES, compile_excludes, extract_description, scan_directory};
pub use tree::{Field, MergedNode, MergedTree, NodeKind, Tree, TreeNode, reconcile};

pub struct DirectoryPlanner {
    project_name: String,
    project_dir: PathBuf,
    plan_file: PathBuf,
    excludes: Vec<glob::Pattern>,
}

impl DirectoryPlanner {
    pub fn new(
        project_name: impl Into<String>,
        project_dir: impl Into<PathBuf>,
        plan_file: impl Into<PathBuf>,
        exclude_patterns: &[String],
    ) -> Self {
        Self {
            project_name: project_name.into(),
            project_dir: project_dir.into(),
            plan_file: plan_file.into(),
            excludes: compile_excludes(exclude_patterns),
        }
    }

    pub fn plan_file(&self) -> &Path {
        &self.plan_file
    }

    /// The persisted plan, or an empty tree if none has been written yet.
    pub fn load_plan(&self) -> Result<Tree> {
        if !self.plan_file.exists() {
            return Ok(Tree::new());
        }
        let text = std::fs::read_to_string(&self.plan_file)
            .with_context(|| format!("Failed to read {}", self.plan_file.display()))?;
        if text.trim().is_empty() {
            return Ok(Tree::new());
        }
        serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse {}", self.plan_file.display()))
    }

    fn save_plan(&self, plan: &Tree) -> Result<()> {
        let yaml = serde_yaml::to_string(plan).context("Failed to serialize directory plan")?;
        write_atomic(&self.plan_file, yaml.as_bytes())
            .with_context(|| format!("Failed to write {}", self.plan_file.display()))
    }

    /// Scan the project directory into a tree keyed by the project name.
    pub fn scan(&self) -> Result<Tree> {
        let mut tree = Tree::new();
        if self.project_dir.is_dir() {
            tree.insert(
                self.project_name.clone(),
                scan_directory(&self.project_dir, &self.excludes)?,
            );
        }
        Ok(tree)
    }

    /// Reconcile the persisted plan with a fresh scan.
    pub fn reconcile(&self) -> Result<MergedTree> {
        let planned = self.load_plan()?;
        let actual = self.scan()?;
        Ok(reconcile(&planned, &actual))
    }

    /// Merge `patch` into the persisted plan. A patch not rooted at the
    /// project name is treated as the contents of the project root.
    pub fn update(&self, mut patch: Tree) -> Result<Tree> {
        let rooted = if patch.len() == 1 && patch.contains_key(&self.project_name) {
            patch
        } else {
            let mut root = TreeNode::directory("");
            root.contents.append(&mut patch);
            Tree::from([(self.project_name.clone(), root)])
        };

        let mut plan = self.load_plan()?;
        for (name, node) in rooted {
            plan.entry(name).or_default().merge_plan(node);
        }
        self.save_plan(&plan)?;
        tracing::info!(
            plan_file = %self.plan_file.display(),
            entries = plan.values().map(TreeNode::count).sum::<usize>(),
            "updated directory plan"
        );
        Ok(plan)
    }

    /// Parse a YAML or JSON patch and merge it.
    pub fn update_from_str(&self, patch: &str) -> Result<Tree> {
        let tree: Tree = serde_yaml::from_str(patch).context("Directory plan patch must be a YAML/JSON mapping of names to nodes")?;
        self.update(tree)
    }

    pub fn actual_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.scan()?).context("Failed to render directory tree")
    }

    pub fn reconciled_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.reconcile()?).context("Failed to render directory tree")
    }
}
