//! Planned/actual directory tree model and reconciliation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

pub const NOT_PLANNED: &str = "not planned";
pub const NOT_IMPLEMENTED: &str = "not implemented";

static DIRECTORY_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^directory (of|for)\s*").expect("valid directory prefix regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    #[serde(alias = "dir")]
    Directory,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top level of a tree: the project name mapped to its root directory node.
pub type Tree = BTreeMap<String, TreeNode>;

/// One file or directory. Children are keyed by entry name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<NodeKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contents: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    pub fn file(description: impl Into<String>, size: u64) -> Self {
        Self {
            kind: Some(NodeKind::File),
            description: description.into(),
            size: Some(size),
            contents: BTreeMap::new(),
        }
    }

    pub fn directory(description: impl Into<String>) -> Self {
        Self {
            kind: Some(NodeKind::Directory),
            description: description.into(),
            size: None,
            contents: BTreeMap::new(),
        }
    }

    /// Declared kind, or directory when the node has children.
    pub fn kind(&self) -> NodeKind {
        match self.kind {
            Some(kind) => kind,
            None if !self.contents.is_empty() => NodeKind::Directory,
            None => NodeKind::File,
        }
    }

    /// Merge a planning patch into this node. Non-empty fields in the patch
    /// win; children merge recursively.
    pub fn merge_plan(&mut self, patch: TreeNode) {
        if patch.kind.is_some() {
            self.kind = patch.kind;
        }
        if !patch.description.is_empty() {
            self.description = if patch.kind() == NodeKind::Directory {
                DIRECTORY_PREFIX_RE
                    .replace(&patch.description, "")
                    .into_owned()
            } else {
                patch.description
            };
        }
        for (name, child) in patch.contents {
            self.contents.entry(name).or_default().merge_plan(child);
        }
    }

    /// Number of entries in this subtree, including this node.
    pub fn count(&self) -> usize {
        1 + self.contents.values().map(TreeNode::count).sum::<usize>()
    }
}

/// A field that is either identical on both sides or differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Field {
    Same(String),
    Diverged { planned: String, actual: String },
}

impl Field {
    fn compare(planned: String, actual: String) -> Self {
        if planned == actual {
            Self::Same(actual)
        } else {
            Self::Diverged { planned, actual }
        }
    }

    pub fn is_same(&self) -> bool {
        matches!(self, Self::Same(_))
    }
}

/// One entry of the reconciled tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedNode {
    #[serde(rename = "type")]
    pub kind: Field,
    pub description: Field,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub contents: BTreeMap<String, MergedNode>,
}

impl MergedNode {
    /// True when this node and every descendant match the plan.
    pub fn in_sync(&self) -> bool {
        self.kind.is_same() && self.description.is_same() && self.contents.values().all(MergedNode::in_sync)
    }
}

pub type MergedTree = BTreeMap<String, MergedNode>;

/// Combine a planned tree with a scanned one.
///
/// Entries present on both sides compare field by field. An empty planned
/// description matches any actual description. Entries only on one side are
/// reported against the `"not planned"` / `"not implemented"` sentinels.
pub fn reconcile(planned: &Tree, actual: &Tree) -> MergedTree {
    merge_children(planned, actual)
}

fn merge_children(
    planned: &BTreeMap<String, TreeNode>,
    actual: &BTreeMap<String, TreeNode>,
) -> BTreeMap<String, MergedNode> {
    let mut merged = BTreeMap::new();
    for (name, node) in actual {
        let entry = match planned.get(name) {
            Some(plan) => merge_node(plan, node),
            None => actual_only(node),
        };
        merged.insert(name.clone(), entry);
    }
    for (name, plan) in planned {
        if !actual.contains_key(name) {
            merged.insert(name.clone(), planned_only(plan));
        }
    }
    merged
}

fn merge_node(plan: &TreeNode, actual: &TreeNode) -> MergedNode {
    let description = if plan.description.is_empty() {
        Field::Same(actual.description.clone())
    } else {
        Field::compare(plan.description.clone(), actual.description.clone())
    };
    MergedNode {
        kind: Field::compare(plan.kind().to_string(), actual.kind().to_string()),
        description,
        size: actual.size,
        contents: merge_children(&plan.contents, &actual.contents),
    }
}

fn actual_only(actual: &TreeNode) -> MergedNode {
    MergedNode {
        kind: Field::Diverged {
            planned: NOT_PLANNED.to_string(),
            actual: actual.kind().to_string(),
        },
        description: Field::Diverged {
            planned: NOT_PLANNED.to_string(),
            actual: actual.description.clone(),
        },
        size: actual.size,
        contents: actual
            .contents
            .iter()
            .map(|(name, child)| (name.clone(), actual_only(child)))
            .collect(),
    }
}

fn planned_only(plan: &TreeNode) -> MergedNode {
    MergedNode {
        kind: Field::Diverged {
            planned: plan.kind().to_string(),
            actual: NOT_IMPLEMENTED.to_string(),
        },
        description: Field::Diverged {
            planned: plan.description.clone(),
            actual: NOT_IMPLEMENTED.to_string(),
        },
        size: None,
        contents: plan
            .contents
            .iter()
            .map(|(name, child)| (name.clone(), planned_only(child)))
            .collect(),
    }
}
