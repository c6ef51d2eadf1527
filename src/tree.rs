//! Hierarchical tri-state selection over the backup/restore browser tree.
//!
//! The backend ships a forest of [`TreeNode`]s (categories, folders, files).
//! [`SelectionTree`] flattens it once, then keeps the checked/unchecked/
//! indeterminate state of every node consistent while the user toggles
//! arbitrary subsets. Only fully-checked selectable nodes are ever stored in
//! the selection map; indeterminate is a derived view.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// One entry of the tree payload, as served by `backup_browser_tree`.
#[derive(Clone, Debug, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub selectable: bool,
    #[serde(default)]
    pub default_checked: bool,
    #[serde(default)]
    pub action: Option<Value>,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckState {
    Unchecked,
    Checked,
    Indeterminate,
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("duplicate node id {0:?} in tree payload")]
    DuplicateId(String),
    #[error("action attached to non-selectable node {0:?}")]
    ActionOnContainer(String),
    #[error("unknown node id {0:?}")]
    UnknownNode(String),
}

#[derive(Debug)]
struct NodeMeta {
    selectable: bool,
    default_checked: bool,
    action: Option<Value>,
    parent: Option<usize>,
    children: Vec<usize>,
    depth: usize,
    /// Whether this node or any descendant is selectable. Containers with
    /// no selectable content are ignored when deriving ancestor state.
    has_selectable: bool,
}

/// Selection state for one rendered tree. Built fresh on every payload
/// reload; nothing survives a rebuild.
#[derive(Debug, Default)]
pub struct SelectionTree {
    /// Node ids in depth-first order; the index doubles as the node handle.
    ids: Vec<String>,
    index: HashMap<String, usize>,
    meta: Vec<NodeMeta>,
    roots: Vec<usize>,
    /// Fully-checked selectable nodes. Indeterminate nodes never appear here.
    selected: HashSet<usize>,
    /// Derived per-node state, kept in step with `selected` so the ancestor
    /// pass after a toggle only looks at direct children.
    states: Vec<CheckState>,
}

impl SelectionTree {
    pub fn build(forest: Vec<TreeNode>) -> Result<Self, TreeError> {
        let mut tree = SelectionTree::default();
        for node in forest {
            let root = tree.insert(node, None, 0)?;
            tree.roots.push(root);
        }

        // Children always carry a higher index than their parent, so one
        // reverse sweep resolves has_selectable bottom-up.
        for i in (0..tree.meta.len()).rev() {
            let has = tree.meta[i].selectable
                || tree.meta[i]
                    .children
                    .iter()
                    .any(|&c| tree.meta[c].has_selectable);
            tree.meta[i].has_selectable = has;
        }
        Ok(tree)
    }

    fn insert(
        &mut self,
        node: TreeNode,
        parent: Option<usize>,
        depth: usize,
    ) -> Result<usize, TreeError> {
        let TreeNode {
            id,
            selectable,
            default_checked,
            action,
            children,
            ..
        } = node;

        if self.index.contains_key(&id) {
            return Err(TreeError::DuplicateId(id));
        }
        if !selectable && action.is_some() {
            return Err(TreeError::ActionOnContainer(id));
        }

        let idx = self.meta.len();
        self.index.insert(id.clone(), idx);
        self.ids.push(id);
        self.meta.push(NodeMeta {
            selectable,
            default_checked,
            action,
            parent,
            children: Vec::new(),
            depth,
            has_selectable: false,
        });
        self.states.push(CheckState::Unchecked);

        for child in children {
            let child_idx = self.insert(child, Some(idx), depth + 1)?;
            self.meta[idx].children.push(child_idx);
        }
        Ok(idx)
    }

    /// Applies every `default_checked` seed, shallow nodes first so a
    /// default-checked ancestor is not demoted to indeterminate by a
    /// later-applied descendant default. Tree order breaks depth ties.
    pub fn initialize_defaults(&mut self) {
        let mut seeds: Vec<usize> = (0..self.meta.len())
            .filter(|&i| self.meta[i].default_checked)
            .collect();
        seeds.sort_by_key(|&i| (self.meta[i].depth, i));
        for idx in seeds {
            self.toggle(idx, true);
        }
    }

    /// Toggles a node. A selectable node is set explicitly; either way every
    /// selectable descendant is forced to the same state (no partial results
    /// below an explicit toggle), then ancestor state is re-derived bottom-up.
    /// Returns the ids of all fully-checked nodes, in tree order.
    pub fn set_checked(&mut self, node_id: &str, checked: bool) -> Result<Vec<String>, TreeError> {
        let idx = *self
            .index
            .get(node_id)
            .ok_or_else(|| TreeError::UnknownNode(node_id.to_string()))?;
        self.toggle(idx, checked);
        Ok(self.selected_ids())
    }

    fn toggle(&mut self, idx: usize, checked: bool) {
        self.force_subtree(idx, checked);
        self.refresh_ancestors(idx);
    }

    fn force_subtree(&mut self, root: usize, checked: bool) {
        for i in self.subtree_postorder(root) {
            if self.meta[i].selectable {
                self.states[i] = if checked {
                    CheckState::Checked
                } else {
                    CheckState::Unchecked
                };
                if checked {
                    self.selected.insert(i);
                } else {
                    self.selected.remove(&i);
                }
            } else {
                // Containers always derive; a container without selectable
                // content stays unchecked.
                self.states[i] = self.derive_from_children(i);
            }
        }
    }

    fn subtree_postorder(&self, root: usize) -> Vec<usize> {
        let mut stack = vec![root];
        let mut order = Vec::new();
        while let Some(i) = stack.pop() {
            order.push(i);
            stack.extend(self.meta[i].children.iter().copied());
        }
        order.reverse();
        order
    }

    fn refresh_ancestors(&mut self, from: usize) {
        let mut cursor = self.meta[from].parent;
        while let Some(i) = cursor {
            let derived = self.derive_from_children(i);
            self.states[i] = derived;
            if self.meta[i].selectable {
                if derived == CheckState::Checked {
                    self.selected.insert(i);
                } else {
                    self.selected.remove(&i);
                }
            }
            cursor = self.meta[i].parent;
        }
    }

    fn derive_from_children(&self, idx: usize) -> CheckState {
        let mut total = 0usize;
        let mut checked = 0usize;
        let mut indeterminate = 0usize;
        for &child in &self.meta[idx].children {
            if !self.meta[child].has_selectable {
                continue;
            }
            total += 1;
            match self.states[child] {
                CheckState::Checked => checked += 1,
                CheckState::Indeterminate => indeterminate += 1,
                CheckState::Unchecked => {}
            }
        }
        if total == 0 || (checked == 0 && indeterminate == 0) {
            CheckState::Unchecked
        } else if checked == total {
            CheckState::Checked
        } else {
            CheckState::Indeterminate
        }
    }

    /// Unchecks everything, including derived indeterminate flags.
    pub fn clear(&mut self) {
        self.selected.clear();
        for state in &mut self.states {
            *state = CheckState::Unchecked;
        }
    }

    pub fn check_state(&self, node_id: &str) -> Option<CheckState> {
        self.index.get(node_id).map(|&i| self.states[i])
    }

    /// Ids of every fully-checked selectable node, in tree order.
    pub fn selected_ids(&self) -> Vec<String> {
        (0..self.meta.len())
            .filter(|i| self.selected.contains(i))
            .map(|i| self.ids[i].clone())
            .collect()
    }

    /// Action payloads of the current selection, de-duplicated by structural
    /// equality (two tree positions can carry the same logical action), in
    /// tree order.
    pub fn selected_actions(&self) -> Vec<Value> {
        let mut seen = HashSet::new();
        let mut actions = Vec::new();
        for i in 0..self.meta.len() {
            if !self.selected.contains(&i) {
                continue;
            }
            let Some(action) = &self.meta[i].action else {
                continue;
            };
            // serde_json maps are ordered, so the serialized form is a
            // stable structural key.
            if seen.insert(action.to_string()) {
                actions.push(action.clone());
            }
        }
        actions
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.meta.len()
    }
}
