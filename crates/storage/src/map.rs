use std::collections::BTreeMap;
use std::collections::btree_map;

use serde::{Deserialize, Serialize};

use super::types::{MessageNode, ROOT_MESSAGE_ID};

/// Id-keyed message tree of one conversation.
///
/// Iteration follows id order, so every reader sees the same order for the same
/// data. Nothing here assumes the links form a tree: parents may be missing and
/// children may loop back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageMap {
    nodes: BTreeMap<String, MessageNode>,
}

impl MessageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map holding only the synthetic root.
    pub fn with_root() -> Self {
        let mut map = Self::new();
        map.insert(MessageNode::root());
        map
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MessageNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, MessageNode> {
        self.nodes.iter()
    }

    pub fn nodes(&self) -> btree_map::Values<'_, String, MessageNode> {
        self.nodes.values()
    }

    /// Raw insert; links are stored exactly as given.
    pub fn insert(&mut self, node: MessageNode) -> Option<MessageNode> {
        self.nodes.insert(node.id.clone(), node)
    }

    /// Inserts or replaces `node` and keeps its parent's `children` in sync.
    ///
    /// Replacing an existing node keeps the children it already had; children
    /// listed on the incoming node are appended after them.
    pub fn upsert(&mut self, mut node: MessageNode) {
        if let Some(existing) = self.nodes.get(&node.id) {
            let mut children = existing.children.clone();
            for child in node.children.drain(..) {
                if !children.contains(&child) {
                    children.push(child);
                }
            }
            node.children = children;
        }

        if let Some(parent_id) = node.parent.as_deref()
            && parent_id != node.id
            && let Some(parent) = self.nodes.get_mut(parent_id)
            && !parent.children.iter().any(|child| *child == node.id)
        {
            parent.children.push(node.id.clone());
        }

        self.nodes.insert(node.id.clone(), node);
    }

    /// Ids of nodes without a parent, in iteration order.
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|node| node.parent.is_none())
            .map(|node| node.id.as_str())
            .collect()
    }

    /// Root a walk starts from when no usable selection exists: the reserved
    /// system root when it has no parent, otherwise the first parentless node.
    pub fn preferred_root(&self) -> Option<&MessageNode> {
        if let Some(root) = self.nodes.get(ROOT_MESSAGE_ID)
            && root.parent.is_none()
        {
            return Some(root);
        }

        self.nodes.values().find(|node| node.parent.is_none())
    }
}

impl FromIterator<MessageNode> for MessageMap {
    fn from_iter<T: IntoIterator<Item = MessageNode>>(iter: T) -> Self {
        let mut map = Self::new();
        for node in iter {
            map.insert(node);
        }
        map
    }
}

impl<'a> IntoIterator for &'a MessageMap {
    type Item = (&'a String, &'a MessageNode);
    type IntoIter = btree_map::Iter<'a, String, MessageNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
