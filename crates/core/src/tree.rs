use std::collections::HashSet;

use serde::Serialize;
use strand_storage::{MessageMap, MessageNode, MessageRole};

/// A message on the displayed path, with the branch choices available at its
/// position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMessage {
    #[serde(flatten)]
    pub node: MessageNode,
    /// Ids sharing this message's parent choice point, in stored order.
    pub sibling: Vec<String>,
}

impl DisplayMessage {
    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn role(&self) -> MessageRole {
        self.node.role
    }

    /// 1-based position among siblings and the sibling count, for "n/m"
    /// navigators. `None` when the parent does not list this message.
    pub fn branch_position(&self) -> Option<(usize, usize)> {
        self.sibling
            .iter()
            .position(|id| *id == self.node.id)
            .map(|index| (index + 1, self.sibling.len()))
    }

    pub fn has_branches(&self) -> bool {
        self.sibling.len() > 1
    }
}

/// Flattens `map` into the single path that runs through `selected_id`.
///
/// A selected node is followed forward along first children to its terminal,
/// then the path is rebuilt backward from that terminal to the root. An
/// unknown selection falls back to the first-child walk from the root.
/// Malformed trees degrade to the longest path reachable without revisiting a
/// node or following a missing link; this function never fails.
pub fn linearize(map: &MessageMap, selected_id: &str) -> Vec<DisplayMessage> {
    if map.is_empty() {
        return Vec::new();
    }

    let path = match map.get(selected_id) {
        Some(selected) => {
            let forward = walk_forward(map, selected);
            let terminal = forward.last().copied().unwrap_or(selected);
            walk_backward(map, terminal)
        }
        None => {
            let Some(root) = map.preferred_root() else {
                tracing::debug!(
                    selected_id,
                    node_count = map.len(),
                    "message map has no root; nothing to display"
                );
                return Vec::new();
            };
            tracing::trace!(
                selected_id,
                root_id = %root.id,
                "selection not in message map; walking from root"
            );
            walk_forward(map, root)
        }
    };

    with_siblings(&path)
        .into_iter()
        .filter(|message| message.node.role != MessageRole::System)
        .collect()
}

/// Id of the node reached by following first children from `id`.
pub fn terminal_of<'a>(map: &'a MessageMap, id: &str) -> Option<&'a str> {
    let start = map.get(id)?;
    walk_forward(map, start)
        .last()
        .map(|node| node.id.as_str())
}

/// Id to select after stepping `offset` branches away from message `index`
/// of a linearized path. `None` when the step leaves the sibling list.
pub fn switch_branch(messages: &[DisplayMessage], index: usize, offset: isize) -> Option<String> {
    let message = messages.get(index)?;
    let current = message.sibling.iter().position(|id| *id == message.node.id)?;
    let target = current.checked_add_signed(offset)?;
    message.sibling.get(target).cloned()
}

fn walk_forward<'a>(map: &'a MessageMap, start: &'a MessageNode) -> Vec<&'a MessageNode> {
    let mut visited = HashSet::from([start.id.as_str()]);
    let mut path = vec![start];
    let mut current = start;

    while let Some(next_id) = current.children.first() {
        if visited.contains(next_id.as_str()) {
            tracing::debug!(from = %current.id, to = %next_id, "cycle in children links; stopping walk");
            break;
        }
        let Some(next) = map.get(next_id) else {
            tracing::debug!(from = %current.id, missing = %next_id, "dangling child link; stopping walk");
            break;
        };
        visited.insert(next.id.as_str());
        path.push(next);
        current = next;
    }

    path
}

fn walk_backward<'a>(map: &'a MessageMap, terminal: &'a MessageNode) -> Vec<&'a MessageNode> {
    let mut visited = HashSet::from([terminal.id.as_str()]);
    let mut path = vec![terminal];
    let mut current = terminal;

    while let Some(parent_id) = current.parent.as_deref() {
        if visited.contains(parent_id) {
            tracing::debug!(from = %current.id, to = parent_id, "cycle in parent links; stopping walk");
            break;
        }
        let Some(parent) = map.get(parent_id) else {
            tracing::debug!(from = %current.id, missing = parent_id, "dangling parent link; stopping walk");
            break;
        };
        visited.insert(parent.id.as_str());
        path.push(parent);
        current = parent;
    }

    path.reverse();
    path
}

fn with_siblings(path: &[&MessageNode]) -> Vec<DisplayMessage> {
    path.iter()
        .enumerate()
        .map(|(index, node)| {
            let sibling = match index {
                0 => vec![node.id.clone()],
                _ => path[index - 1].children.clone(),
            };
            DisplayMessage {
                node: (*node).clone(),
                sibling,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_storage::ROOT_MESSAGE_ID;

    fn node(id: &str, parent: Option<&str>, children: &[&str]) -> MessageNode {
        let role = if id.matches('-').count() % 2 == 0 {
            MessageRole::User
        } else {
            MessageRole::Assistant
        };
        let mut node = MessageNode::text(id, role, format!("body of {id}"))
            .with_children(children.iter().copied());
        node.parent = parent.map(str::to_string);
        node
    }

    fn ids(messages: &[DisplayMessage]) -> Vec<&str> {
        messages.iter().map(DisplayMessage::id).collect()
    }

    fn branching_map() -> MessageMap {
        [
            node("1", None, &["2-1", "2-2"]),
            node("2-1", Some("1"), &[]),
            node("2-2", Some("1"), &["2-2-1"]),
            node("2-2-1", Some("2-2"), &[]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn empty_map_yields_nothing() {
        assert!(linearize(&MessageMap::new(), "anything").is_empty());
    }

    #[test]
    fn linear_chain_is_returned_root_first() {
        let map: MessageMap = [
            node("a", None, &["b"]),
            node("b", Some("a"), &["c"]),
            node("c", Some("b"), &["d"]),
            node("d", Some("c"), &[]),
        ]
        .into_iter()
        .collect();

        let messages = linearize(&map, "d");

        assert_eq!(ids(&messages), vec!["a", "b", "c", "d"]);
        for message in &messages {
            assert_eq!(message.sibling, vec![message.id().to_string()]);
        }
    }

    #[test]
    fn selecting_a_branch_keeps_full_sibling_list() {
        let map: MessageMap = [
            node("1", None, &["2-1", "2-2"]),
            node("2-1", Some("1"), &[]),
            node("2-2", Some("1"), &[]),
        ]
        .into_iter()
        .collect();

        let first = linearize(&map, "2-1");
        let second = linearize(&map, "2-2");

        assert_eq!(ids(&first), vec!["1", "2-1"]);
        assert_eq!(ids(&second), vec!["1", "2-2"]);
        assert_eq!(first[1].sibling, vec!["2-1", "2-2"]);
        assert_eq!(second[1].sibling, vec!["2-1", "2-2"]);
        assert_eq!(second[1].branch_position(), Some((2, 2)));
    }

    #[test]
    fn selecting_mid_branch_surfaces_continuation() {
        let messages = linearize(&branching_map(), "2-2");
        assert_eq!(ids(&messages), vec!["1", "2-2", "2-2-1"]);
        assert_eq!(messages[2].sibling, vec!["2-2-1"]);
    }

    #[test]
    fn nested_forks_resolve_by_first_child() {
        let map: MessageMap = [
            node("1", None, &["2"]),
            node("2", Some("1"), &["3-1", "3-2"]),
            node("3-1", Some("2"), &["4-1", "4-2"]),
            node("3-2", Some("2"), &[]),
            node("4-1", Some("3-1"), &[]),
            node("4-2", Some("3-1"), &[]),
        ]
        .into_iter()
        .collect();

        assert_eq!(ids(&linearize(&map, "2")), vec!["1", "2", "3-1", "4-1"]);
        assert_eq!(ids(&linearize(&map, "4-2")), vec!["1", "2", "3-1", "4-2"]);
    }

    #[test]
    fn stale_selection_walks_from_root() {
        let map = branching_map();
        let fallback = linearize(&map, "nonexistent");
        assert_eq!(ids(&fallback), vec!["1", "2-1"]);
        assert_eq!(fallback, linearize(&map, "2-1"));
    }

    #[test]
    fn cycles_terminate_with_partial_path() {
        let map: MessageMap = [node("1", None, &["2"]), node("2", Some("1"), &["1"])]
            .into_iter()
            .collect();

        for selected in ["1", "2"] {
            let messages = linearize(&map, selected);
            assert!(!messages.is_empty());
            assert!(messages.len() <= 2);
        }
    }

    #[test]
    fn parent_cycle_without_root_terminates() {
        let map: MessageMap = [node("1", Some("2"), &["2"]), node("2", Some("1"), &["1"])]
            .into_iter()
            .collect();

        assert_eq!(ids(&linearize(&map, "1")).len(), 2);
        assert!(linearize(&map, "missing").is_empty());
    }

    #[test]
    fn dangling_links_stop_the_walk() {
        let map: MessageMap = [
            node("2", Some("purged"), &["3"]),
            node("3", Some("2"), &["gone"]),
        ]
        .into_iter()
        .collect();

        let messages = linearize(&map, "2");
        assert_eq!(ids(&messages), vec!["2", "3"]);
        assert_eq!(messages[0].sibling, vec!["2"]);
    }

    #[test]
    fn system_root_anchors_but_is_hidden() {
        let map: MessageMap = [
            MessageNode::root().with_children(["u1", "u2"]),
            node("u1", Some(ROOT_MESSAGE_ID), &[]),
            node("u2", Some(ROOT_MESSAGE_ID), &["u2-a"]),
            node("u2-a", Some("u2"), &[]),
        ]
        .into_iter()
        .collect();

        let messages = linearize(&map, "u2");
        assert_eq!(ids(&messages), vec!["u2", "u2-a"]);
        assert_eq!(messages[0].sibling, vec!["u1", "u2"]);

        assert_eq!(ids(&linearize(&map, ROOT_MESSAGE_ID)), vec!["u1"]);
        assert_eq!(ids(&linearize(&map, "stale")), vec!["u1"]);
    }

    #[test]
    fn switch_branch_moves_within_siblings() {
        let messages = linearize(&branching_map(), "2-1");

        assert_eq!(switch_branch(&messages, 1, 1).as_deref(), Some("2-2"));
        assert_eq!(switch_branch(&messages, 1, -1), None);
        assert_eq!(switch_branch(&messages, 1, 2), None);
        assert_eq!(switch_branch(&messages, 9, 1), None);
    }

    #[test]
    fn terminal_follows_first_children() {
        let map = branching_map();
        assert_eq!(terminal_of(&map, "1"), Some("2-1"));
        assert_eq!(terminal_of(&map, "2-2"), Some("2-2-1"));
        assert_eq!(terminal_of(&map, "missing"), None);
    }

    #[test]
    fn display_message_serializes_flat() {
        let messages = linearize(&branching_map(), "2-2");
        let json = serde_json::to_value(&messages[1]).expect("serialize");
        assert_eq!(json["id"], "2-2");
        assert_eq!(json["sibling"][0], "2-1");
        assert_eq!(json["parent"], "1");
    }
}
