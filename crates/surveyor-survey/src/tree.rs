//! Arena-indexed trees.
//!
//! Outline, content and digest trees all live in flat arenas with
//! parent/child links expressed as indices. This keeps deep copies plain
//! `Clone`, makes serde round-trips structural, and avoids back-pointer
//! cycles between the parallel trees.

use serde::{Deserialize, Serialize};

/// Index of a node inside an [`Arena`]. The root is always node zero.
pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Slot<T> {
    data: T,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// A tree stored as a flat slab of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arena<T> {
    nodes: Vec<Slot<T>>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the root node. Any previous contents are discarded.
    pub fn insert_root(&mut self, data: T) -> NodeId {
        self.nodes.clear();
        self.nodes.push(Slot {
            data,
            parent: None,
            children: Vec::new(),
        });
        0
    }

    /// Inserts a child under `parent` and returns its id.
    pub fn insert_child(&mut self, parent: NodeId, data: T) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Slot {
            data,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// The root id, when the arena is non-empty.
    pub fn root(&self) -> Option<NodeId> {
        (!self.nodes.is_empty()).then_some(0)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns whether the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Borrow of the node payload.
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(id).map(|slot| &slot.data)
    }

    /// Mutable borrow of the node payload.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(id).map(|slot| &mut slot.data)
    }

    /// Parent id of `id`, `None` for the root.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|slot| slot.parent)
    }

    /// Child ids of `id`, in insertion order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|slot| slot.children.as_slice())
            .unwrap_or(&[])
    }

    /// Returns whether `id` has no children.
    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.children(id).is_empty()
    }

    /// Distance from the root (root depth is zero).
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Pre-order traversal starting at `id`, including `id` itself.
    pub fn descend(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            order.push(current);
            for child in self.children(current).iter().rev() {
                stack.push(*child);
            }
        }
        order
    }

    /// Pre-order traversal of the whole tree.
    pub fn ids(&self) -> Vec<NodeId> {
        match self.root() {
            Some(root) => self.descend(root),
            None => Vec::new(),
        }
    }

    /// Ids of all leaves, in pre-order.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.ids()
            .into_iter()
            .filter(|id| self.is_leaf(*id))
            .collect()
    }

    /// Child-position path from the root down to `id`.
    pub fn index_path(&self, id: NodeId) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            let position = self.children(parent)
                .iter()
                .position(|child| *child == current)
                .unwrap_or(0);
            path.push(position);
            current = parent;
        }
        path.reverse();
        path
    }

    /// Dotted 1-based section number (`"2.1"`); empty for the root.
    pub fn number_index(&self, id: NodeId) -> String {
        self.index_path(id)
            .iter()
            .map(|position| (position + 1).to_string())
            .collect::<Vec<_>>()
            .join(".")
    }
}
