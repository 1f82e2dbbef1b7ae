//! The active chain: the connected sequence from genesis to the current tip,
//! with height-indexed access and logarithmic fork finding.

use crate::blockindex::{BlockIndex, NodeId};

#[derive(Default)]
pub struct ActiveChain {
    nodes: Vec<NodeId>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.nodes.last().copied()
    }

    /// Height of the tip; -1 for an empty chain.
    pub fn height(&self) -> i32 {
        self.nodes.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<NodeId> {
        if height < 0 {
            return None;
        }
        self.nodes.get(height as usize).copied()
    }

    pub fn contains(&self, index: &BlockIndex, id: NodeId) -> bool {
        self.at(index.node(id).height) == Some(id)
    }

    /// Replaces the suffix so `id` becomes the tip, reusing the shared
    /// prefix with the previous chain.
    pub fn set_tip(&mut self, index: &BlockIndex, id: Option<NodeId>) {
        let Some(id) = id else {
            self.nodes.clear();
            return;
        };
        let height = index.node(id).height;
        self.nodes.resize((height + 1) as usize, id);
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node_height = index.node(node_id).height as usize;
            if self.nodes[node_height] == node_id && node_height < height as usize {
                break;
            }
            self.nodes[node_height] = node_id;
            current = index.node(node_id).parent;
        }
    }

    /// Deepest node shared between this chain and the branch ending at `id`.
    pub fn find_fork(&self, index: &BlockIndex, id: NodeId) -> Option<NodeId> {
        let mut current = id;
        if index.node(current).height > self.height() {
            current = index.ancestor(current, self.height())?;
        }
        while !self.contains(index, current) {
            current = index.node(current).parent?;
        }
        Some(current)
    }

    /// Node ids from the one after `fork` up to and including `id`.
    pub fn path_from_fork(index: &BlockIndex, fork: Option<NodeId>, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            if Some(node_id) == fork {
                break;
            }
            path.push(node_id);
            current = index.node(node_id).parent;
        }
        path.reverse();
        path
    }
}
