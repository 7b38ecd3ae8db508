//! Uniform random picker

use super::Balancer;
use crate::node::Node;
use crate::{Error, Result};
use rand::seq::SliceRandom;

/// Picks uniformly among live nodes, ignoring weights
#[derive(Debug, Default, Clone)]
pub struct RandomBalancer {
    nodes: Vec<Node>,
}

impl RandomBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RandomBalancer {
    fn add(&mut self, node: Node) {
        match self.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    fn rmv(&mut self, node: &Node) {
        self.nodes.retain(|n| n.id != node.id);
    }

    fn update(&mut self, node: Node) {
        self.add(node);
    }

    fn get(&mut self) -> Result<Node> {
        self.nodes
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(Error::Empty)
    }

    fn nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}
