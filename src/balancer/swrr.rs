//! Smooth weighted round-robin picker
//!
//! Every pick raises each node's current weight by its static weight, selects
//! the node with the highest current weight and lowers the winner by the total
//! weight. Selections interleave in proportion to weight instead of bursting
//! on the heaviest node.

use super::Balancer;
use crate::node::Node;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct WeightedNode {
    node: Node,
    current_weight: i64,
}

impl WeightedNode {
    fn weight(&self) -> i64 {
        self.node.weight.max(0)
    }
}

/// Smooth weighted round-robin over live nodes
#[derive(Debug, Default, Clone)]
pub struct SwrrBalancer {
    nodes: Vec<WeightedNode>,
    total_weight: i64,
}

impl SwrrBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_weight(&self) -> i64 {
        self.total_weight
    }

    fn recompute_total(&mut self) {
        self.total_weight = self.nodes.iter().map(WeightedNode::weight).sum();
    }
}

impl Balancer for SwrrBalancer {
    fn add(&mut self, node: Node) {
        match self.nodes.iter_mut().find(|n| n.node.id == node.id) {
            // Keeps current_weight so a weight refresh does not reset the rotation.
            Some(existing) => existing.node = node,
            None => self.nodes.push(WeightedNode {
                node,
                current_weight: 0,
            }),
        }
        self.recompute_total();
    }

    fn rmv(&mut self, node: &Node) {
        self.nodes.retain(|n| n.node.id != node.id);
        self.recompute_total();
    }

    fn update(&mut self, node: Node) {
        self.add(node);
    }

    fn get(&mut self) -> Result<Node> {
        // An all-zero set rotates as if every weight were 1.
        let uniform = self.total_weight == 0;
        let mut best: Option<usize> = None;
        for idx in 0..self.nodes.len() {
            let entry = &mut self.nodes[idx];
            entry.current_weight += if uniform { 1 } else { entry.weight() };
            let current = entry.current_weight;
            match best {
                Some(b) if self.nodes[b].current_weight >= current => {}
                _ => best = Some(idx),
            }
        }

        let winner = best.ok_or(Error::Empty)?;
        let total = if uniform {
            self.nodes.len() as i64
        } else {
            self.total_weight
        };
        let entry = &mut self.nodes[winner];
        entry.current_weight -= total;
        Ok(entry.node.clone())
    }

    fn nodes(&self) -> Vec<Node> {
        self.nodes.iter().map(|n| n.node.clone()).collect()
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted(id: &str, weight: i64) -> Node {
        Node::new(id, "user", format!("{}:80", id)).with_weight(weight)
    }

    fn picks(balancer: &mut SwrrBalancer, n: usize) -> Vec<String> {
        (0..n).map(|_| balancer.get().unwrap().id).collect()
    }

    #[test]
    fn test_smooth_sequence() {
        let mut balancer = SwrrBalancer::new();
        balancer.add(weighted("A", 4));
        balancer.add(weighted("B", 2));
        balancer.add(weighted("C", 1));
        assert_eq!(balancer.total_weight(), 7);

        assert_eq!(
            picks(&mut balancer, 7),
            vec!["A", "B", "A", "C", "A", "B", "A"]
        );
        // The cycle repeats once every current weight returns to zero.
        assert_eq!(
            picks(&mut balancer, 7),
            vec!["A", "B", "A", "C", "A", "B", "A"]
        );
    }

    #[test]
    fn test_equal_weights_round_robin_in_insertion_order() {
        let mut balancer = SwrrBalancer::new();
        balancer.add(weighted("x", 1));
        balancer.add(weighted("y", 1));
        balancer.add(weighted("z", 1));
        assert_eq!(
            picks(&mut balancer, 6),
            vec!["x", "y", "z", "x", "y", "z"]
        );
    }

    #[test]
    fn test_all_zero_weights_rotate() {
        let mut balancer = SwrrBalancer::new();
        balancer.add(weighted("x", 0));
        balancer.add(weighted("y", 0));
        balancer.add(weighted("z", -3));
        assert_eq!(balancer.total_weight(), 0);
        assert_eq!(
            picks(&mut balancer, 6),
            vec!["x", "y", "z", "x", "y", "z"]
        );

        // Once any node carries weight the zero-weight nodes stop winning.
        balancer.update(weighted("y", 2));
        let chosen = picks(&mut balancer, 10);
        assert!(chosen.iter().all(|id| id == "y"), "{:?}", chosen);
    }

    #[test]
    fn test_update_changes_share() {
        let mut balancer = SwrrBalancer::new();
        balancer.add(weighted("A", 1));
        balancer.add(weighted("B", 1));
        balancer.update(weighted("B", 3));
        assert_eq!(balancer.total_weight(), 4);

        let chosen = picks(&mut balancer, 400);
        let b = chosen.iter().filter(|id| id.as_str() == "B").count();
        assert_eq!(b, 300);
    }

    #[test]
    fn test_remove_recomputes_total() {
        let mut balancer = SwrrBalancer::new();
        let a = weighted("A", 5);
        balancer.add(a.clone());
        balancer.add(weighted("B", 2));
        balancer.rmv(&a);
        assert_eq!(balancer.total_weight(), 2);
        assert_eq!(picks(&mut balancer, 3), vec!["B", "B", "B"]);

        balancer.rmv(&weighted("B", 2));
        assert_eq!(balancer.get(), Err(Error::Empty));
    }
}
