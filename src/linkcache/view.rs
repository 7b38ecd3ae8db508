//! Role and liveness as observed from bus events

use crate::event::LeaderState;
use crate::node::Node;
use dashmap::DashMap;
use parking_lot::RwLock;

/// What this process currently knows about its role and the live fleet
#[derive(Debug, Default)]
pub struct ClusterView {
    role: RwLock<LeaderState>,
    alive: DashMap<String, Node>,
}

impl ClusterView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(&self) -> LeaderState {
        *self.role.read()
    }

    pub fn is_master(&self) -> bool {
        self.role().is_master()
    }

    /// Record a role change and return the previous role
    pub fn set_role(&self, role: LeaderState) -> LeaderState {
        std::mem::replace(&mut *self.role.write(), role)
    }

    pub fn mark_alive(&self, node: Node) {
        self.alive.insert(node.id.clone(), node);
    }

    pub fn mark_dead(&self, id: &str) -> Option<Node> {
        self.alive.remove(id).map(|(_, node)| node)
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.alive.contains_key(id)
    }

    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_transitions() {
        let view = ClusterView::new();
        assert_eq!(view.role(), LeaderState::Wait);
        assert_eq!(view.set_role(LeaderState::Slave), LeaderState::Wait);
        assert!(!view.is_master());
        assert_eq!(view.set_role(LeaderState::Master), LeaderState::Slave);
        assert!(view.is_master());
    }

    #[test]
    fn test_liveness() {
        let view = ClusterView::new();
        view.mark_alive(Node::new("u1", "user", "10.0.0.1:80"));
        assert!(view.is_alive("u1"));
        assert_eq!(view.mark_dead("u1").map(|n| n.name), Some("user".to_string()));
        assert!(!view.is_alive("u1"));
        assert!(view.mark_dead("u1").is_none());
    }
}
