//! Per-service node pickers driven by membership events
//!
//! A [`BalancerGroup`] keeps one random and one smooth weighted round-robin
//! picker per service. Both are updated identically so a caller can choose
//! the strategy on every pick.

mod random;
mod swrr;

pub use random::RandomBalancer;
pub use swrr::SwrrBalancer;

use crate::bus::{handler_fn, Channel, Message, MessageBus};
use crate::event::{decode_membership, MembershipEvent, MembershipKind, MEMBERSHIP_TOPIC};
use crate::node::Node;
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Channel the balancer group consumes membership events on
pub const BALANCER_CHANNEL: &str = "balancer";

/// Picker over the live nodes of one service
pub trait Balancer: Send + Sync {
    /// Add a node, replacing any node with the same ID
    fn add(&mut self, node: Node);

    /// Remove the node with the same ID
    fn rmv(&mut self, node: &Node);

    /// Refresh a node's weight. Unknown nodes are added.
    fn update(&mut self, node: Node);

    /// Pick one node. Fails with [`Error::Empty`] when no node is live.
    fn get(&mut self) -> Result<Node>;

    fn nodes(&self) -> Vec<Node>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Picking strategy chosen per call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Random,
    Swrr,
}

#[derive(Default)]
struct PickerPair {
    random: RandomBalancer,
    swrr: SwrrBalancer,
}

/// Picker pairs keyed by service name
#[derive(Default)]
pub struct BalancerGroup {
    services: DashMap<String, PickerPair>,
}

impl BalancerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: Node) {
        debug!("Balancer add {} ({}) weight={}", node.id, node.name, node.weight);
        let mut pair = self.services.entry(node.name.clone()).or_default();
        pair.random.add(node.clone());
        pair.swrr.add(node);
    }

    pub fn update(&self, node: Node) {
        debug!(
            "Balancer update {} ({}) weight={}",
            node.id, node.name, node.weight
        );
        let mut pair = self.services.entry(node.name.clone()).or_default();
        pair.random.update(node.clone());
        pair.swrr.update(node);
    }

    pub fn remove(&self, node: &Node) {
        debug!("Balancer remove {} ({})", node.id, node.name);
        let now_empty = match self.services.get_mut(&node.name) {
            Some(mut pair) => {
                pair.random.rmv(node);
                pair.swrr.rmv(node);
                pair.swrr.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.services
                .remove_if(&node.name, |_, pair| pair.swrr.is_empty());
        }
    }

    /// Apply one membership change
    pub fn apply(&self, event: MembershipEvent) {
        match event.event {
            MembershipKind::Add => self.add(event.node),
            MembershipKind::Update => self.update(event.node),
            MembershipKind::Remove => self.remove(&event.node),
        }
    }

    /// Pick a node of `service`
    pub fn pick(&self, service: &str, strategy: Strategy) -> Result<Node> {
        let mut pair = self.services.get_mut(service).ok_or(Error::Empty)?;
        match strategy {
            Strategy::Random => pair.random.get(),
            Strategy::Swrr => pair.swrr.get(),
        }
    }

    /// Live nodes of `service` in insertion order
    pub fn nodes(&self, service: &str) -> Vec<Node> {
        self.services
            .get(service)
            .map(|pair| pair.swrr.nodes())
            .unwrap_or_default()
    }

    /// Services with at least one live node, sorted
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Subscribe to membership events on `bus`
    pub async fn attach(self: &Arc<Self>, bus: &MessageBus) -> Result<Arc<Channel>> {
        let channel = bus.topic(MEMBERSHIP_TOPIC)?.sub(BALANCER_CHANNEL).await?;
        let group = Arc::clone(self);
        channel.attach(handler_fn(move |msg: Message| {
            let group = Arc::clone(&group);
            async move {
                group.apply(decode_membership(&msg)?);
                Ok(())
            }
        }))?;
        info!("Balancer group attached to {}", MEMBERSHIP_TOPIC);
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_service_is_empty() {
        let group = BalancerGroup::new();
        assert_eq!(group.pick("user", Strategy::Random), Err(Error::Empty));
        assert_eq!(group.pick("user", Strategy::Swrr), Err(Error::Empty));
    }

    #[test]
    fn test_pickers_stay_in_sync() {
        let group = BalancerGroup::new();
        group.add(Node::new("u1", "user", "10.0.0.1:80").with_weight(2));
        group.add(Node::new("u2", "user", "10.0.0.2:80"));
        group.add(Node::new("o1", "order", "10.0.1.1:80"));

        assert_eq!(group.services(), vec!["order".to_string(), "user".to_string()]);
        assert_eq!(group.pick("user", Strategy::Swrr).unwrap().id, "u1");
        assert_eq!(group.pick("order", Strategy::Random).unwrap().id, "o1");

        let u1 = Node::new("u1", "user", "10.0.0.1:80");
        group.remove(&u1);
        for _ in 0..10 {
            assert_eq!(group.pick("user", Strategy::Random).unwrap().id, "u2");
            assert_eq!(group.pick("user", Strategy::Swrr).unwrap().id, "u2");
        }
    }

    #[test]
    fn test_last_remove_drops_service() {
        let group = BalancerGroup::new();
        let node = Node::new("u1", "user", "10.0.0.1:80");
        group.apply(MembershipEvent::add(node.clone()));
        group.apply(MembershipEvent::update(node.clone().with_weight(9)));
        assert_eq!(group.nodes("user")[0].weight, 9);

        group.apply(MembershipEvent::remove(node));
        assert!(group.services().is_empty());
        assert_eq!(group.pick("user", Strategy::Swrr), Err(Error::Empty));
    }
}
