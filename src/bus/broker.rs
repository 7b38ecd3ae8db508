//! Cluster broker interface
//!
//! Cluster-scoped topics delegate delivery to an external broker with
//! NSQ-style semantics: every channel name on a topic is a consumer group
//! that receives its own copy of each message, and consumers sharing a
//! channel name compete for it.

use super::Message;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Non-blocking callback the broker invokes for every delivered message
pub type Sink = Arc<dyn Fn(Message) + Send + Sync>;

/// Administrative and data-plane surface of the cluster broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a topic before first use
    async fn declare_topic(&self, topic: &str) -> Result<()>;

    /// Declare a channel (consumer group) on a topic
    async fn declare_channel(&self, topic: &str, channel: &str) -> Result<()>;

    /// Open a producer handle for a topic
    async fn producer(&self, topic: &str) -> Result<Arc<dyn Producer>>;

    /// Register a consumer in the `channel` group of `topic`
    async fn subscribe(&self, topic: &str, channel: &str, sink: Sink)
        -> Result<Box<dyn Consumer>>;
}

/// Publishing handle for one topic
#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, topic: &str, msg: Message) -> Result<()>;
}

/// Live broker subscription
pub trait Consumer: Send + Sync {
    /// Detach from the broker. Idempotent.
    fn stop(&self);
}
