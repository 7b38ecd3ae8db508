//! In-memory cluster broker for development and testing
//!
//! Several `MessageBus` instances sharing one `MemoryBroker` behave like
//! separate processes attached to the same broker cluster.

use super::broker::{Broker, Consumer, Producer, Sink};
use super::Message;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Consumers sharing one channel name
#[derive(Default)]
struct ChannelGroup {
    consumers: Vec<(u64, Sink)>,
    cursor: usize,
    /// Held until the first consumer joins the group
    pending: VecDeque<Message>,
}

impl ChannelGroup {
    fn next_sink(&mut self) -> Option<Sink> {
        if self.consumers.is_empty() {
            return None;
        }
        let idx = self.cursor % self.consumers.len();
        self.cursor = self.cursor.wrapping_add(1);
        Some(Arc::clone(&self.consumers[idx].1))
    }
}

#[derive(Default)]
struct BrokerState {
    topics: Mutex<HashMap<String, HashMap<String, ChannelGroup>>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl BrokerState {
    fn publish(&self, topic: &str, msg: Message) {
        let deliveries: Vec<Sink> = {
            let mut topics = self.topics.lock();
            let channels = topics.entry(topic.to_string()).or_default();
            channels
                .values_mut()
                .filter_map(|group| match group.next_sink() {
                    Some(sink) => Some(sink),
                    None => {
                        group.pending.push_back(msg.clone());
                        None
                    }
                })
                .collect()
        };

        self.published.fetch_add(1, Ordering::Relaxed);
        // Sinks run outside the lock so they may call back into the broker.
        for sink in deliveries {
            sink(msg.clone());
        }
    }
}

/// Shared in-process broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel names declared on a topic
    pub fn channel_names(&self, topic: &str) -> Vec<String> {
        let topics = self.state.topics.lock();
        let mut names: Vec<String> = topics
            .get(topic)
            .map(|channels| channels.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Number of live consumers in a channel group
    pub fn consumer_count(&self, topic: &str, channel: &str) -> usize {
        self.state
            .topics
            .lock()
            .get(topic)
            .and_then(|channels| channels.get(channel))
            .map(|group| group.consumers.len())
            .unwrap_or(0)
    }

    /// Total messages published since creation
    pub fn published(&self) -> u64 {
        self.state.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_topic(&self, topic: &str) -> Result<()> {
        self.state
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_channel(&self, topic: &str, channel: &str) -> Result<()> {
        self.state
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .entry(channel.to_string())
            .or_default();
        Ok(())
    }

    async fn producer(&self, _topic: &str) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(MemoryProducer {
            state: Arc::clone(&self.state),
        }))
    }

    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        sink: Sink,
    ) -> Result<Box<dyn Consumer>> {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let backlog: Vec<Message> = {
            let mut topics = self.state.topics.lock();
            let group = topics
                .entry(topic.to_string())
                .or_default()
                .entry(channel.to_string())
                .or_default();
            group.consumers.push((id, Arc::clone(&sink)));
            group.pending.drain(..).collect()
        };

        debug!(
            "Consumer {} joined {}/{} ({} pending messages)",
            id,
            topic,
            channel,
            backlog.len()
        );
        for msg in backlog {
            sink(msg);
        }

        Ok(Box::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            topic: topic.to_string(),
            channel: channel.to_string(),
            id,
        }))
    }
}

struct MemoryProducer {
    state: Arc<BrokerState>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn publish(&self, topic: &str, msg: Message) -> Result<()> {
        self.state.publish(topic, msg);
        Ok(())
    }
}

struct MemoryConsumer {
    state: Arc<BrokerState>,
    topic: String,
    channel: String,
    id: u64,
}

impl Consumer for MemoryConsumer {
    fn stop(&self) {
        let mut topics = self.state.topics.lock();
        if let Some(group) = topics
            .get_mut(&self.topic)
            .and_then(|channels| channels.get_mut(&self.channel))
        {
            group.consumers.retain(|(id, _)| *id != self.id);
        }
    }
}
