//! Message bus with process-local and cluster-wide topics
//!
//! Local topics fan messages out inside this process through a dispatch task.
//! Cluster topics hand publishing and channel membership to a [`Broker`], so
//! equal channel names in different processes compete for messages while
//! different names each get a copy.

pub mod broker;
pub mod channel;
pub mod memory;
pub mod queue;
pub(crate) mod telemetry;
pub mod topic;

pub use broker::{Broker, Consumer, Producer, Sink};
pub use channel::Channel;
pub use memory::MemoryBroker;
pub use topic::{Scope, Topic};

use crate::config::BusConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

/// Opaque payload carried by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Bytes,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self { body: body.into() }
    }
}

/// Consumer attached to a channel
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, msg: Message) -> Result<()>;
}

#[async_trait]
impl Handler for mpsc::UnboundedSender<Message> {
    async fn handle(&self, msg: Message) -> Result<()> {
        self.send(msg).map_err(|_| Error::Exiting)
    }
}

/// Handler backed by an async closure, see [`handler_fn`]
pub struct HandlerFn<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, msg: Message) -> Result<()> {
        (self.f)(msg).await
    }
}

/// Wrap an async closure as a channel handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn {
        f,
        _fut: PhantomData,
    })
}

/// Registry of the topics used by one process
pub struct MessageBus {
    config: BusConfig,
    broker: Option<Arc<dyn Broker>>,
    local: DashMap<String, Arc<Topic>>,
    cluster: DashMap<String, Arc<Topic>>,
    /// Serializes cluster topic creation, which awaits the broker
    cluster_lock: Mutex<()>,
    exiting: AtomicBool,
}

impl MessageBus {
    /// Bus with local topics only
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            broker: None,
            local: DashMap::new(),
            cluster: DashMap::new(),
            cluster_lock: Mutex::new(()),
            exiting: AtomicBool::new(false),
        }
    }

    /// Bus whose cluster topics go through `broker`
    pub fn with_broker(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        let mut bus = Self::new(config);
        bus.broker = Some(broker);
        bus
    }

    pub fn has_broker(&self) -> bool {
        self.broker.is_some()
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Look up or create a local topic.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let topic = self
            .local
            .entry(name.to_string())
            .or_insert_with(|| Topic::local(name))
            .clone();
        Ok(topic)
    }

    /// Look up or create a cluster topic
    pub async fn cluster_topic(&self, name: &str) -> Result<Arc<Topic>> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let broker = self.broker.as_ref().ok_or_else(|| {
            Error::Config(format!("cluster topic {} requires a broker", name))
        })?;
        if let Some(topic) = self.cluster.get(name) {
            return Ok(Arc::clone(topic.value()));
        }

        let _guard = self.cluster_lock.lock().await;
        if let Some(topic) = self.cluster.get(name) {
            return Ok(Arc::clone(topic.value()));
        }
        let topic =
            Topic::cluster(name, Arc::clone(broker), self.config.producers_per_topic).await?;
        self.cluster.insert(name.to_string(), Arc::clone(&topic));
        Ok(topic)
    }

    /// Names of every topic created so far, local first
    pub fn topic_names(&self) -> Vec<(Scope, String)> {
        let mut names: Vec<(Scope, String)> = self
            .local
            .iter()
            .map(|e| (Scope::Local, e.key().clone()))
            .collect();
        names.sort();
        let mut cluster: Vec<(Scope, String)> = self
            .cluster
            .iter()
            .map(|e| (Scope::Cluster, e.key().clone()))
            .collect();
        cluster.sort();
        names.extend(cluster);
        names
    }

    /// Stop every topic. Returns `false` if the bus was already exiting.
    pub fn exit(&self) -> bool {
        if self
            .exiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        for topic in self.local.iter().chain(self.cluster.iter()) {
            topic.exit();
        }
        info!(
            "Message bus exiting ({} local, {} cluster topics)",
            self.local.len(),
            self.cluster.len()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_topic_lookup_is_idempotent() {
        let bus = MessageBus::new(BusConfig::default());
        let a = bus.topic("events").unwrap();
        let b = bus.topic("events").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.scope(), Scope::Local);
    }

    #[tokio::test]
    async fn test_cluster_topic_without_broker() {
        let bus = MessageBus::new(BusConfig::default());
        assert!(matches!(
            bus.cluster_topic("events").await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_fn_receives_messages() {
        let bus = MessageBus::new(BusConfig::default());
        let topic = bus.topic("events").unwrap();
        let channel = topic.sub("audit").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel
            .attach(handler_fn(move |msg: Message| {
                let tx = tx.clone();
                async move {
                    tx.send(msg.body).map_err(|_| Error::Exiting)?;
                    Ok(())
                }
            }))
            .unwrap();

        topic.publish(Message::new(&b"hello"[..])).await.unwrap();
        let body = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_exit_is_idempotent_and_rejects_new_topics() {
        let bus = MessageBus::new(BusConfig::default());
        let topic = bus.topic("events").unwrap();
        assert!(bus.exit());
        assert!(!bus.exit());
        assert!(topic.is_exiting());
        assert!(matches!(bus.topic("other"), Err(Error::Exiting)));
    }
}
