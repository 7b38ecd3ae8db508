//! Topics: named message streams with local or cluster delivery scope

use super::broker::{Broker, Producer};
use super::channel::Channel;
use super::{telemetry, Message};
use crate::event::MeshEvent;
use crate::{Error, Result};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Delivery scope of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Delivery confined to this process
    Local,
    /// Delivery fanned out through the cluster broker
    Cluster,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Local => "local",
            Scope::Cluster => "cluster",
        }
    }
}

enum Transport {
    /// Inbox drained by the topic's dispatch task
    Local(mpsc::UnboundedSender<Message>),
    Cluster {
        broker: Arc<dyn Broker>,
        producers: Vec<Arc<dyn Producer>>,
    },
}

/// A named topic owning zero or more channels
pub struct Topic {
    name: String,
    scope: Scope,
    transport: Transport,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    /// Serializes channel creation so a name is never created twice
    create_lock: Mutex<()>,
    channels_changed: Notify,
    exiting: AtomicBool,
    shutdown: CancellationToken,
}

impl Topic {
    /// Create a local topic and start its dispatch task.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn local(name: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = Arc::new(Self::with_transport(name, Scope::Local, Transport::Local(tx)));
        tokio::spawn(dispatch(Arc::clone(&topic), rx));
        debug!("Created local topic {}", name);
        topic
    }

    /// Declare a cluster topic at the broker and open its producer handles
    pub(crate) async fn cluster(
        name: &str,
        broker: Arc<dyn Broker>,
        producer_count: usize,
    ) -> Result<Arc<Self>> {
        broker.declare_topic(name).await?;

        let mut producers = Vec::with_capacity(producer_count.max(1));
        for _ in 0..producer_count.max(1) {
            producers.push(broker.producer(name).await?);
        }

        info!(
            "Created cluster topic {} with {} producers",
            name,
            producers.len()
        );
        Ok(Arc::new(Self::with_transport(
            name,
            Scope::Cluster,
            Transport::Cluster { broker, producers },
        )))
    }

    fn with_transport(name: &str, scope: Scope, transport: Transport) -> Self {
        Self {
            name: name.to_string(),
            scope,
            transport,
            channels: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            channels_changed: Notify::new(),
            exiting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Look up or create the named channel.
    ///
    /// On a cluster topic a new channel joins the broker consumer group of the
    /// same name.
    pub async fn sub(&self, channel: &str) -> Result<Arc<Channel>> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        if let Some(existing) = self.channels.read().get(channel) {
            return Ok(Arc::clone(existing));
        }

        let _guard = self.create_lock.lock().await;
        if let Some(existing) = self.channels.read().get(channel) {
            return Ok(Arc::clone(existing));
        }

        let created = Channel::spawn(&self.name, channel);
        if let Transport::Cluster { broker, .. } = &self.transport {
            let subscribed = async {
                broker.declare_channel(&self.name, channel).await?;
                broker
                    .subscribe(&self.name, channel, created.sink())
                    .await
            }
            .await;
            match subscribed {
                Ok(consumer) => created.set_consumer(consumer),
                Err(e) => {
                    created.exit();
                    return Err(e);
                }
            }
        }

        self.channels
            .write()
            .insert(channel.to_string(), Arc::clone(&created));
        self.channels_changed.notify_one();
        if self.is_exiting() {
            // Lost the race with exit(); nothing else will stop this channel.
            created.exit();
            return Err(Error::Exiting);
        }
        info!(
            "Subscribed channel {} on {} topic {}",
            channel,
            self.scope.as_str(),
            self.name
        );
        Ok(created)
    }

    /// Publish a message to every channel of this topic
    pub async fn publish(&self, msg: Message) -> Result<()> {
        let result = self.publish_inner(msg).await;
        telemetry::record_publish(&self.name, self.scope.as_str(), result.is_ok());
        result
    }

    async fn publish_inner(&self, msg: Message) -> Result<()> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        match &self.transport {
            Transport::Local(inbox) => inbox.send(msg).map_err(|_| Error::Exiting),
            Transport::Cluster { producers, .. } => {
                let producer = producers
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .ok_or_else(|| Error::Broker(format!("no producer for {}", self.name)))?;
                producer.publish(&self.name, msg).await
            }
        }
    }

    /// Serialize and publish a typed event
    pub async fn publish_event(&self, event: impl Into<MeshEvent>) -> Result<()> {
        let msg = event.into().to_message()?;
        self.publish(msg).await
    }

    /// Channel names currently registered
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop the topic and all of its channels. Messages already accepted by a
    /// local topic are fanned out before the channels stop. Returns `false`
    /// if the topic was already exiting.
    pub fn exit(&self) -> bool {
        if self
            .exiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.shutdown.cancel();
        if self.scope == Scope::Cluster {
            self.exit_channels();
        }
        info!("Topic {} exiting", self.name);
        true
    }

    fn exit_channels(&self) {
        for channel in self.channels.read().values() {
            channel.exit();
        }
    }

    fn fanout_snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }
}

fn fan_out(topic: &str, channels: &[Arc<Channel>], msg: Message) {
    for channel in channels {
        if let Err(e) = channel.put(msg.clone()) {
            debug!(
                "Skipping channel {}/{} during fan-out: {}",
                topic,
                channel.name(),
                e
            );
        }
    }
}

/// Dispatch task of a local topic.
///
/// Waits until a channel exists, then fans every inbox message out to the
/// current channel set, refreshing the set whenever a channel is added.
async fn dispatch(topic: Arc<Topic>, mut inbox: mpsc::UnboundedReceiver<Message>) {
    loop {
        if !topic.channels.read().is_empty() {
            break;
        }
        tokio::select! {
            _ = topic.shutdown.cancelled() => {
                topic.exit_channels();
                return;
            }
            _ = topic.channels_changed.notified() => {}
        }
    }

    let mut fanout = topic.fanout_snapshot();
    loop {
        tokio::select! {
            biased;
            _ = topic.shutdown.cancelled() => {
                inbox.close();
                fanout = topic.fanout_snapshot();
                while let Ok(msg) = inbox.try_recv() {
                    fan_out(&topic.name, &fanout, msg);
                }
                break;
            }
            _ = topic.channels_changed.notified() => {
                fanout = topic.fanout_snapshot();
            }
            msg = inbox.recv() => match msg {
                Some(msg) => fan_out(&topic.name, &fanout, msg),
                None => break,
            },
        }
    }

    topic.exit_channels();
    debug!("Dispatch loop for {} stopped", topic.name);
}
