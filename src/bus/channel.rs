//! Channels: independently consumable subscriptions on a topic

use super::broker::{Consumer, Sink};
use super::queue::{delivery_queue, DeliveryQueue, QueueReader};
use super::{telemetry, Handler, Message};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A named subscription on a topic.
///
/// Every channel on a topic sees every message. Handlers attached to the same
/// channel compete: each message goes to exactly one of them.
pub struct Channel {
    topic: String,
    name: String,
    queue: Arc<DeliveryQueue>,
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
    next_handler: AtomicUsize,
    handlers_changed: Notify,
    exiting: AtomicBool,
    shutdown: CancellationToken,
    /// Broker subscription for cluster-scoped channels
    consumer: Mutex<Option<Box<dyn Consumer>>>,
}

impl Channel {
    /// Create a channel and start its delivery task.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(topic: &str, name: &str) -> Arc<Self> {
        let (queue, reader) = delivery_queue();
        let channel = Arc::new(Self {
            topic: topic.to_string(),
            name: name.to_string(),
            queue,
            handlers: RwLock::new(Vec::new()),
            next_handler: AtomicUsize::new(0),
            handlers_changed: Notify::new(),
            exiting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            consumer: Mutex::new(None),
        });
        tokio::spawn(deliver(Arc::clone(&channel), reader));
        channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Register a handler. Messages queued before the first handler is
    /// attached are delivered once it arrives.
    pub fn attach(&self, handler: Arc<dyn Handler>) -> Result<()> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        self.handlers.write().push(handler);
        self.handlers_changed.notify_one();
        debug!("Handler attached to {}/{}", self.topic, self.name);
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Messages waiting for delivery
    pub fn depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Enqueue a message for delivery without blocking
    pub(crate) fn put(&self, msg: Message) -> Result<()> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let parked = self.queue.put(msg)?;
        if parked > 0 {
            telemetry::record_backlog(&self.topic, &self.name, parked);
        }
        Ok(())
    }

    /// Broker callback feeding this channel's queue
    pub(crate) fn sink(self: &Arc<Self>) -> Sink {
        let channel = Arc::downgrade(self);
        Arc::new(move |msg| {
            if let Some(channel) = channel.upgrade() {
                if let Err(e) = channel.put(msg) {
                    debug!(
                        "Dropping broker message for {}/{}: {}",
                        channel.topic, channel.name, e
                    );
                }
            }
        })
    }

    pub(crate) fn set_consumer(&self, consumer: Box<dyn Consumer>) {
        *self.consumer.lock() = Some(consumer);
    }

    /// Stop the channel. Queued messages are still handed to attached
    /// handlers before the delivery task ends. Returns `false` if the channel
    /// was already exiting.
    pub fn exit(&self) -> bool {
        if self
            .exiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(consumer) = self.consumer.lock().take() {
            consumer.stop();
        }
        self.shutdown.cancel();
        debug!("Channel {}/{} exiting", self.topic, self.name);
        true
    }

    fn pick_handler(&self) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read();
        if handlers.is_empty() {
            return None;
        }
        let idx = self.next_handler.fetch_add(1, Ordering::Relaxed) % handlers.len();
        Some(Arc::clone(&handlers[idx]))
    }

    async fn wait_for_handler(&self) -> Option<Arc<dyn Handler>> {
        loop {
            if let Some(handler) = self.pick_handler() {
                return Some(handler);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = self.handlers_changed.notified() => {}
            }
        }
    }

    async fn dispatch(&self, handler: Arc<dyn Handler>, msg: Message) {
        let result = handler.handle(msg).await;
        telemetry::record_delivery(&self.topic, &self.name, result.is_ok());
        if let Err(e) = result {
            warn!("Handler on {}/{} failed: {}", self.topic, self.name, e);
        }
    }
}

/// Delivery task: drains the queue into handlers, one message at a time
async fn deliver(channel: Arc<Channel>, mut reader: QueueReader) {
    let shutdown = channel.shutdown.clone();
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            msg = reader.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match channel.wait_for_handler().await {
            Some(handler) => channel.dispatch(handler, msg).await,
            None => break,
        }
    }

    reader.close();
    let mut drained = 0usize;
    while let Some(msg) = reader.try_next() {
        match channel.pick_handler() {
            Some(handler) => {
                channel.dispatch(handler, msg).await;
                drained += 1;
            }
            None => break,
        }
    }
    debug!(
        "Delivery for {}/{} stopped ({} drained)",
        channel.topic, channel.name, drained
    );
}
