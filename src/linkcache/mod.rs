//! Session-affinity link cache
//!
//! Resolves `(token, callee service)` to the address of the instance the token
//! was first bound to, records new bindings and garbage-collects them when the
//! token is unlinked or the instance goes offline.
//!
//! Two implementations share the [`LinkCache`] interface:
//! - [`LocalLinkCache`] keeps bindings in process memory and only mirrors
//!   link counts to the shared store.
//! - [`SharedLinkCache`] keeps everything in the shared store so any process
//!   of the service resolves any token. Destructive cleanup runs only while
//!   this process holds the master role.

mod keys;
mod local;
mod router;
mod shared;
mod telemetry;
mod view;

pub use keys::{KeySpace, RelationKey};
pub use local::LocalLinkCache;
pub use router::AffinityRouter;
pub use shared::SharedLinkCache;
pub use view::ClusterView;

use crate::bus::{handler_fn, Channel, Message, MessageBus, Topic};
use crate::config::{CacheMode, LinkCacheConfig};
use crate::event::{
    decode_leader, decode_membership, decode_unlink, LinkCount, MembershipKind, UnlinkRequest,
    LEADER_TOPIC, LINK_COUNT_TOPIC, MEMBERSHIP_TOPIC, UNLINK_TOPIC,
};
use crate::node::Node;
use crate::store::KvStore;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channel the link cache consumes membership and leader events on
pub const LINK_CACHE_CHANNEL: &str = "linkcache";

/// Resolved binding of one token against one callee service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub target_addr: String,
    pub target_id: String,
    pub target_name: String,
}

impl From<&Node> for LinkInfo {
    fn from(node: &Node) -> Self {
        Self {
            target_addr: node.address.clone(),
            target_id: node.id.clone(),
            target_name: node.name.clone(),
        }
    }
}

/// Token to instance bindings of one parent service
#[async_trait]
pub trait LinkCache: Send + Sync {
    /// Address bound to `token` for `service`, or [`Error::NotFound`]
    async fn target(&self, token: &str, service: &str) -> Result<String>;

    /// Bind `token` to `node`. An existing binding for the same service is
    /// replaced.
    async fn link(&self, token: &str, node: &Node) -> Result<()>;

    /// Drop every binding held for `token`
    async fn unlink(&self, token: &str) -> Result<()>;

    /// Drop every binding to `node`
    async fn down(&self, node: &Node) -> Result<()>;

    /// Refresh the child-service list `unlink` fans out to. Returns its size.
    async fn sync_relation(&self) -> Result<usize>;

    /// Sweep relations whose child is not known to be alive. Returns how many
    /// relations were swept.
    async fn sync_offline(&self) -> Result<usize>;

    fn mode(&self) -> CacheMode;

    /// Parent service this cache belongs to
    fn service(&self) -> &str;

    fn view(&self) -> &ClusterView;
}

/// State and helpers shared by both cache modes
pub(crate) struct CacheContext {
    pub(crate) service: String,
    pub(crate) keys: KeySpace,
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) store_timeout: Duration,
    pub(crate) view: ClusterView,
    link_counts: Arc<Topic>,
}

impl CacheContext {
    /// Ping the store and open the link-count topic
    pub(crate) async fn connect(
        service: String,
        config: &LinkCacheConfig,
        store: Arc<dyn KvStore>,
        bus: &MessageBus,
    ) -> Result<Self> {
        if service.is_empty() {
            return Err(Error::Config("link cache requires a service name".to_string()));
        }
        let ctx = Self {
            service,
            keys: KeySpace::new(config.key_prefix.clone()),
            store,
            store_timeout: config.store_timeout,
            view: ClusterView::new(),
            link_counts: bus.topic(LINK_COUNT_TOPIC)?,
        };
        if let Err(e) = ctx.call(ctx.store.ping()).await {
            error!("Shared store ping failed for {}: {}", ctx.service, e);
            return Err(e);
        }
        Ok(ctx)
    }

    /// Run one store round trip bounded by the store timeout
    pub(crate) async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        tokio::time::timeout(self.store_timeout, fut).await?
    }

    pub(crate) fn relation(&self, node: &Node) -> RelationKey {
        RelationKey::new(self.service.clone(), node.name.clone(), node.id.clone())
    }

    /// Announce a relation's new link count. Delivery is best effort.
    pub(crate) async fn publish_count(&self, relation: &RelationKey, count: i64) {
        let event = LinkCount {
            parent: relation.parent.clone(),
            child_name: relation.child_name.clone(),
            child_id: relation.child_id.clone(),
            count: count.max(0),
        };
        if let Err(e) = self.link_counts.publish_event(event).await {
            debug!("Link count for {} not published: {}", relation, e);
        }
    }
}

/// Handles of the tasks started by [`start`]. Dropping the handles cancels
/// the tasks without waiting for them.
#[must_use = "dropping the handles stops the link cache tasks"]
pub struct LinkCacheTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    channels: Vec<Arc<Channel>>,
}

impl LinkCacheTasks {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the periodic tasks and event channels and wait for them to end
    pub async fn shutdown(mut self) {
        self.stop();
        let handles = std::mem::take(&mut self.handles);
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Link cache task ended abnormally: {}", e);
            }
        }
        info!("Link cache tasks stopped");
    }

    fn stop(&self) {
        self.shutdown.cancel();
        for channel in &self.channels {
            channel.exit();
        }
    }
}

impl Drop for LinkCacheTasks {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wire a link cache to the bus and start its reconciliation loops.
///
/// Membership adds and updates feed the alive set and removes trigger
/// `down`; leader events drive the role; unlink requests addressed to this
/// service are applied. In shared mode one process of the service handles
/// each unlink request, in local mode every process handles its own.
pub async fn start(
    cache: Arc<dyn LinkCache>,
    bus: &MessageBus,
    config: &LinkCacheConfig,
    instance_id: &str,
) -> Result<LinkCacheTasks> {
    let shutdown = CancellationToken::new();
    let mut channels = Vec::with_capacity(3);

    let membership = bus.topic(MEMBERSHIP_TOPIC)?.sub(LINK_CACHE_CHANNEL).await?;
    let handler_cache = Arc::clone(&cache);
    membership.attach(handler_fn(move |msg: Message| {
        let cache = Arc::clone(&handler_cache);
        async move {
            let event = decode_membership(&msg)?;
            match event.event {
                MembershipKind::Add | MembershipKind::Update => {
                    cache.view().mark_alive(event.node);
                    Ok(())
                }
                MembershipKind::Remove => {
                    cache.view().mark_dead(&event.node.id);
                    cache.down(&event.node).await
                }
            }
        }
    }))?;
    channels.push(membership);

    let leader = bus.topic(LEADER_TOPIC)?.sub(LINK_CACHE_CHANNEL).await?;
    let handler_cache = Arc::clone(&cache);
    leader.attach(handler_fn(move |msg: Message| {
        let cache = Arc::clone(&handler_cache);
        async move {
            let role = decode_leader(&msg)?;
            let previous = cache.view().set_role(role);
            if previous != role {
                info!(
                    "Link cache for {} role {} -> {}",
                    cache.service(),
                    previous,
                    role
                );
                telemetry::record_role_transition(role.as_str());
            }
            Ok(())
        }
    }))?;
    channels.push(leader);

    let unlink_topic = if bus.has_broker() {
        bus.cluster_topic(UNLINK_TOPIC).await?
    } else {
        info!("No broker configured, unlink requests stay process-local");
        bus.topic(UNLINK_TOPIC)?
    };
    let unlink_channel = match cache.mode() {
        CacheMode::Shared => cache.service().to_string(),
        CacheMode::Local => format!("{}.{}", cache.service(), instance_id),
    };
    let unlink = unlink_topic.sub(&unlink_channel).await?;
    let handler_cache = Arc::clone(&cache);
    unlink.attach(handler_fn(move |msg: Message| {
        let cache = Arc::clone(&handler_cache);
        async move {
            let request = decode_unlink(&msg)?;
            if request.parent != cache.service() {
                return Ok(());
            }
            cache.unlink(&request.token).await
        }
    }))?;
    channels.push(unlink);

    let mut handles = Vec::with_capacity(2);
    if cache.mode() == CacheMode::Shared {
        handles.push(spawn_periodic(
            "sync_relation",
            Arc::clone(&cache),
            config.sync_relation_interval,
            shutdown.clone(),
            |cache| async move { cache.sync_relation().await },
        ));
    }
    handles.push(spawn_periodic(
        "sync_offline",
        Arc::clone(&cache),
        config.sync_offline_interval,
        shutdown.clone(),
        |cache| async move { cache.sync_offline().await },
    ));

    info!(
        "Link cache started for {} in {} mode",
        cache.service(),
        cache.mode().as_str()
    );
    Ok(LinkCacheTasks {
        shutdown,
        handles,
        channels,
    })
}

/// Publish an unlink request for `token` held by `parent`
pub async fn request_unlink(bus: &MessageBus, parent: &str, token: &str) -> Result<()> {
    let topic = if bus.has_broker() {
        bus.cluster_topic(UNLINK_TOPIC).await?
    } else {
        bus.topic(UNLINK_TOPIC)?
    };
    topic
        .publish_event(UnlinkRequest {
            parent: parent.to_string(),
            token: token.to_string(),
        })
        .await
}

/// Run `tick` every `period` until cancelled. Each tick runs in its own task
/// so a panic is logged and the loop carries on.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    cache: Arc<dyn LinkCache>,
    period: Duration,
    shutdown: CancellationToken,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<dyn LinkCache>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<usize>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match tokio::spawn(tick(Arc::clone(&cache))).await {
                        Ok(Ok(n)) => debug!("{} for {} done ({})", name, cache.service(), n),
                        Ok(Err(e)) => warn!("{} for {} failed: {}", name, cache.service(), e),
                        Err(e) => error!("{} task for {} panicked: {}", name, cache.service(), e),
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("{} loop for {} stopped", name, cache.service());
                    break;
                }
            }
        }
    })
}
