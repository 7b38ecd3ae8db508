//! Link cache backed by the shared key-value store
//!
//! Every process of a service resolves every token. Counts rely on the
//! store's atomic single-key operations. `down` and the offline sweep delete
//! state other processes rely on, so they only run while this process holds
//! the master role.

use super::telemetry;
use super::{CacheContext, ClusterView, LinkCache, LinkInfo, RelationKey};
use crate::bus::MessageBus;
use crate::config::{CacheMode, LinkCacheConfig};
use crate::node::Node;
use crate::store::KvStore;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock as SnapshotLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Link cache holding bindings in the shared store
pub struct SharedLinkCache {
    ctx: CacheContext,
    /// Child services `unlink` fans out to, rebuilt by `sync_relation`
    children: SnapshotLock<Vec<String>>,
    /// `target` reads, every mutation writes
    lock: RwLock<()>,
}

impl SharedLinkCache {
    pub async fn new(
        service: impl Into<String>,
        config: &LinkCacheConfig,
        store: Arc<dyn KvStore>,
        bus: &MessageBus,
    ) -> Result<Self> {
        let ctx = CacheContext::connect(service.into(), config, store, bus).await?;
        let cache = Self {
            ctx,
            children: SnapshotLock::new(Vec::new()),
            lock: RwLock::new(()),
        };
        let children = cache.sync_relation().await?;
        info!(
            "Shared link cache ready for {} ({} linked services)",
            cache.ctx.service, children
        );
        Ok(cache)
    }

    /// Snapshot of the child services `unlink` currently fans out to
    pub fn child_services(&self) -> Vec<String> {
        self.children.read().clone()
    }

    fn remember_child(&self, child: &str) {
        let mut children = self.children.write();
        if !children.iter().any(|c| c == child) {
            children.push(child.to_string());
        }
    }

    async fn relation_members(&self) -> Result<Vec<RelationKey>> {
        let key = self.ctx.keys.relation(&self.ctx.service);
        let members = self.ctx.call(self.ctx.store.smembers(&key)).await?;
        Ok(members
            .iter()
            .filter_map(|member| match RelationKey::parse(member) {
                Ok(rel) => Some(rel),
                Err(e) => {
                    warn!("Ignoring relation member {}: {}", member, e);
                    None
                }
            })
            .collect())
    }

    async fn lookup(&self, token: &str, service: &str) -> Result<Option<LinkInfo>> {
        let route = self.ctx.keys.route(&self.ctx.service, service);
        match self.ctx.call(self.ctx.store.hget(&route, token)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drop one token from a relation's count and token set. The relation
    /// membership and count key stay until `down` removes the relation.
    async fn release(&self, rel: &RelationKey, token: &str) -> Result<()> {
        let store = &self.ctx.store;
        let keys = &self.ctx.keys;
        let count = self
            .ctx
            .call(store.incr_by(&keys.link_count(rel), -1))
            .await?;
        self.ctx.call(store.srem(&keys.tokens(rel), token)).await?;
        self.ctx.publish_count(rel, count).await;
        Ok(())
    }

    async fn link_locked(&self, token: &str, node: &Node) -> Result<()> {
        let store = &self.ctx.store;
        let keys = &self.ctx.keys;
        let rel = self.ctx.relation(node);
        let route = keys.route(&self.ctx.service, &node.name);
        let value = serde_json::to_string(&LinkInfo::from(node))?;

        let previous = self.lookup(token, &node.name).await?;
        if let Some(previous) = &previous {
            if previous.target_id == node.id {
                self.ctx.call(store.hset(&route, token, &value)).await?;
                return Ok(());
            }
        }

        // Relation and count first: a route is never visible without them.
        self.ctx
            .call(store.sadd(&keys.relation(&self.ctx.service), &rel.encode()))
            .await?;
        self.ctx.call(store.sadd(&keys.tokens(&rel), token)).await?;
        let count = self.ctx.call(store.incr_by(&keys.link_count(&rel), 1)).await?;
        self.ctx.call(store.hset(&route, token, &value)).await?;
        self.remember_child(&node.name);
        self.ctx.publish_count(&rel, count).await;

        if let Some(previous) = previous {
            let old = RelationKey::new(
                self.ctx.service.clone(),
                previous.target_name,
                previous.target_id,
            );
            debug!(
                "Token {} for {} moved from {} to {}",
                token, node.name, old.child_id, node.id
            );
            self.release(&old, token).await?;
        }
        Ok(())
    }

    async fn unlink_locked(&self, token: &str) -> Result<()> {
        let store = &self.ctx.store;
        for child in self.child_services() {
            let Some(info) = self.lookup(token, &child).await? else {
                continue;
            };
            let route = self.ctx.keys.route(&self.ctx.service, &child);
            let removed = self
                .ctx
                .call(store.hdel(&route, &[token.to_string()]))
                .await?;
            // Another process removed the field first and owns the decrement.
            if removed == 0 {
                continue;
            }
            let rel = RelationKey::new(self.ctx.service.clone(), child, info.target_id);
            self.release(&rel, token).await?;
        }
        Ok(())
    }

    /// Remove every binding of one relation. Caller holds the write lock and
    /// has checked the role.
    ///
    /// Route fields are selected by their bound target rather than the token
    /// set, so a field orphaned by a partial write is still removed and a
    /// token already moved to another target is left alone.
    async fn sweep(&self, rel: &RelationKey) -> Result<usize> {
        let store = &self.ctx.store;
        let keys = &self.ctx.keys;
        let route = keys.route(&rel.parent, &rel.child_name);
        let fields: Vec<String> = self
            .ctx
            .call(store.hgetall(&route))
            .await?
            .into_iter()
            .filter_map(|(token, raw)| match serde_json::from_str::<LinkInfo>(&raw) {
                Ok(info) if info.target_id == rel.child_id => Some(token),
                Ok(_) => None,
                Err(e) => {
                    warn!("Ignoring route entry {} in {}: {}", token, route, e);
                    None
                }
            })
            .collect();
        if !fields.is_empty() {
            self.ctx.call(store.hdel(&route, &fields)).await?;
        }
        self.ctx.call(store.del(&keys.tokens(rel))).await?;
        self.ctx
            .call(store.srem(&keys.relation(&rel.parent), &rel.encode()))
            .await?;
        self.ctx.call(store.del(&keys.link_count(rel))).await?;
        self.ctx.publish_count(rel, 0).await;
        Ok(fields.len())
    }
}

#[async_trait]
impl LinkCache for SharedLinkCache {
    async fn target(&self, token: &str, service: &str) -> Result<String> {
        let result = {
            let _guard = self.lock.read().await;
            self.lookup(token, service)
                .await
                .and_then(|info| info.map(|i| i.target_addr).ok_or(Error::NotFound))
        };
        telemetry::record_operation("target", "shared", &result);
        result
    }

    async fn link(&self, token: &str, node: &Node) -> Result<()> {
        let _guard = self.lock.write().await;
        let result = self.link_locked(token, node).await;
        telemetry::record_operation("link", "shared", &result);
        result
    }

    async fn unlink(&self, token: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let result = self.unlink_locked(token).await;
        telemetry::record_operation("unlink", "shared", &result);
        result
    }

    async fn down(&self, node: &Node) -> Result<()> {
        if !self.ctx.view.is_master() {
            debug!(
                "Skipping down for {} ({}): role is {}",
                node.id,
                node.name,
                self.ctx.view.role()
            );
            return Ok(());
        }
        let rel = self.ctx.relation(node);
        let _guard = self.lock.write().await;
        let result = self.sweep(&rel).await;
        if let Ok(tokens) = result {
            info!("Dropped {} links to {} ({})", tokens, node.id, node.name);
        }
        telemetry::record_operation("down", "shared", &result);
        result.map(|_| ())
    }

    async fn sync_relation(&self) -> Result<usize> {
        let children: BTreeSet<String> = self
            .relation_members()
            .await?
            .into_iter()
            .map(|rel| rel.child_name)
            .collect();
        let children: Vec<String> = children.into_iter().collect();
        let count = children.len();
        *self.children.write() = children;
        Ok(count)
    }

    async fn sync_offline(&self) -> Result<usize> {
        if !self.ctx.view.is_master() {
            debug!(
                "Offline sweep for {} suppressed: role is {}",
                self.ctx.service,
                self.ctx.view.role()
            );
            return Ok(0);
        }

        let _guard = self.lock.write().await;
        let stale: Vec<RelationKey> = self
            .relation_members()
            .await?
            .into_iter()
            .filter(|rel| !self.ctx.view.is_alive(&rel.child_id))
            .collect();
        for rel in &stale {
            self.sweep(rel).await?;
        }
        if !stale.is_empty() {
            info!(
                "Offline sweep for {} dropped {} relations",
                self.ctx.service,
                stale.len()
            );
        }
        telemetry::record_sweep("shared", stale.len());
        Ok(stale.len())
    }

    fn mode(&self) -> CacheMode {
        CacheMode::Shared
    }

    fn service(&self) -> &str {
        &self.ctx.service
    }

    fn view(&self) -> &ClusterView {
        &self.ctx.view
    }
}
