//! Process-local link cache
//!
//! Bindings live in memory; only link counts are mirrored to the shared store
//! so discovery in other processes sees aggregate load. Several processes of
//! one service add to the same count key, so removals decrement by the
//! number of tokens this process held and the key is never deleted.

use super::telemetry;
use super::{CacheContext, ClusterView, LinkCache, LinkInfo, RelationKey};
use crate::bus::MessageBus;
use crate::config::{CacheMode, LinkCacheConfig};
use crate::node::Node;
use crate::store::KvStore;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct LocalState {
    /// (child service, token) -> binding
    routes: HashMap<(String, String), LinkInfo>,
    /// Tokens bound to each child instance
    relations: HashMap<RelationKey, HashSet<String>>,
}

impl LocalState {
    fn child_services(&self) -> HashSet<String> {
        self.relations
            .keys()
            .map(|rel| rel.child_name.clone())
            .collect()
    }
}

/// Link cache holding bindings in process memory
pub struct LocalLinkCache {
    ctx: CacheContext,
    state: RwLock<LocalState>,
}

impl LocalLinkCache {
    pub async fn new(
        service: impl Into<String>,
        config: &LinkCacheConfig,
        store: Arc<dyn KvStore>,
        bus: &MessageBus,
    ) -> Result<Self> {
        let ctx = CacheContext::connect(service.into(), config, store, bus).await?;
        info!("Local link cache ready for {}", ctx.service);
        Ok(Self {
            ctx,
            state: RwLock::new(LocalState::default()),
        })
    }

    /// Number of bindings held by this process
    pub async fn len(&self) -> usize {
        self.state.read().await.routes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tokens this process has bound to `node`
    pub async fn tokens_for(&self, node: &Node) -> Vec<String> {
        let rel = self.ctx.relation(node);
        let state = self.state.read().await;
        let mut tokens: Vec<String> = state
            .relations
            .get(&rel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        tokens.sort();
        tokens
    }

    /// Adjust the fleet-wide count. The key is shared with other processes of
    /// this service and is never deleted from here.
    async fn add_count(&self, rel: &RelationKey, delta: i64) -> Result<()> {
        let key = self.ctx.keys.link_count(rel);
        let count = self.ctx.call(self.ctx.store.incr_by(&key, delta)).await?;
        self.ctx.publish_count(rel, count).await;
        Ok(())
    }

    /// Remove one token from a relation, dropping the relation when it empties
    fn release(state: &mut LocalState, rel: &RelationKey, token: &str) {
        if let Some(tokens) = state.relations.get_mut(rel) {
            tokens.remove(token);
            if tokens.is_empty() {
                state.relations.remove(rel);
            }
        }
    }

    fn holds(state: &LocalState, rel: &RelationKey, token: &str) -> bool {
        state
            .relations
            .get(rel)
            .is_some_and(|tokens| tokens.contains(token))
    }

    // Each store call below is followed by the matching in-memory change, so
    // a failed call leaves memory and the count in step.

    async fn link_locked(&self, state: &mut LocalState, token: &str, node: &Node) -> Result<()> {
        let route = (node.name.clone(), token.to_string());
        let rel = self.ctx.relation(node);

        if let Some(previous) = state.routes.get(&route).cloned() {
            if previous.target_id == node.id {
                state.routes.insert(route, LinkInfo::from(node));
                return Ok(());
            }
            let old = RelationKey::new(
                self.ctx.service.clone(),
                previous.target_name.clone(),
                previous.target_id.clone(),
            );
            if Self::holds(state, &old, token) {
                self.add_count(&old, -1).await?;
                Self::release(state, &old, token);
            }
            state.routes.remove(&route);
            debug!(
                "Token {} for {} moved from {} to {}",
                token, node.name, previous.target_id, node.id
            );
        }

        self.add_count(&rel, 1).await?;
        state.routes.insert(route, LinkInfo::from(node));
        state
            .relations
            .entry(rel)
            .or_default()
            .insert(token.to_string());
        Ok(())
    }

    async fn unlink_locked(&self, state: &mut LocalState, token: &str) -> Result<()> {
        for child in state.child_services() {
            let route = (child, token.to_string());
            let Some(info) = state.routes.get(&route).cloned() else {
                continue;
            };
            let rel = RelationKey::new(
                self.ctx.service.clone(),
                info.target_name.clone(),
                info.target_id.clone(),
            );
            if Self::holds(state, &rel, token) {
                self.add_count(&rel, -1).await?;
                Self::release(state, &rel, token);
            }
            state.routes.remove(&route);
        }
        Ok(())
    }

    async fn down_locked(&self, state: &mut LocalState, rel: &RelationKey) -> Result<usize> {
        let Some(held) = state.relations.get(rel).map(HashSet::len) else {
            return Ok(0);
        };
        self.add_count(rel, -(held as i64)).await?;
        let tokens = state.relations.remove(rel).unwrap_or_default();
        for token in &tokens {
            let route = (rel.child_name.clone(), token.clone());
            if matches!(state.routes.get(&route), Some(info) if info.target_id == rel.child_id) {
                state.routes.remove(&route);
            }
        }
        Ok(tokens.len())
    }
}

#[async_trait]
impl LinkCache for LocalLinkCache {
    async fn target(&self, token: &str, service: &str) -> Result<String> {
        let result = {
            let state = self.state.read().await;
            state
                .routes
                .get(&(service.to_string(), token.to_string()))
                .map(|info| info.target_addr.clone())
                .ok_or(Error::NotFound)
        };
        telemetry::record_operation("target", "local", &result);
        result
    }

    async fn link(&self, token: &str, node: &Node) -> Result<()> {
        let mut state = self.state.write().await;
        let result = self.link_locked(&mut state, token, node).await;
        telemetry::record_operation("link", "local", &result);
        result
    }

    async fn unlink(&self, token: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let result = self.unlink_locked(&mut state, token).await;
        telemetry::record_operation("unlink", "local", &result);
        result
    }

    async fn down(&self, node: &Node) -> Result<()> {
        let rel = self.ctx.relation(node);
        let mut state = self.state.write().await;
        let result = self.down_locked(&mut state, &rel).await;
        if let Ok(tokens) = result {
            if tokens > 0 {
                info!("Dropped {} links to {} ({})", tokens, node.id, node.name);
            }
        }
        telemetry::record_operation("down", "local", &result);
        result.map(|_| ())
    }

    async fn sync_relation(&self) -> Result<usize> {
        Ok(self.state.read().await.child_services().len())
    }

    async fn sync_offline(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let stale: Vec<RelationKey> = state
            .relations
            .keys()
            .filter(|rel| !self.ctx.view.is_alive(&rel.child_id))
            .cloned()
            .collect();
        for rel in &stale {
            self.down_locked(&mut state, rel).await?;
        }
        if !stale.is_empty() {
            info!(
                "Offline sweep for {} dropped {} relations",
                self.ctx.service,
                stale.len()
            );
        }
        telemetry::record_sweep("local", stale.len());
        Ok(stale.len())
    }

    fn mode(&self) -> CacheMode {
        CacheMode::Local
    }

    fn service(&self) -> &str {
        &self.ctx.service
    }

    fn view(&self) -> &ClusterView {
        &self.ctx.view
    }
}
