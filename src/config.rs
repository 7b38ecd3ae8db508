//! Configuration and component factory
//!
//! Every config struct has a `Default` and a `from_env` constructor. The
//! [`ComponentFactory`] maps a link-cache mode to the constructor that builds
//! it, so deployments pick the implementation through configuration.

use crate::bus::MessageBus;
use crate::linkcache::{LinkCache, LocalLinkCache, SharedLinkCache};
use crate::store::KvStore;
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("Invalid value for {}: {}", name, raw))),
    }
}

/// Message bus configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Producer handles opened per cluster topic
    pub producers_per_topic: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            producers_per_topic: 4,
        }
    }
}

impl BusConfig {
    /// Environment variables:
    /// - MESH_BUS_PRODUCERS: producer handles per cluster topic (default: 4)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(producers) = parse_var::<usize>(&lookup, "MESH_BUS_PRODUCERS")? {
            if producers == 0 {
                return Err(Error::Config(
                    "MESH_BUS_PRODUCERS must be at least 1".to_string(),
                ));
            }
            config.producers_per_topic = producers;
        }
        Ok(config)
    }
}

/// Where link-cache state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheMode {
    /// Process memory, counts mirrored to the shared store
    #[default]
    Local,
    /// Shared key-value store
    Shared,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Local => "local",
            CacheMode::Shared => "shared",
        }
    }
}

impl FromStr for CacheMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(CacheMode::Local),
            "shared" | "redis" => Ok(CacheMode::Shared),
            other => Err(Error::Config(format!(
                "Unknown LINKCACHE_MODE: {}. Use 'local' or 'shared'",
                other
            ))),
        }
    }
}

/// Link cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCacheConfig {
    pub mode: CacheMode,
    /// Namespace for every shared-store key
    pub key_prefix: String,
    pub sync_relation_interval: Duration,
    pub sync_offline_interval: Duration,
    /// Upper bound on one store round trip
    pub store_timeout: Duration,
}

impl Default for LinkCacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Local,
            key_prefix: "mesh".to_string(),
            sync_relation_interval: Duration::from_secs(3),
            sync_offline_interval: Duration::from_secs(30),
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl LinkCacheConfig {
    /// Environment variables:
    /// - LINKCACHE_MODE: "local" (default), "shared" or "redis"
    /// - LINKCACHE_PREFIX: shared-store key prefix (default: mesh)
    /// - LINKCACHE_SYNC_RELATION_SECS: relation refresh period (default: 3)
    /// - LINKCACHE_SYNC_OFFLINE_SECS: offline sweep period (default: 30)
    /// - LINKCACHE_STORE_TIMEOUT_MS: store round-trip bound (default: 2000)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(mode) = parse_var::<CacheMode>(&lookup, "LINKCACHE_MODE")? {
            config.mode = mode;
        }
        if let Some(prefix) = lookup("LINKCACHE_PREFIX") {
            if prefix.trim().is_empty() {
                return Err(Error::Config("LINKCACHE_PREFIX must not be empty".to_string()));
            }
            config.key_prefix = prefix.trim().to_string();
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LINKCACHE_SYNC_RELATION_SECS")? {
            config.sync_relation_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LINKCACHE_SYNC_OFFLINE_SECS")? {
            config.sync_offline_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "LINKCACHE_STORE_TIMEOUT_MS")? {
            config.store_timeout = Duration::from_millis(ms.max(1));
        }
        Ok(config)
    }
}

/// Process-level configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Logical service this process belongs to
    pub service: String,
    /// Unique ID of this process
    pub instance_id: String,
    pub bus: BusConfig,
    pub link_cache: LinkCacheConfig,
}

impl MeshConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            bus: BusConfig::default(),
            link_cache: LinkCacheConfig::default(),
        }
    }

    /// Environment variables:
    /// - MESH_SERVICE_NAME: logical service name (required)
    /// - MESH_INSTANCE_ID: process ID (default: random UUID)
    ///
    /// plus everything read by [`BusConfig::from_env`] and
    /// [`LinkCacheConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let service = lookup("MESH_SERVICE_NAME")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("MESH_SERVICE_NAME is required".to_string()))?;
        let instance_id = lookup("MESH_INSTANCE_ID")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            service,
            instance_id,
            bus: BusConfig::from_lookup(&lookup)?,
            link_cache: LinkCacheConfig::from_lookup(&lookup)?,
        })
    }
}

/// Constructor registered for one link-cache mode
pub type LinkCacheBuilder = for<'a> fn(
    String,
    &'a LinkCacheConfig,
    Arc<dyn KvStore>,
    &'a MessageBus,
) -> BoxFuture<'a, Result<Arc<dyn LinkCache>>>;

fn build_local<'a>(
    service: String,
    config: &'a LinkCacheConfig,
    store: Arc<dyn KvStore>,
    bus: &'a MessageBus,
) -> BoxFuture<'a, Result<Arc<dyn LinkCache>>> {
    async move {
        let cache: Arc<dyn LinkCache> =
            Arc::new(LocalLinkCache::new(service, config, store, bus).await?);
        Ok(cache)
    }
    .boxed()
}

fn build_shared<'a>(
    service: String,
    config: &'a LinkCacheConfig,
    store: Arc<dyn KvStore>,
    bus: &'a MessageBus,
) -> BoxFuture<'a, Result<Arc<dyn LinkCache>>> {
    async move {
        let cache: Arc<dyn LinkCache> =
            Arc::new(SharedLinkCache::new(service, config, store, bus).await?);
        Ok(cache)
    }
    .boxed()
}

/// Registry of link-cache constructors keyed by mode
pub struct ComponentFactory {
    builders: HashMap<CacheMode, LinkCacheBuilder>,
}

impl Default for ComponentFactory {
    fn default() -> Self {
        let mut factory = Self::empty();
        factory.register(CacheMode::Local, build_local);
        factory.register(CacheMode::Shared, build_shared);
        factory
    }
}

impl ComponentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with no registered modes
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Register or replace the constructor for `mode`
    pub fn register(&mut self, mode: CacheMode, builder: LinkCacheBuilder) {
        self.builders.insert(mode, builder);
    }

    pub fn is_registered(&self, mode: CacheMode) -> bool {
        self.builders.contains_key(&mode)
    }

    /// Build the link cache selected by `config.mode`
    pub async fn build_link_cache(
        &self,
        service: &str,
        config: &LinkCacheConfig,
        store: Arc<dyn KvStore>,
        bus: &MessageBus,
    ) -> Result<Arc<dyn LinkCache>> {
        let builder = self.builders.get(&config.mode).ok_or_else(|| {
            Error::Config(format!(
                "No link cache registered for mode {}",
                config.mode.as_str()
            ))
        })?;
        info!(
            "Building {} link cache for {} (prefix={})",
            config.mode.as_str(),
            service,
            config.key_prefix
        );
        builder(service.to_string(), config, store, bus).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LinkCacheConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(config, LinkCacheConfig::default());
        assert_eq!(config.sync_relation_interval, Duration::from_secs(3));
        assert_eq!(config.sync_offline_interval, Duration::from_secs(30));
        assert_eq!(BusConfig::default().producers_per_topic, 4);
    }

    #[test]
    fn test_link_cache_overrides() {
        let config = LinkCacheConfig::from_lookup(env(&[
            ("LINKCACHE_MODE", "redis"),
            ("LINKCACHE_PREFIX", "prod"),
            ("LINKCACHE_STORE_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.mode, CacheMode::Shared);
        assert_eq!(config.key_prefix, "prod");
        assert_eq!(config.store_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        assert!(matches!(
            LinkCacheConfig::from_lookup(env(&[("LINKCACHE_MODE", "memcached")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            LinkCacheConfig::from_lookup(env(&[("LINKCACHE_SYNC_OFFLINE_SECS", "soon")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            BusConfig::from_lookup(env(&[("MESH_BUS_PRODUCERS", "0")])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_mesh_config_requires_service() {
        assert!(matches!(
            MeshConfig::from_lookup(env(&[])),
            Err(Error::Config(_))
        ));

        let config = MeshConfig::from_lookup(env(&[
            ("MESH_SERVICE_NAME", "gateway"),
            ("MESH_INSTANCE_ID", "gw-1"),
            ("MESH_BUS_PRODUCERS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.service, "gateway");
        assert_eq!(config.instance_id, "gw-1");
        assert_eq!(config.bus.producers_per_topic, 2);
    }

    #[test]
    fn test_generated_instance_id() {
        let config = MeshConfig::from_lookup(env(&[("MESH_SERVICE_NAME", "gateway")])).unwrap();
        assert!(uuid::Uuid::parse_str(&config.instance_id).is_ok());
    }
}
