//! # meshlink
//!
//! Runtime substrate for a fleet of stateless service processes.
//!
//! ## Components
//!
//! - **Message bus**: process-local and cluster-wide topics with independently
//!   consumable channels and unbounded, non-blocking delivery queues
//! - **Balancer group**: per-service random and smooth weighted round-robin
//!   pickers driven by membership events
//! - **Link cache**: session affinity from `(token, callee service)` to one
//!   instance, kept in process memory or in a shared key-value store
//!
//! Components talk to each other only through the bus. External collaborators
//! (membership registry, leader signal) publish typed [`event::MeshEvent`]s on
//! well-known topics.

pub mod balancer;
pub mod bus;
pub mod config;
pub mod event;
pub mod linkcache;
pub mod node;
pub mod store;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::balancer::{Balancer, BalancerGroup, Strategy};
    pub use crate::bus::{handler_fn, Channel, Handler, Message, MessageBus, Topic};
    pub use crate::config::{BusConfig, CacheMode, ComponentFactory, LinkCacheConfig, MeshConfig};
    pub use crate::event::{LeaderState, MembershipEvent, MeshEvent};
    pub use crate::linkcache::{AffinityRouter, LinkCache, LinkInfo};
    pub use crate::node::Node;
    pub use crate::store::{KvStore, MemoryStore};
    pub use crate::{Error, Result};
}
