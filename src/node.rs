//! Service instance descriptor shared by the balancer and link cache

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single live instance of a logical service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Globally unique instance ID
    pub id: String,
    /// Logical service this instance belongs to
    pub name: String,
    /// Dialable address (host:port)
    pub address: String,
    /// Static weight used by the weighted picker
    pub weight: i64,
    /// Free-form registry metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    /// Create a node with weight 1 and no metadata
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            weight: 1,
            metadata: HashMap::new(),
        }
    }

    /// Builder-style weight override
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    /// Builder-style metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
