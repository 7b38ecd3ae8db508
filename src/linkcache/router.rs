//! Token-aware address resolution on top of the link cache and balancer

use super::LinkCache;
use crate::balancer::{BalancerGroup, Strategy};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Resolves a callee address, keeping a token on the instance it was first
/// routed to
#[derive(Clone)]
pub struct AffinityRouter {
    cache: Arc<dyn LinkCache>,
    balancers: Arc<BalancerGroup>,
}

impl AffinityRouter {
    pub fn new(cache: Arc<dyn LinkCache>, balancers: Arc<BalancerGroup>) -> Self {
        Self { cache, balancers }
    }

    /// Address for a call to `service`.
    ///
    /// Without a token any node will do. With a token the existing binding
    /// wins. A miss picks a node by weight and binds the token to it.
    pub async fn route(&self, token: Option<&str>, service: &str) -> Result<String> {
        let token = match token {
            Some(token) if !token.is_empty() => token,
            _ => return Ok(self.balancers.pick(service, Strategy::Random)?.address),
        };

        match self.cache.target(token, service).await {
            Ok(addr) => return Ok(addr),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let node = self.balancers.pick(service, Strategy::Swrr)?;
        self.cache.link(token, &node).await?;
        debug!("Bound token {} to {} ({})", token, node.id, service);
        Ok(node.address)
    }
}
