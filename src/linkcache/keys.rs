//! Shared-store key layout and relation keys
//!
//! ```text
//! {prefix}:relation:{parent}                 set of relation keys
//! {prefix}:route:{parent}-{child_service}    hash of token -> LinkInfo JSON
//! {prefix}:tokens:{relation_key}             set of tokens bound to one child
//! {prefix}:linkcount:{relation_key}          counter of those tokens
//! ```
//!
//! Components are escaped (`%` as `%25`, `-` as `%2D`) so a relation key
//! always splits back into exactly three parts.

use crate::{Error, Result};
use std::fmt;

fn escape(part: &str) -> String {
    if !part.contains(['%', '-']) {
        return part.to_string();
    }
    part.replace('%', "%25").replace('-', "%2D")
}

fn unescape(part: &str) -> Result<String> {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3);
        match code {
            Some("25") => out.push('%'),
            Some(c) if c.eq_ignore_ascii_case("2D") => out.push('-'),
            _ => {
                return Err(Error::Internal(format!(
                    "invalid escape in key component {}",
                    part
                )))
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Parent service to child instance relation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationKey {
    pub parent: String,
    pub child_name: String,
    pub child_id: String,
}

impl RelationKey {
    pub fn new(
        parent: impl Into<String>,
        child_name: impl Into<String>,
        child_id: impl Into<String>,
    ) -> Self {
        Self {
            parent: parent.into(),
            child_name: child_name.into(),
            child_id: child_id.into(),
        }
    }

    /// `<parent>-<child_name>-<child_id>` with escaped components
    pub fn encode(&self) -> String {
        format!(
            "{}-{}-{}",
            escape(&self.parent),
            escape(&self.child_name),
            escape(&self.child_id)
        )
    }

    pub fn parse(encoded: &str) -> Result<Self> {
        let parts: Vec<&str> = encoded.split('-').collect();
        match parts.as_slice() {
            [parent, child_name, child_id] => Ok(Self {
                parent: unescape(parent)?,
                child_name: unescape(child_name)?,
                child_id: unescape(child_id)?,
            }),
            _ => Err(Error::Internal(format!(
                "malformed relation key {}",
                encoded
            ))),
        }
    }
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Namespaced shared-store keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn relation(&self, parent: &str) -> String {
        format!("{}:relation:{}", self.prefix, escape(parent))
    }

    pub fn route(&self, parent: &str, child_service: &str) -> String {
        format!(
            "{}:route:{}-{}",
            self.prefix,
            escape(parent),
            escape(child_service)
        )
    }

    pub fn tokens(&self, relation: &RelationKey) -> String {
        format!("{}:tokens:{}", self.prefix, relation.encode())
    }

    pub fn link_count(&self, relation: &RelationKey) -> String {
        format!("{}:linkcount:{}", self.prefix, relation.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names_encode_verbatim() {
        let key = RelationKey::new("gateway", "user", "user1");
        assert_eq!(key.encode(), "gateway-user-user1");
        assert_eq!(RelationKey::parse("gateway-user-user1").unwrap(), key);
    }

    #[test]
    fn test_hyphenated_components_survive() {
        let key = RelationKey::new("api-gw", "user-svc", "10%-a");
        let encoded = key.encode();
        assert_eq!(encoded, "api%2Dgw-user%2Dsvc-10%25%2Da");
        assert_eq!(RelationKey::parse(&encoded).unwrap(), key);
    }

    #[test]
    fn test_malformed_keys_rejected() {
        assert!(RelationKey::parse("only-two").is_err());
        assert!(RelationKey::parse("a-b-c-d").is_err());
        assert!(RelationKey::parse("a-b-bad%zz").is_err());
    }

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("mesh");
        let rel = RelationKey::new("gateway", "user", "u1");
        assert_eq!(keys.relation("gateway"), "mesh:relation:gateway");
        assert_eq!(keys.route("gateway", "user"), "mesh:route:gateway-user");
        assert_eq!(keys.tokens(&rel), "mesh:tokens:gateway-user-u1");
        assert_eq!(keys.link_count(&rel), "mesh:linkcount:gateway-user-u1");
    }
}
