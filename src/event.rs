//! Typed events exchanged over the message bus
//!
//! Every payload crossing the bus is a [`MeshEvent`] serialized to JSON inside
//! a [`Message`] body. Consumers decode at the bus boundary and match on the
//! variant they expect.

use crate::bus::Message;
use crate::node::Node;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Local topic the membership registry publishes node changes on
pub const MEMBERSHIP_TOPIC: &str = "mesh.membership";
/// Local topic the leader signal publishes role changes on
pub const LEADER_TOPIC: &str = "mesh.leader";
/// Local topic the link cache publishes per-child link counts on
pub const LINK_COUNT_TOPIC: &str = "mesh.linkcount";
/// Cluster topic carrying token invalidations
pub const UNLINK_TOPIC: &str = "mesh.unlink";

/// Kind of membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipKind {
    Add,
    Remove,
    Update,
}

/// Node change observed by the membership registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub event: MembershipKind,
    pub node: Node,
}

impl MembershipEvent {
    pub fn add(node: Node) -> Self {
        Self {
            event: MembershipKind::Add,
            node,
        }
    }

    pub fn remove(node: Node) -> Self {
        Self {
            event: MembershipKind::Remove,
            node,
        }
    }

    pub fn update(node: Node) -> Self {
        Self {
            event: MembershipKind::Update,
            node,
        }
    }
}

/// Role of this process as reported by the leader signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderState {
    #[default]
    Wait,
    Slave,
    Master,
}

impl LeaderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaderState::Wait => "wait",
            LeaderState::Slave => "slave",
            LeaderState::Master => "master",
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, LeaderState::Master)
    }
}

impl fmt::Display for LeaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of tokens currently bound from a parent service to one child instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCount {
    pub parent: String,
    pub child_name: String,
    pub child_id: String,
    pub count: i64,
}

/// Request to drop a token's bindings held by `parent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkRequest {
    pub parent: String,
    pub token: String,
}

/// Every payload kind carried by the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MeshEvent {
    Membership(MembershipEvent),
    Leader(LeaderState),
    LinkCount(LinkCount),
    Unlink(UnlinkRequest),
}

impl MeshEvent {
    /// Serialize into a bus message
    pub fn to_message(&self) -> Result<Message> {
        let body = serde_json::to_vec(self)?;
        Ok(Message::new(body))
    }

    /// Decode a bus message
    pub fn from_message(msg: &Message) -> Result<Self> {
        Ok(serde_json::from_slice(&msg.body)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MeshEvent::Membership(_) => "membership",
            MeshEvent::Leader(_) => "leader",
            MeshEvent::LinkCount(_) => "link_count",
            MeshEvent::Unlink(_) => "unlink",
        }
    }
}

impl From<MembershipEvent> for MeshEvent {
    fn from(e: MembershipEvent) -> Self {
        MeshEvent::Membership(e)
    }
}

impl From<LeaderState> for MeshEvent {
    fn from(s: LeaderState) -> Self {
        MeshEvent::Leader(s)
    }
}

impl From<LinkCount> for MeshEvent {
    fn from(c: LinkCount) -> Self {
        MeshEvent::LinkCount(c)
    }
}

impl From<UnlinkRequest> for MeshEvent {
    fn from(r: UnlinkRequest) -> Self {
        MeshEvent::Unlink(r)
    }
}

/// Decode a message that must carry a membership event
pub fn decode_membership(msg: &Message) -> Result<MembershipEvent> {
    match MeshEvent::from_message(msg)? {
        MeshEvent::Membership(e) => Ok(e),
        other => Err(unexpected("membership", &other)),
    }
}

/// Decode a message that must carry a leader state
pub fn decode_leader(msg: &Message) -> Result<LeaderState> {
    match MeshEvent::from_message(msg)? {
        MeshEvent::Leader(s) => Ok(s),
        other => Err(unexpected("leader", &other)),
    }
}

/// Decode a message that must carry a link count
pub fn decode_link_count(msg: &Message) -> Result<LinkCount> {
    match MeshEvent::from_message(msg)? {
        MeshEvent::LinkCount(c) => Ok(c),
        other => Err(unexpected("link_count", &other)),
    }
}

/// Decode a message that must carry an unlink request
pub fn decode_unlink(msg: &Message) -> Result<UnlinkRequest> {
    match MeshEvent::from_message(msg)? {
        MeshEvent::Unlink(r) => Ok(r),
        other => Err(unexpected("unlink", &other)),
    }
}

fn unexpected(expected: &str, got: &MeshEvent) -> Error {
    Error::Serialization(format!(
        "expected {} event, got {}",
        expected,
        got.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_wire_format() {
        let node = Node::new("user-1", "user", "10.0.0.1:9000").with_weight(3);
        let msg = MeshEvent::from(MembershipEvent::add(node.clone()))
            .to_message()
            .unwrap();

        let json: serde_json::Value = serde_json::from_slice(&msg.body).unwrap();
        assert_eq!(json["kind"], "membership");
        assert_eq!(json["data"]["event"], "add");
        assert_eq!(json["data"]["node"]["weight"], 3);

        let decoded = decode_membership(&msg).unwrap();
        assert_eq!(decoded.node, node);
    }

    #[test]
    fn test_leader_state_wire_format() {
        let msg = MeshEvent::from(LeaderState::Master).to_message().unwrap();
        assert_eq!(
            std::str::from_utf8(&msg.body).unwrap(),
            r#"{"kind":"leader","data":"master"}"#
        );
        assert_eq!(decode_leader(&msg).unwrap(), LeaderState::Master);
    }

    #[test]
    fn test_wrong_variant_is_serialization_error() {
        let msg = MeshEvent::from(LeaderState::Slave).to_message().unwrap();
        match decode_membership(&msg) {
            Err(Error::Serialization(reason)) => assert!(reason.contains("leader")),
            other => panic!("expected serialization error, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_body_rejected() {
        let msg = Message::new(b"not json".to_vec());
        assert!(matches!(
            MeshEvent::from_message(&msg),
            Err(Error::Serialization(_))
        ));
    }
}
