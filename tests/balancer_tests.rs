//! Integration tests for the balancer group driven over the bus

use meshlink::balancer::{Balancer, BalancerGroup, Strategy, SwrrBalancer};
use meshlink::bus::MessageBus;
use meshlink::config::BusConfig;
use meshlink::event::{MembershipEvent, MEMBERSHIP_TOPIC};
use meshlink::node::Node;
use meshlink::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

async fn wait_until(check: impl Fn() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[test]
fn test_swrr_seven_picks() {
    let mut swrr = SwrrBalancer::new();
    swrr.add(Node::new("A", "user", "a:80").with_weight(4));
    swrr.add(Node::new("B", "user", "b:80").with_weight(2));
    swrr.add(Node::new("C", "user", "c:80").with_weight(1));

    let order: Vec<String> = (0..7).map(|_| swrr.get().unwrap().id).collect();
    assert_eq!(order, vec!["A", "B", "A", "C", "A", "B", "A"]);
}

#[test]
fn test_empty_then_single_node() {
    let group = BalancerGroup::new();
    assert_eq!(group.pick("user", Strategy::Swrr), Err(Error::Empty));

    let node = Node::new("u1", "user", "10.0.0.1:80");
    group.add(node.clone());
    assert_eq!(group.pick("user", Strategy::Swrr).unwrap(), node);
    assert_eq!(group.pick("user", Strategy::Random).unwrap(), node);
}

#[tokio::test]
async fn test_membership_events_drive_group() {
    let bus = MessageBus::new(BusConfig::default());
    let group = Arc::new(BalancerGroup::new());
    group.attach(&bus).await.unwrap();

    let topic = bus.topic(MEMBERSHIP_TOPIC).unwrap();
    let a = Node::new("A", "user", "a:80").with_weight(4);
    let b = Node::new("B", "user", "b:80").with_weight(2);
    topic.publish_event(MembershipEvent::add(a.clone())).await.unwrap();
    topic.publish_event(MembershipEvent::add(b.clone())).await.unwrap();
    wait_until(|| group.nodes("user").len() == 2).await;

    topic
        .publish_event(MembershipEvent::update(b.clone().with_weight(8)))
        .await
        .unwrap();
    wait_until(|| group.nodes("user").iter().any(|n| n.id == "B" && n.weight == 8)).await;

    topic.publish_event(MembershipEvent::remove(a)).await.unwrap();
    wait_until(|| group.nodes("user").len() == 1).await;
    for _ in 0..5 {
        assert_eq!(group.pick("user", Strategy::Swrr).unwrap().id, "B");
    }

    topic.publish_event(MembershipEvent::remove(b)).await.unwrap();
    wait_until(|| group.services().is_empty()).await;
    assert_eq!(group.pick("user", Strategy::Random), Err(Error::Empty));
}

#[tokio::test]
async fn test_undecodable_events_are_skipped() {
    let bus = MessageBus::new(BusConfig::default());
    let group = Arc::new(BalancerGroup::new());
    group.attach(&bus).await.unwrap();

    let topic = bus.topic(MEMBERSHIP_TOPIC).unwrap();
    topic
        .publish(meshlink::bus::Message::new(&b"{not json"[..]))
        .await
        .unwrap();
    topic
        .publish_event(MembershipEvent::add(Node::new("u1", "user", "u:80")))
        .await
        .unwrap();

    wait_until(|| group.nodes("user").len() == 1).await;
}
