//! Message bus telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct BusInstruments {
    published: Counter<u64>,
    publish_failures: Counter<u64>,
    delivered: Counter<u64>,
    handler_failures: Counter<u64>,
    backlog_depth: Histogram<u64>,
}

fn instruments() -> &'static BusInstruments {
    static INSTRUMENTS: OnceLock<BusInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("meshlink.bus");
        BusInstruments {
            published: meter
                .u64_counter("meshlink.bus.published")
                .with_description("Messages accepted for publishing")
                .init(),
            publish_failures: meter
                .u64_counter("meshlink.bus.publish.failures")
                .with_description("Publish attempts rejected by the topic or broker")
                .init(),
            delivered: meter
                .u64_counter("meshlink.bus.delivered")
                .with_description("Messages handed to channel handlers")
                .init(),
            handler_failures: meter
                .u64_counter("meshlink.bus.handler.failures")
                .with_description("Handler invocations that returned an error")
                .init(),
            backlog_depth: meter
                .u64_histogram("meshlink.bus.backlog.depth")
                .with_description("Channel backlog length sampled when a message is parked")
                .init(),
        }
    })
}

pub(crate) fn record_publish(topic: &str, scope: &'static str, ok: bool) {
    let attrs = [
        KeyValue::new("topic", topic.to_string()),
        KeyValue::new("scope", scope),
    ];
    if ok {
        instruments().published.add(1, &attrs);
    } else {
        instruments().publish_failures.add(1, &attrs);
    }
}

pub(crate) fn record_delivery(topic: &str, channel: &str, ok: bool) {
    let attrs = [
        KeyValue::new("topic", topic.to_string()),
        KeyValue::new("channel", channel.to_string()),
    ];
    instruments().delivered.add(1, &attrs);
    if !ok {
        instruments().handler_failures.add(1, &attrs);
    }
}

pub(crate) fn record_backlog(topic: &str, channel: &str, depth: usize) {
    instruments().backlog_depth.record(
        depth as u64,
        &[
            KeyValue::new("topic", topic.to_string()),
            KeyValue::new("channel", channel.to_string()),
        ],
    );
}
