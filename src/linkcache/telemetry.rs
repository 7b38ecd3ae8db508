//! Link cache telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct LinkCacheInstruments {
    operations: Counter<u64>,
    swept_relations: Histogram<u64>,
    role_transitions: Counter<u64>,
}

fn instruments() -> &'static LinkCacheInstruments {
    static INSTRUMENTS: OnceLock<LinkCacheInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("meshlink.linkcache");
        LinkCacheInstruments {
            operations: meter
                .u64_counter("meshlink.linkcache.operations")
                .with_description("Link cache operations by outcome")
                .init(),
            swept_relations: meter
                .u64_histogram("meshlink.linkcache.sweep.relations")
                .with_description("Relations removed by one offline sweep")
                .init(),
            role_transitions: meter
                .u64_counter("meshlink.linkcache.role.transitions")
                .with_description("Observed leader role changes")
                .init(),
        }
    })
}

pub(crate) fn record_operation<T>(
    op: &'static str,
    mode: &'static str,
    result: &crate::Result<T>,
) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(crate::Error::NotFound) => "miss",
        Err(crate::Error::Timeout) => "timeout",
        Err(_) => "error",
    };
    instruments().operations.add(
        1,
        &[
            KeyValue::new("op", op),
            KeyValue::new("mode", mode),
            KeyValue::new("outcome", outcome),
        ],
    );
}

pub(crate) fn record_sweep(mode: &'static str, relations: usize) {
    instruments()
        .swept_relations
        .record(relations as u64, &[KeyValue::new("mode", mode)]);
}

pub(crate) fn record_role_transition(role: &'static str) {
    instruments()
        .role_transitions
        .add(1, &[KeyValue::new("role", role)]);
}
