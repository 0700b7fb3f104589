//! Prometheus counters for session and watch activity.
//!
//! Nothing here starts an exporter; callers that want to publish the numbers
//! scrape [`gather_metrics`] from whatever endpoint they already serve.


use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;

lazy_static! {
    pub static ref SESSION_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("session_transitions", "Session state transitions seen by store clients"),
        &["state"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_events", "Watch notifications delivered to path listeners"),
        &["event_type"]
    )
    .expect("metric can not be created");

    pub static ref RESYNC_REQUESTS: IntCounter = IntCounter::new(
        "resync_requests",
        "Listeners asked to resynchronize after a session change"
    )
    .expect("metric can not be created");

    pub static ref CONTENT_UPDATES: IntCounter = IntCounter::new(
        "content_updates",
        "Cached values replaced by content watchers"
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

pub(crate) fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(SESSION_TRANSITIONS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCH_EVENTS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(RESYNC_REQUESTS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(CONTENT_UPDATES.clone()))
        .expect("collector can be registered");
}

/// Renders every counter in the Prometheus text format.
pub fn gather_metrics() -> String {
    REGISTER.call_once(|| register_custom_metrics(&REGISTRY));

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode custom metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        warn!("custom metrics could not be from_utf8'd: {}", e);
        String::default()
    })
}
