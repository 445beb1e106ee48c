//! # Prometheus Metrics — Exposition for Scraping
//!
//! Exposes engine metrics in the Prometheus text exposition format on
//! `GET /metrics`.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `utsav_levels_started_total` | Counter | — | New attempts created |
//! | `utsav_start_replays_total` | Counter | — | Starts that returned an existing attempt |
//! | `utsav_levels_completed_total` | Counter | `outcome` | Completed attempts |
//! | `utsav_stale_expired_total` | Counter | — | Attempts failed by the stale sweeper |
//! | `utsav_store_retries_total` | Counter | — | Transient storage errors retried |
//! | `utsav_http_request_duration_seconds` | Histogram | `method`, `path` | Request latency |

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::model::Outcome;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct OutcomeLabel {
    pub outcome: String,
}

impl From<Outcome> for OutcomeLabel {
    fn from(outcome: Outcome) -> Self {
        let outcome = match outcome {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
        };
        Self {
            outcome: outcome.to_string(),
        }
    }
}

/// Label set for HTTP latency. `path` is normalized so ids do not explode
/// cardinality.
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct HttpLabel {
    pub method: String,
    pub path: String,
}

fn http_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.001, 2.0, 14))
}

/// Thread-safe metrics registry. All fields are atomic handles that share
/// storage with the registry, so clones can be passed into components.
pub struct Metrics {
    pub registry: Registry,
    pub levels_started: Counter,
    pub start_replays: Counter,
    pub levels_completed: Family<OutcomeLabel, Counter>,
    pub stale_expired: Counter,
    pub store_retries: Counter,
    pub http_request_duration: Family<HttpLabel, Histogram, fn() -> Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let levels_started = Counter::default();
        registry.register(
            "utsav_levels_started",
            "New level attempts created",
            levels_started.clone(),
        );

        let start_replays = Counter::default();
        registry.register(
            "utsav_start_replays",
            "Start requests that returned an existing in-progress attempt",
            start_replays.clone(),
        );

        let levels_completed = Family::<OutcomeLabel, Counter>::default();
        registry.register(
            "utsav_levels_completed",
            "Completed level attempts by outcome",
            levels_completed.clone(),
        );

        let stale_expired = Counter::default();
        registry.register(
            "utsav_stale_expired",
            "In-progress attempts failed by the stale sweeper",
            stale_expired.clone(),
        );

        let store_retries = Counter::default();
        registry.register(
            "utsav_store_retries",
            "Transient storage errors that were retried",
            store_retries.clone(),
        );

        let http_request_duration =
            Family::<HttpLabel, Histogram, fn() -> Histogram>::new_with_constructor(http_histogram);
        registry.register(
            "utsav_http_request_duration_seconds",
            "HTTP request latency",
            http_request_duration.clone(),
        );

        Self {
            registry,
            levels_started,
            start_replays,
            levels_completed,
            stale_expired,
            store_retries,
            http_request_duration,
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics should not fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
