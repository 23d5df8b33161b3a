//! Forwarding kept events to the broker and the query store
//!
//! Kept events are published to the broker topic with the entity id as the
//! partition key, so per-entity ordering survives the trip. Publishing is
//! retried on a short fixed schedule; once the schedule is exhausted the
//! event is dropped and counted, never queued indefinitely. The store write
//! happens after a successful publish and is best-effort.

pub mod sinks;

pub use sinks::{EventPublisher, EventStore, HttpPublisher, HttpStore, MockPublisher, MockStore};

use crate::config::ForwarderConfig;
use crate::error::ForwardError;
use crate::events::Event;
use crate::metrics::MetricsAggregator;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;

/// Delays before each publish retry
pub const PUBLISH_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_millis(1_000),
];

/// Forwarder for events that survived the filter
pub struct Forwarder {
    publisher: Arc<dyn EventPublisher>,
    store: Arc<dyn EventStore>,
    metrics: Arc<MetricsAggregator>,
}

impl Forwarder {
    /// Create a forwarder with the HTTP broker and store sinks
    pub fn new(config: &ForwarderConfig, metrics: Arc<MetricsAggregator>) -> Self {
        let publisher = HttpPublisher::new(
            config.broker_url.clone(),
            config.topic.clone(),
            config.request_timeout(),
        );
        let store = HttpStore::new(config.store_url.clone(), config.request_timeout());
        Self::with_sinks(Arc::new(publisher), Arc::new(store), metrics)
    }

    /// Create a forwarder with explicit sink implementations
    pub fn with_sinks(
        publisher: Arc<dyn EventPublisher>,
        store: Arc<dyn EventStore>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            publisher,
            store,
            metrics,
        }
    }

    /// Forward one kept event
    ///
    /// Publishes to the broker first; only a published event is offered to
    /// the store, so the store never holds events the broker lost. Store
    /// failures are logged and absorbed.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::RetriesExhausted` when every publish attempt
    /// failed; the event is gone at that point.
    pub async fn forward(&self, event: &Event) -> Result<(), ForwardError> {
        let key = event.entity_id.as_deref().unwrap_or(&event.id);
        self.publish_with_retry(key, event).await?;

        match self.store.store(event).await {
            Ok(()) => self.metrics.record_stored(),
            Err(err) => warn!("Store write failed for event {}: {}", event.id, err),
        }
        Ok(())
    }

    async fn publish_with_retry(&self, key: &str, event: &Event) -> Result<(), ForwardError> {
        let attempts = PUBLISH_RETRY_DELAYS.len() + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = PUBLISH_RETRY_DELAYS[attempt - 1];
                debug!(
                    "Retrying publish of event {} in {:?} (attempt {} of {})",
                    event.id,
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::time::sleep(delay).await;
            }

            match self.publisher.publish(key, event).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        "Publish attempt {} for event {} failed: {}",
                        attempt + 1,
                        event.id,
                        err
                    );
                    last_error = err.to_string();
                }
            }
        }

        self.metrics.record_forward_failure();
        error!(
            "Dropping event {} after {} failed publish attempts",
            event.id, attempts
        );
        Err(ForwardError::RetriesExhausted {
            attempts: attempts as u32,
            last_error,
        })
    }
}
