//! Broker and store sinks for kept events
//!
//! Both collaborators speak plain HTTP: the broker takes keyed records on a
//! topic endpoint, the store takes the event document itself. The traits
//! exist so the forwarder can be exercised against mocks, and so a
//! different broker client can be dropped in without touching the retry
//! logic.

use crate::error::ForwardError;
use crate::events::Event;
use reqwest::Client;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Trait for broker publish implementations
pub trait EventPublisher: Send + Sync {
    fn publish<'a>(
        &'a self,
        key: &'a str,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), ForwardError>> + Send + 'a>>;
}

/// Trait for query-store write implementations
pub trait EventStore: Send + Sync {
    fn store<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), ForwardError>> + Send + 'a>>;
}

/// Record shape the broker accepts
///
/// The key carries the partition routing; records with the same key stay
/// ordered relative to each other.
#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    key: &'a str,
    value: &'a Event,
}

/// HTTP publisher for the append-log broker
pub struct HttpPublisher {
    client: Client,
    broker_url: String,
    topic: String,
}

impl HttpPublisher {
    /// Create a new broker publisher
    ///
    /// # Arguments
    /// * `broker_url` - Broker base URL (e.g., "http://127.0.0.1:9092")
    /// * `topic` - Topic the kept events are published to
    /// * `timeout` - Per-request timeout
    pub fn new(broker_url: String, topic: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            broker_url,
            topic,
        }
    }

    /// Format the topic endpoint URL
    fn topic_url(&self) -> String {
        format!(
            "{}/topics/{}",
            self.broker_url.trim_end_matches('/'),
            self.topic
        )
    }
}

impl EventPublisher for HttpPublisher {
    fn publish<'a>(
        &'a self,
        key: &'a str,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), ForwardError>> + Send + 'a>> {
        Box::pin(async move {
            let request = PublishRequest { key, value: event };

            let response = self
                .client
                .post(self.topic_url())
                .json(&request)
                .send()
                .await
                .map_err(|e| ForwardError::Publish(format!("broker request failed: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "no body".to_string());
                return Err(ForwardError::Publish(format!(
                    "broker returned {}: {}",
                    status, body
                )));
            }

            Ok(())
        })
    }
}

/// HTTP writer for the query store
pub struct HttpStore {
    client: Client,
    store_url: String,
}

impl HttpStore {
    /// Create a new store writer
    ///
    /// # Arguments
    /// * `store_url` - Store base URL (e.g., "http://127.0.0.1:8095")
    /// * `timeout` - Per-request timeout
    pub fn new(store_url: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .expect("Failed to create HTTP client");

        Self { client, store_url }
    }

    fn events_url(&self) -> String {
        format!("{}/events", self.store_url.trim_end_matches('/'))
    }
}

impl EventStore for HttpStore {
    fn store<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), ForwardError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.events_url())
                .json(event)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "no body".to_string());
                return Err(ForwardError::Store(format!(
                    "store returned {}: {}",
                    status, body
                )));
            }

            Ok(())
        })
    }
}

/// Mock publisher for testing
///
/// Outcomes are returned in order and cycle after the last one. Every call
/// is recorded with its partition key and event id.
pub struct MockPublisher {
    outcomes: Vec<Result<(), String>>,
    current_index: Arc<Mutex<usize>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockPublisher {
    /// Create a mock publisher with scripted outcomes
    pub fn with_outcomes(outcomes: Vec<Result<(), String>>) -> Self {
        Self {
            outcomes,
            current_index: Arc::new(Mutex::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock publisher that always succeeds
    pub fn success() -> Self {
        Self::with_outcomes(vec![Ok(())])
    }

    /// Create a mock publisher that always fails
    pub fn error(message: &str) -> Self {
        Self::with_outcomes(vec![Err(message.to_string())])
    }

    /// Get the number of times publish() has been called
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Get the partition keys seen so far, in call order
    pub fn published_keys(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Get the event ids seen so far, in call order
    pub fn published_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }
}

impl EventPublisher for MockPublisher {
    fn publish<'a>(
        &'a self,
        key: &'a str,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), ForwardError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((key.to_string(), event.id.clone()));

            let mut index = self.current_index.lock().unwrap();
            let outcome = self.outcomes[*index % self.outcomes.len()].clone();
            *index += 1;

            outcome.map_err(ForwardError::Publish)
        })
    }
}

/// Mock store for testing
pub struct MockStore {
    outcomes: Vec<Result<(), String>>,
    current_index: Arc<Mutex<usize>>,
    stored_ids: Arc<Mutex<Vec<String>>>,
}

impl MockStore {
    pub fn with_outcomes(outcomes: Vec<Result<(), String>>) -> Self {
        Self {
            outcomes,
            current_index: Arc::new(Mutex::new(0)),
            stored_ids: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn success() -> Self {
        Self::with_outcomes(vec![Ok(())])
    }

    pub fn error(message: &str) -> Self {
        Self::with_outcomes(vec![Err(message.to_string())])
    }

    /// Get the ids of events passed to store(), in call order
    pub fn stored_ids(&self) -> Vec<String> {
        self.stored_ids.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.stored_ids.lock().unwrap().len()
    }
}

impl EventStore for MockStore {
    fn store<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), ForwardError>> + Send + 'a>> {
        Box::pin(async move {
            self.stored_ids.lock().unwrap().push(event.id.clone());

            let mut index = self.current_index.lock().unwrap();
            let outcome = self.outcomes[*index % self.outcomes.len()].clone();
            *index += 1;

            outcome.map_err(ForwardError::Store)
        })
    }
}
