/// Error types for the event sieve
pub mod error;

/// Event model and canonical event-type names
pub mod events;

/// Hub connection session with auth, heartbeat and reconnect handling
pub mod session;

/// Raw frame normalization into pipeline events
pub mod normalizer;

/// Filter engine, stage cascade and per-entity decision context
pub mod filter;

/// Queue consumption and worker fan-out
pub mod pipeline;

/// Forwarding kept events to the broker and store
pub mod forwarder;

/// Process-wide counters and processing-time distribution
pub mod metrics;

/// Health classification derived from the aggregate counters
pub mod health;

/// Stats and health read API
pub mod api;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use error::{ApiError, ConfigError, ForwardError, SessionError};
