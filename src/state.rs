//! # Application State Management
//!
//! Shared state accessed by the HTTP handlers and by every WebSocket connection.
//!
//! ## Key Concepts:
//!
//! ### Arc<RwLock<T>> for mutable data
//! - **Arc**: every actix worker and request handler holds a reference to the same data
//! - **RwLock**: many readers or one writer; `parking_lot`'s lock cannot be poisoned,
//!   so reads and writes never return an error
//!
//! ### Arc<RelayServices> for collaborators
//! The live connector, summarizer, profile backend and session registry are created
//! once at startup and never replaced. They are shared without a lock; each one
//! synchronizes internally where it has to.

use crate::config::AppConfig;
use crate::relay::RelayServices;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all handlers.
///
/// ## Thread Safety Pattern:
/// - `config` and `metrics` change at runtime, so they sit behind locks
/// - `relay` and `start_time` are fixed after startup
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request metrics, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Collaborators shared by every relay session
    pub relay: Arc<RelayServices>,

    /// When the server started
    pub start_time: Instant,
}

/// HTTP metrics collected across all requests.
///
/// Relay sessions are not counted here: the registry knows how many are live, and
/// the relay keeps its own counters for handshakes, upstream failures and summaries.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// WebSocket upgrades accepted on `/ws`
    pub upgrade_count: u64,

    /// Per-route metrics.
    /// Key: method plus route pattern (e.g., "GET /api/v1/sessions/{id}")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one route.
///
/// ## Derived values:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this route (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Create the state from a validated configuration and the relay's collaborators.
    ///
    /// The registry's session limit is taken from `config`, so the two cannot disagree
    /// at startup.
    pub fn new(config: AppConfig, relay: Arc<RelayServices>) -> Self {
        relay.registry.set_max_sessions(config.session.max_concurrent_sessions);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            relay,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so a slow caller never blocks an update.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// ## What changes immediately:
    /// - The registry's session limit
    ///
    /// ## What changes for new sessions only:
    /// - Everything a session captures in `RelaySettings` when it is accepted
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        self.relay
            .registry
            .set_max_sessions(new_config.session.max_concurrent_sessions);
        *self.config.write() = new_config;
        Ok(())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    /// Increment the total error counter (4xx and 5xx responses).
    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn increment_upgrade_count(&self) {
        self.metrics.write().upgrade_count += 1;
    }

    /// Record detailed metrics for a specific route.
    ///
    /// The first request to a route creates its entry with `or_default()`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics.
    ///
    /// The copy is taken under a read lock, so serializing it never holds the lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average response time for this route.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0 // No requests yet
        }
    }

    /// Error rate between 0.0 (no errors) and 1.0 (every request failed).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::Harness;

    fn state() -> AppState {
        AppState::new(AppConfig::default(), Harness::new().services)
    }

    #[test]
    fn test_config_update_applies_session_limit() {
        let state = state();
        assert_eq!(
            state.relay.registry.max_sessions(),
            AppConfig::default().session.max_concurrent_sessions
        );

        let mut config = state.get_config();
        config.session.max_concurrent_sessions = 2;
        state.update_config(config).unwrap();

        assert_eq!(state.relay.registry.max_sessions(), 2);
        assert_eq!(state.get_config().session.max_concurrent_sessions, 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let state = state();
        let mut config = state.get_config();
        config.session.max_concurrent_sessions = 0;

        assert!(state.update_config(config).is_err());
        assert_eq!(
            state.relay.registry.max_sessions(),
            AppConfig::default().session.max_concurrent_sessions
        );
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }
}
