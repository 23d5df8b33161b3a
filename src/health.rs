//! Health classification derived from the aggregate counters
//!
//! A small poller that reads the metrics snapshot and the connection state
//! on a fixed interval and publishes a coarse status. It only reports;
//! remediation (reconnects, restarts) happens elsewhere.

use crate::config::HealthConfig;
use crate::events::Timestamp;
use crate::metrics::{MetricsAggregator, StatsSnapshot};
use crate::session::ConnectionState;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

/// Average processing time above which the pipeline counts as slow
pub const SLOW_PROCESSING_MS: f64 = 100.0;

/// Average processing time above which slowness is critical
pub const CRITICAL_PROCESSING_MS: f64 = 500.0;

/// Expected band for the filter rate; outside it suggests misconfiguration
pub const FILTER_RATE_BAND: (f64, f64) = (0.40, 0.95);

/// Processed events required before the filter-rate band is judged
pub const MIN_EVENTS_FOR_RATE_BAND: u64 = 50;

/// Consecutive critical polls that escalate slowness to an error
pub const CRITICAL_POLLS_FOR_ERROR: u32 = 3;

/// Coarse pipeline status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

/// One published health observation
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub connection: &'static str,
    pub avg_processing_ms: f64,
    pub total_processed: u64,
    pub filter_rate: f64,
    pub timestamp: Timestamp,
}

impl HealthReport {
    /// The report published before the first poll completes
    pub fn startup() -> Self {
        Self {
            status: HealthStatus::Degraded,
            connection: ConnectionState::Connecting.label(),
            avg_processing_ms: 0.0,
            total_processed: 0,
            filter_rate: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// Periodic poller that turns counters into a health status
pub struct HealthMonitor {
    metrics: Arc<MetricsAggregator>,
    connection: watch::Receiver<ConnectionState>,
    report_tx: watch::Sender<HealthReport>,
    poll_interval: Duration,
    critical_streak: u32,
}

impl HealthMonitor {
    pub fn new(
        config: &HealthConfig,
        metrics: Arc<MetricsAggregator>,
        connection: watch::Receiver<ConnectionState>,
        report_tx: watch::Sender<HealthReport>,
    ) -> Self {
        Self {
            metrics,
            connection,
            report_tx,
            poll_interval: config.poll_interval(),
            critical_streak: 0,
        }
    }

    /// Poll until shutdown is requested
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Health monitor polling every {:?}",
            self.poll_interval
        );
        let mut ticker = interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.poll();
                    if report.status != HealthStatus::Healthy {
                        warn!(
                            "Health {:?}: connection {}, avg {:.1}ms, filter rate {:.2}",
                            report.status,
                            report.connection,
                            report.avg_processing_ms,
                            report.filter_rate
                        );
                    } else {
                        debug!("Health HEALTHY");
                    }
                    self.report_tx.send_replace(report);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health monitor stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Take one observation
    pub fn poll(&mut self) -> HealthReport {
        let snapshot = self.metrics.snapshot();
        debug!(
            "Processing-time histogram: <=10ms {}, <=50ms {}, <=100ms {}, <=500ms {}, over {}",
            snapshot.histogram[0],
            snapshot.histogram[1],
            snapshot.histogram[2],
            snapshot.histogram[3],
            snapshot.histogram[4]
        );
        let connection = *self.connection.borrow();
        let status = self.classify(&snapshot, connection);

        HealthReport {
            status,
            connection: connection.label(),
            avg_processing_ms: snapshot.avg_processing_ms,
            total_processed: snapshot.total_processed,
            filter_rate: snapshot.filter_rate,
            timestamp: snapshot.timestamp,
        }
    }

    /// Classify one snapshot, updating the critical-slowness streak
    ///
    /// Slowness above the critical threshold must persist for
    /// [`CRITICAL_POLLS_FOR_ERROR`] consecutive polls before it becomes an
    /// error; a single good poll resets the streak. The filter-rate band is
    /// only judged once enough events have been processed to make the rate
    /// meaningful.
    fn classify(&mut self, snapshot: &StatsSnapshot, connection: ConnectionState) -> HealthStatus {
        if snapshot.avg_processing_ms > CRITICAL_PROCESSING_MS {
            self.critical_streak += 1;
        } else {
            self.critical_streak = 0;
        }

        if connection == ConnectionState::Closed {
            return HealthStatus::Error;
        }
        if self.critical_streak >= CRITICAL_POLLS_FOR_ERROR {
            return HealthStatus::Error;
        }
        if connection != ConnectionState::Active {
            return HealthStatus::Degraded;
        }
        if snapshot.avg_processing_ms >= SLOW_PROCESSING_MS {
            return HealthStatus::Degraded;
        }
        if snapshot.total_processed >= MIN_EVENTS_FOR_RATE_BAND {
            let (low, high) = FILTER_RATE_BAND;
            if snapshot.filter_rate < low || snapshot.filter_rate > high {
                return HealthStatus::Degraded;
            }
        }

        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn create_test_monitor(
        connection: ConnectionState,
    ) -> (HealthMonitor, Arc<MetricsAggregator>, watch::Sender<ConnectionState>) {
        let metrics = Arc::new(MetricsAggregator::new());
        let (conn_tx, conn_rx) = watch::channel(connection);
        let (report_tx, _report_rx) = watch::channel(HealthReport::startup());
        let monitor = HealthMonitor::new(
            &HealthConfig::default(),
            metrics.clone(),
            conn_rx,
            report_tx,
        );
        (monitor, metrics, conn_tx)
    }

    fn record_events(metrics: &MetricsAggregator, count: usize, each_ms: u64, filtered: usize) {
        for i in 0..count {
            metrics.record_processed(StdDuration::from_millis(each_ms));
            if i < filtered {
                metrics.record_filtered();
            }
        }
    }

    #[test]
    fn test_active_connection_with_normal_load_is_healthy() {
        let (mut monitor, metrics, _conn_tx) = create_test_monitor(ConnectionState::Active);
        record_events(&metrics, 100, 5, 70);

        let report = monitor.poll();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.connection, "active");
        assert_eq!(report.total_processed, 100);
    }

    #[test]
    fn test_reconnecting_connection_degrades() {
        let (mut monitor, metrics, _conn_tx) =
            create_test_monitor(ConnectionState::Reconnecting { attempt: 2 });
        record_events(&metrics, 100, 5, 70);

        assert_eq!(monitor.poll().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_closed_connection_is_an_error() {
        let (mut monitor, _metrics, _conn_tx) = create_test_monitor(ConnectionState::Closed);
        assert_eq!(monitor.poll().status, HealthStatus::Error);
    }

    #[test]
    fn test_slow_processing_degrades() {
        let (mut monitor, metrics, _conn_tx) = create_test_monitor(ConnectionState::Active);
        record_events(&metrics, 100, 150, 70);

        assert_eq!(monitor.poll().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_critical_slowness_needs_three_polls_to_error() {
        let (mut monitor, metrics, _conn_tx) = create_test_monitor(ConnectionState::Active);
        record_events(&metrics, 100, 600, 70);

        assert_eq!(monitor.poll().status, HealthStatus::Degraded);
        assert_eq!(monitor.poll().status, HealthStatus::Degraded);
        assert_eq!(monitor.poll().status, HealthStatus::Error);
    }

    #[test]
    fn test_recovery_resets_the_critical_streak() {
        let (mut monitor, metrics, _conn_tx) = create_test_monitor(ConnectionState::Active);
        record_events(&metrics, 100, 600, 70);

        monitor.poll();
        monitor.poll();
        // the pipeline recovers before the third poll
        metrics.reset();
        record_events(&metrics, 100, 5, 70);
        assert_eq!(monitor.poll().status, HealthStatus::Healthy);

        // slowness returning starts a fresh streak
        metrics.reset();
        record_events(&metrics, 100, 600, 70);
        assert_eq!(monitor.poll().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_filter_rate_outside_band_degrades() {
        let (mut monitor, metrics, _conn_tx) = create_test_monitor(ConnectionState::Active);
        // filtering almost nothing suggests the stages are misconfigured
        record_events(&metrics, 100, 5, 10);

        assert_eq!(monitor.poll().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_filter_rate_band_ignored_for_small_samples() {
        let (mut monitor, metrics, _conn_tx) = create_test_monitor(ConnectionState::Active);
        // ten events is too few to judge the rate
        record_events(&metrics, 10, 5, 0);

        assert_eq!(monitor.poll().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"HEALTHY\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"DEGRADED\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Error).unwrap(),
            "\"ERROR\""
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_reports_until_shutdown() {
        let metrics = Arc::new(MetricsAggregator::new());
        let (_conn_tx, conn_rx) = watch::channel(ConnectionState::Active);
        let (report_tx, report_rx) = watch::channel(HealthReport::startup());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let config = HealthConfig {
            poll_interval_secs: 1,
        };
        let monitor = HealthMonitor::new(&config, metrics.clone(), conn_rx, report_tx);
        let handle = tokio::spawn(monitor.run(shutdown_rx));

        record_events(&metrics, 100, 5, 70);
        tokio::time::sleep(StdDuration::from_millis(1_100)).await;
        assert_eq!(report_rx.borrow().status, HealthStatus::Healthy);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
