//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the validated configuration (read-only after startup)
//! - **metrics**: per-endpoint request counters updated by the metrics middleware
//! - **pipeline**: provider clients, conversational memory and reply-cycle counters
//! - **connections**: number of live voice WebSockets, bounded by
//!   `performance.max_concurrent_sessions`
//!
//! ## Locking:
//! Metrics sit behind a `std::sync::RwLock`; every critical section is a few
//! integer updates and never crosses an `.await`. A poisoned lock is recovered
//! rather than propagated since the counters stay meaningful.

use crate::config::AppConfig;
use crate::pipeline::VoicePipeline;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state that's shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Request metrics collected by the middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Voice pipeline shared by all connections
    pub pipeline: Arc<VoicePipeline>,

    /// Live voice WebSocket connections
    connections: Arc<AtomicUsize>,

    /// When the server started
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Total voice WebSocket connections accepted since server start
    pub connections_accepted: u64,

    /// Voice WebSocket upgrades rejected because all slots were taken
    pub connections_rejected: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Metrics for a single endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Holds one voice connection slot; releases it on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: VoicePipeline) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            pipeline: Arc::new(pipeline),
            connections: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    /// Record one finished request for `endpoint`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a voice connection slot, or `None` when all are taken.
    pub fn try_acquire_connection(&self) -> Option<ConnectionSlot> {
        let max = self.config.performance.max_concurrent_sessions;
        let acquired = self
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max).then_some(current + 1)
            })
            .is_ok();

        let mut metrics = self.metrics_write();
        if acquired {
            metrics.connections_accepted += 1;
            Some(ConnectionSlot {
                connections: self.connections.clone(),
            })
        } else {
            metrics.connections_rejected += 1;
            None
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Snapshot of current metrics (used by the metrics endpoints).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
