//! # Application State Management
//!
//! Everything that is shared between HTTP handlers and WebSocket connections lives in
//! `AppState`: the immutable configuration, the connection registry, the two backend
//! clients, and the counters reported by `/health` and `/api/v1/metrics`.
//!
//! The backend clients and the registry are built once in `main` and handed to every
//! connection through this struct; there are no process-wide globals.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Lets every worker thread and every connection hold the same registry and clients
//! - `AppState` itself is cheap to clone: cloning only bumps reference counts
//!
//! ### `Arc<dyn Trait>`
//! - `generator` and `synthesizer` are trait objects, so tests can swap in fakes
//!
//! ### Atomics vs RwLock
//! - Conversation counters are plain `AtomicU64`s, updated from pipeline workers
//! - HTTP endpoint metrics need a `HashMap`, so they sit behind an `RwLock`

use crate::backends::{SpeechSynthesizer, TextGenerator};
use crate::config::AppConfig;
use crate::registry::ConnectionRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Configuration, fixed for the lifetime of the process
    pub config: Arc<AppConfig>,

    /// Live WebSocket connections by client id
    pub registry: Arc<ConnectionRegistry>,

    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,

    /// Counters updated by every conversation pipeline
    pub conversation: Arc<ConversationStats>,

    /// HTTP request metrics (updated by middleware)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// HTTP request metrics collected by `MetricsMiddleware`.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Process-wide conversation counters.
#[derive(Debug, Default)]
pub struct ConversationStats {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    turns_completed: AtomicU64,
    turns_failed: AtomicU64,
    messages_queued: AtomicU64,
    messages_rejected: AtomicU64,
}

/// Point-in-time copy of `ConversationStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConversationSnapshot {
    pub active_connections: u64,
    pub connections_opened: u64,
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub messages_queued: u64,
    pub messages_rejected: u64,
}

impl ConversationStats {
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Audio for a message reached the client.
    pub fn turn_completed(&self) {
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A message ended in a backend, emission, validation or timeout error.
    pub fn turn_failed(&self) {
        self.turns_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A message arrived while busy and was put in the pending queue.
    pub fn message_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// A message was refused without entering processing or the queue.
    pub fn message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        ConversationSnapshot {
            active_connections: opened.saturating_sub(closed),
            connections_opened: opened,
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_failed: self.turns_failed.load(Ordering::Relaxed),
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Assemble the shared state from already-constructed services.
    pub fn new(
        config: AppConfig,
        generator: Arc<dyn TextGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            generator,
            synthesizer,
            conversation: Arc::new(ConversationStats::default()),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Record one HTTP request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
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

    /// Copy of the HTTP metrics, so the lock is not held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
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

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
