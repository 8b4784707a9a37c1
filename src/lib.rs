//! Resilience and consistency core for fan-out issue automation.
//!
//! Decomposed work items become networks of linked sub-issues in a
//! REST-based tracker, driven through an unreliable remote API: a
//! priority scheduler with circuit breaking and category backoff, a
//! pure error classifier, a transactional idempotency store, a
//! dependency graph, adaptive batching with signed checkpoints, and a
//! recovery coordinator for whatever still fails.

// Allow complex types where needed for comprehensive error handling and configuration
#![allow(clippy::type_complexity)]

pub mod api;
pub mod batch;
pub mod checkpoint;
pub mod classify;
pub mod correlation;
pub mod graph;
pub mod orchestrator;
pub mod recovery;
pub mod scheduler;
pub mod store;

// Re-export the workflow driver for convenience
pub use orchestrator::{WorkflowOrchestrator, WorkflowReport};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

// Global flag for handling Ctrl+C interrupts
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Set the interrupt flag (called by signal handler)
pub fn set_interrupted() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Check if an interrupt has been received
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Reset the interrupt flag (primarily for testing)
pub fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

// Error types for every failure the core can observe at the tracker boundary
// or inside its own consistency machinery
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {})", humantime::format_duration(d))).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("store failure: {0}")]
    Store(String),

    #[error("transaction failure: {0}")]
    Transaction(String),

    #[error("dependency cycle: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("operation interrupted")]
    Interrupted,

    #[error("invalid input: {0}")]
    Invalid(String),
}

// Manual Clone implementation because std::io::Error and serde_json::Error
// don't implement Clone
impl Clone for TrackerError {
    fn clone(&self) -> Self {
        match self {
            TrackerError::Http { status, message } => TrackerError::Http {
                status: *status,
                message: message.clone(),
            },
            TrackerError::RateLimited { retry_after } => TrackerError::RateLimited {
                retry_after: *retry_after,
            },
            TrackerError::Network(e) => {
                TrackerError::Network(std::io::Error::new(e.kind(), e.to_string()))
            }
            TrackerError::Timeout(s) => TrackerError::Timeout(s.clone()),
            TrackerError::CircuitOpen(s) => TrackerError::CircuitOpen(s.clone()),
            TrackerError::Serialization(s) => TrackerError::Serialization(s.clone()),
            TrackerError::Store(s) => TrackerError::Store(s.clone()),
            TrackerError::Transaction(s) => TrackerError::Transaction(s.clone()),
            TrackerError::CycleDetected(path) => TrackerError::CycleDetected(path.clone()),
            TrackerError::Interrupted => TrackerError::Interrupted,
            TrackerError::Invalid(s) => TrackerError::Invalid(s.clone()),
        }
    }
}

// Rendered eagerly so the error stays cloneable
impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::Serialization(e.to_string())
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// A unit of work: an issue-to-be with its id, dependencies, and optional
/// sub-items. Parsed and validated upstream; the core only ever sees
/// well-typed items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub sub_items: Vec<Item>,
}

impl Item {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            labels: Vec::new(),
            dependencies: Vec::new(),
            sub_items: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Flatten this item and all transitive sub-items into one list
    pub fn flatten(&self) -> Vec<&Item> {
        let mut out = vec![self];
        for sub in &self.sub_items {
            out.extend(sub.flatten());
        }
        out
    }
}

/// Aggregate engine configuration. All thresholds are tunable defaults,
/// consumed as already-validated values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub scheduler: scheduler::SchedulerConfig,
    pub breaker: scheduler::CircuitBreakerConfig,
    pub batch: batch::BatchConfig,
    pub recovery: recovery::RecoveryConfig,
}
