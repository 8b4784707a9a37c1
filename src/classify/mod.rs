//! Error classification for recovery strategy selection.
//!
//! Classification is a pure, total, deterministic mapping from a raw
//! `TrackerError` to a `Classification` value. It is decided exactly once,
//! attached to the error as a `ClassifiedError`, and carried explicitly
//! from then on — downstream code never re-inspects raw error text.
//!
//! Precedence: timeout markers first, then HTTP status family, then known
//! low-level network error kinds, then the conservative `Unknown` default
//! (manual intervention, never assumed retryable).

use crate::correlation::CorrelationContext;
use crate::TrackerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// How likely a retry is to succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recoverability {
    /// Retry as-is: network blips, 5xx, rate limiting
    Transient,

    /// Needs a condition changed first: auth, storage, conflicts
    Recoverable,

    /// Retry never succeeds: validation, not-found
    Permanent,

    /// Unclassified; defaults to manual intervention
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What the recovery coordinator should do with the failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ImmediateRetry,
    DelayedRetry,
    RollbackAndRetry,
    ManualIntervention,
    Fallback,
    Skip,
    Abort,
}

/// Failure category, used for backoff selection and batch statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Auth,
    NotFound,
    Validation,
    RateLimited,
    Server,
    Network,
    Timeout,
    CircuitBreaker,
    Storage,
    Unknown,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCategory::Auth => "auth",
            FailureCategory::NotFound => "not_found",
            FailureCategory::Validation => "validation",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::Server => "server",
            FailureCategory::Network => "network",
            FailureCategory::Timeout => "timeout",
            FailureCategory::CircuitBreaker => "circuit_breaker",
            FailureCategory::Storage => "storage",
            FailureCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Recoverability verdict for one failure. A pure value: no owned mutable
/// state, cheap to clone into replay records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub recoverability: Recoverability,
    pub severity: Severity,
    pub strategy: RecoveryStrategy,
    pub retryable: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub should_rollback: bool,
    pub requires_manual_intervention: bool,
    pub category: FailureCategory,
    pub suggested_actions: Vec<String>,
}

/// Context about where an error occurred
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Operation label (e.g. "create_issue", "update_issue")
    pub operation: String,

    /// Target of the operation (item id or content hash)
    pub target: String,

    pub correlation: CorrelationContext,

    pub timestamp: DateTime<Utc>,

    /// Additional metadata (batch index, attempt, etc.)
    pub metadata: HashMap<String, String>,
}

impl ErrorContext {
    pub fn new(
        operation: impl Into<String>,
        target: impl Into<String>,
        correlation: CorrelationContext,
    ) -> Self {
        Self {
            operation: operation.into(),
            target: target.into(),
            correlation,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A raw failure with its classification attached
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub error: TrackerError,
    pub classification: Classification,
    pub context: ErrorContext,

    /// Attempts already made when this classification was produced
    pub retry_count: u32,
}

impl ClassifiedError {
    /// Whether the scheduler may retry this failure again
    pub fn can_retry(&self) -> bool {
        self.classification.retryable && self.retry_count < self.classification.max_retries
    }

    /// Explicit retry-after hint carried by the raw error, if any.
    /// Takes precedence over the category backoff formula.
    pub fn retry_after_hint(&self) -> Option<Duration> {
        match &self.error {
            TrackerError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failure in {} on {}: {} (attempt {}/{})",
            self.classification.category,
            self.context.operation,
            self.context.target,
            self.error,
            self.retry_count + 1,
            self.classification.max_retries.max(1),
        )
    }
}

/// Pure classifier. Stateless; construction exists only so callers can
/// hold it alongside the rest of the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a raw failure. Total over every `TrackerError`; never
    /// panics.
    pub fn classify(&self, error: TrackerError, context: ErrorContext) -> ClassifiedError {
        let classification = self.classification_for(&error);
        ClassifiedError {
            error,
            classification,
            context,
            retry_count: 0,
        }
    }

    fn classification_for(&self, error: &TrackerError) -> Classification {
        match error {
            // Timeout markers take precedence over everything else: the
            // remote call is in an unknown final state.
            TrackerError::Timeout(_) => Classification {
                recoverability: Recoverability::Transient,
                severity: Severity::High,
                strategy: RecoveryStrategy::DelayedRetry,
                retryable: true,
                max_retries: 3,
                base_delay: Duration::from_millis(1000),
                should_rollback: false,
                requires_manual_intervention: false,
                category: FailureCategory::Timeout,
                suggested_actions: vec![
                    "Check replay safety before re-creating the target".to_string(),
                    "Verify tracker availability".to_string(),
                ],
            },

            TrackerError::RateLimited { .. } => Self::rate_limited(),

            TrackerError::Http { status, .. } => self.classify_status(*status),

            TrackerError::Network(io_err) => self.classify_network(io_err),

            TrackerError::CircuitOpen(_) => Classification {
                recoverability: Recoverability::Transient,
                severity: Severity::High,
                strategy: RecoveryStrategy::DelayedRetry,
                // The breaker itself gates retries; re-queueing at the
                // scheduler would just spin against the open circuit.
                retryable: false,
                max_retries: 0,
                base_delay: Duration::from_millis(1000),
                should_rollback: false,
                requires_manual_intervention: false,
                category: FailureCategory::CircuitBreaker,
                suggested_actions: vec![
                    "Wait for the circuit breaker to re-close".to_string(),
                ],
            },

            TrackerError::Serialization(_) | TrackerError::Invalid(_) => Classification {
                recoverability: Recoverability::Permanent,
                severity: Severity::High,
                strategy: RecoveryStrategy::ManualIntervention,
                retryable: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                should_rollback: false,
                requires_manual_intervention: true,
                category: FailureCategory::Validation,
                suggested_actions: vec!["Fix the payload and replay".to_string()],
            },

            // Store commit/rollback failures signal a possible consistency
            // gap: surfaced, never auto-retried.
            TrackerError::Store(_) | TrackerError::Transaction(_) => Classification {
                recoverability: Recoverability::Recoverable,
                severity: Severity::Critical,
                strategy: RecoveryStrategy::ManualIntervention,
                retryable: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                should_rollback: false,
                requires_manual_intervention: true,
                category: FailureCategory::Storage,
                suggested_actions: vec![
                    "Inspect the idempotency store for partial state".to_string(),
                    "Resolve storage failure before resuming".to_string(),
                ],
            },

            TrackerError::CycleDetected(_) => Classification {
                recoverability: Recoverability::Permanent,
                severity: Severity::Critical,
                strategy: RecoveryStrategy::Abort,
                retryable: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                should_rollback: false,
                requires_manual_intervention: true,
                category: FailureCategory::Validation,
                suggested_actions: vec!["Break the dependency cycle".to_string()],
            },

            TrackerError::Interrupted => Classification {
                recoverability: Recoverability::Permanent,
                severity: Severity::Medium,
                strategy: RecoveryStrategy::Abort,
                retryable: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                should_rollback: false,
                requires_manual_intervention: false,
                category: FailureCategory::Unknown,
                suggested_actions: vec!["Resume from the last checkpoint".to_string()],
            },
        }
    }

    fn classify_status(&self, status: u16) -> Classification {
        match status {
            401 | 403 => Classification {
                recoverability: Recoverability::Recoverable,
                severity: Severity::High,
                strategy: RecoveryStrategy::ManualIntervention,
                retryable: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                should_rollback: false,
                requires_manual_intervention: true,
                category: FailureCategory::Auth,
                suggested_actions: vec![
                    "Refresh or re-issue the API token".to_string(),
                    "Verify the token has the required scopes".to_string(),
                ],
            },
            404 => Classification {
                recoverability: Recoverability::Permanent,
                severity: Severity::Low,
                strategy: RecoveryStrategy::Skip,
                retryable: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                should_rollback: false,
                requires_manual_intervention: false,
                category: FailureCategory::NotFound,
                suggested_actions: vec![
                    "Confirm the target still exists remotely".to_string(),
                ],
            },
            422 => Classification {
                recoverability: Recoverability::Permanent,
                severity: Severity::High,
                strategy: RecoveryStrategy::ManualIntervention,
                retryable: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                should_rollback: true,
                requires_manual_intervention: true,
                category: FailureCategory::Validation,
                suggested_actions: vec![
                    "Roll back partial state for this item".to_string(),
                    "Fix the payload validation error and replay".to_string(),
                ],
            },
            429 => Self::rate_limited(),
            500..=599 => Classification {
                recoverability: Recoverability::Transient,
                severity: Severity::High,
                strategy: RecoveryStrategy::DelayedRetry,
                retryable: true,
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                should_rollback: false,
                requires_manual_intervention: false,
                category: FailureCategory::Server,
                suggested_actions: vec![
                    "Retry with exponential backoff".to_string(),
                    "Check the tracker status page".to_string(),
                ],
            },
            400..=499 => Classification {
                recoverability: Recoverability::Permanent,
                severity: Severity::Medium,
                strategy: RecoveryStrategy::ManualIntervention,
                retryable: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                should_rollback: false,
                requires_manual_intervention: true,
                category: FailureCategory::Validation,
                suggested_actions: vec!["Inspect the rejected request".to_string()],
            },
            _ => Self::unknown(),
        }
    }

    fn classify_network(&self, io_err: &std::io::Error) -> Classification {
        use std::io::ErrorKind;

        match io_err.kind() {
            // Connection-level resets: worth an immediate retry
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Classification {
                recoverability: Recoverability::Transient,
                severity: Severity::Medium,
                strategy: RecoveryStrategy::ImmediateRetry,
                retryable: true,
                max_retries: 3,
                base_delay: Duration::from_millis(100),
                should_rollback: false,
                requires_manual_intervention: false,
                category: FailureCategory::Network,
                suggested_actions: vec!["Retry immediately".to_string()],
            },

            // DNS and timeout-like kinds: give the network a moment
            ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::NotFound
            | ErrorKind::AddrNotAvailable => Classification {
                recoverability: Recoverability::Transient,
                severity: Severity::Medium,
                strategy: RecoveryStrategy::DelayedRetry,
                retryable: true,
                max_retries: 3,
                base_delay: Duration::from_millis(250),
                should_rollback: false,
                requires_manual_intervention: false,
                category: FailureCategory::Network,
                suggested_actions: vec![
                    "Retry with backoff".to_string(),
                    "Check DNS and connectivity".to_string(),
                ],
            },

            _ => Self::unknown(),
        }
    }

    /// Rate limiting gets a larger retry budget than other transients:
    /// waiting out the window almost always succeeds.
    fn rate_limited() -> Classification {
        Classification {
            recoverability: Recoverability::Transient,
            severity: Severity::Medium,
            strategy: RecoveryStrategy::DelayedRetry,
            retryable: true,
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            should_rollback: false,
            requires_manual_intervention: false,
            category: FailureCategory::RateLimited,
            suggested_actions: vec![
                "Honor the retry-after hint when present".to_string(),
                "Reduce batch size".to_string(),
            ],
        }
    }

    fn unknown() -> Classification {
        Classification {
            recoverability: Recoverability::Unknown,
            severity: Severity::Medium,
            strategy: RecoveryStrategy::ManualIntervention,
            retryable: false,
            max_retries: 0,
            base_delay: Duration::ZERO,
            should_rollback: false,
            requires_manual_intervention: true,
            category: FailureCategory::Unknown,
            suggested_actions: vec![
                "Inspect the raw failure and replay manually".to_string(),
            ],
        }
    }
}
