//! Recovery coordination for terminally failed operations.
//!
//! The scheduler already burns the per-category retry budget; failures
//! that still escape it land here. The coordinator dispatches on the
//! strategy the classifier chose, walking a per-failure state machine
//! (pending, in progress, retrying or rolling back, then a terminal
//! state) and always reporting what it did. Permanent failures are never
//! silently swallowed: they end in a failed result or a durable replay
//! record a human can act on.

use crate::classify::{
    ClassifiedError, ErrorClassifier, FailureCategory, RecoveryStrategy,
};
use crate::correlation::CorrelationId;
use crate::scheduler::backoff;
use crate::store::IdempotencyStore;
use crate::TrackerResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Retry budget for the immediate-retry strategy
    pub immediate_retry_limit: u32,

    /// Retry budget for the delayed and rollback-then-retry strategies
    pub delayed_retry_limit: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            immediate_retry_limit: 3,
            delayed_retry_limit: 5,
        }
    }
}

/// Per-failure recovery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Pending,
    InProgress,
    Retrying,
    RollingBack,
    Success,
    Failed,
    ManualInterventionRequired,
}

/// Everything a human needs to replay a failed operation later without
/// recomputing the workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRecord {
    pub workflow: String,
    pub operation: String,
    pub target: String,
    pub category: FailureCategory,
    pub strategy: RecoveryStrategy,
    pub suggested_actions: Vec<String>,
    pub correlation: CorrelationId,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

impl ReplayRecord {
    pub fn from_failure(failure: &ClassifiedError) -> Self {
        Self {
            workflow: failure.context.correlation.workflow.clone(),
            operation: failure.context.operation.clone(),
            target: failure.context.target.clone(),
            category: failure.classification.category,
            strategy: failure.classification.strategy,
            suggested_actions: failure.classification.suggested_actions.clone(),
            correlation: failure.context.correlation.id,
            error: failure.error.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

/// Outcome report for one recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub strategy_applied: RecoveryStrategy,
    pub final_state: RecoveryState,
    pub retry_attempts: u32,
    pub rollback_performed: bool,
    pub manual_intervention_required: bool,
    pub actions_taken: Vec<String>,
    pub replay_record: Option<ReplayRecord>,
}

impl RecoveryResult {
    fn new(strategy: RecoveryStrategy) -> Self {
        Self {
            success: false,
            strategy_applied: strategy,
            final_state: RecoveryState::Pending,
            retry_attempts: 0,
            rollback_performed: false,
            manual_intervention_required: false,
            actions_taken: Vec::new(),
            replay_record: None,
        }
    }

    fn note(&mut self, action: impl Into<String>) {
        self.actions_taken.push(action.into());
    }
}

pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    classifier: ErrorClassifier,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            classifier: ErrorClassifier::new(),
        }
    }

    /// Attempt to recover from a classified failure. `operation` is
    /// re-invoked for retrying strategies; `fallback` feeds the fallback
    /// strategy. Returns the report and, when recovery produced one, the
    /// operation's value.
    pub async fn recover<T, F, Fut>(
        &self,
        failure: ClassifiedError,
        operation: F,
        fallback: Option<T>,
        store: &mut IdempotencyStore,
    ) -> (RecoveryResult, Option<T>)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = TrackerResult<T>>,
    {
        let strategy = failure.classification.strategy;
        let mut result = RecoveryResult::new(strategy);
        result.final_state = RecoveryState::InProgress;
        info!(
            operation = %failure.context.operation,
            target = %failure.context.target,
            category = %failure.classification.category,
            strategy = ?strategy,
            "recovery started"
        );

        let value = match strategy {
            RecoveryStrategy::ImmediateRetry => {
                self.retry(
                    &failure,
                    &operation,
                    self.config.immediate_retry_limit,
                    false,
                    &mut result,
                )
                .await
            }

            RecoveryStrategy::DelayedRetry => {
                self.retry(
                    &failure,
                    &operation,
                    self.config.delayed_retry_limit,
                    true,
                    &mut result,
                )
                .await
            }

            RecoveryStrategy::RollbackAndRetry => {
                self.rollback(store, &mut result);
                self.retry(
                    &failure,
                    &operation,
                    self.config.delayed_retry_limit,
                    true,
                    &mut result,
                )
                .await
            }

            RecoveryStrategy::ManualIntervention => {
                if failure.classification.should_rollback {
                    self.rollback(store, &mut result);
                }
                result.manual_intervention_required = true;
                result.replay_record = Some(ReplayRecord::from_failure(&failure));
                result.note("recorded replay record for manual intervention");
                None
            }

            RecoveryStrategy::Fallback => {
                if fallback.is_some() {
                    result.note("substituted degraded fallback result");
                }
                fallback
            }

            RecoveryStrategy::Skip => {
                result.note(format!("skipped {}", failure.context.target));
                result.final_state = RecoveryState::Success;
                result.success = true;
                warn!(
                    target = %failure.context.target,
                    "operation skipped as non-fatal"
                );
                return (result, None);
            }

            RecoveryStrategy::Abort => {
                if failure.classification.should_rollback {
                    self.rollback(store, &mut result);
                }
                result.note("workflow aborted");
                error!(
                    operation = %failure.context.operation,
                    target = %failure.context.target,
                    error = %failure.error,
                    "unrecoverable failure, aborting"
                );
                None
            }
        };

        match strategy {
            RecoveryStrategy::Skip => {}
            RecoveryStrategy::ManualIntervention => {
                result.final_state = RecoveryState::ManualInterventionRequired;
            }
            _ => {
                result.success = value.is_some();
                result.final_state = if result.success {
                    RecoveryState::Success
                } else {
                    RecoveryState::Failed
                };
            }
        }

        info!(
            state = ?result.final_state,
            retries = result.retry_attempts,
            rollback = result.rollback_performed,
            "recovery finished"
        );
        (result, value)
    }

    async fn retry<T, F, Fut>(
        &self,
        failure: &ClassifiedError,
        operation: &F,
        budget: u32,
        delayed: bool,
        result: &mut RecoveryResult,
    ) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = TrackerResult<T>>,
    {
        result.final_state = RecoveryState::Retrying;
        let mut current = failure.clone();

        for attempt in 0..budget {
            if delayed {
                let delay = backoff::retry_delay(&current, attempt);
                result.note(format!(
                    "waited {} before retry {}",
                    humantime::format_duration(delay),
                    attempt + 1
                ));
                tokio::time::sleep(delay).await;
            }

            result.retry_attempts += 1;
            match operation().await {
                Ok(value) => {
                    result.note(format!("retry {} succeeded", attempt + 1));
                    return Some(value);
                }
                Err(e) => {
                    let reclassified = self.classifier.classify(e, failure.context.clone());
                    warn!(
                        attempt = attempt + 1,
                        category = %reclassified.classification.category,
                        error = %reclassified.error,
                        "recovery retry failed"
                    );
                    if !reclassified.classification.retryable {
                        result.note("retry hit a non-retryable failure, stopping".to_string());
                        return None;
                    }
                    current = reclassified;
                }
            }
        }
        result.note(format!("retry budget of {budget} exhausted"));
        None
    }

    fn rollback(&self, store: &mut IdempotencyStore, result: &mut RecoveryResult) {
        result.final_state = RecoveryState::RollingBack;
        if !store.has_active_transaction() {
            result.note("no active transaction to roll back");
            return;
        }
        match store.rollback_transaction() {
            Ok(()) => {
                result.rollback_performed = true;
                result.note("rolled back active transaction");
            }
            Err(e) => {
                // Surfaced in the report; rollback failures are for a
                // human, not another retry loop
                error!(error = %e, "rollback failed during recovery");
                result.note(format!("rollback failed: {e}"));
            }
        }
    }
}
