//! Adaptive batch processing.
//!
//! Items flow through the handler in groups. Group size shrinks under
//! rate-limit pressure or error spikes and grows back while processing is
//! clean. After every group a signed checkpoint lands in the checkpoint
//! store, so an interrupted run can resume from the last confirmed
//! frontier instead of replaying the whole workflow.

use crate::checkpoint::{CheckpointSigner, CheckpointStore, WorkflowCheckpoint};
use crate::classify::{ClassifiedError, FailureCategory};
use crate::recovery::ReplayRecord;
use crate::{Item, TrackerResult};
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,

    /// Shrink when rate-limited failures exceed this share of a group
    pub rate_limit_shrink_threshold: f64,

    /// Shrink when failures of any kind exceed this share of a group
    pub error_shrink_threshold: f64,

    /// Growth multiplier applied after a fully clean group
    pub growth_factor: f64,

    /// Pause between groups
    pub inter_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 5,
            min_batch_size: 1,
            max_batch_size: 20,
            rate_limit_shrink_threshold: 0.1,
            error_shrink_threshold: 0.25,
            growth_factor: 1.5,
            inter_batch_delay: Duration::from_millis(200),
        }
    }
}

/// Aggregate outcome of one batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,

    /// Failure counts keyed by category name
    pub by_category: HashMap<String, u32>,

    /// Durable records for failures a human must replay
    pub manual_interventions: Vec<ReplayRecord>,

    pub elapsed: Duration,

    /// Items per second over the whole run
    pub throughput: f64,

    /// True when an interrupt stopped the run before all items were
    /// attempted
    pub interrupted: bool,

    pub final_batch_size: usize,
}

/// Per-item handler: resolves to `Ok` once the item is confirmed done
pub type ItemHandler =
    dyn Fn(Item) -> BoxFuture<'static, Result<(), ClassifiedError>> + Send + Sync;

pub struct BatchProcessor {
    config: BatchConfig,
    signer: CheckpointSigner,
    checkpoints: Arc<dyn CheckpointStore>,
    workflow: String,
    sequence: u64,
    current_size: usize,
    completed: Vec<String>,
    failed: Vec<String>,
    interrupt: Arc<AtomicBool>,
}

impl BatchProcessor {
    pub fn new(
        config: BatchConfig,
        signer: CheckpointSigner,
        checkpoints: Arc<dyn CheckpointStore>,
        workflow: impl Into<String>,
    ) -> Self {
        let current_size = config.initial_batch_size.clamp(
            config.min_batch_size.max(1),
            config.max_batch_size.max(1),
        );
        Self {
            config,
            signer,
            checkpoints,
            workflow: workflow.into(),
            sequence: 0,
            current_size,
            completed: Vec::new(),
            failed: Vec::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag for aborting this processor specifically; the process-wide
    /// interrupt flag is honored as well.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn current_batch_size(&self) -> usize {
        self.current_size
    }

    fn interrupted(&self) -> bool {
        crate::is_interrupted() || self.interrupt.load(Ordering::SeqCst)
    }

    /// Run every item through the handler in adaptively-sized groups.
    /// Items within a group run concurrently; the scheduler behind the
    /// handler enforces the real concurrency limit.
    pub async fn process(
        &mut self,
        items: &[Item],
        handler: &ItemHandler,
    ) -> TrackerResult<BatchReport> {
        let run_started = Instant::now();
        let mut by_category: HashMap<String, u32> = HashMap::new();
        let mut manual_interventions = Vec::new();
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut interrupted = false;
        let mut next = 0usize;

        info!(
            workflow = %self.workflow,
            total = items.len(),
            batch_size = self.current_size,
            "batch run started"
        );

        while next < items.len() {
            if self.interrupted() {
                // Graceful drain: in-flight group already finished, just
                // stop taking new ones
                warn!(
                    workflow = %self.workflow,
                    remaining = items.len() - next,
                    "interrupt observed, draining batch run"
                );
                interrupted = true;
                break;
            }

            let size = self.current_size.min(items.len() - next);
            let group = &items[next..next + size];
            let results = join_all(group.iter().map(|item| handler(item.clone()))).await;

            let mut group_failures = 0usize;
            let mut group_rate_limited = 0usize;
            for (item, result) in group.iter().zip(results) {
                match result {
                    Ok(()) => {
                        succeeded += 1;
                        self.completed.push(item.id.clone());
                    }
                    Err(failure) => {
                        failed += 1;
                        group_failures += 1;
                        let category = failure.classification.category;
                        if category == FailureCategory::RateLimited {
                            group_rate_limited += 1;
                        }
                        *by_category.entry(category.to_string()).or_insert(0) += 1;
                        if failure.classification.requires_manual_intervention {
                            manual_interventions.push(ReplayRecord::from_failure(&failure));
                        }
                        self.failed.push(item.id.clone());
                    }
                }
            }

            self.adapt(size, group_rate_limited, group_failures);
            self.emit_checkpoint(next + size).await?;
            next += size;

            if next < items.len() && !self.config.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }
        }

        let elapsed = run_started.elapsed();
        let attempted = succeeded + failed;
        let report = BatchReport {
            total: items.len(),
            succeeded,
            failed,
            by_category,
            manual_interventions,
            elapsed,
            throughput: attempted as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
            interrupted,
            final_batch_size: self.current_size,
        };
        info!(
            workflow = %self.workflow,
            succeeded = report.succeeded,
            failed = report.failed,
            throughput = format!("{:.1}/s", report.throughput),
            interrupted = report.interrupted,
            "batch run finished"
        );
        Ok(report)
    }

    fn adapt(&mut self, group_size: usize, rate_limited: usize, failures: usize) {
        let rate_ratio = rate_limited as f64 / group_size as f64;
        let error_ratio = failures as f64 / group_size as f64;

        let previous = self.current_size;
        if rate_ratio > self.config.rate_limit_shrink_threshold
            || error_ratio > self.config.error_shrink_threshold
        {
            self.current_size = (self.current_size / 2).max(self.config.min_batch_size.max(1));
        } else if failures == 0 {
            let grown = (self.current_size as f64 * self.config.growth_factor).ceil() as usize;
            self.current_size = grown.min(self.config.max_batch_size.max(1));
        }

        if self.current_size != previous {
            debug!(
                from = previous,
                to = self.current_size,
                rate_ratio = format!("{rate_ratio:.2}"),
                error_ratio = format!("{error_ratio:.2}"),
                "batch size adapted"
            );
        }
    }

    async fn emit_checkpoint(&mut self, cursor: usize) -> TrackerResult<()> {
        self.sequence += 1;
        let checkpoint = WorkflowCheckpoint {
            workflow: self.workflow.clone(),
            sequence: self.sequence,
            completed: self.completed.clone(),
            failed: self.failed.clone(),
            state: serde_json::json!({ "cursor": cursor }),
            created_at: Utc::now(),
        };
        let signed = self.signer.sign(&checkpoint)?;
        self.checkpoints.save(&signed).await
    }
}
