//! Workflow driver: fans a set of work items into linked tracker issues.
//!
//! One orchestrator owns one dependency graph, one idempotency store, one
//! scheduler, and one batch processor. Items are processed frontier by
//! frontier: the ready set flows through the batch processor, successes
//! are recorded in a store transaction before being marked complete, and
//! terminal failures go through the recovery coordinator. Items downstream
//! of a failure simply never become ready and are reported as blocked.

use crate::api::{CreateIssue, IssueRecord, IssueTracker, UpdateIssue};
use crate::batch::{BatchProcessor, BatchReport};
use crate::checkpoint::{CheckpointSigner, CheckpointStore};
use crate::classify::{ClassifiedError, ErrorContext, RecoveryStrategy};
use crate::correlation::CorrelationContext;
use crate::graph::DependencyGraph;
use crate::recovery::{RecoveryCoordinator, RecoveryResult};
use crate::scheduler::{Priority, RequestScheduler};
use crate::store::{
    content_hash, IdempotencyStore, ItemState, ItemStatus, OpTarget, OperationKind,
};
use crate::{EngineConfig, Item, TrackerError, TrackerResult};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Final accounting for one workflow run
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub workflow: String,
    pub total: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Skipped as non-fatal (e.g. remote target gone); dependents proceed
    pub skipped: Vec<String>,
    /// Never became ready because something upstream failed, or the run
    /// was interrupted first
    pub blocked: Vec<String>,
    pub batches: Vec<BatchReport>,
    pub recoveries: Vec<RecoveryResult>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
enum Plan {
    Create,
    Update(String),
}

pub struct WorkflowOrchestrator {
    workflow: String,
    tracker: Arc<dyn IssueTracker>,
    scheduler: Arc<RequestScheduler>,
    store: IdempotencyStore,
    batch: BatchProcessor,
    recovery: RecoveryCoordinator,
    correlation: CorrelationContext,
}

impl WorkflowOrchestrator {
    /// Build an orchestrator with a fresh checkpoint signing key. Must be
    /// called from within a tokio runtime.
    pub fn new(
        workflow: impl Into<String>,
        tracker: Arc<dyn IssueTracker>,
        checkpoints: Arc<dyn CheckpointStore>,
        store: IdempotencyStore,
        config: EngineConfig,
    ) -> TrackerResult<Self> {
        let workflow = workflow.into();
        let scheduler = Arc::new(RequestScheduler::new(config.scheduler, config.breaker));
        let (signer, _) = CheckpointSigner::generate()?;
        let batch = BatchProcessor::new(config.batch, signer, checkpoints, workflow.clone());
        Ok(Self {
            correlation: CorrelationContext::root(workflow.clone()),
            workflow,
            tracker,
            scheduler,
            store,
            batch,
            recovery: RecoveryCoordinator::new(config.recovery),
        })
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &IdempotencyStore {
        &self.store
    }

    /// Drive every item (and its sub-items) to a linked tracker issue.
    pub async fn run(&mut self, items: &[Item]) -> TrackerResult<WorkflowReport> {
        let started = Instant::now();
        let flat = flatten_items(items);
        let index: HashMap<String, Item> =
            flat.iter().map(|item| (item.id.clone(), item.clone())).collect();

        let mut graph = DependencyGraph::new();
        for item in &flat {
            graph.add_node(item.id.clone(), item.dependencies.clone());
        }

        // Every referenced dependency must resolve to a declared item
        for id in graph.node_ids() {
            if !index.contains_key(id) {
                return Err(TrackerError::Invalid(format!(
                    "dependency on undeclared item: {id}"
                )));
            }
        }

        if let Some(cycle) = graph.detect_cycles().into_iter().next() {
            error!(workflow = %self.workflow, cycle = ?cycle, "dependency cycle, refusing to run");
            return Err(TrackerError::CycleDetected(cycle));
        }

        // Resume: items the store already confirmed complete stay done
        let mut completed: HashSet<String> = flat
            .iter()
            .filter(|item| {
                self.store
                    .issue_state(&item.id)
                    .map_or(false, |s| s.status == ItemStatus::Completed)
            })
            .map(|item| item.id.clone())
            .collect();
        if !completed.is_empty() {
            info!(
                workflow = %self.workflow,
                resumed = completed.len(),
                "resuming with previously completed items"
            );
        }

        let mut failed: HashSet<String> = HashSet::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut batches = Vec::new();
        let mut recoveries = Vec::new();
        let mut interrupted = false;

        info!(workflow = %self.workflow, items = flat.len(), "workflow run started");

        loop {
            if crate::is_interrupted() {
                warn!(workflow = %self.workflow, "interrupt observed, stopping frontier loop");
                interrupted = true;
                break;
            }

            let frontier: Vec<String> = graph
                .ready_nodes(&completed)
                .into_iter()
                .filter(|id| !failed.contains(id))
                .collect();
            if frontier.is_empty() {
                break;
            }
            debug!(workflow = %self.workflow, frontier = frontier.len(), "processing ready frontier");

            let report = self.process_frontier(&frontier, &index, &graph).await?;
            let outcomes = report.outcomes;
            interrupted = interrupted || report.batch.interrupted;
            batches.push(report.batch);

            let mut confirmed: Vec<(String, IssueRecord)> = Vec::new();
            for (id, outcome) in outcomes {
                match outcome {
                    Ok(record) => confirmed.push((id, record)),
                    Err(failure) => {
                        let (result, value) = self.recover_item(&index[&id], failure).await;
                        let strategy = result.strategy_applied;
                        let success = result.success;
                        recoveries.push(result);
                        match value {
                            Some(record) => confirmed.push((id, record)),
                            None if success && strategy == RecoveryStrategy::Skip => {
                                skipped.push(id.clone());
                                completed.insert(id);
                            }
                            None => {
                                failed.insert(id);
                            }
                        }
                    }
                }
            }

            // Durably record successes before marking them complete
            if !confirmed.is_empty() {
                self.store.begin_transaction()?;
                for (id, record) in &confirmed {
                    let kind = if self.store.issue_state(id).is_some() {
                        OperationKind::Update
                    } else {
                        OperationKind::Create
                    };
                    let node = graph.node(id);
                    let state = ItemState {
                        status: ItemStatus::Completed,
                        dependencies: index[id].dependencies.clone(),
                        dependents: node
                            .map(|n| n.dependents.iter().cloned().collect())
                            .unwrap_or_default(),
                        remote_id: Some(record.id.clone()),
                        remote_content_hash: Some(content_hash(id, &record.body)),
                        updated_at: chrono::Utc::now(),
                    };
                    self.store
                        .record_operation(kind, OpTarget::Issue(id.clone()), Some(state))?;
                }
                self.store.commit_transaction()?;
                for (id, _) in confirmed {
                    completed.insert(id);
                }
            }

            // Feed observed rate-limit headroom back into the scheduler
            match self.tracker.rate_limit_status().await {
                Ok(info) => self.scheduler.record_rate_limit(&info),
                Err(e) => debug!(error = %e, "rate limit status unavailable"),
            }

            if interrupted {
                break;
            }
        }

        let blocked: Vec<String> = {
            let mut blocked: Vec<String> = flat
                .iter()
                .map(|item| item.id.clone())
                .filter(|id| !completed.contains(id) && !failed.contains(id))
                .collect();
            blocked.sort();
            blocked
        };
        let mut completed: Vec<String> = completed.into_iter().collect();
        completed.sort();
        let mut failed: Vec<String> = failed.into_iter().collect();
        failed.sort();
        skipped.sort();

        let report = WorkflowReport {
            workflow: self.workflow.clone(),
            total: flat.len(),
            completed,
            failed,
            skipped,
            blocked,
            batches,
            recoveries,
            interrupted,
            elapsed: started.elapsed(),
        };
        info!(
            workflow = %report.workflow,
            completed = report.completed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            interrupted = report.interrupted,
            "workflow run finished"
        );
        Ok(report)
    }

    /// Stop scheduler intake and drain in-flight tracker calls.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    async fn process_frontier(
        &mut self,
        frontier: &[String],
        index: &HashMap<String, Item>,
        graph: &DependencyGraph,
    ) -> TrackerResult<FrontierReport> {
        // Decide create vs. update per item up front, against local state
        let mut plans: HashMap<String, (Plan, Priority)> = HashMap::new();
        for id in frontier {
            let plan = match self.store.issue_state(id).and_then(|s| s.remote_id.clone()) {
                Some(remote_id) => Plan::Update(remote_id),
                None => Plan::Create,
            };
            // Items others wait on jump a band
            let priority = if graph.node(id).is_some_and(|n| !n.dependents.is_empty()) {
                Priority::High
            } else {
                Priority::Medium
            };
            plans.insert(id.clone(), (plan, priority));
        }

        // Remote ids of already-completed dependencies, for issue linking
        let id_map: HashMap<String, String> = frontier
            .iter()
            .flat_map(|id| index[id].dependencies.iter())
            .filter_map(|dep| {
                self.store
                    .issue_state(dep)
                    .and_then(|s| s.remote_id.clone())
                    .map(|remote| (dep.clone(), remote))
            })
            .collect();

        let plans = Arc::new(plans);
        let id_map = Arc::new(id_map);
        let outcomes: Arc<Mutex<Vec<(String, Result<IssueRecord, ClassifiedError>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracker = Arc::clone(&self.tracker);
        let scheduler = Arc::clone(&self.scheduler);
        let correlation = self.correlation.clone();

        let handler = {
            let outcomes = Arc::clone(&outcomes);
            move |item: Item| {
                let plans = Arc::clone(&plans);
                let id_map = Arc::clone(&id_map);
                let outcomes = Arc::clone(&outcomes);
                let tracker = Arc::clone(&tracker);
                let scheduler = Arc::clone(&scheduler);
                let correlation = correlation.child();
                async move {
                    let (plan, priority) = match plans.get(&item.id) {
                        Some(entry) => entry.clone(),
                        None => return Ok(()),
                    };
                    let body = linked_body(&item, &id_map);
                    let result = match plan {
                        Plan::Create => {
                            let req = CreateIssue {
                                title: item.title.clone(),
                                body,
                                labels: item.labels.clone(),
                            };
                            let context =
                                ErrorContext::new("create_issue", &item.id, correlation);
                            scheduler
                                .submit(
                                    move || {
                                        let tracker = Arc::clone(&tracker);
                                        let req = req.clone();
                                        async move { tracker.create_issue(&req).await }
                                    },
                                    context,
                                    priority,
                                )
                                .await
                        }
                        Plan::Update(remote_id) => {
                            let req = UpdateIssue {
                                title: Some(item.title.clone()),
                                body: Some(body),
                                labels: Some(item.labels.clone()),
                                state: None,
                            };
                            let context =
                                ErrorContext::new("update_issue", &item.id, correlation);
                            scheduler
                                .submit(
                                    move || {
                                        let tracker = Arc::clone(&tracker);
                                        let req = req.clone();
                                        let remote_id = remote_id.clone();
                                        async move {
                                            tracker.update_issue(&remote_id, &req).await
                                        }
                                    },
                                    context,
                                    priority,
                                )
                                .await
                        }
                    };

                    let mut outcomes = outcomes.lock().unwrap_or_else(|e| e.into_inner());
                    match result {
                        Ok(record) => {
                            outcomes.push((item.id.clone(), Ok(record)));
                            Ok(())
                        }
                        Err(failure) => {
                            outcomes.push((item.id.clone(), Err(failure.clone())));
                            Err(failure)
                        }
                    }
                }
                .boxed()
            }
        };

        let frontier_items: Vec<Item> = frontier.iter().map(|id| index[id].clone()).collect();
        let batch = self.batch.process(&frontier_items, &handler).await?;

        let outcomes = {
            let mut guard = outcomes.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        Ok(FrontierReport { batch, outcomes })
    }

    /// Last line of defense: the scheduler already spent the per-category
    /// retry budget, so recovery retries hit the tracker directly. The
    /// retried operation is the same one the frontier attempted: an update
    /// when the store already knows the remote issue, a create otherwise.
    async fn recover_item(
        &mut self,
        item: &Item,
        failure: ClassifiedError,
    ) -> (RecoveryResult, Option<IssueRecord>) {
        let tracker = Arc::clone(&self.tracker);
        let plan = match self
            .store
            .issue_state(&item.id)
            .and_then(|s| s.remote_id.clone())
        {
            Some(remote_id) => Plan::Update(remote_id),
            None => Plan::Create,
        };
        let id_map: HashMap<String, String> = item
            .dependencies
            .iter()
            .filter_map(|dep| {
                self.store
                    .issue_state(dep)
                    .and_then(|s| s.remote_id.clone())
                    .map(|remote| (dep.clone(), remote))
            })
            .collect();
        let body = linked_body(item, &id_map);

        let replay_unsafe = matches!(plan, Plan::Create)
            && matches!(&failure.error, TrackerError::Timeout(_))
            && !self
                .store
                .is_replay_safe(OperationKind::Create, &OpTarget::Issue(item.id.clone()));
        if replay_unsafe {
            // The timed-out create may have landed; re-creating would
            // duplicate the issue
            warn!(item = %item.id, "timed-out create is not replay safe, requiring manual review");
        }

        let title = item.title.clone();
        let labels = item.labels.clone();
        let operation = move || {
            let tracker = Arc::clone(&tracker);
            let plan = plan.clone();
            let title = title.clone();
            let body = body.clone();
            let labels = labels.clone();
            async move {
                if replay_unsafe {
                    return Err(TrackerError::Invalid(
                        "replay of timed-out create refused".to_string(),
                    ));
                }
                match plan {
                    Plan::Create => {
                        let req = CreateIssue {
                            title,
                            body,
                            labels,
                        };
                        tracker.create_issue(&req).await
                    }
                    Plan::Update(remote_id) => {
                        let req = UpdateIssue {
                            title: Some(title),
                            body: Some(body),
                            labels: Some(labels),
                            state: None,
                        };
                        tracker.update_issue(&remote_id, &req).await
                    }
                }
            }
        };
        self.recovery
            .recover(failure, operation, None, &mut self.store)
            .await
    }
}

struct FrontierReport {
    batch: BatchReport,
    outcomes: Vec<(String, Result<IssueRecord, ClassifiedError>)>,
}

/// Flatten items depth-first; each sub-item implicitly depends on its
/// parent so the parent issue exists before its children link to it.
fn flatten_items(items: &[Item]) -> Vec<Item> {
    fn collect(item: &Item, parent: Option<&str>, out: &mut Vec<Item>) {
        let mut flat = item.clone();
        flat.sub_items = Vec::new();
        if let Some(parent) = parent {
            if !flat.dependencies.iter().any(|d| d == parent) {
                flat.dependencies.push(parent.to_string());
            }
        }
        out.push(flat);
        for sub in &item.sub_items {
            collect(sub, Some(&item.id), out);
        }
    }

    let mut out = Vec::new();
    for item in items {
        collect(item, None, &mut out);
    }
    out
}

/// Issue body with dependency links appended, using remote ids where the
/// dependency already exists on the tracker.
fn linked_body(item: &Item, id_map: &HashMap<String, String>) -> String {
    if item.dependencies.is_empty() {
        return item.body.clone();
    }
    let links: Vec<String> = item
        .dependencies
        .iter()
        .map(|dep| match id_map.get(dep) {
            Some(remote) => format!("#{remote}"),
            None => dep.clone(),
        })
        .collect();
    format!("{}\n\nDepends on: {}", item.body, links.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_adds_parent_dependency() {
        let mut epic = Item::new("epic", "Epic");
        let mut task = Item::new("task", "Task");
        task.sub_items.push(Item::new("subtask", "Subtask"));
        epic.sub_items.push(task);

        let flat = flatten_items(&[epic]);
        let ids: Vec<_> = flat.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["epic", "task", "subtask"]);
        assert!(flat[1].dependencies.contains(&"epic".to_string()));
        assert!(flat[2].dependencies.contains(&"task".to_string()));
        assert!(flat.iter().all(|i| i.sub_items.is_empty()));
    }

    #[test]
    fn test_linked_body_prefers_remote_ids() {
        let item = Item::new("c", "C")
            .with_dependencies(vec!["a".to_string(), "b".to_string()]);
        let id_map = [("a".to_string(), "101".to_string())].into_iter().collect();
        let body = linked_body(&item, &id_map);
        assert!(body.ends_with("Depends on: #101, b"));
    }
}
