//! Shared test doubles for workflow integration tests.

use async_trait::async_trait;
use chrono::Utc;
use issueforge_core::api::{
    CreateIssue, IssueFilter, IssueRecord, IssueState, IssueTracker, RateLimitInfo, UpdateIssue,
};
use issueforge_core::{TrackerError, TrackerResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Route workflow tracing through the test harness; safe to call from
/// every test.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct MockState {
    issues: HashMap<String, IssueRecord>,
    next_id: u64,
    /// Scripted failures, keyed by issue title, consumed in order
    failures: HashMap<String, VecDeque<TrackerError>>,
    creates: HashMap<String, u32>,
    create_attempts: HashMap<String, u32>,
    updates: HashMap<String, u32>,
    rate_limit: Option<RateLimitInfo>,
}

/// In-memory issue tracker with scripted failures per title
#[derive(Default)]
pub struct MockTracker {
    state: Mutex<MockState>,
}

impl MockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `count` copies of `error` to be returned for the next
    /// create/update calls touching `title`.
    pub fn fail_next(&self, title: &str, error: TrackerError, count: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.failures.entry(title.to_string()).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    pub fn set_rate_limit(&self, info: RateLimitInfo) {
        self.state.lock().unwrap().rate_limit = Some(info);
    }

    /// Issues actually created with this title (the exactly-once check)
    pub fn created_count(&self, title: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .creates
            .get(title)
            .copied()
            .unwrap_or(0)
    }

    /// Create calls attempted for this title, including failed ones
    pub fn create_attempts(&self, title: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .create_attempts
            .get(title)
            .copied()
            .unwrap_or(0)
    }

    pub fn update_count(&self, title: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .updates
            .get(title)
            .copied()
            .unwrap_or(0)
    }

    pub fn issue_by_title(&self, title: &str) -> Option<IssueRecord> {
        self.state
            .lock()
            .unwrap()
            .issues
            .values()
            .find(|issue| issue.title == title)
            .cloned()
    }

    pub fn total_issues(&self) -> usize {
        self.state.lock().unwrap().issues.len()
    }
}

#[async_trait]
impl IssueTracker for MockTracker {
    async fn create_issue(&self, req: &CreateIssue) -> TrackerResult<IssueRecord> {
        let mut state = self.state.lock().unwrap();
        *state
            .create_attempts
            .entry(req.title.clone())
            .or_insert(0) += 1;
        if let Some(error) = state
            .failures
            .get_mut(&req.title)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        state.next_id += 1;
        let record = IssueRecord {
            id: state.next_id.to_string(),
            title: req.title.clone(),
            body: req.body.clone(),
            labels: req.labels.clone(),
            state: IssueState::Open,
            updated_at: Utc::now(),
        };
        state.issues.insert(record.id.clone(), record.clone());
        *state.creates.entry(req.title.clone()).or_insert(0) += 1;
        Ok(record)
    }

    async fn update_issue(&self, id: &str, req: &UpdateIssue) -> TrackerResult<IssueRecord> {
        let mut state = self.state.lock().unwrap();

        let title = state
            .issues
            .get(id)
            .map(|issue| issue.title.clone())
            .ok_or_else(|| TrackerError::Http {
                status: 404,
                message: format!("issue {id} not found"),
            })?;
        if let Some(error) = state
            .failures
            .get_mut(&title)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        let issue = match state.issues.get_mut(id) {
            Some(issue) => issue,
            None => unreachable!("checked above"),
        };
        if let Some(new_title) = &req.title {
            issue.title = new_title.clone();
        }
        if let Some(body) = &req.body {
            issue.body = body.clone();
        }
        if let Some(labels) = &req.labels {
            issue.labels = labels.clone();
        }
        if let Some(new_state) = req.state {
            issue.state = new_state;
        }
        issue.updated_at = Utc::now();
        let record = issue.clone();
        *state.updates.entry(record.title.clone()).or_insert(0) += 1;
        Ok(record)
    }

    async fn get_issue(&self, id: &str) -> TrackerResult<IssueRecord> {
        self.state
            .lock()
            .unwrap()
            .issues
            .get(id)
            .cloned()
            .ok_or_else(|| TrackerError::Http {
                status: 404,
                message: format!("issue {id} not found"),
            })
    }

    async fn list_issues(&self, filter: &IssueFilter) -> TrackerResult<Vec<IssueRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .issues
            .values()
            .filter(|issue| {
                filter
                    .state
                    .map_or(true, |wanted| issue.state == wanted)
                    && filter
                        .labels
                        .iter()
                        .all(|label| issue.labels.contains(label))
            })
            .cloned()
            .collect())
    }

    async fn rate_limit_status(&self) -> TrackerResult<RateLimitInfo> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .rate_limit
            .unwrap_or(RateLimitInfo {
                remaining: 5000,
                limit: 5000,
                reset_at: Utc::now() + chrono::Duration::hours(1),
            }))
    }
}
