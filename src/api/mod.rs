//! Abstract boundary to the remote issue tracker.
//!
//! The core never talks HTTP itself; it consumes any REST-like tracker
//! through this capability trait. Implementations are expected to surface
//! status codes, rate-limit headers, and retry-after hints as the
//! corresponding `TrackerError` variants and `RateLimitInfo` values.

use crate::TrackerResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rate-limit metadata parsed from response headers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    /// Requests remaining in the current window
    pub remaining: u32,

    /// Total requests allowed per window
    pub limit: u32,

    /// When the window resets
    pub reset_at: DateTime<Utc>,
}

impl RateLimitInfo {
    /// True once the window is exhausted and calls must pause until reset
    pub fn exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Lifecycle state of a remote issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
}

/// An issue as the remote tracker reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    /// Remote identifier assigned by the tracker
    pub id: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: IssueState,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateIssue {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateIssue {
    pub title: Option<String>,
    pub body: Option<String>,
    pub labels: Option<Vec<String>>,
    pub state: Option<IssueState>,
}

/// Filter for listing issues
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueFilter {
    pub labels: Vec<String>,
    pub state: Option<IssueState>,
}

/// Capability set the core requires of a tracker. Any REST-like issue
/// tracker satisfies it; the transport lives entirely behind the trait.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(&self, req: &CreateIssue) -> TrackerResult<IssueRecord>;

    async fn update_issue(&self, id: &str, req: &UpdateIssue) -> TrackerResult<IssueRecord>;

    async fn get_issue(&self, id: &str) -> TrackerResult<IssueRecord>;

    async fn list_issues(&self, filter: &IssueFilter) -> TrackerResult<Vec<IssueRecord>>;

    /// Current rate-limit window as the tracker reports it
    async fn rate_limit_status(&self) -> TrackerResult<RateLimitInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_exhaustion() {
        let mut info = RateLimitInfo {
            remaining: 3,
            limit: 60,
            reset_at: Utc::now(),
        };
        assert!(!info.exhausted());

        info.remaining = 0;
        assert!(info.exhausted());
    }

    #[test]
    fn test_update_issue_defaults_to_no_changes() {
        let update = UpdateIssue::default();
        assert!(update.title.is_none());
        assert!(update.body.is_none());
        assert!(update.labels.is_none());
        assert!(update.state.is_none());
    }

    #[test]
    fn test_issue_record_round_trip() {
        let record = IssueRecord {
            id: "1042".to_string(),
            title: "Add retry budget".to_string(),
            body: String::new(),
            labels: vec!["auto".to_string()],
            state: IssueState::Open,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: IssueRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
