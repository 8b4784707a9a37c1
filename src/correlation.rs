//! Correlation identifiers threaded explicitly through every submission.
//!
//! There is deliberately no global tracker: a workflow creates one root
//! context and derives children from it, so parent/child relationships
//! survive across retries and replay records without hidden state.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque correlation id, unique per operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Correlation context carried on a per-workflow handle and passed down
/// through scheduler submissions, classifications, and replay records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub id: CorrelationId,
    pub parent: Option<CorrelationId>,
    pub workflow: String,
}

impl CorrelationContext {
    /// Root context for a workflow run
    pub fn root(workflow: impl Into<String>) -> Self {
        Self {
            id: CorrelationId::new(),
            parent: None,
            workflow: workflow.into(),
        }
    }

    /// Derive a child context for a sub-operation
    pub fn child(&self) -> Self {
        Self {
            id: CorrelationId::new(),
            parent: Some(self.id),
            workflow: self.workflow.clone(),
        }
    }
}
