//! Idempotency store: transactional local state for workflow operations.
//!
//! Tracks per-document and per-issue state, groups mutations into
//! transactions with reverse-replay rollback, and answers the replay
//! safety question after a timeout left a remote call in an unknown final
//! state. State mutates in memory immediately (read-your-writes inside a
//! transaction) and is persisted durably as one JSON record per workflow
//! on commit.

use crate::{TrackerError, TrackerResult};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RECORD_VERSION: u32 = 1;

/// Processing status of a tracked item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Local state for one tracked target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
    pub status: ItemStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub dependents: Vec<String>,
    /// Identifier the tracker assigned to this target, once known
    #[serde(default)]
    pub remote_id: Option<String>,
    /// Content hash last confirmed on the remote side
    #[serde(default)]
    pub remote_content_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ItemState {
    pub fn pending() -> Self {
        Self {
            status: ItemStatus::Pending,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            remote_id: None,
            remote_content_hash: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = status;
        self.updated_at = Utc::now();
        self
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self.updated_at = Utc::now();
        self
    }
}

/// What an operation acted on: a source document (by content hash) or a
/// tracker issue (by item id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "key")]
pub enum OpTarget {
    Prd(String),
    Issue(String),
}

impl OpTarget {
    pub fn key(&self) -> &str {
        match self {
            OpTarget::Prd(hash) => hash,
            OpTarget::Issue(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// One recorded mutation inside a transaction. `previous_state` is what
/// rollback restores; `None` means the target did not exist before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub kind: OperationKind,
    pub target: OpTarget,
    pub previous_state: Option<ItemState>,
    pub new_state: Option<ItemState>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

/// A group of operations that commits or rolls back as a unit. Immutable
/// once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub operations: Vec<Operation>,
    pub status: TransactionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Durable record layout, one per workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreRecord {
    prds: HashMap<String, ItemState>,
    issues: HashMap<String, ItemState>,
    transactions: Vec<Transaction>,
    version: u32,
    last_updated: DateTime<Utc>,
}

/// Hash identifying a document by logical path and content. Including the
/// path means a moved-but-unchanged document hashes as new, which errs on
/// the side of re-checking rather than silently reusing state.
pub fn content_hash(path: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
            out
        })
}

pub struct IdempotencyStore {
    workflow: String,
    prds: HashMap<String, ItemState>,
    issues: HashMap<String, ItemState>,
    history: Vec<Transaction>,
    active: Option<Transaction>,
    conn: Connection,
}

impl IdempotencyStore {
    /// Open (or create) the durable store at `path` and hydrate any
    /// existing record for `workflow`.
    pub fn open(path: impl AsRef<Path>, workflow: impl Into<String>) -> TrackerResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| TrackerError::Store(format!("open store: {e}")))?;
        Self::with_connection(conn, workflow)
    }

    /// Fully in-memory store, mainly for tests
    pub fn in_memory(workflow: impl Into<String>) -> TrackerResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TrackerError::Store(format!("open store: {e}")))?;
        Self::with_connection(conn, workflow)
    }

    fn with_connection(conn: Connection, workflow: impl Into<String>) -> TrackerResult<Self> {
        let workflow = workflow.into();
        let mut store = Self {
            workflow,
            prds: HashMap::new(),
            issues: HashMap::new(),
            history: Vec::new(),
            active: None,
            conn,
        };
        store
            .init_schema()
            .and_then(|_| store.hydrate())
            .map_err(|e| TrackerError::Store(format!("{e:#}")))?;
        Ok(store)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("enable WAL")?;
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS workflow_state (
                    workflow TEXT PRIMARY KEY,
                    record TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )
            .context("create workflow_state table")?;
        Ok(())
    }

    fn hydrate(&mut self) -> anyhow::Result<()> {
        let row: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM workflow_state WHERE workflow = ?1",
                [&self.workflow],
                |row| row.get(0),
            )
            .optional()
            .context("load workflow record")?;

        if let Some(json) = row {
            let record: StoreRecord =
                serde_json::from_str(&json).context("decode workflow record")?;
            debug!(
                workflow = %self.workflow,
                prds = record.prds.len(),
                issues = record.issues.len(),
                transactions = record.transactions.len(),
                "hydrated workflow record"
            );
            self.prds = record.prds;
            self.issues = record.issues;
            self.history = record.transactions;
        }
        Ok(())
    }

    fn persist(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        let record = StoreRecord {
            prds: self.prds.clone(),
            issues: self.issues.clone(),
            transactions: self.history.clone(),
            version: RECORD_VERSION,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string(&record).context("encode workflow record")?;
        self.conn
            .execute(
                "INSERT INTO workflow_state (workflow, record, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(workflow) DO UPDATE SET
                     record = excluded.record,
                     updated_at = excluded.updated_at",
                rusqlite::params![self.workflow, json, Utc::now().to_rfc3339()],
            )
            .context("upsert workflow record")?;

        let elapsed = started.elapsed();
        if elapsed.as_millis() > 100 {
            warn!(
                workflow = %self.workflow,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow workflow record save"
            );
        }
        Ok(())
    }

    /// Start a transaction. At most one may be active per workflow.
    pub fn begin_transaction(&mut self) -> TrackerResult<Uuid> {
        if self.active.is_some() {
            return Err(TrackerError::Transaction(
                "a transaction is already active".to_string(),
            ));
        }
        let txn = Transaction {
            id: Uuid::new_v4(),
            operations: Vec::new(),
            status: TransactionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
        };
        let id = txn.id;
        debug!(workflow = %self.workflow, txn = %id, "transaction started");
        self.active = Some(txn);
        Ok(id)
    }

    /// Record a mutation inside the active transaction and apply it to
    /// in-memory state immediately. `new_state` is `None` for deletes.
    pub fn record_operation(
        &mut self,
        kind: OperationKind,
        target: OpTarget,
        new_state: Option<ItemState>,
    ) -> TrackerResult<()> {
        if self.active.is_none() {
            return Err(TrackerError::Transaction(
                "no active transaction".to_string(),
            ));
        }

        let previous_state = self.lookup(&target).cloned();
        let key = target.key().to_string();
        let slot = match &target {
            OpTarget::Prd(_) => &mut self.prds,
            OpTarget::Issue(_) => &mut self.issues,
        };
        match &new_state {
            Some(state) => {
                slot.insert(key, state.clone());
            }
            None => {
                slot.remove(&key);
            }
        }

        let op = Operation {
            kind,
            target,
            previous_state,
            new_state,
            timestamp: Utc::now(),
        };
        if let Some(txn) = self.active.as_mut() {
            txn.operations.push(op);
        }
        Ok(())
    }

    /// Commit the active transaction and persist the workflow record. A
    /// failed persist leaves the transaction active and is surfaced to
    /// the caller; it is never retried automatically.
    pub fn commit_transaction(&mut self) -> TrackerResult<()> {
        let mut txn = self
            .active
            .take()
            .ok_or_else(|| TrackerError::Transaction("no active transaction".to_string()))?;
        txn.status = TransactionStatus::Committed;
        txn.ended_at = Some(Utc::now());
        let ops = txn.operations.len();
        let id = txn.id;
        self.history.push(txn);

        if let Err(e) = self.persist() {
            // Undo the terminal marking so the caller can decide
            let mut txn = match self.history.pop() {
                Some(txn) => txn,
                None => return Err(TrackerError::Store(format!("{e:#}"))),
            };
            txn.status = TransactionStatus::Active;
            txn.ended_at = None;
            self.active = Some(txn);
            return Err(TrackerError::Store(format!("commit persist failed: {e:#}")));
        }

        info!(workflow = %self.workflow, txn = %id, operations = ops, "transaction committed");
        Ok(())
    }

    /// Roll back the active transaction: replay its operations in reverse,
    /// restoring each target's previous state or deleting fresh targets.
    pub fn rollback_transaction(&mut self) -> TrackerResult<()> {
        let mut txn = self
            .active
            .take()
            .ok_or_else(|| TrackerError::Transaction("no active transaction".to_string()))?;

        for op in txn.operations.iter().rev() {
            let key = op.target.key().to_string();
            let slot = match &op.target {
                OpTarget::Prd(_) => &mut self.prds,
                OpTarget::Issue(_) => &mut self.issues,
            };
            match &op.previous_state {
                Some(prev) => {
                    slot.insert(key, prev.clone());
                }
                None => {
                    slot.remove(&key);
                }
            }
        }

        txn.status = TransactionStatus::RolledBack;
        txn.ended_at = Some(Utc::now());
        let id = txn.id;
        let ops = txn.operations.len();
        self.history.push(txn);

        self.persist()
            .map_err(|e| TrackerError::Store(format!("rollback persist failed: {e:#}")))?;

        info!(workflow = %self.workflow, txn = %id, operations = ops, "transaction rolled back");
        Ok(())
    }

    /// Whether re-running an operation after an unknown outcome is safe.
    /// Creates are unsafe once the target is known complete; updates are
    /// last-write-wins and always safe.
    pub fn is_replay_safe(&self, kind: OperationKind, target: &OpTarget) -> bool {
        match kind {
            OperationKind::Create => self
                .lookup(target)
                .map_or(true, |state| state.status != ItemStatus::Completed),
            OperationKind::Update | OperationKind::Delete => true,
        }
    }

    pub fn prd_state(&self, hash: &str) -> Option<&ItemState> {
        self.prds.get(hash)
    }

    pub fn issue_state(&self, id: &str) -> Option<&ItemState> {
        self.issues.get(id)
    }

    pub fn has_active_transaction(&self) -> bool {
        self.active.is_some()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.history
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    fn lookup(&self, target: &OpTarget) -> Option<&ItemState> {
        match target {
            OpTarget::Prd(hash) => self.prds.get(hash),
            OpTarget::Issue(id) => self.issues.get(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store() -> IdempotencyStore {
        IdempotencyStore::in_memory("wf-test").unwrap()
    }

    fn completed() -> ItemState {
        ItemState::pending().with_status(ItemStatus::Completed)
    }

    #[test]
    fn test_one_active_transaction_per_workflow() {
        let mut store = store();
        store.begin_transaction().unwrap();
        assert!(matches!(
            store.begin_transaction(),
            Err(TrackerError::Transaction(_))
        ));
    }

    #[test]
    fn test_record_requires_active_transaction() {
        let mut store = store();
        let result = store.record_operation(
            OperationKind::Create,
            OpTarget::Issue("task-1".to_string()),
            Some(ItemState::pending()),
        );
        assert!(matches!(result, Err(TrackerError::Transaction(_))));
    }

    #[test]
    fn test_reads_see_writes_inside_transaction() {
        let mut store = store();
        store.begin_transaction().unwrap();
        store
            .record_operation(
                OperationKind::Create,
                OpTarget::Issue("task-1".to_string()),
                Some(ItemState::pending()),
            )
            .unwrap();
        assert_eq!(
            store.issue_state("task-1").unwrap().status,
            ItemStatus::Pending
        );
    }

    #[test]
    fn test_rollback_restores_prior_state_exactly() {
        let mut store = store();

        store.begin_transaction().unwrap();
        store
            .record_operation(
                OperationKind::Create,
                OpTarget::Issue("task-1".to_string()),
                Some(completed()),
            )
            .unwrap();
        store.commit_transaction().unwrap();
        let baseline = store.issue_state("task-1").cloned().unwrap();

        store.begin_transaction().unwrap();
        store
            .record_operation(
                OperationKind::Update,
                OpTarget::Issue("task-1".to_string()),
                Some(ItemState::pending().with_status(ItemStatus::Failed)),
            )
            .unwrap();
        store
            .record_operation(
                OperationKind::Create,
                OpTarget::Issue("task-2".to_string()),
                Some(ItemState::pending()),
            )
            .unwrap();
        store.rollback_transaction().unwrap();

        assert_eq!(store.issue_state("task-1"), Some(&baseline));
        assert!(store.issue_state("task-2").is_none());
    }

    #[test]
    fn test_terminal_transactions_recorded_in_history() {
        let mut store = store();
        store.begin_transaction().unwrap();
        store.commit_transaction().unwrap();
        store.begin_transaction().unwrap();
        store.rollback_transaction().unwrap();

        let statuses: Vec<_> = store.transactions().iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![TransactionStatus::Committed, TransactionStatus::RolledBack]
        );
        assert!(store.transactions().iter().all(|t| t.ended_at.is_some()));
    }

    #[test]
    fn test_replay_safety_rules() {
        let mut store = store();
        store.begin_transaction().unwrap();
        store
            .record_operation(
                OperationKind::Create,
                OpTarget::Issue("done".to_string()),
                Some(completed()),
            )
            .unwrap();
        store
            .record_operation(
                OperationKind::Create,
                OpTarget::Issue("open".to_string()),
                Some(ItemState::pending().with_status(ItemStatus::Processing)),
            )
            .unwrap();
        store.commit_transaction().unwrap();

        let done = OpTarget::Issue("done".to_string());
        let open = OpTarget::Issue("open".to_string());
        let missing = OpTarget::Issue("missing".to_string());

        assert!(!store.is_replay_safe(OperationKind::Create, &done));
        assert!(store.is_replay_safe(OperationKind::Create, &open));
        assert!(store.is_replay_safe(OperationKind::Create, &missing));
        assert!(store.is_replay_safe(OperationKind::Update, &done));
    }

    #[test]
    fn test_content_hash_sensitive_to_path_and_content() {
        let a = content_hash("docs/feature.md", "body");
        let b = content_hash("docs/feature.md", "body changed");
        let c = content_hash("docs/moved/feature.md", "body");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, content_hash("docs/feature.md", "body"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_record_survives_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let mut store = IdempotencyStore::open(&path, "wf-disk").unwrap();
            store.begin_transaction().unwrap();
            store
                .record_operation(
                    OperationKind::Create,
                    OpTarget::Prd(content_hash("doc.md", "content")),
                    Some(completed()),
                )
                .unwrap();
            store
                .record_operation(
                    OperationKind::Create,
                    OpTarget::Issue("task-1".to_string()),
                    Some(ItemState::pending()),
                )
                .unwrap();
            store.commit_transaction().unwrap();
        }

        let store = IdempotencyStore::open(&path, "wf-disk").unwrap();
        let hash = content_hash("doc.md", "content");
        assert_eq!(store.prd_state(&hash).unwrap().status, ItemStatus::Completed);
        assert_eq!(store.issue_state("task-1").unwrap().status, ItemStatus::Pending);
        assert_eq!(store.transactions().len(), 1);
    }

    #[test]
    fn test_store_record_json_round_trip_rehydrates_dates() {
        let record = StoreRecord {
            prds: HashMap::new(),
            issues: [("task-1".to_string(), completed())].into_iter().collect(),
            transactions: vec![],
            version: RECORD_VERSION,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        // Persisted layout is camelCase
        assert!(json.contains("\"lastUpdated\""));
        assert!(json.contains("\"remoteContentHash\""));
        let back: StoreRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    proptest! {
        /// Any sequence of operations inside one transaction rolls back
        /// to exactly the pre-transaction state.
        #[test]
        fn prop_rollback_restores_baseline(
            ops in prop::collection::vec((0usize..6, prop_oneof![
                Just(OperationKind::Create),
                Just(OperationKind::Update),
                Just(OperationKind::Delete),
            ]), 1..20)
        ) {
            let mut store = store();

            // Seed a committed baseline over half the key space
            store.begin_transaction().unwrap();
            for i in 0..3usize {
                store.record_operation(
                    OperationKind::Create,
                    OpTarget::Issue(format!("task-{i}")),
                    Some(completed()),
                ).unwrap();
            }
            store.commit_transaction().unwrap();
            let baseline: Vec<_> = (0..6usize)
                .map(|i| store.issue_state(&format!("task-{i}")).cloned())
                .collect();

            store.begin_transaction().unwrap();
            for (idx, kind) in ops {
                let target = OpTarget::Issue(format!("task-{idx}"));
                let new_state = match kind {
                    OperationKind::Delete => None,
                    _ => Some(ItemState::pending().with_status(ItemStatus::Processing)),
                };
                store.record_operation(kind, target, new_state).unwrap();
            }
            store.rollback_transaction().unwrap();

            for (i, expected) in baseline.iter().enumerate() {
                prop_assert_eq!(store.issue_state(&format!("task-{i}")), expected.as_ref());
            }
        }
    }
}
