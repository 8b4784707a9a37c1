//! Signed workflow checkpoints.
//!
//! After each batch group the processor emits a checkpoint describing
//! which items completed and failed so far. Checkpoints are Ed25519-signed
//! over their canonical JSON payload and verified against a known public
//! key on load; a tampered or wrongly-signed blob is rejected. Transport
//! of the blobs is out of scope; a memory store and a directory store
//! cover tests and local use.

use crate::{TrackerError, TrackerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Workflow progress snapshot emitted after each processed group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub workflow: String,

    /// Monotonic per-workflow checkpoint number
    pub sequence: u64,

    /// Item ids confirmed complete so far
    pub completed: Vec<String>,

    /// Item ids terminally failed so far
    pub failed: Vec<String>,

    /// Opaque resumption state owned by the caller
    pub state: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

/// A checkpoint plus the detached signature over its JSON payload.
/// Workflow and sequence are duplicated outside the payload so stores can
/// index without verifying first; verification trusts only the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedCheckpoint {
    pub workflow: String,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Ed25519 signer for checkpoint payloads
pub struct CheckpointSigner {
    keypair: Ed25519KeyPair,
}

impl CheckpointSigner {
    /// Generate a fresh keypair. Returns the signer and the PKCS#8
    /// document to persist if the key must survive the process.
    pub fn generate() -> TrackerResult<(Self, Vec<u8>)> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| TrackerError::Store("checkpoint key generation failed".to_string()))?;
        let signer = Self::from_pkcs8(pkcs8.as_ref())?;
        Ok((signer, pkcs8.as_ref().to_vec()))
    }

    pub fn from_pkcs8(pkcs8: &[u8]) -> TrackerResult<Self> {
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|_| TrackerError::Store("invalid checkpoint signing key".to_string()))?;
        Ok(Self { keypair })
    }

    /// Public key bytes to hand to verifiers
    pub fn public_key(&self) -> Vec<u8> {
        self.keypair.public_key().as_ref().to_vec()
    }

    pub fn sign(&self, checkpoint: &WorkflowCheckpoint) -> TrackerResult<SignedCheckpoint> {
        let payload = serde_json::to_vec(checkpoint)?;
        let signature = self.keypair.sign(&payload).as_ref().to_vec();
        debug!(
            workflow = %checkpoint.workflow,
            sequence = checkpoint.sequence,
            completed = checkpoint.completed.len(),
            failed = checkpoint.failed.len(),
            "checkpoint signed"
        );
        Ok(SignedCheckpoint {
            workflow: checkpoint.workflow.clone(),
            sequence: checkpoint.sequence,
            payload,
            signature,
        })
    }
}

/// Verify a signed checkpoint against a known public key and return the
/// decoded payload. Any signature or payload mismatch is rejected.
pub fn verify(public_key: &[u8], signed: &SignedCheckpoint) -> TrackerResult<WorkflowCheckpoint> {
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(&signed.payload, &signed.signature)
        .map_err(|_| {
            warn!(
                workflow = %signed.workflow,
                sequence = signed.sequence,
                "checkpoint signature rejected"
            );
            TrackerError::Invalid("checkpoint signature verification failed".to_string())
        })?;
    let checkpoint: WorkflowCheckpoint = serde_json::from_slice(&signed.payload)?;
    Ok(checkpoint)
}

/// Where signed checkpoints land. Blob transport lives behind this trait.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, signed: &SignedCheckpoint) -> TrackerResult<()>;

    /// Highest-sequence checkpoint recorded for a workflow, if any
    async fn load_latest(&self, workflow: &str) -> TrackerResult<Option<SignedCheckpoint>>;
}

/// In-memory store for tests and single-process runs
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<HashMap<String, Vec<SignedCheckpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, signed: &SignedCheckpoint) -> TrackerResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(signed.workflow.clone())
            .or_default()
            .push(signed.clone());
        Ok(())
    }

    async fn load_latest(&self, workflow: &str) -> TrackerResult<Option<SignedCheckpoint>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .get(workflow)
            .and_then(|list| list.iter().max_by_key(|c| c.sequence))
            .cloned())
    }
}

/// One JSON file per checkpoint under a directory
pub struct DirCheckpointStore {
    dir: PathBuf,
}

impl DirCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> TrackerResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| TrackerError::Store(format!("checkpoint dir: {e}")))?;
        Ok(Self { dir })
    }

    fn path_for(&self, workflow: &str, sequence: u64) -> PathBuf {
        self.dir.join(format!("{workflow}-{sequence:08}.json"))
    }
}

#[async_trait]
impl CheckpointStore for DirCheckpointStore {
    async fn save(&self, signed: &SignedCheckpoint) -> TrackerResult<()> {
        let path = self.path_for(&signed.workflow, signed.sequence);
        let json = serde_json::to_vec_pretty(signed)?;
        std::fs::write(&path, json)
            .map_err(|e| TrackerError::Store(format!("checkpoint write: {e}")))?;
        debug!(path = %path.display(), "checkpoint persisted");
        Ok(())
    }

    async fn load_latest(&self, workflow: &str) -> TrackerResult<Option<SignedCheckpoint>> {
        let prefix = format!("{workflow}-");
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| TrackerError::Store(format!("checkpoint dir read: {e}")))?;

        let mut latest: Option<SignedCheckpoint> = None;
        for entry in entries {
            let entry = entry.map_err(|e| TrackerError::Store(format!("checkpoint dir read: {e}")))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let bytes = std::fs::read(entry.path())
                .map_err(|e| TrackerError::Store(format!("checkpoint read: {e}")))?;
            let signed: SignedCheckpoint = serde_json::from_slice(&bytes)?;
            if latest
                .as_ref()
                .map_or(true, |best| signed.sequence > best.sequence)
            {
                latest = Some(signed);
            }
        }
        Ok(latest)
    }
}
