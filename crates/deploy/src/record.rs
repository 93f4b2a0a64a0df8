//! The deployment record: what has been deployed, transferred and verified so far.
//!
//! The record is written after every successful step, so a crash mid-run leaves a partial
//! record that a later run resumes from. It is stored as pretty-printed JSON to stay readable
//! when debugging a deployment by hand.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{ArgValue, OwnershipEdge};

/// Errors raised while reading, writing or locking a record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed deployment record {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("another run holds the lock {}", .path.display())]
    Locked { path: PathBuf },
}

/// Verification state of a deployed contract.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VerificationStatus {
    #[default]
    Pending,
    Verified,
    Failed,
}

/// A deployed contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub address: Address,
    pub tx_hash: B256,
    /// Resolved constructor arguments, in declaration order.
    pub constructor_args: Vec<ArgValue>,
    #[serde(default)]
    pub verification: VerificationStatus,
    /// Last verification failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_error: Option<String>,
    pub deployed_at: DateTime<Utc>,
}

impl RecordEntry {
    pub fn new(address: Address, tx_hash: B256, constructor_args: Vec<ArgValue>) -> Self {
        Self {
            address,
            tx_hash,
            constructor_args,
            verification: VerificationStatus::Pending,
            verification_error: None,
            deployed_at: Utc::now(),
        }
    }
}

/// A confirmed ownership transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedTransfer {
    pub contract: String,
    pub new_owner: String,
    /// Transaction that applied the transfer. `None` when an earlier, unrecorded run applied it
    /// and it was only found on chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
}

impl AppliedTransfer {
    pub fn matches(&self, edge: &OwnershipEdge) -> bool {
        self.contract == edge.contract && self.new_owner == edge.new_owner
    }
}

/// Everything a run has achieved, keyed by contract name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Fingerprint of the graph that produced this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_hash: Option<String>,
    #[serde(default)]
    pub contracts: BTreeMap<String, RecordEntry>,
    #[serde(default)]
    pub ownership: Vec<AppliedTransfer>,
}

impl DeploymentRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, name: &str) -> Option<&RecordEntry> {
        self.contracts.get(name)
    }

    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.contracts.get(name).map(|entry| entry.address)
    }

    pub fn is_deployed(&self, name: &str) -> bool {
        self.contracts.contains_key(name)
    }

    pub fn record_deployment(&mut self, name: impl Into<String>, entry: RecordEntry) {
        self.contracts.insert(name.into(), entry);
    }

    pub fn transfer(&self, edge: &OwnershipEdge) -> Option<&AppliedTransfer> {
        self.ownership.iter().find(|applied| applied.matches(edge))
    }

    pub fn record_transfer(&mut self, edge: &OwnershipEdge, tx_hash: Option<B256>) {
        self.ownership.push(AppliedTransfer {
            contract: edge.contract.clone(),
            new_owner: edge.new_owner.clone(),
            tx_hash,
        });
    }

    /// Update the verification state of a contract. Returns false if it is not recorded.
    pub fn set_verification(
        &mut self,
        name: &str,
        status: VerificationStatus,
        error: Option<String>,
    ) -> bool {
        match self.contracts.get_mut(name) {
            Some(entry) => {
                entry.verification = status;
                entry.verification_error = error;
                true
            }
            None => false,
        }
    }
}

/// Durable storage for a [`DeploymentRecord`].
pub trait RecordStore {
    /// Load the stored record, or `None` if nothing was stored yet.
    fn load(&self) -> Result<Option<DeploymentRecord>, RecordError>;

    /// Persist the record. Must be durable when it returns.
    fn save(&self, record: &DeploymentRecord) -> Result<(), RecordError>;
}

/// A record stored as a single JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, path: &Path) -> impl FnOnce(std::io::Error) -> RecordError {
        let path = path.to_path_buf();
        move |source| RecordError::Io { path, source }
    }
}

impl RecordStore for JsonFileStore {
    fn load(&self) -> Result<Option<DeploymentRecord>, RecordError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path).map_err(self.io_error(&self.path))?;
        let record = serde_json::from_str(&content).map_err(|source| RecordError::Json {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(path = %self.path.display(), "Deployment record loaded");
        Ok(Some(record))
    }

    fn save(&self, record: &DeploymentRecord) -> Result<(), RecordError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(self.io_error(parent))?;
        }

        let json = serde_json::to_string_pretty(record).map_err(|source| RecordError::Json {
            path: self.path.clone(),
            source,
        })?;

        crate::fs::write_atomic(&self.path, json.as_bytes()).map_err(self.io_error(&self.path))?;

        tracing::trace!(path = %self.path.display(), "Deployment record saved");
        Ok(())
    }
}

/// Exclusive advisory lock guarding a record against concurrent runs.
///
/// Released when dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock that sits next to `record_path`, failing immediately if it is held.
    pub fn acquire(record_path: &Path) -> Result<Self, RecordError> {
        let path = record_path.with_extension("lock");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| RecordError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| RecordError::Io {
                path: path.clone(),
                source,
            })?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                return Err(RecordError::Locked { path });
            }
            Err(source) => return Err(RecordError::Io { path, source }),
        }

        tracing::debug!(path = %path.display(), "Run lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to release run lock");
        }
    }
}
