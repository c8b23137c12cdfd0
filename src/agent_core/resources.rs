//! Process-wide resources shared by a session tree.
//!
//! Responsibilities:
//! - Count tool operations against `limits.max_operations`
//! - Snapshot files before write-class tools touch them
//! - Carry the audit sink
//! - Cooperative cancellation
//!
//! A [`RuntimeContext`] is shared by a session and every subtask it spawns,
//! so the operation limit applies to the whole tree.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::audit::{AuditSink, NullAuditSink, SqliteAuditLog};
use super::errors::{AuditError, DispatchError};
use crate::config::RuntimeConfig;

// ─── OperationCounter ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct OperationCounter {
    count: AtomicU64,
    limit: u64,
}

impl OperationCounter {
    pub fn new(limit: u64) -> Self {
        Self {
            count: AtomicU64::new(0),
            limit,
        }
    }

    /// Reserve one operation.
    ///
    /// Fails once the limit is passed; the failed attempt still counts, so
    /// every later call fails too.
    pub fn try_acquire(&self) -> Result<u64, DispatchError> {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.limit {
            return Err(DispatchError::OperationLimitExceeded {
                count,
                limit: self.limit,
            });
        }
        Ok(count)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst).min(self.limit)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

// ─── CancellationFlag ───────────────────────────────────────────────────────

/// Shared cancel switch, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─── BackupStore ────────────────────────────────────────────────────────────

/// Sidecar metadata written next to each backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub created_at: String,
    pub size_bytes: u64,
}

/// Copies files aside before they are modified.
///
/// Backups are named `<sha256(path)[..16]>_<timestamp>_<uuid>.bak` so
/// repeated writes to the same file never collide.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot `path` if it is an existing regular file.
    pub fn snapshot(&self, path: &Path) -> std::io::Result<Option<BackupRecord>> {
        if !path.is_file() {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.dir)?;

        let digest = Sha256::digest(path.to_string_lossy().as_bytes());
        let prefix: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        let now = chrono::Utc::now();
        let name = format!(
            "{prefix}_{}_{}.bak",
            now.format("%Y%m%dT%H%M%S%3fZ"),
            uuid::Uuid::new_v4().simple()
        );
        let backup_path = self.dir.join(name);
        let size_bytes = std::fs::copy(path, &backup_path)?;

        let record = BackupRecord {
            original_path: path.to_path_buf(),
            backup_path: backup_path.clone(),
            created_at: now.to_rfc3339(),
            size_bytes,
        };
        let sidecar = backup_path.with_extension("bak.json");
        let json = serde_json::to_string_pretty(&record).map_err(std::io::Error::other)?;
        std::fs::write(sidecar, json)?;

        tracing::debug!(
            original = %path.display(),
            backup = %backup_path.display(),
            size_bytes,
            "file backed up"
        );
        Ok(Some(record))
    }

    /// All backups taken of `path`, oldest first.
    pub fn list_for(&self, path: &Path) -> std::io::Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let p = entry?.path();
            if !p.to_string_lossy().ends_with(".bak.json") {
                continue;
            }
            let Ok(record) = serde_json::from_str::<BackupRecord>(&std::fs::read_to_string(&p)?)
            else {
                continue;
            };
            if record.original_path == path {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

// ─── RuntimeContext ─────────────────────────────────────────────────────────

/// Resources shared by every session in a tree.
pub struct RuntimeContext {
    pub operations: OperationCounter,
    pub audit: Arc<dyn AuditSink>,
    pub backups: Option<BackupStore>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("operations", &self.operations)
            .field("backups", &self.backups)
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    /// Build from config: SQLite audit log and backups as configured.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, AuditError> {
        let audit: Arc<dyn AuditSink> = if config.audit.enabled {
            let path = config.audit_database_path();
            Arc::new(SqliteAuditLog::open(&path.to_string_lossy())?)
        } else {
            Arc::new(NullAuditSink)
        };
        let backups = config
            .audit
            .backups_enabled
            .then(|| BackupStore::new(config.backup_dir()));
        Ok(Self {
            operations: OperationCounter::new(config.limits.max_operations),
            audit,
            backups,
        })
    }

    /// In-memory context: no audit persistence, no backups.
    pub fn ephemeral(max_operations: u64) -> Self {
        Self {
            operations: OperationCounter::new(max_operations),
            audit: Arc::new(NullAuditSink),
            backups: None,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
