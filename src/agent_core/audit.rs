//! Audit log for tool dispatches.
//!
//! Every dispatch that reaches the permission gate produces one record:
//! operation, target, outcome, timing. The SQLite sink uses `rusqlite` in
//! WAL mode behind a `std::sync::Mutex`, since a connection is not `Sync`
//! and writes are short.

use std::sync::Mutex;

use rusqlite::{params, Connection};

use super::errors::AuditError;
use super::types::{AuditEntry, AuditStatus, NewAuditEntry};

/// Destination for audit records.
///
/// Recording must never fail a dispatch; the dispatcher logs sink errors and
/// carries on.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &NewAuditEntry) -> Result<(), AuditError>;

    /// Entries for a session, oldest first. Sinks that do not retain entries
    /// return an empty list.
    fn entries(&self, _session_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(Vec::new())
    }
}

/// Discards every record. Used when auditing is disabled.
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _entry: &NewAuditEntry) -> Result<(), AuditError> {
        Ok(())
    }
}

// ─── SQLite ─────────────────────────────────────────────────────────────────

/// SQLite-backed audit log.
pub struct SqliteAuditLog {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAuditLog").finish_non_exhaustive()
    }
}

impl SqliteAuditLog {
    /// Open (or create) the audit database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AuditError> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                operation TEXT NOT NULL,
                target TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                execution_time_ms INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_audit_session
                ON audit_log(session_id, id);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, AuditError> {
        self.conn.lock().map_err(|_| AuditError::DatabaseError {
            reason: "audit connection mutex poisoned".into(),
        })
    }
}

impl AuditSink for SqliteAuditLog {
    fn record(&self, entry: &NewAuditEntry) -> Result<(), AuditError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_log
             (session_id, timestamp, operation, target, status, detail, execution_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.session_id,
                chrono::Utc::now().to_rfc3339(),
                entry.operation,
                entry.target,
                entry.status.as_str(),
                entry.detail,
                entry.execution_time_ms as i64,
            ],
        )?;
        Ok(())
    }

    fn entries(&self, session_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, timestamp, operation, target, status, detail, execution_time_ms
             FROM audit_log WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(AuditEntry {
                id: row.get(0)?,
                session_id: row.get(1)?,
                timestamp: row.get(2)?,
                operation: row.get(3)?,
                target: row.get(4)?,
                status: AuditStatus::parse(&row.get::<_, String>(5)?),
                detail: row.get(6)?,
                execution_time_ms: row.get::<_, i64>(7)? as u64,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session: &str, status: AuditStatus) -> NewAuditEntry {
        NewAuditEntry {
            session_id: session.into(),
            operation: "write_file".into(),
            target: "src/lib.rs".into(),
            status,
            detail: None,
            execution_time_ms: 12,
        }
    }

    #[test]
    fn test_record_and_read_back() {
        let log = SqliteAuditLog::open(":memory:").unwrap();
        log.record(&entry("s1", AuditStatus::Success)).unwrap();
        log.record(&entry("s1", AuditStatus::Denied)).unwrap();
        log.record(&entry("s2", AuditStatus::Error)).unwrap();

        let entries = log.entries("s1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, AuditStatus::Success);
        assert_eq!(entries[1].status, AuditStatus::Denied);
        assert_eq!(entries[0].execution_time_ms, 12);
        assert_eq!(entries[0].target, "src/lib.rs");
    }

    #[test]
    fn test_file_backed_log_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/audit.db");
        let path = path.to_str().unwrap();
        {
            let log = SqliteAuditLog::open(path).unwrap();
            log.record(&entry("s1", AuditStatus::RejectedByUser)).unwrap();
        }
        let log = SqliteAuditLog::open(path).unwrap();
        assert_eq!(log.entries("s1").unwrap()[0].status, AuditStatus::RejectedByUser);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let log = std::sync::Arc::new(SqliteAuditLog::open(path.to_str().unwrap()).unwrap());

        let writers: Vec<_> = (0..32)
            .map(|i| {
                let log = log.clone();
                tokio::task::spawn_blocking(move || {
                    let session = if i % 2 == 0 { "parent" } else { "child" };
                    log.record(&entry(session, AuditStatus::Success))
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        assert_eq!(log.entries("parent").unwrap().len(), 16);
        assert_eq!(log.entries("child").unwrap().len(), 16);
        let ids: std::collections::BTreeSet<i64> = log
            .entries("parent")
            .unwrap()
            .iter()
            .chain(log.entries("child").unwrap().iter())
            .map(|e| e.id)
            .collect();
        assert_eq!(ids.len(), 32);
    }

    #[test]
    fn test_null_sink() {
        let sink = NullAuditSink;
        sink.record(&entry("s1", AuditStatus::Success)).unwrap();
        assert!(sink.entries("s1").unwrap().is_empty());
    }
}
