//! Permission Store: tiered permission grants for tool execution.
//!
//! Supports three tiers:
//! - **Allow Once** (`Confirmed`): no grant stored, ask every time.
//! - **Allow for Session**: grant lives until the session ends.
//! - **Always Allow**: persisted to `permissions.json`.
//!
//! Grants are scoped to a tool and, optionally, a pattern: the primary
//! command for exec tools (`cargo`, `pytest@tests`) or the target path for
//! file tools. A grant without a pattern covers every call to the tool.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ─── Types ──────────────────────────────────────────────────────────────────

/// Scope of a permission grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    /// Valid until the session ends.
    Session,
    /// Persisted across restarts.
    Always,
}

/// A single permission grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub tool_name: String,
    /// Command or path pattern; `None` covers every call to the tool.
    #[serde(default)]
    pub pattern: Option<String>,
    pub scope: PermissionScope,
    /// ISO 8601 timestamp when the grant was created.
    pub granted_at: String,
}

/// Result of checking a call's grant status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// An active grant covers the call.
    Allowed,
    /// No grant; fall through to the policy.
    NeedsConfirmation,
}

fn grant_key(tool_name: &str, pattern: Option<&str>) -> String {
    match pattern {
        Some(p) => format!("{tool_name}:{p}"),
        None => tool_name.to_string(),
    }
}

// ─── Persistent Format ──────────────────────────────────────────────────────

/// On-disk format for `permissions.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedGrants {
    version: u32,
    /// Grant key → grant.
    grants: HashMap<String, PermissionGrant>,
}

// ─── PermissionStore ────────────────────────────────────────────────────────

/// Session and persistent permission grants for one session.
#[derive(Debug, Clone, Default)]
pub struct PermissionStore {
    session_grants: HashMap<String, PermissionGrant>,
    persistent_grants: HashMap<String, PermissionGrant>,
    /// `None` keeps persistent grants in memory only.
    persist_path: Option<PathBuf>,
}

impl PermissionStore {
    /// Create a store backed by `path`, loading any grants already saved there.
    pub fn open(path: PathBuf) -> Self {
        let mut store = Self {
            persist_path: Some(path),
            ..Self::default()
        };
        store.load_from_disk();
        store
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Check whether a grant covers a call to `tool_name` with `pattern`.
    pub fn check(&self, tool_name: &str, pattern: Option<&str>) -> PermissionStatus {
        let covered = |key: &str| {
            self.persistent_grants.contains_key(key) || self.session_grants.contains_key(key)
        };
        if covered(tool_name) || pattern.is_some_and(|p| covered(&grant_key(tool_name, Some(p)))) {
            PermissionStatus::Allowed
        } else {
            PermissionStatus::NeedsConfirmation
        }
    }

    /// Grant a permission for a tool (optionally narrowed by pattern).
    pub fn grant(&mut self, tool_name: &str, pattern: Option<&str>, scope: PermissionScope) {
        let key = grant_key(tool_name, pattern);
        let grant = PermissionGrant {
            tool_name: tool_name.to_string(),
            pattern: pattern.map(str::to_string),
            scope,
            granted_at: chrono::Utc::now().to_rfc3339(),
        };

        match scope {
            PermissionScope::Session => {
                self.session_grants.insert(key, grant);
            }
            PermissionScope::Always => {
                self.persistent_grants.insert(key, grant);
                self.save_to_disk();
            }
        }

        tracing::info!(tool = tool_name, pattern = ?pattern, scope = ?scope, "permission granted");
    }

    /// Revoke a grant in either tier.
    pub fn revoke(&mut self, tool_name: &str, pattern: Option<&str>) -> bool {
        let key = grant_key(tool_name, pattern);
        let removed_persistent = self.persistent_grants.remove(&key).is_some();
        let removed_session = self.session_grants.remove(&key).is_some();

        if removed_persistent {
            self.save_to_disk();
        }

        let removed = removed_persistent || removed_session;
        if removed {
            tracing::info!(tool = tool_name, pattern = ?pattern, "permission revoked");
        }
        removed
    }

    /// List all persistent grants, sorted by tool then pattern.
    pub fn list_persistent(&self) -> Vec<&PermissionGrant> {
        let mut grants: Vec<&PermissionGrant> = self.persistent_grants.values().collect();
        grants.sort_by(|a, b| (&a.tool_name, &a.pattern).cmp(&(&b.tool_name, &b.pattern)));
        grants
    }

    /// Clear all session grants.
    pub fn clear_session(&mut self) {
        let count = self.session_grants.len();
        self.session_grants.clear();
        if count > 0 {
            tracing::info!(cleared = count, "session permissions cleared");
        }
    }

    // ─── Persistence ────────────────────────────────────────────────────

    fn load_from_disk(&mut self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        if !path.exists() {
            return;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<PersistedGrants>(&content) {
                Ok(persisted) => {
                    tracing::info!(
                        count = persisted.grants.len(),
                        path = %path.display(),
                        "loaded persistent permissions"
                    );
                    self.persistent_grants = persisted.grants;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "failed to parse permissions file, starting fresh"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read permissions file");
            }
        }
    }

    /// Save persistent grants to disk (atomic write).
    fn save_to_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let persisted = PersistedGrants {
            version: 1,
            grants: self.persistent_grants.clone(),
        };

        let content = match serde_json::to_string_pretty(&persisted) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize permissions");
                return;
            }
        };

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        // Write to temp file, then rename
        let tmp_path = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp_path, &content) {
            tracing::error!(error = %e, "failed to write permissions temp file");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp_path, path) {
            tracing::error!(error = %e, "failed to rename permissions file");
            return;
        }

        tracing::debug!(count = self.persistent_grants.len(), "saved persistent permissions");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_returns_needs_confirmation_by_default() {
        let store = PermissionStore::in_memory();
        assert_eq!(
            store.check("write_file", Some("src/main.rs")),
            PermissionStatus::NeedsConfirmation
        );
    }

    #[test]
    fn test_session_grant_allows_tool() {
        let mut store = PermissionStore::in_memory();
        store.grant("write_file", None, PermissionScope::Session);
        assert_eq!(store.check("write_file", Some("any.txt")), PermissionStatus::Allowed);
    }

    #[test]
    fn test_pattern_grant_is_narrow() {
        let mut store = PermissionStore::in_memory();
        store.grant("run_shell", Some("cargo"), PermissionScope::Session);
        assert_eq!(store.check("run_shell", Some("cargo")), PermissionStatus::Allowed);
        assert_eq!(
            store.check("run_shell", Some("curl")),
            PermissionStatus::NeedsConfirmation
        );
        assert_eq!(store.check("run_shell", None), PermissionStatus::NeedsConfirmation);
    }

    #[test]
    fn test_clear_session_removes_session_grants_only() {
        let mut store = PermissionStore::in_memory();
        store.grant("tool_a", None, PermissionScope::Session);
        store.grant("tool_b", None, PermissionScope::Always);

        store.clear_session();

        assert_eq!(store.check("tool_a", None), PermissionStatus::NeedsConfirmation);
        assert_eq!(store.check("tool_b", None), PermissionStatus::Allowed);
    }

    #[test]
    fn test_revoke_removes_grant() {
        let mut store = PermissionStore::in_memory();
        store.grant("tool_a", Some("x"), PermissionScope::Always);
        assert!(store.revoke("tool_a", Some("x")));
        assert_eq!(store.check("tool_a", Some("x")), PermissionStatus::NeedsConfirmation);
        assert!(!store.revoke("tool_a", Some("x")));
    }

    #[test]
    fn test_list_persistent_returns_sorted() {
        let mut store = PermissionStore::in_memory();
        store.grant("zzz", None, PermissionScope::Always);
        store.grant("aaa", None, PermissionScope::Always);
        store.grant("mmm", None, PermissionScope::Session);

        let grants = store.list_persistent();
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].tool_name, "aaa");
        assert_eq!(grants[1].tool_name, "zzz");
    }

    #[test]
    fn test_always_grants_persist_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");

        let mut store = PermissionStore::open(path.clone());
        store.grant("run_shell", Some("pytest"), PermissionScope::Always);
        store.grant("write_file", None, PermissionScope::Session);

        let reopened = PermissionStore::open(path);
        assert_eq!(reopened.check("run_shell", Some("pytest")), PermissionStatus::Allowed);
        assert_eq!(reopened.check("write_file", None), PermissionStatus::NeedsConfirmation);
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");
        std::fs::write(&path, "not json").unwrap();
        let store = PermissionStore::open(path);
        assert!(store.list_persistent().is_empty());
    }

    #[test]
    fn test_permission_scope_serialization() {
        assert_eq!(serde_json::to_string(&PermissionScope::Session).unwrap(), "\"session\"");
        assert_eq!(serde_json::to_string(&PermissionScope::Always).unwrap(), "\"always\"");
    }
}
