pub mod agent_core;
pub mod config;
pub mod inference;
pub mod tools;

#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};

pub use agent_core::{
    AutopilotLoop, AutopilotOutcome, ConversationSession, SessionError, SessionServices,
    SubtaskRunner,
};
pub use config::{load_or_default, RuntimeConfig};
pub use tools::{EffectClass, Tool, ToolOutput, ToolRegistry, ToolSpec};

/// Log file name inside the log directory.
const LOG_FILE_NAME: &str = "runtime.log";

/// Rotated log files kept alongside the current one.
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for the runtime.
///
/// - macOS: `~/Library/Application Support/cowork-runtime/`
/// - Windows: `{FOLDERID_RoamingAppData}\cowork-runtime\`
/// - Linux: `$XDG_DATA_HOME/cowork-runtime/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.cowork-runtime/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("cowork-runtime");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cowork-runtime")
}

/// Initialize the tracing subscriber, writing to `log_dir/runtime.log`.
///
/// On each call:
/// 1. Rotates existing logs (runtime.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh runtime.log with a line-flushing writer.
/// 3. Logs a startup banner with the log path.
///
/// `RUST_LOG` overrides the default filter. `COWORK_LOG_FORMAT=json` switches
/// to JSON lines. Returns the log file path; installing a second global
/// subscriber is a no-op.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, LOG_FILES_KEPT);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cowork_runtime=info,warn"));

    let json = std::env::var("COWORK_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);
    let installed = if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "=== cowork-runtime starting ==="
        );
    }
    Ok(log_path)
}

/// Rotate log files: `runtime.log` → `runtime.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("runtime.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("runtime.log.3"), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("runtime.log.1"), "current");
        assert_eq!(read("runtime.log.2"), "one");
        assert!(!dir.path().join("runtime.log.3").exists());
    }

    #[test]
    fn test_init_tracing_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_tracing(&dir.path().join("logs")).unwrap();
        assert!(path.exists());
        assert!(path.ends_with(LOG_FILE_NAME));
    }
}
