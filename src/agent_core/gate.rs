//! Permission gate: classifies a tool call as allow, deny or confirm.
//!
//! Evaluation depends only on the call, the tool's spec, the policy config,
//! the session's grants and where path symlinks point. Rules run in a fixed
//! order and the first match wins:
//!
//! 1. Deny mutating tools in read-only mode
//! 2. Deny network tools when network access is off
//! 3. Deny paths outside the repository when `restrict_to_repo` is set
//! 4. Deny sensitive files unless `allow_sensitive`
//! 5. Deny destructive command patterns, and privilege escalation unless
//!    `allow_sudo`
//! 6. Allow calls covered by a session or persistent grant
//! 7. Allow known-safe calls (reads inside the root, harmless commands)
//!    unless `require_permission_for_all`
//! 8. Allow everything else when `require_permission` is off
//! 9. Otherwise require confirmation

use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;

use super::permissions::{PermissionStatus, PermissionStore};
use super::types::PermissionDecision;
use crate::config::PolicyConfig;
use crate::tools::{EffectClass, ToolSpec};

// ─── Rule Tables ────────────────────────────────────────────────────────────

/// Destructive shell patterns. Denied regardless of grants or `allow_sudo`.
const DANGEROUS_PATTERNS: &[&str] = &[
    // rm -rf / or rm -rf /*
    r"(?i)\brm\s+(-[a-z]*r[a-z]*f[a-z]*|-[a-z]*f[a-z]*r[a-z]*|--recursive\s+--force|--force\s+--recursive)\s+(/|/\*|~|\$HOME)(\s|$)",
    // Fork bomb
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    // dd to raw devices, or piping into dd
    r"(?i)\bdd\s+.*of=/dev/",
    r"\|\s*dd\b",
    // Write to raw disk devices
    r">\s*/dev/(sd|hd|nvme|disk)",
    // Filesystem formatting
    r"(?i)\bmkfs(\.|\s)",
    // chmod/chown on the filesystem root
    r"(?i)\bch(mod|own)\s+(-R\s+)?\S+\s+/(\s|$)",
];

/// Privilege escalation commands, matched as whole tokens.
const ESCALATION_TOKENS: &[&str] = &["sudo", "su", "doas", "pkexec"];

/// Files that commonly hold secrets.
const SENSITIVE_GLOBS: &[&str] = &[
    "**/.env",
    "**/.env.*",
    "**/*.pem",
    "**/*.key",
    "**/*.p12",
    "**/*.pfx",
    "**/id_rsa*",
    "**/id_ed25519*",
    "**/id_ecdsa*",
    "**/.ssh/**",
    "**/.aws/credentials",
    "**/.netrc",
    "**/.git-credentials",
    "**/.npmrc",
    "**/.pypirc",
    "**/credentials.json",
    "**/secrets.*",
];

/// Read-only commands allowed without confirmation.
const HARMLESS_COMMANDS: &[&str] = &[
    "grep", "egrep", "fgrep", "rg", "find", "ls", "cat", "head", "tail", "sed -n", "less",
    "more", "wc", "file", "stat", "which", "whereis", "pwd", "cd", "echo", "printenv", "df",
    "du", "ps", "uname", "date", "tree", "diff", "git status", "git log", "git diff",
    "git show", "git branch", "cargo test", "pytest", "npm test", "go test", "make test",
];

/// Fetch commands treated as harmless only when network access is enabled.
const NETWORK_COMMANDS: &[&str] = &["curl", "wget"];

const CONTEXT_COMMANDS: &[&str] = &["cd", "pushd", "popd"];
const SETUP_COMMANDS: &[&str] = &["export", "set", "unset", "source", "."];
const SHELL_WRAPPERS: &[&str] = &["sh -c", "bash -c", "zsh -c", "ksh -c", "dash -c"];

// ─── Command Analysis ───────────────────────────────────────────────────────

/// The command that actually does the work in a shell line, plus the
/// directory it runs in when the line starts with `cd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    /// Primary command, possibly with its first flag (`sed -n`).
    pub command: String,
    pub working_dir: Option<String>,
}

impl CommandInfo {
    /// Grant pattern: `command` or `command@dir`.
    pub fn pattern(&self) -> String {
        match &self.working_dir {
            Some(dir) => format!("{}@{dir}", self.command),
            None => self.command.clone(),
        }
    }
}

fn basename(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

/// Command name plus a following flag, if any (`sed -n`).
fn command_with_flag(tokens: &[&str]) -> Option<String> {
    let first = basename(tokens.first()?);
    match tokens.get(1) {
        Some(flag) if flag.starts_with('-') => Some(format!("{first} {flag}")),
        _ => Some(first.to_string()),
    }
}

/// Extract the primary command of a shell line.
///
/// Looks through `find -exec`, `xargs`, `sh -c` and `eval` wrappers to the
/// command they run, splits compound lines on `&&`, `||`, `;` and pipes, and
/// skips directory changes and environment setup.
pub fn extract_command_info(cmd: &str) -> Option<CommandInfo> {
    let trimmed = cmd.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();

    if lower.starts_with("find ") {
        if let Some(idx) = tokens
            .iter()
            .position(|t| t.eq_ignore_ascii_case("-exec") || t.eq_ignore_ascii_case("-execdir"))
        {
            if let Some(command) = command_with_flag(&tokens[idx + 1..]) {
                return Some(CommandInfo {
                    command,
                    working_dir: None,
                });
            }
        }
    }

    if lower == "xargs" || lower.starts_with("xargs ") {
        let rest: Vec<&str> = tokens[1..]
            .iter()
            .skip_while(|t| t.starts_with('-'))
            .copied()
            .collect();
        // xargs with no command runs echo
        let command = command_with_flag(&rest).unwrap_or_else(|| "echo".to_string());
        return Some(CommandInfo {
            command,
            working_dir: None,
        });
    }

    for wrapper in SHELL_WRAPPERS {
        if let Some(idx) = lower.find(wrapper) {
            let remainder = trimmed[idx + wrapper.len()..]
                .trim()
                .trim_start_matches(['"', '\'']);
            let inner: Vec<&str> = remainder.split_whitespace().collect();
            if let Some(command) = command_with_flag(&inner) {
                return Some(CommandInfo {
                    command,
                    working_dir: None,
                });
            }
        }
    }

    if lower.starts_with("eval ") {
        let remainder = trimmed[5..].trim().trim_start_matches(['"', '\'']);
        let inner: Vec<&str> = remainder.split_whitespace().collect();
        if let Some(command) = command_with_flag(&inner) {
            return Some(CommandInfo {
                command,
                working_dir: None,
            });
        }
    }

    // Compound commands: the first segment of each pipe chain
    let segments = trimmed
        .split("&&")
        .flat_map(|s| s.split("||"))
        .flat_map(|s| s.split(';'))
        .filter_map(|s| s.split('|').next());

    let mut working_dir = None;
    for segment in segments {
        let parts: Vec<&str> = segment.split_whitespace().collect();
        let Some(first) = parts.first() else {
            continue;
        };
        if CONTEXT_COMMANDS.contains(first) {
            if *first == "cd" {
                working_dir = parts.get(1).map(|d| d.to_string());
            }
            continue;
        }
        if SETUP_COMMANDS.contains(first) {
            continue;
        }
        return Some(CommandInfo {
            command: command_with_flag(&parts)?,
            working_dir,
        });
    }

    // Only directory changes: fall back to the first token
    Some(CommandInfo {
        command: basename(tokens[0]).to_string(),
        working_dir,
    })
}

/// Every sub-command of a compound line, for harmlessness checks.
fn sub_commands(cmd: &str) -> Vec<String> {
    cmd.split("&&")
        .flat_map(|s| s.split("||"))
        .flat_map(|s| s.split(';'))
        .flat_map(|s| s.split('|'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ─── Path Handling ──────────────────────────────────────────────────────────

/// Resolve `path` against `root`, normalize `.`/`..`, then follow symlinks.
///
/// The longest existing ancestor is canonicalized and the components that
/// do not exist yet are re-joined, so new files still resolve.
pub fn resolve_path(root: &Path, path: &str) -> PathBuf {
    let expanded = match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|h| h.join(rest)),
        None => None,
    };
    let candidate = expanded.unwrap_or_else(|| {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    });
    follow_symlinks(&normalize(&candidate))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the longest existing prefix of an absolute, normalized path.
fn follow_symlinks(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        if let Ok(real) = std::fs::canonicalize(existing) {
            return missing.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Root made absolute (against the process cwd), normalized and with
/// symlinks followed.
fn absolute_root(root: &Path) -> PathBuf {
    let absolute = if root.is_absolute() {
        normalize(root)
    } else {
        let cwd = std::env::current_dir().unwrap_or_default();
        normalize(&cwd.join(root))
    };
    follow_symlinks(&absolute)
}

// ─── PermissionGate ─────────────────────────────────────────────────────────

/// Compiled rule tables. Build once and share.
#[derive(Debug)]
pub struct PermissionGate {
    dangerous: Vec<Regex>,
    sensitive: GlobSet,
}

/// Errors compiling the gate's rule tables.
#[derive(Debug, thiserror::Error)]
pub enum GateBuildError {
    #[error("invalid dangerous-command pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid sensitive-file glob: {0}")]
    Glob(#[from] globset::Error),
}

impl PermissionGate {
    pub fn new() -> Result<Self, GateBuildError> {
        Self::with_rules(DANGEROUS_PATTERNS, SENSITIVE_GLOBS)
    }

    /// Build a gate from custom pattern and glob tables.
    pub fn with_rules(dangerous: &[&str], sensitive: &[&str]) -> Result<Self, GateBuildError> {
        let dangerous = dangerous
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let mut builder = GlobSetBuilder::new();
        for pattern in sensitive {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            dangerous,
            sensitive: builder.build()?,
        })
    }

    /// Decide whether a call may run.
    pub fn evaluate(
        &self,
        spec: &ToolSpec,
        arguments: &serde_json::Value,
        policy: &PolicyConfig,
        grants: &PermissionStore,
    ) -> PermissionDecision {
        let root = absolute_root(&policy.root);
        let paths: Vec<PathBuf> = spec
            .paths(arguments)
            .into_iter()
            .map(|p| resolve_path(&root, p))
            .collect();
        let command = spec.command(arguments);

        if policy.read_only && spec.effect.is_mutating() {
            return PermissionDecision::deny(format!(
                "'{}' modifies the system and read-only mode is on",
                spec.name
            ));
        }

        if spec.effect == EffectClass::Network && !policy.enable_network {
            return PermissionDecision::deny(format!(
                "'{}' needs network access, which is disabled",
                spec.name
            ));
        }

        if policy.restrict_to_repo {
            if let Some(outside) = paths.iter().find(|p| !p.starts_with(&root)) {
                return PermissionDecision::deny(format!(
                    "{} is outside the repository {}",
                    outside.display(),
                    root.display()
                ));
            }
        }

        if !policy.allow_sensitive {
            if let Some(sensitive) = paths.iter().find(|p| self.sensitive.is_match(p)) {
                return PermissionDecision::deny(format!(
                    "{} looks like a sensitive file (set allow_sensitive to permit)",
                    sensitive.display()
                ));
            }
            if let Some(token) = command.and_then(|c| self.sensitive_token(&root, c)) {
                return PermissionDecision::deny(format!(
                    "command references sensitive file '{token}' (set allow_sensitive to permit)"
                ));
            }
        }

        if let Some(cmd) = command {
            if let Some(pattern) = self.dangerous.iter().find(|re| re.is_match(cmd)) {
                return PermissionDecision::deny(format!(
                    "command matches destructive pattern `{}`",
                    pattern.as_str()
                ));
            }
            if !policy.allow_sudo {
                if let Some(token) = cmd
                    .split_whitespace()
                    .find(|t| ESCALATION_TOKENS.contains(&basename(t)))
                {
                    return PermissionDecision::deny(format!(
                        "privilege escalation via '{token}' is blocked (set allow_sudo to permit)"
                    ));
                }
            }
        }

        let pattern = grant_pattern(spec, arguments);
        if grants.check(&spec.name, pattern.as_deref()) == PermissionStatus::Allowed {
            return PermissionDecision::allow("previously approved");
        }

        if !policy.require_permission_for_all {
            if spec.effect == EffectClass::Read && paths.iter().all(|p| p.starts_with(&root)) {
                return PermissionDecision::allow("read inside the repository");
            }
            if let Some(cmd) = command {
                if is_harmless(cmd, policy.enable_network) {
                    return PermissionDecision::allow("harmless read-only command");
                }
            }
        }

        if !policy.require_permission {
            return PermissionDecision::allow("permission prompts disabled");
        }

        PermissionDecision::confirm(confirmation_reason(spec, &paths, command))
    }

    /// A command token that names a sensitive file, if any.
    fn sensitive_token<'a>(&self, root: &Path, cmd: &'a str) -> Option<&'a str> {
        cmd.split_whitespace()
            .map(|t| t.trim_matches(['"', '\'']))
            .filter(|t| !t.starts_with('-'))
            .find(|t| self.sensitive.is_match(resolve_path(root, t)))
    }
}

/// Pattern a grant for this call is recorded under.
///
/// Exec tools use the primary command (`cargo`, `pytest@tests`); path tools
/// use the first path argument as given.
pub fn grant_pattern(spec: &ToolSpec, arguments: &serde_json::Value) -> Option<String> {
    if let Some(cmd) = spec.command(arguments) {
        return extract_command_info(cmd).map(|info| info.pattern());
    }
    spec.paths(arguments).first().map(|p| p.to_string())
}

/// Every sub-command is on the harmless list (or, with network access on,
/// a plain fetch).
fn is_harmless(cmd: &str, allow_network: bool) -> bool {
    // Redirections can write files even from read-only commands
    if cmd.contains('>') || cmd.contains("-delete") {
        return false;
    }
    if runs_hidden_command(cmd) {
        return false;
    }
    let subs = sub_commands(cmd);
    !subs.is_empty()
        && subs.iter().all(|sub| {
            let Some(info) = extract_command_info(sub) else {
                return false;
            };
            let words: Vec<&str> = sub.split_whitespace().take(2).collect();
            let leading_pair = words.join(" ");
            let network: &[&str] = if allow_network { NETWORK_COMMANDS } else { &[] };
            HARMLESS_COMMANDS.iter().chain(network).any(|h| {
                info.command == *h
                    || info.command.strip_prefix(h).is_some_and(|rest| rest.starts_with(' '))
                    || (words.first() == Some(&info.command.as_str()) && leading_pair == *h)
            })
        })
}

/// Command substitution, process substitution, backgrounding or a second
/// line: parts of the command that the sub-command split never sees.
fn runs_hidden_command(cmd: &str) -> bool {
    cmd.contains("$(")
        || cmd.contains('`')
        || cmd.contains("<(")
        || cmd.contains(['\n', '\r'])
        || cmd.replace("&&", "").contains('&')
}

fn confirmation_reason(spec: &ToolSpec, paths: &[PathBuf], command: Option<&str>) -> String {
    if let Some(cmd) = command {
        return format!("run `{cmd}`");
    }
    match paths.first() {
        Some(p) => format!("{} {}", spec.effect.as_str(), p.display()),
        None => format!("{} via '{}'", spec.effect.as_str(), spec.name),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
