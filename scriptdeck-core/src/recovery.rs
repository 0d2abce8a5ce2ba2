//! Dependency recovery.
//!
//! Watches stderr lines for the interpreter's "module not found" signature,
//! pulls out the module name, installs it and lets the session restart the
//! script. One cycle at a time per session; duplicates are ignored.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::InterpreterConfig;

/// Where the current auto-fix cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryState {
    #[default]
    Idle,
    Detecting,
    Installing,
    Restarting,
}

/// Outcome of one install, reported back to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAttempt {
    pub module: String,
    pub success: bool,
}

/// Handed out when a cycle begins. Stale tickets (the cycle was cancelled
/// by a stop or a new run) are refused by every later step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryTicket {
    pub module: String,
    pub epoch: u64,
}

/// Module name between the first `'` after `signature` and the next `'`.
pub fn parse_missing_module(line: &str, signature: &str) -> Option<String> {
    let start = line.find(signature)? + signature.len();
    let rest = &line[start..];
    let open = rest.find('\'')? + 1;
    let len = rest[open..].find('\'')?;
    let module = rest[open..open + len].trim();
    if module.is_empty() {
        return None;
    }
    Some(module.to_string())
}

#[derive(Debug, Default)]
struct Tracker {
    state: RecoveryState,
    epoch: u64,
    /// Installed during the current chain of auto-restarts.
    installed: Vec<String>,
}

#[derive(Debug)]
pub struct DependencyRecovery {
    signature: String,
    tracker: Mutex<Tracker>,
}

impl DependencyRecovery {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            tracker: Mutex::new(Tracker::default()),
        }
    }

    pub fn is_signature(&self, line: &str) -> bool {
        !self.signature.is_empty() && line.contains(&self.signature)
    }

    pub fn state(&self) -> RecoveryState {
        self.lock().state
    }

    pub fn in_flight(&self) -> bool {
        self.state() != RecoveryState::Idle
    }

    /// Start a cycle for `line`. `None` when the line is not a signature,
    /// a cycle is already running, the name cannot be extracted, or the
    /// same module was already installed for this chain of restarts.
    pub fn try_begin(&self, line: &str) -> Option<RecoveryTicket> {
        if !self.is_signature(line) {
            return None;
        }

        let mut t = self.lock();
        if t.state != RecoveryState::Idle {
            tracing::debug!("recovery already in flight, ignoring: {}", line);
            return None;
        }
        t.state = RecoveryState::Detecting;

        let Some(module) = parse_missing_module(line, &self.signature) else {
            t.state = RecoveryState::Idle;
            return None;
        };
        if t.installed.iter().any(|m| m == &module) {
            // Installing it did not help last time.
            t.state = RecoveryState::Idle;
            return None;
        }

        Some(RecoveryTicket {
            module,
            epoch: t.epoch,
        })
    }

    pub fn mark_installing(&self, ticket: &RecoveryTicket) -> bool {
        self.advance(ticket, RecoveryState::Detecting, RecoveryState::Installing)
    }

    /// Install succeeded; the restart is next.
    pub fn mark_restarting(&self, ticket: &RecoveryTicket) -> bool {
        let mut t = self.lock();
        if t.epoch != ticket.epoch || t.state != RecoveryState::Installing {
            return false;
        }
        t.state = RecoveryState::Restarting;
        t.installed.push(ticket.module.clone());
        true
    }

    /// Close the cycle. Returns false if it was cancelled meanwhile.
    pub fn finish(&self, ticket: &RecoveryTicket) -> bool {
        let mut t = self.lock();
        if t.epoch != ticket.epoch {
            return false;
        }
        t.state = RecoveryState::Idle;
        true
    }

    pub fn is_current(&self, ticket: &RecoveryTicket) -> bool {
        self.lock().epoch == ticket.epoch
    }

    /// Abandon any cycle in flight and forget the restart chain.
    pub fn reset(&self) {
        let mut t = self.lock();
        t.epoch = t.epoch.wrapping_add(1);
        t.state = RecoveryState::Idle;
        t.installed.clear();
    }

    fn advance(&self, ticket: &RecoveryTicket, from: RecoveryState, to: RecoveryState) -> bool {
        let mut t = self.lock();
        if t.epoch != ticket.epoch || t.state != from {
            return false;
        }
        t.state = to;
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ════════════════════════════════════════════════════════════════════
// Package installation
// ════════════════════════════════════════════════════════════════════

/// Installs one package. `true` means "worth restarting the script".
#[async_trait]
pub trait PackageInstaller: Send + Sync + std::fmt::Debug {
    async fn install(&self, module: &str) -> bool;
}

/// `<interpreter> -m pip install <module>`.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    program: String,
    install_args: Vec<String>,
    timeout: Duration,
}

impl PipInstaller {
    pub fn new(interpreter: &InterpreterConfig, timeout: Duration) -> Self {
        Self {
            program: interpreter.program.clone(),
            install_args: interpreter.install_args.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    async fn install(&self, module: &str) -> bool {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.install_args)
            .arg(module)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(0x0800_0000);

        tracing::info!(program = %self.program, module, "installing missing module");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(program = %self.program, "installer failed to start: {}", e);
                return false;
            }
            Err(_) => {
                tracing::warn!(module, timeout = ?self.timeout, "installer timed out");
                return false;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(module, status = ?output.status.code(), "installer stdout: {}", stdout.trim());

        let ok = installer_succeeded(&stderr);
        if !ok {
            tracing::warn!(module, "installer reported an error: {}", stderr.trim());
        }
        ok
    }
}

/// The installer's exit code is not trusted; any "error" on stderr is a
/// failure, anything else a success.
pub fn installer_succeeded(stderr: &str) -> bool {
    !stderr.to_ascii_lowercase().contains("error")
}
