//! Configuration consumed by the engine.
//!
//! `EngineSettings` is engine-wide (one per host), `BlockConfig` is the
//! host's persistence record for a single block. The engine never writes
//! either back on its own.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::BlockId;

/// Memory ceiling used when the host passes 0.
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 300;
/// CPU ceiling used when the host passes 0.
pub const DEFAULT_CPU_LIMIT_PERCENT: u32 = 10;
/// Loop interval a fresh block starts with.
pub const DEFAULT_LOOP_INTERVAL_SECS: f64 = 5.0;

// ════════════════════════════════════════════════════════════════════
// Resource limits
// ════════════════════════════════════════════════════════════════════

/// Soft ceilings for a block's whole process tree. 0 means "use the default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_percent: u32,
    pub memory_mb: u64,
}

impl ResourceLimits {
    pub fn new(cpu_percent: u32, memory_mb: u64) -> Self {
        Self {
            cpu_percent,
            memory_mb,
        }
    }

    pub fn effective_cpu_percent(&self) -> u32 {
        match self.cpu_percent {
            0 => DEFAULT_CPU_LIMIT_PERCENT,
            pct => pct.min(100),
        }
    }

    pub fn effective_memory_mb(&self) -> u64 {
        match self.memory_mb {
            0 => DEFAULT_MEMORY_LIMIT_MB,
            mb => mb,
        }
    }

    pub fn effective_memory_bytes(&self) -> u64 {
        self.effective_memory_mb().saturating_mul(1024 * 1024)
    }
}

// ════════════════════════════════════════════════════════════════════
// Interpreter
// ════════════════════════════════════════════════════════════════════

/// How to launch scripts and how to recognise / fix a missing dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Binary name looked up on PATH.
    pub program: String,
    /// Arguments placed before the script path (unbuffered mode).
    pub script_args: Vec<String>,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
    /// Arguments placed before the module name when installing a package.
    pub install_args: Vec<String>,
    /// Substring the interpreter prints when an import fails.
    pub missing_module_signature: String,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        let program = if cfg!(windows) { "python" } else { "python3" };
        Self {
            program: program.to_string(),
            script_args: vec!["-u".to_string()],
            env: vec![
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("PYTHONUTF8".to_string(), "1".to_string()),
            ],
            install_args: vec!["-m".into(), "pip".into(), "install".into()],
            missing_module_signature: "No module named".to_string(),
        }
    }
}

impl InterpreterConfig {
    /// Plain interpreter, no extra args or env. Handy for `sh`-driven tests.
    pub fn bare(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            script_args: Vec::new(),
            env: Vec::new(),
            ..Self::default()
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Engine settings
// ════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub interpreter: InterpreterConfig,
    /// Install a missing module and restart the script automatically.
    pub auto_install_modules: bool,
    /// Limits applied to blocks that do not carry their own.
    pub default_limits: ResourceLimits,
    /// How long a forced stop waits after closing stdin before killing.
    pub stop_grace_ms: u64,
    /// Upper bound on waiting for a killed process to be reaped.
    pub kill_wait_ms: u64,
    /// Bound for `<interpreter> --version`.
    pub probe_timeout_ms: u64,
    /// Bound for one package installation.
    pub install_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            interpreter: InterpreterConfig::default(),
            auto_install_modules: true,
            default_limits: ResourceLimits::default(),
            stop_grace_ms: 0,
            kill_wait_ms: 5_000,
            probe_timeout_ms: 2_000,
            install_timeout_ms: 120_000,
        }
    }
}

impl EngineSettings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }

    /// Load settings from disk. A missing file yields defaults; a malformed
    /// one is logged and also yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file, using defaults");
            return Self::default();
        }

        match Self::read(path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring unreadable settings: {:#}", e);
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&json).context("Failed to parse settings JSON")
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to encode settings")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

// ════════════════════════════════════════════════════════════════════
// Block configuration (host persistence record)
// ════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: BlockId,
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default)]
    pub is_looping: bool,
    #[serde(default = "default_loop_interval")]
    pub loop_interval_secs: f64,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_loop_interval() -> f64 {
    DEFAULT_LOOP_INTERVAL_SECS
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            script_path: None,
            is_looping: false,
            loop_interval_secs: DEFAULT_LOOP_INTERVAL_SECS,
            limits: None,
        }
    }
}

impl BlockConfig {
    pub fn for_script(path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// The stored interval, or `None` if it is not a usable duration.
    pub fn loop_interval(&self) -> Option<Duration> {
        if self.loop_interval_secs > 0.0 {
            Duration::try_from_secs_f64(self.loop_interval_secs).ok()
        } else {
            None
        }
    }

    pub fn script_exists(&self) -> bool {
        self.script_path
            .as_deref()
            .is_some_and(|p| !p.as_os_str().is_empty() && p.is_file())
    }
}

/// Load a saved layout: a JSON array of block records.
pub fn load_layout(path: impl AsRef<Path>) -> Result<Vec<BlockConfig>> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read layout {}", path.display()))?;
    serde_json::from_str(&json).context("Failed to parse layout JSON")
}
