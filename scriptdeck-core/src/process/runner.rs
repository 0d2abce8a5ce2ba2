use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use crate::config::InterpreterConfig;
use crate::error::{SpawnError, StopError, WriteError};

/// What to launch: `<program> <script_args..> <script> <extra_args..>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub script: PathBuf,
    pub script_args: Vec<String>,
    pub extra_args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn for_script(interpreter: &InterpreterConfig, script: impl Into<PathBuf>) -> Self {
        let script = script.into();
        let working_dir = script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        Self {
            program: interpreter.program.clone(),
            script,
            script_args: interpreter.script_args.clone(),
            extra_args: Vec::new(),
            env: interpreter.env.clone(),
            working_dir,
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    /// We asked for the kill.
    pub killed: bool,
}

/// Output pipes of a started process, handed to the relay pumps.
#[derive(Debug)]
pub struct ProcessStreams {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// One OS process instance. Never reused across runs.
pub struct ProcessHandle {
    pid: u32,
    started_at: DateTime<Utc>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("exit", &self.exit_info())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_info().and_then(|e| e.code)
    }

    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }

    /// Resolves once the process has been reaped.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let unknown = ExitInfo {
            code: None,
            killed: false,
        };
        match rx.wait_for(Option::is_some).await {
            Ok(info) => (*info).unwrap_or(unknown),
            // The watcher task is gone; it only drops the sender after reaping.
            Err(_) => self.exit_info().unwrap_or(unknown),
        }
    }

    async fn wait_timeout(&self, limit: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }

    pub(crate) fn request_kill(&self) {
        let tx = self.kill_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    async fn close_stdin(&self) {
        let stdin = self.stdin.lock().await.take();
        if let Some(mut stdin) = stdin {
            let _ = stdin.shutdown().await;
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Runner
// ════════════════════════════════════════════════════════════════════

/// Starts, feeds and stops interpreter processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    stop_grace: Duration,
    kill_wait: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::ZERO, Duration::from_secs(5))
    }
}

impl ProcessRunner {
    pub fn new(stop_grace: Duration, kill_wait: Duration) -> Self {
        Self {
            stop_grace,
            kill_wait,
        }
    }

    /// Spawn the process. The interpreter and the script are checked up
    /// front, so a missing file never shows up as a strange exit code.
    pub fn start(&self, spec: &ProcessSpec) -> Result<(ProcessHandle, ProcessStreams), SpawnError> {
        let program = which::which(&spec.program).map_err(|source| SpawnError::InterpreterNotFound {
            program: spec.program.clone(),
            source,
        })?;

        if !spec.script.is_file() {
            return Err(SpawnError::ScriptNotFound(spec.script.clone()));
        }

        let mut cmd = Command::new(&program);
        cmd.args(&spec.script_args)
            .arg(&spec.script)
            .args(&spec.extra_args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // Own process group, so a kill reaches the helpers a script spawns.
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let io_err = |source: std::io::Error| SpawnError::Io {
            program: spec.program.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(io_err)?;
        let pid = child
            .id()
            .ok_or_else(|| io_err(std::io::Error::other("process exited before its pid was read")))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(io_err(std::io::Error::other("child pipes were not captured")));
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_exit(child, pid, kill_rx, exit_tx));

        tracing::info!(pid, program = %program.display(), script = %spec.script.display(), "process started");

        let handle = ProcessHandle {
            pid,
            started_at: Utc::now(),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
        };
        Ok((handle, ProcessStreams { stdout, stderr }))
    }

    /// Stop a process. Without `force_kill` this only closes stdin and lets
    /// the script finish on its own. With it, the process tree is killed
    /// (after the configured grace window) and reaped before returning.
    pub async fn stop(&self, handle: &ProcessHandle, force_kill: bool) -> Result<(), StopError> {
        if handle.has_exited() {
            return Err(StopError::AlreadyExited { pid: handle.pid });
        }

        handle.close_stdin().await;
        if !force_kill {
            tracing::debug!(pid = handle.pid, "stdin closed, waiting for process to exit on its own");
            return Ok(());
        }

        if !self.stop_grace.is_zero() && handle.wait_timeout(self.stop_grace).await.is_some() {
            return Ok(());
        }

        handle.request_kill();
        match handle.wait_timeout(self.kill_wait).await {
            Some(_) => Ok(()),
            None => Err(StopError::ExitTimeout {
                pid: handle.pid,
                waited: self.kill_wait,
            }),
        }
    }

    /// Write `text` plus a line terminator to the process input.
    pub async fn write_line(&self, handle: &ProcessHandle, text: &str) -> Result<(), WriteError> {
        let pid = handle.pid;
        if handle.has_exited() {
            return Err(WriteError::Exited { pid });
        }

        let mut guard = handle.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(WriteError::InputClosed { pid })?;

        // Prevent double-newlines if callers already include CR/LF.
        let line = text.trim_end_matches(['\r', '\n']);
        let mut payload = String::with_capacity(line.len() + 2);
        payload.push_str(line);
        payload.push_str(LINE_TERMINATOR);

        let result = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        result.map_err(|source| {
            if source.kind() == std::io::ErrorKind::BrokenPipe {
                WriteError::Exited { pid }
            } else {
                WriteError::Io { pid, source }
            }
        })
    }
}

#[cfg(windows)]
const LINE_TERMINATOR: &str = "\r\n";
#[cfg(not(windows))]
const LINE_TERMINATOR: &str = "\n";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    KillRequested,
}

/// Owns the `Child`: reaps it, or kills then reaps it on request (or when
/// the handle is dropped), then publishes the exit.
async fn watch_exit(
    mut child: Child,
    pid: u32,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = kill_rx => Waited::KillRequested,
    };

    let (status, killed) = match waited {
        Waited::Exited(status) => (status, false),
        Waited::KillRequested => {
            kill_tree(pid);
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid, "start_kill: {}", e);
            }
            (child.wait().await, true)
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(pid, "failed to reap process: {}", e);
            None
        }
    };

    tracing::info!(pid, ?code, killed, "process exited");
    let _ = exit_tx.send(Some(ExitInfo { code, killed }));
}

/// SIGKILL the whole process group the script leads.
#[cfg(unix)]
fn kill_tree(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!(pid, "killpg failed: {}", e),
    }
}

#[cfg(not(unix))]
fn kill_tree(_pid: u32) {}
