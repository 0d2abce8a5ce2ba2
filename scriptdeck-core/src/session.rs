//! Block session: the per-block orchestrator the host talks to.
//!
//! Composes the process runner, output relay, dependency recovery, resource
//! governor and loop scheduler into one state machine. At most one process
//! is alive per session; control operations (`run`, `stop`, `dispose` and
//! the recovery restart) are serialised on one async lock.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{BlockConfig, EngineSettings, ResourceLimits};
use crate::error::SessionError;
use crate::governor::{GroupSlot, ResourceGovernor};
use crate::process::{ExitInfo, ProcessHandle, ProcessRunner, ProcessSpec, TreeUsage, sample_tree};
use crate::recovery::{DependencyRecovery, PackageInstaller, RecoveryAttempt, RecoveryTicket};
use crate::relay::{OutputRelay, pump_stderr, pump_stdout};
use crate::scheduler::LoopScheduler;
use crate::state::{SessionState, StateCell};
use crate::{BlockId, HostSink, SessionEvent};

pub const MSG_FILE_NOT_FOUND: &str = "File not found or not selected!";
pub const MSG_NO_PROCESS: &str = "No running process to receive input.";
pub const MSG_STARTUP_ERROR: &str = "Python startup error:";
pub const INPUT_ECHO_PREFIX: &str = ">>> ";

/// Upper bound on draining the pipes after the process is gone.
const DRAIN_WAIT: Duration = Duration::from_secs(2);
const USAGE_WINDOW: Duration = Duration::from_millis(250);

/// What `run` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Started { run: u64, pid: u32 },
    /// Path empty or file missing; nothing was touched.
    ScriptMissing,
    /// Interpreter or script could not be launched; reported to the host.
    SpawnFailed,
    /// The session was in a state that cannot start a run.
    Refused(SessionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOrigin {
    Host,
    Recovery,
}

#[derive(Debug, Clone)]
struct SessionConfig {
    script_path: Option<PathBuf>,
    is_looping: bool,
    loop_interval_secs: f64,
    limits: Option<ResourceLimits>,
}

#[derive(Debug)]
struct ActiveRun {
    run: u64,
    handle: Arc<ProcessHandle>,
    stop_requested: bool,
    /// Flips to `true` once the monitor has finished the run.
    done: watch::Receiver<bool>,
}

struct Inner {
    id: BlockId,
    settings: Arc<EngineSettings>,
    runner: ProcessRunner,
    installer: Arc<dyn PackageInstaller>,
    group: Mutex<GroupSlot>,
    relay: Arc<OutputRelay>,
    state: StateCell,
    config: Mutex<SessionConfig>,
    control: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveRun>>,
    recovery: DependencyRecovery,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
    scheduler: LoopScheduler,
    runs: AtomicU64,
}

/// Handle to one block. Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct BlockSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BlockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSession")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .field("governor", &self.inner.lock_group().backend())
            .finish()
    }
}

impl BlockSession {
    pub(crate) fn new(
        config: BlockConfig,
        settings: Arc<EngineSettings>,
        governor: Arc<dyn ResourceGovernor>,
        installer: Arc<dyn PackageInstaller>,
        sink: Arc<dyn HostSink>,
    ) -> Self {
        let id = config.id;
        let runner = ProcessRunner::new(settings.stop_grace(), settings.kill_wait());
        let recovery = DependencyRecovery::new(settings.interpreter.missing_module_signature.clone());

        let inner = Inner {
            id,
            runner,
            installer,
            group: Mutex::new(GroupSlot::new(governor, id)),
            relay: Arc::new(OutputRelay::new(id, sink)),
            state: StateCell::new(id),
            config: Mutex::new(SessionConfig {
                script_path: config.script_path,
                is_looping: config.is_looping,
                loop_interval_secs: config.loop_interval_secs,
                limits: config.limits,
            }),
            control: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            recovery,
            recovery_task: Mutex::new(None),
            scheduler: LoopScheduler::new(),
            runs: AtomicU64::new(0),
            settings,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> BlockId {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    /// A process of this session is alive.
    pub fn is_running(&self) -> bool {
        self.inner
            .lock_active()
            .as_ref()
            .is_some_and(|a| !a.handle.has_exited())
    }

    pub fn output_text(&self) -> String {
        self.inner.relay.text()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock_active().as_ref().map(|a| a.handle.pid())
    }

    /// Snapshot in the host's persistence shape.
    pub fn config(&self) -> BlockConfig {
        let cfg = self.inner.lock_config().clone();
        BlockConfig {
            id: self.inner.id,
            script_path: cfg.script_path,
            is_looping: cfg.is_looping,
            loop_interval_secs: cfg.loop_interval_secs,
            limits: cfg.limits,
        }
    }

    pub fn set_script_path(&self, path: Option<PathBuf>) -> Result<(), SessionError> {
        self.inner.ensure_live()?;
        self.inner.lock_config().script_path = path;
        Ok(())
    }

    /// Applied to the group at the next run.
    pub fn set_limits(&self, limits: Option<ResourceLimits>) -> Result<(), SessionError> {
        self.inner.ensure_live()?;
        self.inner.lock_config().limits = limits;
        Ok(())
    }

    /// Start the script, replacing any run in progress.
    pub async fn run(&self) -> Result<RunStatus, SessionError> {
        let inner = &self.inner;
        inner.ensure_live()?;
        inner.cancel_recovery();
        inner.scheduler.cancel_pending();

        let _control = inner.control.lock().await;
        inner.ensure_live()?;
        inner.start_locked(RunOrigin::Host).await
    }

    /// Close stdin; with `force_kill`, also kill the process tree and wait
    /// for it. Stopping an idle session does nothing.
    pub async fn stop(&self, force_kill: bool) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.ensure_live()?;
        inner.cancel_recovery();
        inner.scheduler.cancel_pending();

        let _control = inner.control.lock().await;
        inner.ensure_live()?;
        inner.halt(force_kill, true).await;
        Ok(())
    }

    /// Write one line to the script. Returns whether it was delivered.
    pub async fn send_input(&self, text: &str) -> Result<bool, SessionError> {
        let inner = &self.inner;
        inner.ensure_live()?;

        // A process waiting on a recovery install is still alive and reading.
        let handle = inner
            .lock_active()
            .as_ref()
            .map(|a| a.handle.clone())
            .filter(|h| !h.has_exited());
        let Some(handle) = handle else {
            inner.relay.push_status_line(MSG_NO_PROCESS);
            return Ok(false);
        };

        match inner.runner.write_line(&handle, text).await {
            Ok(()) => {
                let echoed = text.trim_end_matches(['\r', '\n']);
                inner.relay.push_status_line(&format!("{INPUT_ECHO_PREFIX}{echoed}"));
                Ok(true)
            }
            Err(e) => {
                tracing::debug!(block = %inner.id, "input dropped: {}", e);
                Ok(false)
            }
        }
    }

    /// Arm the loop. When idle, the first run comes after one interval.
    pub fn arm_loop(&self, interval: Duration) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.ensure_live()?;
        inner.scheduler.arm(interval)?;

        let stem = {
            let mut cfg = inner.lock_config();
            cfg.is_looping = true;
            cfg.loop_interval_secs = interval.as_secs_f64();
            cfg.script_path
                .as_deref()
                .and_then(|p| p.file_stem())
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        inner
            .relay
            .push_status_line(&loop_status_line(interval, &stem));
        tracing::info!(block = %inner.id, ?interval, "loop armed");

        if inner.state.get() == SessionState::Idle && !inner.scheduler.has_pending() {
            inner.schedule_loop();
        }
        Ok(())
    }

    /// Cancel the pending wait; a run in flight finishes without a successor.
    pub fn disarm_loop(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.ensure_live()?;
        inner.scheduler.disarm();
        inner.lock_config().is_looping = false;
        tracing::info!(block = %inner.id, "loop disarmed");
        Ok(())
    }

    /// Takes effect from the next wait.
    pub fn set_loop_interval(&self, interval: Duration) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.ensure_live()?;
        inner.scheduler.set_interval(interval)?;
        inner.lock_config().loop_interval_secs = interval.as_secs_f64();
        Ok(())
    }

    pub fn is_looping(&self) -> bool {
        self.inner.scheduler.is_armed()
    }

    /// Re-arm a loop persisted by the host, but only if the script is still
    /// there. Otherwise looping is switched off. Returns whether it armed.
    pub fn restore_loop_state(&self) -> Result<bool, SessionError> {
        self.inner.ensure_live()?;
        let cfg = self.config();

        if cfg.is_looping && cfg.script_exists() {
            if let Some(interval) = cfg.loop_interval() {
                self.arm_loop(interval)?;
                return Ok(true);
            }
            tracing::warn!(block = %cfg.id, secs = cfg.loop_interval_secs, "stored loop interval is not usable");
        } else if cfg.is_looping {
            tracing::info!(block = %cfg.id, "script is gone, not restoring loop");
        }

        self.inner.scheduler.disarm();
        self.inner.lock_config().is_looping = false;
        Ok(false)
    }

    /// Aggregate usage of the running process tree.
    pub async fn resource_usage(&self) -> Result<Option<TreeUsage>, SessionError> {
        self.inner.ensure_live()?;
        let Some(pid) = self.pid() else {
            return Ok(None);
        };
        Ok(sample_tree(pid, USAGE_WINDOW).await)
    }

    /// Hard stop, close the resource group, refuse everything afterwards.
    pub async fn dispose(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.ensure_live()?;
        inner.scheduler.disarm();
        inner.cancel_recovery();

        let _control = inner.control.lock().await;
        inner.ensure_live()?;
        inner.halt(true, true).await;
        inner.lock_group().close();
        inner.state.transition(SessionState::Disposed, inner.sink());
        tracing::info!(block = %inner.id, "session disposed");
        Ok(())
    }
}

pub fn loop_status_line(interval: Duration, file_stem: &str) -> String {
    format!(
        "Loop: ON | Interval: {}s | File: {}",
        interval.as_secs_f64(),
        file_stem
    )
}

// ════════════════════════════════════════════════════════════════════
// Internals
// ════════════════════════════════════════════════════════════════════

impl Inner {
    fn sink(&self) -> &dyn HostSink {
        self.relay.sink().as_ref()
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.state.get() == SessionState::Disposed {
            return Err(SessionError::Disposed(self.id));
        }
        Ok(())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, SessionConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_group(&self) -> std::sync::MutexGuard<'_, GroupSlot> {
        self.group.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_recovery(&self) {
        self.recovery.reset();
        let task = self
            .recovery_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Caller holds `control`.
    async fn start_locked(self: &Arc<Self>, origin: RunOrigin) -> Result<RunStatus, SessionError> {
        let (script, limits) = {
            let cfg = self.lock_config();
            let limits = cfg.limits.unwrap_or(self.settings.default_limits);
            (cfg.script_path.clone(), limits)
        };

        let Some(script) = script.filter(|p| !p.as_os_str().is_empty() && p.is_file()) else {
            tracing::info!(block = %self.id, "run skipped, script not found");
            self.relay.replace(MSG_FILE_NOT_FOUND);
            if origin == RunOrigin::Recovery {
                self.halt(true, false).await;
                self.state
                    .transition_from(SessionState::Recovering, SessionState::Idle, self.sink());
            }
            return Ok(RunStatus::ScriptMissing);
        };

        self.halt(true, origin == RunOrigin::Host).await;

        if !self.state.transition(SessionState::Starting, self.sink()) {
            let current = self.state.get();
            self.ensure_live()?;
            tracing::warn!(block = %self.id, ?current, "cannot start a run from this state");
            return Ok(RunStatus::Refused(current));
        }

        self.relay.begin_run();
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let spec = ProcessSpec::for_script(&self.settings.interpreter, &script);

        let (handle, streams) = match self.runner.start(&spec) {
            Ok(started) => started,
            Err(e) => {
                tracing::warn!(block = %self.id, "failed to start script: {}", e);
                self.relay.push_status_line(&format!("{MSG_STARTUP_ERROR} {e}"));
                self.state.transition(SessionState::Idle, self.sink());
                return Ok(RunStatus::SpawnFailed);
            }
        };
        let pid = handle.pid();
        let handle = Arc::new(handle);

        if let Err(e) = self.lock_group().assign(&limits, pid) {
            tracing::warn!(block = %self.id, pid, "running without resource limits: {}", e);
        }

        let (done_tx, done_rx) = watch::channel(false);
        *self.lock_active() = Some(ActiveRun {
            run,
            handle: handle.clone(),
            stop_requested: false,
            done: done_rx,
        });

        self.state.transition(SessionState::Running, self.sink());
        self.sink().emit(SessionEvent::RunStarted {
            block: self.id,
            run,
            pid,
        });

        let stdout_task = tokio::spawn(pump_stdout(streams.stdout, self.relay.clone()));
        let weak = Arc::downgrade(self);
        let stderr_task = tokio::spawn(pump_stderr(streams.stderr, move |line| {
            if let Some(inner) = weak.upgrade() {
                inner.on_stderr_line(line);
            }
        }));
        tokio::spawn(monitor(
            Arc::downgrade(self),
            run,
            handle,
            [stdout_task, stderr_task],
            done_tx,
        ));

        tracing::info!(block = %self.id, run, pid, ?origin, "run started");
        Ok(RunStatus::Started { run, pid })
    }

    /// Stop the active process, if any. With `transition` the session goes
    /// through `Stopping`; without it the current state is kept (recovery
    /// replacing its own run). Caller holds `control`.
    async fn halt(self: &Arc<Self>, force_kill: bool, transition: bool) {
        let target = {
            let mut active = self.lock_active();
            active.as_mut().map(|a| {
                a.stop_requested = true;
                (a.run, a.handle.clone(), a.done.clone())
            })
        };

        let Some((run, handle, done)) = target else {
            if transition {
                self.state
                    .transition_from(SessionState::Recovering, SessionState::Idle, self.sink());
            }
            return;
        };

        if transition {
            let sink = self.sink();
            let _ = self.state.transition_from(SessionState::Running, SessionState::Stopping, sink)
                || self.state.transition_from(SessionState::Recovering, SessionState::Stopping, sink)
                || self.state.transition_from(SessionState::Starting, SessionState::Stopping, sink);
        }

        if let Err(e) = self.runner.stop(&handle, force_kill).await {
            tracing::debug!(block = %self.id, "stop: {}", e);
        }

        if force_kill {
            self.await_done(run, &handle, done).await;
        }
    }

    async fn await_done(self: &Arc<Self>, run: u64, handle: &ProcessHandle, mut done: watch::Receiver<bool>) {
        let limit = self.settings.kill_wait() + DRAIN_WAIT;
        let finished = matches!(
            tokio::time::timeout(limit, done.wait_for(|d| *d)).await,
            Ok(Ok(_))
        );
        if !finished {
            tracing::debug!(block = %self.id, run, "monitor did not report, finishing run here");
            self.finish_run(run, handle.exit_info());
        }
    }

    /// Exactly once per run, whoever gets here first.
    fn finish_run(self: &Arc<Self>, run: u64, exit: Option<ExitInfo>) {
        let finished = {
            let mut active = self.lock_active();
            if active.as_ref().is_some_and(|a| a.run == run) {
                active.take()
            } else {
                None
            }
        };
        let Some(finished) = finished else {
            return;
        };

        let exit_code = exit.and_then(|e| e.code);
        // No exit info means the wait gave up after a forced stop.
        let killed = exit.is_none_or(|e| e.killed);
        tracing::info!(block = %self.id, run, ?exit_code, killed, "run finished");
        self.sink().emit(SessionEvent::RunFinished {
            block: self.id,
            run,
            exit_code,
            killed,
        });

        let sink = self.sink();
        if self.state.transition_from(SessionState::Stopping, SessionState::Idle, sink) {
            return;
        }
        // A Recovering session is finished by its recovery task.
        if self.state.transition_from(SessionState::Running, SessionState::Idle, sink)
            && !finished.stop_requested
        {
            self.schedule_loop();
        }
    }

    fn schedule_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let scheduled = self.scheduler.schedule(move || async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let session = BlockSession { inner };
            if let Err(e) = session.run().await {
                tracing::debug!(block = %session.id(), "loop run skipped: {}", e);
            }
        });
        if scheduled {
            tracing::debug!(block = %self.id, interval = ?self.scheduler.interval(), "next loop run scheduled");
        }
    }

    fn on_stderr_line(self: &Arc<Self>, line: String) {
        let ticket = if self.settings.auto_install_modules {
            self.recovery.try_begin(&line)
        } else {
            None
        };
        if let Some(ticket) = ticket {
            let sink = self.sink();
            if self.recovery.mark_installing(&ticket)
                && self
                    .state
                    .transition_from(SessionState::Running, SessionState::Recovering, sink)
            {
                self.relay
                    .push_autofix_line(&format!("Installing missing module: {}...", ticket.module));
                tracing::info!(block = %self.id, module = %ticket.module, "missing module detected");

                let mut slot = self.recovery_task.lock().unwrap_or_else(|e| e.into_inner());
                *slot = Some(tokio::spawn(recover(Arc::downgrade(self), ticket)));
                return;
            }
            self.recovery.finish(&ticket);
        }

        self.relay.push_error_line(&line);
    }

    async fn complete_recovery(self: &Arc<Self>, ticket: RecoveryTicket, attempt: RecoveryAttempt) {
        if !self.recovery.is_current(&ticket) {
            return;
        }
        let _control = self.control.lock().await;
        if !self.recovery.is_current(&ticket) {
            return;
        }

        if attempt.success && self.recovery.mark_restarting(&ticket) {
            self.relay.push_autofix_line(&format!(
                "Successfully installed {}. Restarting script...",
                attempt.module
            ));
            self.halt(true, false).await;
            self.recovery.finish(&ticket);
            if let Err(e) = self.start_locked(RunOrigin::Recovery).await {
                tracing::debug!(block = %self.id, "restart after install skipped: {}", e);
            }
            return;
        }

        self.relay
            .push_autofix_line(&format!("Failed to install {}.", attempt.module));
        self.halt(true, false).await;
        self.recovery.finish(&ticket);
        if self
            .state
            .transition_from(SessionState::Recovering, SessionState::Idle, self.sink())
        {
            self.schedule_loop();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.scheduler.disarm();
        let task = self
            .recovery_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        let active = self.active.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(active) = active {
            active.handle.request_kill();
        }
        // GroupSlot closes the group on drop.
    }
}

/// Wait for exit, drain the pipes, then finish the run.
async fn monitor(
    session: Weak<Inner>,
    run: u64,
    handle: Arc<ProcessHandle>,
    pumps: [JoinHandle<()>; 2],
    done: watch::Sender<bool>,
) {
    let exit = handle.wait().await;

    let aborts = pumps.each_ref().map(JoinHandle::abort_handle);
    let drained = tokio::time::timeout(DRAIN_WAIT, async {
        for pump in pumps {
            let _ = pump.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::debug!(run, "output pumps did not drain, aborting them");
        for abort in aborts {
            abort.abort();
        }
    }

    if let Some(inner) = session.upgrade() {
        inner.finish_run(run, Some(exit));
    }
    done.send_replace(true);
}

async fn recover(session: Weak<Inner>, ticket: RecoveryTicket) {
    let Some(installer) = session.upgrade().map(|s| s.installer.clone()) else {
        return;
    };
    let success = installer.install(&ticket.module).await;
    let attempt = RecoveryAttempt {
        module: ticket.module.clone(),
        success,
    };
    tracing::info!(module = %attempt.module, success, "dependency install finished");

    if let Some(inner) = session.upgrade() {
        inner.complete_recovery(ticket, attempt).await;
    }
}
