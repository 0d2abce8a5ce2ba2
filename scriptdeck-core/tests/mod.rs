use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use scriptdeck_core::config::load_layout;
use scriptdeck_core::error::GovernorError;
use scriptdeck_core::governor::{GroupSlot, NoopGovernor, NoopGroup};
use scriptdeck_core::relay::{OutputRelay, pump_stdout};
use scriptdeck_core::scheduler::LoopScheduler;
use scriptdeck_core::{
    BlockConfig, BlockId, EngineSettings, InterpreterConfig, PackageInstaller, PipInstaller,
    ResourceGovernor, ResourceGroup, ResourceLimits, RunStatus, ScriptEngine, SessionError,
    SessionEvent, SessionState,
};

// ============================================================================
// Helpers
// ============================================================================

const SIGNATURE_LINE: &str = "ModuleNotFoundError: No module named 'requests'";

/// Counts groups and remembers which pids went where.
#[derive(Debug, Default)]
struct RecordingGovernor {
    created: AtomicUsize,
    groups: Mutex<Vec<Arc<NoopGroup>>>,
    assigned: Arc<Mutex<Vec<u32>>>,
}

impl RecordingGovernor {
    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn assigned(&self) -> Vec<u32> {
        self.assigned.lock().unwrap().clone()
    }

    fn all_closed(&self) -> bool {
        self.groups.lock().unwrap().iter().all(|g| g.is_closed())
    }
}

#[derive(Debug)]
struct RecordingGroup {
    inner: Arc<NoopGroup>,
    assigned: Arc<Mutex<Vec<u32>>>,
}

impl ResourceGroup for RecordingGroup {
    fn assign(&self, pid: u32) -> Result<(), GovernorError> {
        self.inner.assign(pid)?;
        self.assigned.lock().unwrap().push(pid);
        Ok(())
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl ResourceGovernor for RecordingGovernor {
    fn backend(&self) -> &'static str {
        "recording"
    }

    fn create_group(
        &self,
        _block: BlockId,
        _limits: &ResourceLimits,
    ) -> Result<Arc<dyn ResourceGroup>, GovernorError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::new(NoopGroup::default());
        self.groups.lock().unwrap().push(inner.clone());
        Ok(Arc::new(RecordingGroup {
            inner,
            assigned: self.assigned.clone(),
        }))
    }
}

/// Records every install; optionally blocks until released.
#[derive(Debug)]
struct CountingInstaller {
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
    succeed: bool,
}

impl CountingInstaller {
    fn new(succeed: bool) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            gate: None,
            succeed,
        }
    }

    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(true)
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageInstaller for CountingInstaller {
    async fn install(&self, module: &str) -> bool {
        self.calls.lock().unwrap().push(module.to_string());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.succeed
    }
}

struct Harness {
    engine: ScriptEngine,
    governor: Arc<RecordingGovernor>,
    installer: Arc<CountingInstaller>,
}

fn sh_settings() -> EngineSettings {
    EngineSettings {
        interpreter: InterpreterConfig::bare("sh"),
        ..EngineSettings::default()
    }
}

fn harness_with(settings: EngineSettings, installer: CountingInstaller) -> Harness {
    let governor = Arc::new(RecordingGovernor::default());
    let installer = Arc::new(installer);
    let engine = ScriptEngine::builder()
        .settings(settings)
        .governor(governor.clone())
        .installer(installer.clone())
        .build();
    Harness {
        engine,
        governor,
        installer,
    }
}

fn harness() -> Harness {
    harness_with(sh_settings(), CountingInstaller::new(true))
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[cfg(unix)]
fn write_executable(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = write_script(dir, name, body);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn runs_started(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::RunStarted { .. }))
        .count()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

// ============================================================================
// Run preconditions
// ============================================================================

#[tokio::test]
async fn test_missing_script_reports_and_spawns_nothing() {
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h
        .engine
        .create_session(BlockConfig::for_script("/definitely/not/here.py"), Arc::new(tx));

    let status = session.run().await.unwrap();

    assert_eq!(status, RunStatus::ScriptMissing);
    assert_eq!(session.output_text(), "File not found or not selected!");
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.pid().is_none());
    assert_eq!(h.governor.created(), 0);
    assert_eq!(runs_started(&drain(&mut rx)), 0);
}

#[tokio::test]
async fn test_empty_script_path_reports_and_stays_idle() {
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::default(), Arc::new(scriptdeck_core::NullSink));

    assert_eq!(session.run().await.unwrap(), RunStatus::ScriptMissing);
    assert_eq!(session.output_text(), "File not found or not selected!");
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(h.governor.created(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_missing_interpreter_is_a_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "hello.py", "print('hi')\n");
    let h = harness_with(
        EngineSettings {
            interpreter: InterpreterConfig::bare("scriptdeck-no-such-interpreter"),
            ..EngineSettings::default()
        },
        CountingInstaller::new(true),
    );
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    assert_eq!(session.run().await.unwrap(), RunStatus::SpawnFailed);
    assert!(session.output_text().starts_with("Python startup error:"));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(h.governor.created(), 0);
}

// ============================================================================
// Process lifecycle
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_run_then_force_stop_leaves_no_process() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "sleepy.sh", "sleep 30\n");
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    let RunStatus::Started { pid, .. } = session.run().await.unwrap() else {
        panic!("script did not start");
    };
    assert_eq!(session.state(), SessionState::Running);
    assert!(process_alive(pid));

    session.stop(true).await.unwrap();

    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.is_running());
    assert!(!process_alive(pid));
    assert_eq!(h.governor.assigned(), vec![pid]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_second_stop_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "sleepy.sh", "sleep 30\n");
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h.engine.create_session(BlockConfig::for_script(&script), Arc::new(tx));

    session.run().await.unwrap();
    session.stop(true).await.unwrap();
    let before = drain(&mut rx);
    assert!(before.contains(&SessionEvent::StateChanged {
        block: session.id(),
        state: SessionState::Idle,
    }));

    session.stop(true).await.unwrap();
    session.stop(false).await.unwrap();

    assert_eq!(session.state(), SessionState::Idle);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_stop_on_fresh_session_is_a_noop() {
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::default(), Arc::new(scriptdeck_core::NullSink));
    session.stop(true).await.unwrap();
    session.stop(false).await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);
}

#[cfg(unix)]
#[tokio::test]
async fn test_graceful_stop_closes_input_and_waits() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "reader.sh",
        "while read line; do echo \"got $line\"; done\necho closed\n",
    );
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    session.run().await.unwrap();
    session.stop(false).await.unwrap();

    wait_until("graceful exit", || session.state() == SessionState::Idle).await;
    assert!(session.output_text().contains("closed"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_replaces_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "sleepy.sh", "sleep 30\n");
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    let RunStatus::Started { pid: first, .. } = session.run().await.unwrap() else {
        panic!("first run did not start");
    };
    let RunStatus::Started { pid: second, .. } = session.run().await.unwrap() else {
        panic!("second run did not start");
    };

    assert_ne!(first, second);
    assert!(!process_alive(first));
    assert_eq!(session.pid(), Some(second));
    // One group, reused across runs.
    assert_eq!(h.governor.created(), 1);
    assert_eq!(h.governor.assigned(), vec![first, second]);

    session.dispose().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_exit_code_and_stderr_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fails.sh", "echo partial\necho oops >&2\nexit 3\n");
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h.engine.create_session(BlockConfig::for_script(&script), Arc::new(tx));

    session.run().await.unwrap();
    wait_until("exit", || session.state() == SessionState::Idle).await;

    let text = session.output_text();
    assert!(text.contains("partial"));
    assert!(text.contains("[Error] oops\n"));
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::RunFinished {
            exit_code: Some(3),
            killed: false,
            ..
        }
    )));
}

#[cfg(unix)]
#[tokio::test]
async fn test_forced_stop_reports_killed_run() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "sleepy.sh", "sleep 30\n");
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h.engine.create_session(BlockConfig::for_script(&script), Arc::new(tx));

    session.run().await.unwrap();
    session.stop(true).await.unwrap();

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::RunFinished { killed: true, .. }
    )));
}

#[cfg(unix)]
#[tokio::test]
async fn test_output_of_new_run_replaces_old_text() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "count.sh", "echo run-output\n");
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    session.run().await.unwrap();
    wait_until("first run", || session.state() == SessionState::Idle).await;
    session.run().await.unwrap();
    wait_until("second run", || session.state() == SessionState::Idle).await;

    assert_eq!(session.output_text(), "run-output\n");
}

// ============================================================================
// Output normalization
// ============================================================================

#[tokio::test]
async fn test_relay_normalizes_line_endings() {
    let relay = Arc::new(OutputRelay::new(
        uuid::Uuid::new_v4(),
        Arc::new(scriptdeck_core::NullSink),
    ));
    pump_stdout(&b"a\r\nb\n\nc"[..], relay.clone()).await;
    assert_eq!(relay.text(), "a\nb\nc");
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_output_is_normalized() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "crlf.sh", "printf 'a\\r\\nb\\n\\nc'\n");
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    session.run().await.unwrap();
    wait_until("exit", || session.state() == SessionState::Idle).await;
    assert_eq!(session.output_text(), "a\nb\nc");
}

// ============================================================================
// Input
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_send_input_writes_and_echoes() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "echo.sh", "read line\necho \"got $line\"\n");
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    session.run().await.unwrap();
    assert!(session.send_input("hello\r\n").await.unwrap());
    wait_until("exit", || session.state() == SessionState::Idle).await;

    let text = session.output_text();
    assert!(text.contains(">>> hello\n"));
    assert!(text.contains("got hello"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_send_input_without_process_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "idle.sh", "exit 0\n");
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    assert!(!session.send_input("anyone?").await.unwrap());
    assert!(session.output_text().contains("No running process to receive input."));
}

// ============================================================================
// Dependency recovery
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_missing_module_installs_once_and_restarts_once() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "if [ -f installed.marker ]; then echo restarted; exit 0; fi\n\
         echo \"{SIGNATURE_LINE}\" >&2\n\
         echo \"{SIGNATURE_LINE}\" >&2\n\
         exit 1\n"
    );
    let script = write_script(dir.path(), "needs_requests.sh", &body);
    let gate = Arc::new(Notify::new());
    let h = harness_with(sh_settings(), CountingInstaller::gated(gate.clone()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h.engine.create_session(BlockConfig::for_script(&script), Arc::new(tx));

    session.run().await.unwrap();

    // The duplicate arrives while the install is still pending.
    let duplicate = format!("[Error] {SIGNATURE_LINE}");
    wait_until("duplicate signature", || session.output_text().contains(&duplicate)).await;
    assert_eq!(session.state(), SessionState::Recovering);
    assert!(
        session
            .output_text()
            .contains("[AutoFix] Installing missing module: requests...")
    );

    std::fs::write(dir.path().join("installed.marker"), "").unwrap();
    gate.notify_one();

    wait_until("restarted run", || {
        session.state() == SessionState::Idle && session.output_text().contains("restarted")
    })
    .await;

    assert_eq!(h.installer.calls(), vec!["requests".to_string()]);
    assert_eq!(runs_started(&drain(&mut rx)), 2);
    // The restart starts from a clean buffer.
    assert_eq!(session.output_text(), "restarted\n");
    assert_eq!(h.governor.created(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_install_reports_and_does_not_retry() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("echo \"{SIGNATURE_LINE}\" >&2\nexit 1\n");
    let script = write_script(dir.path(), "needs_requests.sh", &body);
    let h = harness_with(sh_settings(), CountingInstaller::new(false));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h.engine.create_session(BlockConfig::for_script(&script), Arc::new(tx));

    session.run().await.unwrap();
    wait_until("failed recovery", || {
        session.state() == SessionState::Idle
            && session.output_text().contains("[AutoFix] Failed to install requests.")
    })
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.installer.calls(), vec!["requests".to_string()]);
    assert_eq!(runs_started(&drain(&mut rx)), 1);
    assert_eq!(session.state(), SessionState::Idle);
}

#[cfg(unix)]
#[tokio::test]
async fn test_auto_install_disabled_relays_error() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("echo \"{SIGNATURE_LINE}\" >&2\nexit 1\n");
    let script = write_script(dir.path(), "needs_requests.sh", &body);
    let h = harness_with(
        EngineSettings {
            auto_install_modules: false,
            ..sh_settings()
        },
        CountingInstaller::new(true),
    );
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    session.run().await.unwrap();
    wait_until("exit", || session.state() == SessionState::Idle).await;

    assert!(session.output_text().contains(&format!("[Error] {SIGNATURE_LINE}")));
    assert!(h.installer.calls().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_cancels_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("echo \"{SIGNATURE_LINE}\" >&2\nsleep 30\n");
    let script = write_script(dir.path(), "needs_requests.sh", &body);
    let gate = Arc::new(Notify::new());
    let h = harness_with(sh_settings(), CountingInstaller::gated(gate.clone()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h.engine.create_session(BlockConfig::for_script(&script), Arc::new(tx));

    session.run().await.unwrap();
    wait_until("recovery", || session.state() == SessionState::Recovering).await;

    session.stop(true).await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(runs_started(&drain(&mut rx)), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_input_reaches_process_while_recovering() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "echo \"{SIGNATURE_LINE}\" >&2\nread line\necho \"got $line\"\nsleep 30\n"
    );
    let script = write_script(dir.path(), "needs_requests.sh", &body);
    let gate = Arc::new(Notify::new());
    let h = harness_with(sh_settings(), CountingInstaller::gated(gate.clone()));
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    session.run().await.unwrap();
    wait_until("recovery", || session.state() == SessionState::Recovering).await;
    assert!(session.is_running());

    assert!(session.send_input("still here").await.unwrap());
    wait_until("reply", || session.output_text().contains("got still here")).await;
    assert!(!session.output_text().contains("No running process"));

    session.dispose().await.unwrap();
    gate.notify_one();
}

#[cfg(unix)]
#[tokio::test]
async fn test_pip_installer_uses_stderr_heuristic() {
    let dir = tempfile::tempdir().unwrap();
    let ok = write_executable(
        dir.path(),
        "fake-pip-ok",
        "#!/bin/sh\necho \"Successfully installed $1\"\nexit 1\n",
    );
    let bad = write_executable(
        dir.path(),
        "fake-pip-bad",
        "#!/bin/sh\necho \"ERROR: No matching distribution found for $1\" >&2\nexit 0\n",
    );

    let installer = |program: &Path| {
        let mut interpreter = InterpreterConfig::bare(program.to_string_lossy());
        interpreter.install_args = Vec::new();
        PipInstaller::new(&interpreter, Duration::from_secs(10))
    };

    // Exit codes are deliberately the opposite of the verdict.
    assert!(installer(&ok).install("requests").await);
    assert!(!installer(&bad).install("requests").await);
}

// ============================================================================
// Loop scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_loop_runs_once_after_interval() {
    let scheduler = LoopScheduler::new();
    scheduler.arm(Duration::from_secs(2)).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    // The previous run just exited.
    let r = runs.clone();
    assert!(scheduler.schedule(move || async move {
        r.fetch_add(1, Ordering::SeqCst);
    }));

    tokio::time::sleep(Duration::from_millis(1900)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disarm_before_interval_prevents_run() {
    let scheduler = LoopScheduler::new();
    scheduler.arm(Duration::from_secs(2)).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let r = runs.clone();
    scheduler.schedule(move || async move {
        r.fetch_add(1, Ordering::SeqCst);
    });
    scheduler.disarm();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(!scheduler.is_armed());
}

#[cfg(unix)]
#[tokio::test]
async fn test_session_loop_reruns_after_interval() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "tick.sh", "echo tick\n");
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h.engine.create_session(BlockConfig::for_script(&script), Arc::new(tx));

    session.arm_loop(Duration::from_millis(400)).unwrap();
    assert!(session.output_text().contains("Loop: ON | Interval: 0.4s | File: tick"));
    session.run().await.unwrap();

    wait_until("first run", || session.state() == SessionState::Idle).await;
    let idle_at = tokio::time::Instant::now();

    let second = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            if let SessionEvent::RunStarted { run: 2, .. } = event {
                return;
            }
        }
    })
    .await;
    assert!(second.is_ok(), "loop did not start a second run");
    assert!(idle_at.elapsed() >= Duration::from_millis(300));

    session.disarm_loop().unwrap();
    wait_until("second run", || session.state() == SessionState::Idle).await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert!(
        !drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::RunStarted { run: 3, .. }))
    );
    assert!(!session.is_looping());
}

#[cfg(unix)]
#[tokio::test]
async fn test_explicit_stop_cancels_pending_loop_run() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "tick.sh", "echo tick\n");
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = h.engine.create_session(BlockConfig::for_script(&script), Arc::new(tx));

    session.arm_loop(Duration::from_millis(300)).unwrap();
    session.run().await.unwrap();
    wait_until("first run", || session.state() == SessionState::Idle).await;

    session.stop(true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(runs_started(&drain(&mut rx)), 1);
    // Still armed: the next completed run schedules again.
    assert!(session.is_looping());
    session.dispose().await.unwrap();
}

#[test]
fn test_zero_loop_interval_is_rejected() {
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::default(), Arc::new(scriptdeck_core::NullSink));
    assert!(matches!(
        session.arm_loop(Duration::ZERO),
        Err(SessionError::Schedule(_))
    ));
    assert!(!session.is_looping());
}

// ============================================================================
// Loop restore
// ============================================================================

#[tokio::test]
async fn test_restore_forces_loop_off_when_script_is_gone() {
    let h = harness();
    let config = BlockConfig {
        is_looping: true,
        ..BlockConfig::for_script("/definitely/not/here.py")
    };
    let session = h
        .engine
        .restore_session(config, Arc::new(scriptdeck_core::NullSink));

    assert!(!session.is_looping());
    assert!(!session.config().is_looping);
}

#[tokio::test]
async fn test_restore_rearms_loop_for_existing_script() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "tick.sh", "echo tick\n");
    let h = harness();
    let config = BlockConfig {
        is_looping: true,
        loop_interval_secs: 60.0,
        ..BlockConfig::for_script(&script)
    };
    let session = h
        .engine
        .restore_session(config, Arc::new(scriptdeck_core::NullSink));

    assert!(session.is_looping());
    assert!(session.config().is_looping);
    // First run waits a full interval.
    assert_eq!(session.state(), SessionState::Idle);
    session.dispose().await.unwrap();
}

#[test]
fn test_layout_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("layout.json");
    std::fs::write(
        &path,
        r#"[{"script_path": "/tmp/a.py", "is_looping": true, "loop_interval_secs": 2.0},
            {"script_path": null}]"#,
    )
    .unwrap();

    let blocks = load_layout(&path).unwrap();
    assert_eq!(blocks.len(), 2);
    assert!(blocks[0].is_looping);
    assert_eq!(blocks[0].loop_interval(), Some(Duration::from_secs(2)));
    assert!(blocks[1].script_path.is_none());
    assert_ne!(blocks[0].id, blocks[1].id);
}

// ============================================================================
// Resource groups
// ============================================================================

#[test]
fn test_group_close_is_idempotent() {
    let group = NoopGovernor
        .create_group(uuid::Uuid::new_v4(), &ResourceLimits::default())
        .unwrap();
    group.close();
    group.close();
    assert!(group.is_closed());
    assert!(matches!(group.assign(1), Err(GovernorError::Closed)));
}

#[test]
fn test_closing_never_created_group_is_fine() {
    let mut slot = GroupSlot::new(Arc::new(NoopGovernor), uuid::Uuid::new_v4());
    slot.close();
    slot.close();
    assert!(!slot.is_open());
}

#[test]
fn test_slot_reuses_open_group() {
    let governor = Arc::new(RecordingGovernor::default());
    let mut slot = GroupSlot::new(governor.clone(), uuid::Uuid::new_v4());
    let limits = ResourceLimits::new(20, 128);

    slot.assign(&limits, 100).unwrap();
    slot.assign(&limits, 101).unwrap();
    assert_eq!(governor.created(), 1);
    assert_eq!(governor.assigned(), vec![100, 101]);

    slot.close();
    assert!(governor.all_closed());
    slot.assign(&limits, 102).unwrap();
    assert_eq!(governor.created(), 2);
}

#[cfg(unix)]
#[test]
fn test_process_group_close_is_idempotent() {
    use scriptdeck_core::governor::ProcessGroupGovernor;
    let group = ProcessGroupGovernor::new()
        .create_group(uuid::Uuid::new_v4(), &ResourceLimits::default())
        .unwrap();
    group.close();
    group.close();
    assert!(group.is_closed());
}

#[cfg(target_os = "linux")]
#[test]
fn test_process_group_applies_memory_ceiling() {
    use scriptdeck_core::governor::ProcessGroupGovernor;

    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    let group = ProcessGroupGovernor::new()
        .create_group(uuid::Uuid::new_v4(), &ResourceLimits::new(0, 64))
        .unwrap();
    group.assign(pid).unwrap();

    let limits = std::fs::read_to_string(format!("/proc/{pid}/limits")).unwrap();
    let row = limits
        .lines()
        .find(|l| l.starts_with("Max address space"))
        .expect("address space row");
    assert_eq!(row.split_whitespace().nth(3), Some("67108864"));

    child.kill().unwrap();
    child.wait().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn test_cgroup_group_writes_limits_and_members() {
    use scriptdeck_core::governor::CgroupGovernor;

    let root = tempfile::tempdir().unwrap();
    let block = uuid::Uuid::new_v4();
    let group = CgroupGovernor::new(root.path())
        .create_group(block, &ResourceLimits::new(20, 64))
        .unwrap();
    group.assign(4242).unwrap();

    let dir = root.path().join(format!("scriptdeck-{block}"));
    let read = |file: &str| std::fs::read_to_string(dir.join(file)).unwrap();
    assert_eq!(read("memory.max"), "67108864");
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get()) as u64;
    assert_eq!(read("cpu.max"), format!("{} 100000", 100_000 * cpus * 20 / 100));
    assert_eq!(read("cgroup.procs"), "4242");

    group.update_limits(&ResourceLimits::new(20, 128)).unwrap();
    assert_eq!(read("memory.max"), "134217728");
}

#[tokio::test]
async fn test_restore_with_oversized_interval_forces_loop_off() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "tick.sh", "echo tick\n");
    let config: BlockConfig = serde_json::from_value(serde_json::json!({
        "script_path": script,
        "is_looping": true,
        "loop_interval_secs": 1e300,
    }))
    .unwrap();
    let h = harness();
    let session = h
        .engine
        .restore_session(config, Arc::new(scriptdeck_core::NullSink));

    assert!(!session.is_looping());
    assert!(!session.config().is_looping);
    assert_eq!(session.state(), SessionState::Idle);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_resource_usage_of_running_tree() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "sleepy.sh", "sleep 30\n");
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    assert!(session.resource_usage().await.unwrap().is_none());
    session.run().await.unwrap();

    let usage = session.resource_usage().await.unwrap().expect("usage of a live tree");
    assert!(usage.processes >= 1);
    assert!(usage.cpu_percent >= 0.0);

    session.dispose().await.unwrap();
}

// ============================================================================
// Disposal
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_dispose_kills_closes_and_rejects() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "sleepy.sh", "sleep 30\n");
    let h = harness();
    let session = h
        .engine
        .create_session(BlockConfig::for_script(&script), Arc::new(scriptdeck_core::NullSink));

    let RunStatus::Started { pid, .. } = session.run().await.unwrap() else {
        panic!("script did not start");
    };
    session.dispose().await.unwrap();

    assert_eq!(session.state(), SessionState::Disposed);
    assert!(!process_alive(pid));
    assert!(h.governor.all_closed());

    assert!(matches!(session.run().await, Err(SessionError::Disposed(_))));
    assert!(matches!(session.stop(true).await, Err(SessionError::Disposed(_))));
    assert!(matches!(session.send_input("x").await, Err(SessionError::Disposed(_))));
    assert!(matches!(
        session.arm_loop(Duration::from_secs(1)),
        Err(SessionError::Disposed(_))
    ));
    assert!(matches!(session.disarm_loop(), Err(SessionError::Disposed(_))));
    assert!(matches!(session.dispose().await, Err(SessionError::Disposed(_))));
}

// ============================================================================
// Interpreter probe & settings
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_probe_reports_version() {
    let dir = tempfile::tempdir().unwrap();
    let fake = write_executable(dir.path(), "fakepy", "#!/bin/sh\necho 'Python 3.99.0'\n");
    let h = harness_with(
        EngineSettings {
            interpreter: InterpreterConfig::bare(fake.to_string_lossy()),
            ..EngineSettings::default()
        },
        CountingInstaller::new(true),
    );
    assert_eq!(h.engine.probe_interpreter().await.as_deref(), Some("Python 3.99.0"));
}

#[tokio::test]
async fn test_probe_missing_interpreter_is_unavailable() {
    let h = harness_with(
        EngineSettings {
            interpreter: InterpreterConfig::bare("scriptdeck-no-such-interpreter"),
            ..EngineSettings::default()
        },
        CountingInstaller::new(true),
    );
    assert!(h.engine.probe_interpreter().await.is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_probe_times_out_as_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let fake = write_executable(dir.path(), "hangpy", "#!/bin/sh\nexec sleep 30\n");
    let h = harness_with(
        EngineSettings {
            interpreter: InterpreterConfig::bare(fake.to_string_lossy()),
            probe_timeout_ms: 200,
            ..EngineSettings::default()
        },
        CountingInstaller::new(true),
    );

    let started = std::time::Instant::now();
    assert!(h.engine.probe_interpreter().await.is_none());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_settings_missing_or_malformed_fall_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(
        EngineSettings::load(dir.path().join("absent.json")),
        EngineSettings::default()
    );

    let broken = dir.path().join("broken.json");
    std::fs::write(&broken, "{ not json").unwrap();
    assert_eq!(EngineSettings::load(&broken), EngineSettings::default());
}

#[test]
fn test_settings_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("settings.json");
    let settings = EngineSettings {
        auto_install_modules: false,
        default_limits: ResourceLimits::new(25, 512),
        ..EngineSettings::default()
    };
    settings.save(&path).unwrap();
    assert_eq!(EngineSettings::load(&path), settings);
}
