//! Engine root: owns the collaborators every block session shares and hands
//! them out explicitly.

use std::sync::Arc;

use crate::config::{BlockConfig, EngineSettings};
use crate::governor::{ResourceGovernor, default_governor};
use crate::process::probe_interpreter;
use crate::recovery::{PackageInstaller, PipInstaller};
use crate::session::BlockSession;
use crate::HostSink;

pub struct ScriptEngine {
    settings: Arc<EngineSettings>,
    governor: Arc<dyn ResourceGovernor>,
    installer: Arc<dyn PackageInstaller>,
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("interpreter", &self.settings.interpreter.program)
            .field("governor", &self.governor.backend())
            .field("installer", &self.installer)
            .finish()
    }
}

impl ScriptEngine {
    /// Defaults for everything: host-detected governor, pip installer.
    pub fn new(settings: EngineSettings) -> Self {
        Self::builder().settings(settings).build()
    }

    pub fn builder() -> ScriptEngineBuilder {
        ScriptEngineBuilder::default()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn governor_backend(&self) -> &'static str {
        self.governor.backend()
    }

    /// A fresh session. Nothing runs until the host calls `run` or arms the loop.
    pub fn create_session(&self, config: BlockConfig, sink: Arc<dyn HostSink>) -> BlockSession {
        tracing::debug!(block = %config.id, script = ?config.script_path, "creating block session");
        BlockSession::new(
            config,
            self.settings.clone(),
            self.governor.clone(),
            self.installer.clone(),
            sink,
        )
    }

    /// A session rebuilt from a persisted record; a stored loop is re-armed
    /// only if its script still exists.
    pub fn restore_session(&self, config: BlockConfig, sink: Arc<dyn HostSink>) -> BlockSession {
        let session = self.create_session(config, sink);
        if let Err(e) = session.restore_loop_state() {
            tracing::warn!(block = %session.id(), "loop not restored: {}", e);
        }
        session
    }

    /// `<interpreter> --version`, or `None` if it is not usable.
    pub async fn probe_interpreter(&self) -> Option<String> {
        probe_interpreter(&self.settings.interpreter, self.settings.probe_timeout()).await
    }
}

#[derive(Default)]
pub struct ScriptEngineBuilder {
    settings: Option<EngineSettings>,
    governor: Option<Arc<dyn ResourceGovernor>>,
    installer: Option<Arc<dyn PackageInstaller>>,
}

impl ScriptEngineBuilder {
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn governor(mut self, governor: Arc<dyn ResourceGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn build(self) -> ScriptEngine {
        let settings = self.settings.unwrap_or_default();
        let governor = self.governor.unwrap_or_else(default_governor);
        let installer = self.installer.unwrap_or_else(|| {
            Arc::new(PipInstaller::new(&settings.interpreter, settings.install_timeout()))
        });

        tracing::info!(
            interpreter = %settings.interpreter.program,
            governor = governor.backend(),
            auto_install = settings.auto_install_modules,
            "script engine ready"
        );

        ScriptEngine {
            settings: Arc::new(settings),
            governor,
            installer,
        }
    }
}
