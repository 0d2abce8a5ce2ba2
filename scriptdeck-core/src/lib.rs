pub mod config;
pub mod engine;
pub mod error;
pub mod governor;
pub mod process;
pub mod recovery;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod state;

// Re-export the main structs so hosts can just use `scriptdeck_core::ScriptEngine`
pub use config::{BlockConfig, EngineSettings, InterpreterConfig, ResourceLimits};
pub use engine::{ScriptEngine, ScriptEngineBuilder};
pub use error::{SessionError, SpawnError, StopError, WriteError};
pub use governor::{ResourceGovernor, ResourceGroup, default_governor};
pub use recovery::{PackageInstaller, PipInstaller};
pub use session::{BlockSession, RunStatus};
pub use state::SessionState;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque identity of a block, handed out by the host.
pub type BlockId = Uuid;

/// Everything the engine tells the host about one block.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    OutputCleared { block: BlockId },                  // Previous run's text was dropped
    Output { block: BlockId, text: String },           // Appended text (already normalized)
    StateChanged { block: BlockId, state: SessionState },
    RunStarted { block: BlockId, run: u64, pid: u32 },
    RunFinished {
        block: BlockId,
        run: u64,
        exit_code: Option<i32>,
        /// Ended by a stop request rather than on its own.
        killed: bool,
    },
}

/// Engine → Host channel. Implementations must not block.
pub trait HostSink: Send + Sync + 'static {
    fn emit(&self, event: SessionEvent);
}

impl HostSink for mpsc::UnboundedSender<SessionEvent> {
    fn emit(&self, event: SessionEvent) {
        // The host dropping its receiver just means nobody is watching anymore.
        let _ = self.send(event);
    }
}

/// A sink for hosts that only poll `BlockSession::output_text()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl HostSink for NullSink {
    fn emit(&self, _event: SessionEvent) {}
}
