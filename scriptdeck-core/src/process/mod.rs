//! External interpreter processes: launch, feed, stop, observe.

pub mod probe;
pub mod runner;
pub mod usage;

pub use probe::probe_interpreter;
pub use runner::{ExitInfo, ProcessHandle, ProcessRunner, ProcessSpec, ProcessStreams};
pub use usage::{TreeUsage, sample_tree};
