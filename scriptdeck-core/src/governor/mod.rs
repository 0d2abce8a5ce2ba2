//! Resource governor.
//!
//! Caps aggregate CPU / memory of everything a block launches. Each session
//! owns at most one group; it is created on the first successful start,
//! reused across restarts, and closed when the session goes away.
//!
//! Backends:
//! - `CgroupGovernor` (Linux, cgroup v2 delegation)
//! - `ProcessGroupGovernor` (Unix, process groups + RLIMIT_AS)
//! - `NoopGovernor` (accepts everything, enforces nothing)

#[cfg(target_os = "linux")]
pub mod cgroup;
#[cfg(unix)]
pub mod pgroup;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::BlockId;
use crate::config::ResourceLimits;
use crate::error::GovernorError;

#[cfg(target_os = "linux")]
pub use cgroup::CgroupGovernor;
#[cfg(unix)]
pub use pgroup::ProcessGroupGovernor;

/// Factory for OS-level resource groups.
pub trait ResourceGovernor: Send + Sync + std::fmt::Debug {
    fn backend(&self) -> &'static str;

    fn create_group(
        &self,
        block: BlockId,
        limits: &ResourceLimits,
    ) -> Result<Arc<dyn ResourceGroup>, GovernorError>;
}

/// One live group. Membership is transitive: children of an assigned
/// process are covered too.
pub trait ResourceGroup: Send + Sync + std::fmt::Debug {
    fn assign(&self, pid: u32) -> Result<(), GovernorError>;

    /// New ceilings for the processes assigned from now on (and, where the
    /// backend can, for the ones already inside).
    fn update_limits(&self, _limits: &ResourceLimits) -> Result<(), GovernorError> {
        Ok(())
    }

    /// Tear the group down, killing whatever is still inside. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Pick the strongest backend this host supports.
pub fn default_governor() -> Arc<dyn ResourceGovernor> {
    if let Some(cgroup) = cgroup_governor() {
        return cgroup;
    }
    fallback_governor()
}

#[cfg(target_os = "linux")]
fn cgroup_governor() -> Option<Arc<dyn ResourceGovernor>> {
    let cgroup = CgroupGovernor::detect()?;
    tracing::info!(root = %cgroup.root().display(), "using cgroup v2 resource governor");
    Some(Arc::new(cgroup))
}

#[cfg(not(target_os = "linux"))]
fn cgroup_governor() -> Option<Arc<dyn ResourceGovernor>> {
    None
}

#[cfg(unix)]
fn fallback_governor() -> Arc<dyn ResourceGovernor> {
    tracing::info!("using process-group resource governor");
    Arc::new(ProcessGroupGovernor::new())
}

#[cfg(not(unix))]
fn fallback_governor() -> Arc<dyn ResourceGovernor> {
    tracing::warn!("no resource governor available on this platform; limits are not enforced");
    Arc::new(NoopGovernor)
}

// ════════════════════════════════════════════════════════════════════
// Per-session slot
// ════════════════════════════════════════════════════════════════════

/// The session's view of its (at most one) resource group.
#[derive(Debug)]
pub struct GroupSlot {
    governor: Arc<dyn ResourceGovernor>,
    block: BlockId,
    group: Option<Arc<dyn ResourceGroup>>,
    limits: Option<ResourceLimits>,
}

impl GroupSlot {
    pub fn new(governor: Arc<dyn ResourceGovernor>, block: BlockId) -> Self {
        Self {
            governor,
            block,
            group: None,
            limits: None,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.governor.backend()
    }

    /// Return the session's group, creating it on first use.
    pub fn ensure(&mut self, limits: &ResourceLimits) -> Result<Arc<dyn ResourceGroup>, GovernorError> {
        if let Some(group) = self.group.as_ref().filter(|g| !g.is_closed()) {
            if self.limits.as_ref() != Some(limits) {
                group.update_limits(limits)?;
                self.limits = Some(*limits);
            }
            return Ok(group.clone());
        }

        let group = self.governor.create_group(self.block, limits)?;
        tracing::debug!(block = %self.block, backend = self.governor.backend(), "resource group created");
        self.group = Some(group.clone());
        self.limits = Some(*limits);
        Ok(group)
    }

    /// Ensure the group and put `pid` into it.
    pub fn assign(&mut self, limits: &ResourceLimits, pid: u32) -> Result<(), GovernorError> {
        self.ensure(limits)?.assign(pid)
    }

    pub fn is_open(&self) -> bool {
        self.group.as_ref().is_some_and(|g| !g.is_closed())
    }

    /// No-op when the group was never created or is already closed.
    pub fn close(&mut self) {
        if let Some(group) = self.group.take() {
            group.close();
            tracing::debug!(block = %self.block, "resource group closed");
        }
        self.limits = None;
    }
}

impl Drop for GroupSlot {
    fn drop(&mut self) {
        self.close();
    }
}

// ════════════════════════════════════════════════════════════════════
// No-op backend
// ════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGovernor;

impl ResourceGovernor for NoopGovernor {
    fn backend(&self) -> &'static str {
        "noop"
    }

    fn create_group(
        &self,
        _block: BlockId,
        _limits: &ResourceLimits,
    ) -> Result<Arc<dyn ResourceGroup>, GovernorError> {
        Ok(Arc::new(NoopGroup::default()))
    }
}

#[derive(Debug, Default)]
pub struct NoopGroup {
    closed: AtomicBool,
}

impl ResourceGroup for NoopGroup {
    fn assign(&self, _pid: u32) -> Result<(), GovernorError> {
        if self.is_closed() {
            return Err(GovernorError::Closed);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
