//! Aggregate CPU / memory usage of a process and its descendants.

use std::time::Duration;

/// Usage of a whole process tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeUsage {
    pub processes: usize,
    pub memory_mb: u64,
    /// Share of the whole machine (all logical CPUs = 100 %).
    pub cpu_percent: f64,
}

/// Sample the tree rooted at `root` over `window`.
/// `None` when the root is gone or the platform has no `/proc`.
pub async fn sample_tree(root: u32, window: Duration) -> Option<TreeUsage> {
    let before = tokio::task::spawn_blocking(move || imp::snapshot(root))
        .await
        .ok()??;
    tokio::time::sleep(window).await;
    let after = tokio::task::spawn_blocking(move || imp::snapshot(root))
        .await
        .ok()??;

    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get()) as f64;
    let secs = window.as_secs_f64().max(f64::EPSILON);
    let delta = after.cpu_ticks.saturating_sub(before.cpu_ticks) as f64;
    let cpu_percent = delta / imp::clock_ticks_per_sec() / secs * 100.0 / cpus;

    Some(TreeUsage {
        processes: after.processes,
        memory_mb: after.rss_kb / 1024,
        cpu_percent,
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    processes: usize,
    rss_kb: u64,
    cpu_ticks: u64,
}

#[cfg(target_os = "linux")]
mod imp {
    use super::Snapshot;
    use std::collections::HashMap;
    use std::fs;

    pub(super) fn clock_ticks_per_sec() -> f64 {
        use nix::unistd::{SysconfVar, sysconf};
        match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(ticks)) if ticks > 0 => ticks as f64,
            _ => 100.0,
        }
    }

    struct StatLine {
        ppid: u32,
        ticks: u64,
    }

    /// `/proc/<pid>/stat`: the command name may contain spaces, so fields are
    /// counted from the closing paren.
    fn read_stat(pid: u32) -> Option<StatLine> {
        let raw = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let after_comm = &raw[raw.rfind(')')? + 1..];
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        // fields[0] = state, [1] = ppid, [11] = utime, [12] = stime
        let ppid = fields.get(1)?.parse().ok()?;
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(StatLine {
            ppid,
            ticks: utime + stime,
        })
    }

    fn read_rss_kb(pid: u32) -> u64 {
        let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")) else {
            return 0;
        };
        status
            .lines()
            .find_map(|l| l.strip_prefix("VmRSS:"))
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub(super) fn snapshot(root: u32) -> Option<Snapshot> {
        let mut stats: HashMap<u32, StatLine> = HashMap::new();
        for entry in fs::read_dir("/proc").ok()?.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(stat) = read_stat(pid) {
                stats.insert(pid, stat);
            }
        }

        if !stats.contains_key(&root) {
            return None;
        }

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, stat) in &stats {
            children.entry(stat.ppid).or_default().push(*pid);
        }

        let mut snap = Snapshot::default();
        let mut stack = vec![root];
        while let Some(pid) = stack.pop() {
            if let Some(stat) = stats.get(&pid) {
                snap.processes += 1;
                snap.cpu_ticks += stat.ticks;
                snap.rss_kb += read_rss_kb(pid);
            }
            if let Some(kids) = children.get(&pid) {
                stack.extend(kids.iter().copied());
            }
        }
        Some(snap)
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::Snapshot;

    pub(super) fn clock_ticks_per_sec() -> f64 {
        100.0
    }

    pub(super) fn snapshot(_root: u32) -> Option<Snapshot> {
        None
    }
}
