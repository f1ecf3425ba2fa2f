//! Process tree termination
//!
//! Workers launched in container mode (and some local setups) fork their own
//! children, so killing only the direct child would orphan them. Termination
//! walks the parent → child relation from a fresh process table snapshot,
//! signals every descendant (leaves first), then the root.
//!
//! Every operation here is idempotent: a pid that is already gone is not an
//! error.

use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};

/// How hard to ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM on unix.
    Graceful,
    /// SIGKILL on unix.
    Forced,
}

impl KillSignal {
    fn as_sysinfo(self) -> Signal {
        match self {
            Self::Graceful => Signal::Term,
            Self::Forced => Signal::Kill,
        }
    }
}

impl std::fmt::Display for KillSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graceful => write!(f, "graceful"),
            Self::Forced => write!(f, "forced"),
        }
    }
}

/// What a termination pass actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeKillReport {
    pub descendants_signalled: usize,
    pub root_signalled: bool,
}

/// Collect all descendants of `root`, ordered so that deeper processes come
/// after their ancestors.
fn descendants_of(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut ordered = Vec::new();
    let mut seen: HashSet<Pid> = HashSet::new();
    seen.insert(root);
    let mut frontier = vec![root];
    while let Some(current) = frontier.pop() {
        if let Some(kids) = children.get(&current) {
            for kid in kids {
                if seen.insert(*kid) {
                    ordered.push(*kid);
                    frontier.push(*kid);
                }
            }
        }
    }
    ordered
}

fn signal(system: &System, pid: Pid, signal: KillSignal) -> bool {
    match system.process(pid) {
        Some(process) if process.status() != ProcessStatus::Zombie => process
            .kill_with(signal.as_sysinfo())
            // Platforms without the requested signal fall back to a hard kill.
            .unwrap_or_else(|| process.kill()),
        _ => false,
    }
}

/// Terminate `pid` and all of its descendants. Blocking; scans the process
/// table.
pub fn terminate_tree_blocking(pid: u32, kill_signal: KillSignal) -> TreeKillReport {
    let root = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut report = TreeKillReport::default();
    let descendants = descendants_of(&system, root);

    // Leaves first so nothing gets re-parented to init mid-teardown.
    for child in descendants.iter().rev() {
        if signal(&system, *child, kill_signal) {
            report.descendants_signalled += 1;
        }
    }
    report.root_signalled = signal(&system, root, kill_signal);

    if report.root_signalled || report.descendants_signalled > 0 {
        log::info!(
            "[PROCESS_TREE] Sent {} termination to pid {} and {} descendant(s)",
            kill_signal,
            pid,
            report.descendants_signalled
        );
    } else {
        log::debug!("[PROCESS_TREE] Pid {} already gone, nothing to signal", pid);
    }
    report
}

/// Async wrapper that keeps the process table scan off the reactor.
pub async fn terminate_tree(pid: u32, kill_signal: KillSignal) -> TreeKillReport {
    match tokio::task::spawn_blocking(move || terminate_tree_blocking(pid, kill_signal)).await {
        Ok(report) => report,
        Err(e) => {
            log::error!("[PROCESS_TREE] Termination task for pid {} failed: {}", pid, e);
            TreeKillReport::default()
        }
    }
}

/// Whether `pid` still names a live (non-zombie) process.
pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dead_pid_is_a_noop() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let first = terminate_tree(pid, KillSignal::Graceful).await;
        let second = terminate_tree(pid, KillSignal::Forced).await;
        assert!(!first.root_signalled);
        assert_eq!(first, second);
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminates_descendants_and_root() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30 & wait")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        // Let the shell fork its sleepers.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let system = {
            let mut s = System::new();
            s.refresh_processes(ProcessesToUpdate::All, true);
            s
        };
        let descendants = descendants_of(&system, Pid::from_u32(pid));
        assert_eq!(descendants.len(), 2);

        let report = terminate_tree(pid, KillSignal::Graceful).await;
        assert_eq!(report.descendants_signalled, 2);

        tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("shell should exit once its tree is torn down")
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        for d in descendants {
            assert!(!is_alive(d.as_u32()));
        }
    }

    #[tokio::test]
    async fn test_graceful_then_forced_on_lone_process() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(is_alive(pid));

        let report = terminate_tree(pid, KillSignal::Graceful).await;
        assert!(report.root_signalled);
        assert_eq!(report.descendants_signalled, 0);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("sleep should exit on SIGTERM")
            .unwrap();
        assert!(!status.success());

        // Escalating after exit is harmless.
        let late = terminate_tree(pid, KillSignal::Forced).await;
        assert!(!late.root_signalled);
    }
}
