// Process tree inspection.
//
// A supervised tree is the process group led by the spawned child plus every
// live descendant of that child (descendants may have moved to another group).

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid as NixPid};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

const KILL_ATTEMPTS: usize = 100;
const KILL_BACKOFF: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: i32,
    pub ppid: i32,
    pub pgid: i32,
    pub zombie: bool,
    pub cpu: Duration,
    pub rss_bytes: u64,
}

fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::nothing().with_memory().with_cpu()
}

/// Snapshot of every process on the host (threads excluded)
pub fn snapshot() -> Vec<ProcessEntry> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind());

    sys.processes()
        .values()
        .filter(|p| p.thread_kind().is_none())
        .map(|p| {
            let pid = p.pid().as_u32() as i32;
            ProcessEntry {
                pid,
                ppid: p.parent().map(|pp| pp.as_u32() as i32).unwrap_or(0),
                // The group can only be read while the pid exists; a vanished
                // process falls back to "not in any group".
                pgid: getpgid(Some(NixPid::from_raw(pid))).map(|g| g.as_raw()).unwrap_or(-1),
                zombie: matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
                cpu: Duration::from_millis(p.accumulated_cpu_time()),
                rss_bytes: p.memory(),
            }
        })
        .collect()
}

/// Live members of the tree rooted at `root` (which also leads its group)
pub fn tree_members(root: i32, processes: &[ProcessEntry]) -> Vec<ProcessEntry> {
    let mut children: HashMap<i32, Vec<&ProcessEntry>> = HashMap::new();
    for proc in processes {
        children.entry(proc.ppid).or_default().push(proc);
    }

    let mut seen = HashSet::new();
    let mut members = Vec::new();
    let mut stack: Vec<&ProcessEntry> = processes
        .iter()
        .filter(|p| p.pid == root || p.pgid == root)
        .collect();

    while let Some(proc) = stack.pop() {
        if !seen.insert(proc.pid) {
            continue;
        }
        if let Some(kids) = children.get(&proc.pid) {
            stack.extend(kids.iter().copied());
        }
        if !proc.zombie {
            members.push(proc.clone());
        }
    }
    members
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeUsage {
    pub processes: usize,
    pub cpu: Duration,
    pub rss_bytes: u64,
}

/// Aggregate usage of the tree rooted at `root`
pub fn sample_tree(root: i32) -> TreeUsage {
    let members = tree_members(root, &snapshot());
    TreeUsage {
        processes: members.len(),
        cpu: members.iter().map(|p| p.cpu).sum(),
        rss_bytes: members.iter().map(|p| p.rss_bytes).sum(),
    }
}

/// SIGKILL the whole tree until nothing in it is left running
pub fn kill_tree(root: i32) {
    for _ in 0..KILL_ATTEMPTS {
        let _ = killpg(NixPid::from_raw(root), Signal::SIGKILL);
        let members = tree_members(root, &snapshot());
        if members.is_empty() {
            return;
        }
        for member in &members {
            let _ = kill(NixPid::from_raw(member.pid), Signal::SIGKILL);
        }
        std::thread::sleep(KILL_BACKOFF);
    }
    tracing::warn!(root_pid = root, "process tree still alive after repeated SIGKILL");
}

/// True if the pid exists and has not yet exited
pub fn is_running(pid: i32) -> bool {
    let Ok(raw) = u32::try_from(pid) else {
        return false;
    };
    let pid = Pid::from_u32(raw);
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, ProcessRefreshKind::nothing());
    sys.process(pid)
        .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}
