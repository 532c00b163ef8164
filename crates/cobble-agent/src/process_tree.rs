use std::collections::HashSet;

use cobble_process::ServerStats;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Added to the score of anything that looks like a JVM, so a large helper
/// process never outranks the server itself.
const RUNTIME_NAME_BONUS: u64 = 100 * 1024 * 1024 * 1024;
const RUNTIME_NAMES: &[&str] = &["java", "openjdk"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub pid: u32,
    pub name: String,
    pub memory_bytes: u64,
}

impl Candidate {
    fn score(&self) -> u64 {
        let name = self.name.to_ascii_lowercase();
        let bonus = if RUNTIME_NAMES.iter().any(|n| name.contains(n)) {
            RUNTIME_NAME_BONUS
        } else {
            0
        };
        self.memory_bytes.saturating_add(bonus)
    }
}

/// The process that most likely is the actual server: largest footprint,
/// with JVMs strongly preferred. Ties go to the earlier candidate.
pub fn pick_server_process(candidates: &[Candidate]) -> Option<u32> {
    candidates
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.score().cmp(&b.score()).then(ib.cmp(ia)))
        .map(|(_, c)| c.pid)
}

/// All descendants of `root`, deepest first.
pub fn descendants(system: &System, root: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    collect_children(system, root, &mut out, &mut seen);
    out
}

fn collect_children(system: &System, parent: u32, out: &mut Vec<u32>, seen: &mut HashSet<u32>) {
    for (pid, process) in system.processes() {
        // Linux lists threads as tasks of their process; skip them.
        if process.thread_kind().is_some() || process.parent().map(|p| p.as_u32()) != Some(parent)
        {
            continue;
        }
        let child = pid.as_u32();
        if !seen.insert(child) {
            continue;
        }
        collect_children(system, child, out, seen);
        out.push(child);
    }
}

/// Holds a long-lived `System` so CPU usage has a previous sample to diff.
pub struct ProcessTree {
    system: std::sync::Mutex<System>,
}

impl Default for ProcessTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTree {
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(System::new()),
        }
    }

    /// Stats for the heaviest process in `root`'s subtree (root included).
    pub fn sample(&self, root: u32) -> Option<ServerStats> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes(ProcessesToUpdate::All, true);
        system.refresh_memory();

        let root_proc = system.process(Pid::from_u32(root))?;
        let mut candidates = vec![Candidate {
            pid: root,
            name: root_proc.name().to_string_lossy().to_string(),
            memory_bytes: root_proc.memory(),
        }];
        for pid in descendants(&system, root) {
            if let Some(p) = system.process(Pid::from_u32(pid)) {
                candidates.push(Candidate {
                    pid,
                    name: p.name().to_string_lossy().to_string(),
                    memory_bytes: p.memory(),
                });
            }
        }

        let pid = pick_server_process(&candidates)?;
        let p = system.process(Pid::from_u32(pid))?;
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f32;
        Some(ServerStats {
            pid: Some(pid),
            cpu_percent: (p.cpu_usage() / cores).clamp(0.0, 100.0),
            memory_bytes: p.memory(),
            memory_limit_bytes: system.total_memory(),
            uptime_secs: root_proc.run_time(),
        })
    }

    /// SIGKILLs every descendant (deepest first), then the root, then the
    /// root's process group. Returns how many pids were signalled.
    pub fn kill_tree(&self, root: u32, pgid: Option<i32>) -> usize {
        let victims = {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_processes(ProcessesToUpdate::All, true);
            let mut v = descendants(&system, root);
            v.push(root);
            v
        };

        let mut signalled = 0;
        for pid in &victims {
            if kill_pid(*pid) {
                signalled += 1;
            }
        }
        if let Some(pgid) = pgid.filter(|g| *g > 1) {
            kill_group(pgid);
        }
        tracing::debug!(root, pgid, signalled, "killed process tree");
        signalled
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> bool {
    let system = System::new_with_specifics(
        sysinfo::RefreshKind::nothing().with_processes(sysinfo::ProcessRefreshKind::nothing()),
    );
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|p| p.kill())
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(pid: u32, name: &str, mb: u64) -> Candidate {
        Candidate {
            pid,
            name: name.to_string(),
            memory_bytes: mb * 1024 * 1024,
        }
    }

    #[test]
    fn jvm_beats_larger_wrapper() {
        let cands = [c(10, "bash", 6000), c(11, "java", 2048), c(12, "tail", 1)];
        assert_eq!(pick_server_process(&cands), Some(11));
    }

    #[test]
    fn largest_wins_without_jvm() {
        let cands = [c(10, "sh", 2), c(11, "bedrock_server", 900)];
        assert_eq!(pick_server_process(&cands), Some(11));
        assert_eq!(pick_server_process(&[]), None);
    }

    #[test]
    fn openjdk_names_match_case_insensitively() {
        let cands = [c(1, "launcher", 50), c(2, "OpenJDK Platform binary", 10)];
        assert_eq!(pick_server_process(&cands), Some(2));
    }

    #[test]
    fn ties_prefer_the_root() {
        let cands = [c(1, "sh", 5), c(2, "sh", 5)];
        assert_eq!(pick_server_process(&cands), Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn samples_and_kills_a_shell_subtree() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30 & wait")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let tree = ProcessTree::new();
        let stats = tree.sample(pid).unwrap();
        assert!(stats.pid.is_some());
        assert!(stats.memory_limit_bytes > 0);

        let killed = tree.kill_tree(pid, None);
        assert!(killed >= 1);
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
