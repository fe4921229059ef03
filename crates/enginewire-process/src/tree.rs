//! Process-tree discovery and signalling on Unix.
//!
//! Linux reads parent ids from `/proc/<pid>/stat`; other Unix systems ask
//! `pgrep -P`. Both are rescanned until a pass finds nothing new, so children
//! forked while we walk are still caught.

use std::collections::BTreeSet;
#[cfg(target_os = "linux")]
use std::collections::HashMap;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SCAN_PASSES: usize = 8;

/// Every live descendant of `root`.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut found: Vec<u32> = Vec::new();
    let mut seen = BTreeSet::new();
    for _ in 0..MAX_SCAN_PASSES {
        let before = seen.len();
        let lookup = ChildLookup::snapshot();
        let mut frontier = vec![root];
        while let Some(pid) = frontier.pop() {
            for child in lookup.children(pid) {
                if seen.insert(child) {
                    found.push(child);
                }
                frontier.push(child);
            }
        }
        if seen.len() == before {
            break;
        }
    }
    trace!(root, count = found.len(), "descendants");
    found
}

/// Parent-to-children table built from one pass over `/proc`.
#[cfg(target_os = "linux")]
struct ChildLookup(HashMap<u32, Vec<u32>>);

#[cfg(target_os = "linux")]
impl ChildLookup {
    fn snapshot() -> Self {
        let mut table: HashMap<u32, Vec<u32>> = HashMap::new();
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Self(table);
        };
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(stat) = read_stat(pid) {
                if stat.state != 'Z' {
                    table.entry(stat.ppid).or_default().push(pid);
                }
            }
        }
        Self(table)
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        self.0.get(&pid).cloned().unwrap_or_default()
    }
}

/// Asks `pgrep -P` per parent.
#[cfg(not(target_os = "linux"))]
struct ChildLookup;

#[cfg(not(target_os = "linux"))]
impl ChildLookup {
    fn snapshot() -> Self {
        ChildLookup
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        let output = match std::process::Command::new("pgrep")
            .arg("-P")
            .arg(pid.to_string())
            .output()
        {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "pgrep unavailable");
                return Vec::new();
            }
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }
}

#[cfg(target_os = "linux")]
struct Stat {
    state: char,
    ppid: u32,
}

/// `/proc/<pid>/stat` is `pid (comm) state ppid ...`; `comm` may contain
/// spaces and parentheses, so split after the last `)`.
#[cfg(target_os = "linux")]
fn read_stat(pid: u32) -> Option<Stat> {
    let raw = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rest = &raw[raw.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some(Stat { state, ppid })
}

/// Whether `pid` still runs. Zombies count as gone where we can tell.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    read_stat(pid).is_none_or(|stat| matches!(stat.state, 'Z' | 'X'))
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Send `signal` to `pid`. A pid that is already gone is not an error.
pub fn signal(pid: u32, signal: i32) -> io::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: plain kill(2) on a positive pid.
    if unsafe { libc::kill(raw, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Signal a whole process group. Used as a final sweep for stragglers.
pub fn signal_group(pgid: u32, signal: i32) -> io::Result<()> {
    let raw = i32::try_from(pgid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: kill(2) with a negative pid addresses the process group.
    if unsafe { libc::kill(-raw, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Wait up to `timeout` for `pid` to exit.
pub fn wait_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM every pid, give each `grace` to exit, SIGKILL the survivors.
///
/// Returns the pids that needed SIGKILL.
pub fn terminate_all(pids: &[u32], grace: Duration) -> Vec<u32> {
    for &pid in pids {
        if let Err(err) = signal(pid, libc::SIGTERM) {
            warn!(pid, error = %err, "SIGTERM failed");
        }
    }
    let mut killed = Vec::new();
    for &pid in pids {
        if wait_gone(pid, grace) {
            continue;
        }
        debug!(pid, "escalating to SIGKILL");
        if let Err(err) = signal(pid, libc::SIGKILL) {
            warn!(pid, error = %err, "SIGKILL failed");
        }
        killed.push(pid);
    }
    killed
}

#[cfg(test)]
mod tests {
    use std::process::{Command, Stdio};

    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn reaped_child_is_gone() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!is_alive(pid));
        signal(pid, libc::SIGTERM).expect("gone pid is not an error");
    }

    #[test]
    fn finds_grandchildren() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30 & wait")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sh");
        let root = child.id();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut found = descendants(root);
        while found.len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
            found = descendants(root);
        }
        assert_eq!(found.len(), 2, "expected two sleep children, got {found:?}");

        let killed = terminate_all(&found, Duration::from_secs(2));
        assert!(killed.is_empty());
        for pid in &found {
            assert!(!is_alive(*pid));
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}
