//! Stale driver cleanup
//!
//! Browser drivers started by a node outlive it when the node is killed. Its known driver
//! children are looked up with `pgrep -P` before the node is stopped and killed afterwards.

use localgrid_common::{KnownProcess, OsFamily};
use tracing::{debug, info, warn};

/// A child process reported by `pgrep -l`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildProcess {
    pub pid: u32,
    pub name: String,
}

/// Parse `pgrep -l` output (`<pid> <name>` per line)
pub fn parse_pgrep(output: &str) -> Vec<ChildProcess> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let name = parts.next()?.to_string();
            Some(ChildProcess { pid, name })
        })
        .collect()
}

/// Children whose image name is one of the known drivers
pub fn known_drivers(children: Vec<ChildProcess>, os: OsFamily) -> Vec<ChildProcess> {
    children
        .into_iter()
        .filter(|child| {
            KnownProcess::ALL
                .iter()
                .any(|p| p.image_name(os).eq_ignore_ascii_case(&child.name))
        })
        .collect()
}

/// Known driver processes currently parented by `parent_pid`.
///
/// Must run before the parent dies: orphans are reparented and no longer match.
#[cfg(unix)]
pub async fn driver_children(parent_pid: u32) -> Vec<ChildProcess> {
    let output = match tokio::process::Command::new("pgrep")
        .arg("-P")
        .arg(parent_pid.to_string())
        .arg("-l")
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            warn!("Unable to list children of {}: {}", parent_pid, e);
            return Vec::new();
        }
    };

    let children = parse_pgrep(&String::from_utf8_lossy(&output.stdout));
    debug!("Children of {}: {:?}", parent_pid, children);
    known_drivers(children, OsFamily::current())
}

#[cfg(not(unix))]
pub async fn driver_children(parent_pid: u32) -> Vec<ChildProcess> {
    debug!("Child lookup is not supported here (parent pid: {})", parent_pid);
    Vec::new()
}

/// SIGKILL each process. Returns the PIDs killed.
#[cfg(unix)]
pub fn kill_all(processes: &[ChildProcess]) -> Vec<u32> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let mut killed = Vec::new();
    for process in processes {
        info!("Killing stale {} (pid: {})", process.name, process.pid);
        match kill(Pid::from_raw(process.pid as i32), Signal::SIGKILL) {
            Ok(()) => killed.push(process.pid),
            Err(e) => warn!("Failed to kill {} (pid: {}): {}", process.name, process.pid, e),
        }
    }
    killed
}

#[cfg(not(unix))]
pub fn kill_all(processes: &[ChildProcess]) -> Vec<u32> {
    for process in processes {
        warn!("Leaving {} (pid: {}) running", process.name, process.pid);
    }
    Vec::new()
}
