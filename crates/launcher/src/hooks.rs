//! Process-destroyer hooks
//!
//! Every launched child registers its PID here so an abrupt host exit can still take the
//! children down with it. The registry is an explicit shared object, not a global.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Registered child processes, keyed by PID
#[derive(Debug, Clone, Default)]
pub struct ShutdownHooks {
    inner: Arc<Mutex<BTreeMap<u32, String>>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pid` under a component name
    pub fn register(&self, pid: u32, component: &str) {
        debug!("Registered shutdown hook for {} (pid: {})", component, pid);
        self.inner.lock().insert(pid, component.to_string());
    }

    /// Remove a hook. Returns false if it was already gone.
    pub fn remove(&self, pid: u32) -> bool {
        self.inner.lock().remove(&pid).is_some()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.inner.lock().contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Kill every registered process and clear the registry. Returns the PIDs signalled.
    pub fn fire(&self) -> Vec<u32> {
        let hooks = std::mem::take(&mut *self.inner.lock());

        hooks
            .into_iter()
            .map(|(pid, component)| {
                warn!("Killing {} (pid: {}) on host exit", component, pid);
                kill_pid(pid);
                pid
            })
            .collect()
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_is_idempotent() {
        let hooks = ShutdownHooks::new();
        hooks.register(4242, "hub");
        assert!(hooks.contains(4242));
        assert!(hooks.remove(4242));
        assert!(!hooks.remove(4242));
        assert!(hooks.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fire_kills_registered_children() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let hooks = ShutdownHooks::new();
        let shared = hooks.clone();
        shared.register(pid, "node");

        assert_eq!(hooks.fire(), vec![pid]);
        assert!(shared.is_empty());

        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
