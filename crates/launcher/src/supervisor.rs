//! Process supervision
//!
//! A [`ProcessSupervisor`] owns one managed child:
//! - launches it from a fresh [`CommandLine`] every time
//! - pumps its output into the log so OS pipes never fill
//! - optionally relaunches it whenever it exits, until shutdown is requested
//! - stops it with escalating force

use crate::command::{is_help, CommandLine};
use crate::hooks::ShutdownHooks;
use crate::probe::StatusClient;
use crate::reaper;
use localgrid_common::{ArtifactStore, DownloadRequest, Error, Result};
use parking_lot::Mutex;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Time a child gets to exit after a graceful request
const GRACEFUL_WAIT: Duration = Duration::from_secs(2);
/// Time a child gets to exit after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(1);
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Builds the command line for each launch
pub type CommandFactory = Arc<dyn Fn() -> Result<CommandLine> + Send + Sync>;

/// Re-runs the manifest timestamp gate before a relaunch
#[derive(Clone)]
pub struct Reprovisioner {
    pub store: Arc<ArtifactStore>,
    pub request: DownloadRequest,
}

/// Supervision settings
#[derive(Clone)]
pub struct SupervisorOptions {
    pub continuous_restart: bool,
    /// How often the restart loop checks the child
    pub restart_cycle: Duration,
    /// Endpoint that asks the child to exit on its own
    pub force_restart_url: Option<String>,
    /// Client used for `force_restart_url`
    pub client: Option<Arc<dyn StatusClient>>,
    pub reprovision: Option<Reprovisioner>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            continuous_restart: true,
            restart_cycle: Duration::from_secs(60),
            force_restart_url: None,
            client: None,
            reprovision: None,
        }
    }
}

/// Outcome of [`ProcessSupervisor::start`]
#[derive(Debug)]
pub enum Started {
    /// The child is running (and supervised, if continuous restart is on)
    Running { pid: u32 },
    /// Help mode: the child ran to completion and its output is the result
    Completed { status: ExitStatus, output: String },
}

struct Inner {
    name: String,
    factory: CommandFactory,
    hooks: ShutdownHooks,
    options: SupervisorOptions,
    shutdown: AtomicBool,
    wake: Notify,
    child: Mutex<Option<Child>>,
    pid: Mutex<Option<u32>>,
    launches: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Launches and keeps alive one child process
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(
        name: impl Into<String>,
        factory: CommandFactory,
        hooks: ShutdownHooks,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                factory,
                hooks,
                options,
                shutdown: AtomicBool::new(false),
                wake: Notify::new(),
                child: Mutex::new(None),
                pid: Mutex::new(None),
                launches: AtomicU32::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// PID of the current child
    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock()
    }

    /// Number of successful launches, including the first
    pub fn launch_count(&self) -> u32 {
        self.inner.launches.load(Ordering::SeqCst)
    }

    /// Whether the current child is still alive
    pub fn is_running(&self) -> bool {
        !self.inner.has_exited()
    }

    /// Launch the child. Spawn errors are returned, not retried.
    ///
    /// With continuous restart on, a supervision task keeps relaunching the child until
    /// [`shutdown`](Self::shutdown). A help invocation runs once to completion instead.
    pub async fn start(&self) -> Result<Started> {
        if let Some(pid) = self.pid().filter(|_| self.is_running()) {
            debug!("{} already running (pid: {})", self.inner.name, pid);
            return Ok(Started::Running { pid });
        }

        let cmd = (self.inner.factory)()?;
        if is_help(&cmd.args) {
            return self.inner.run_to_completion(&cmd).await;
        }

        self.inner.shutdown.store(false, Ordering::SeqCst);
        let pid = self.inner.launch(cmd)?;

        if self.inner.options.continuous_restart {
            let inner = self.inner.clone();
            let handle = tokio::spawn(async move { inner.supervise().await });
            *self.inner.task.lock() = Some(handle);
        }
        Ok(Started::Running { pid })
    }

    /// Stop supervising and terminate the child.
    ///
    /// Graceful first (force-restart endpoint, else SIGTERM), then SIGKILL. Known driver
    /// processes parented by the child are killed afterwards. Safe to call repeatedly.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("{} supervision task ended abnormally: {}", self.inner.name, e);
            }
        }

        let Some(pid) = self.pid() else {
            return Ok(());
        };

        // an exited child's PID may already belong to something else
        if self.inner.has_exited() {
            debug!("{} (pid: {}) already exited", self.inner.name, pid);
            self.inner.clear(pid);
            return Ok(());
        }
        info!("Stopping {} (pid: {})", self.inner.name, pid);

        let drivers = reaper::driver_children(pid).await;
        self.inner.request_exit(pid).await;

        if !self.inner.wait_for_exit(GRACEFUL_WAIT).await {
            info!("Force killing {} (pid: {})", self.inner.name, pid);
            if let Some(child) = self.inner.child.lock().as_mut() {
                let _ = child.start_kill();
            }
            if !self.inner.wait_for_exit(KILL_WAIT).await {
                error!("{} (pid: {}) could not be stopped", self.inner.name, pid);
            }
        }

        reaper::kill_all(&drivers);
        self.inner.clear(pid);
        info!("{} has been stopped", self.inner.name);
        Ok(())
    }
}

impl Inner {
    fn launch(&self, cmd: CommandLine) -> Result<u32> {
        debug!("Launching {}: {}", self.name, cmd);

        let mut child = cmd.to_command().spawn().map_err(|e| Error::Spawn {
            component: self.name.clone(),
            reason: format!("{}: {}", cmd.program, e),
        })?;
        let Some(pid) = child.id() else {
            return Err(Error::Spawn {
                component: self.name.clone(),
                reason: format!("{} exited before its pid could be read", cmd.program),
            });
        };

        if let Some(stdout) = child.stdout.take() {
            pump(stdout, self.name.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, self.name.clone());
        }

        self.hooks.register(pid, &self.name);
        *self.child.lock() = Some(child);
        *self.pid.lock() = Some(pid);
        let launches = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        info!("{} started (pid: {}, launch #{})", self.name, pid, launches);
        Ok(pid)
    }

    async fn run_to_completion(&self, cmd: &CommandLine) -> Result<Started> {
        debug!("Running {} once: {}", self.name, cmd);
        let output = cmd.to_command().output().await.map_err(|e| Error::Spawn {
            component: self.name.clone(),
            reason: format!("{}: {}", cmd.program, e),
        })?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(Started::Completed {
            status: output.status,
            output: text,
        })
    }

    /// Restart loop: check the child every `restart_cycle`, relaunch it once it has exited
    async fn supervise(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = sleep(self.options.restart_cycle) => {}
                _ = self.wake.notified() => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if !self.reap_exited() {
                continue;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if let Some(reprovision) = &self.options.reprovision {
                if let Err(e) = reprovision.store.check_for_downloads(&reprovision.request).await {
                    error!("Re-provisioning {} failed: {}", self.name, e);
                }
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }

            match (self.factory)().and_then(|cmd| self.launch(cmd)) {
                Ok(_) => {}
                Err(e) => error!("Failed to relaunch {}: {}", self.name, e),
            }
        }
        debug!("{} supervision loop stopped", self.name);
    }

    /// True when there is no live child (it exited or was never relaunched)
    fn reap_exited(&self) -> bool {
        let status = match self.child.lock().as_mut() {
            Some(child) => child.try_wait(),
            None => return true,
        };

        match status {
            Ok(None) => return false,
            Ok(Some(status)) if status.success() => {
                info!("{} quit ({}). Restarting it.", self.name, status);
            }
            Ok(Some(status)) => {
                error!("{} exited abnormally ({}). Restarting it.", self.name, status);
            }
            Err(e) => {
                error!("Lost track of {}: {}. Restarting it.", self.name, e);
            }
        }

        if let Some(pid) = self.pid.lock().take() {
            self.hooks.remove(pid);
        }
        *self.child.lock() = None;
        true
    }

    /// Whether the current child has exited (reaping it if so)
    fn has_exited(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    fn clear(&self, pid: u32) {
        self.hooks.remove(pid);
        *self.child.lock() = None;
        *self.pid.lock() = None;
    }

    async fn request_exit(&self, pid: u32) {
        if let (Some(url), Some(client)) =
            (&self.options.force_restart_url, &self.options.client)
        {
            match client.post(url).await {
                Ok(()) => {
                    debug!("Asked {} to exit via {}", self.name, url);
                    return;
                }
                Err(e) => debug!("{} force-restart endpoint unavailable: {}", self.name, e),
            }
        }
        terminate(pid);
    }

    /// Poll until the child exits or `limit` passes
    async fn wait_for_exit(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.has_exited() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(EXIT_POLL).await;
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// Forward each output line to the log at debug level
fn pump<R>(reader: R, component: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(component = %component, "{}", line);
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandFactory {
        let script = script.to_string();
        Arc::new(move || Ok(CommandLine::new("sh").arg("-c").arg(script.clone())))
    }

    #[tokio::test]
    async fn test_spawn_failure_is_returned() {
        let factory: CommandFactory =
            Arc::new(|| Ok(CommandLine::new("/nonexistent/localgrid-test-binary")));
        let supervisor = ProcessSupervisor::new(
            "hub",
            factory,
            ShutdownHooks::new(),
            SupervisorOptions::default(),
        );

        match supervisor.start().await {
            Err(Error::Spawn { component, .. }) => assert_eq!(component, "hub"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(supervisor.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_help_runs_once_and_returns_output() {
        let factory: CommandFactory = Arc::new(|| {
            Ok(CommandLine::new("sh")
                .arg("-c")
                .arg("echo usage: grid; exit 0")
                .arg("-help"))
        });
        let hooks = ShutdownHooks::new();
        let supervisor =
            ProcessSupervisor::new("hub", factory, hooks.clone(), SupervisorOptions::default());

        match supervisor.start().await.unwrap() {
            Started::Completed { status, output } => {
                assert!(status.success());
                assert!(output.contains("usage: grid"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(hooks.is_empty());
        assert_eq!(supervisor.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_kills_and_unregisters() {
        let hooks = ShutdownHooks::new();
        let options = SupervisorOptions {
            continuous_restart: false,
            ..Default::default()
        };
        let supervisor = ProcessSupervisor::new("node", sh("sleep 30"), hooks.clone(), options);

        let pid = match supervisor.start().await.unwrap() {
            Started::Running { pid } => pid,
            other => panic!("unexpected: {:?}", other),
        };
        assert!(hooks.contains(pid));
        assert!(supervisor.is_running());

        supervisor.shutdown().await.unwrap();
        assert!(!supervisor.is_running());
        assert!(hooks.is_empty());

        // second shutdown is a no-op
        supervisor.shutdown().await.unwrap();
    }
}
