//! Grid orchestration
//!
//! Brings components up strictly one after another (nodes register against the hub, so
//! it has to answer first): provision artifacts, launch, wait until ready. Any failure is
//! fatal for the whole host process; a partially started grid is never left behind.

use crate::component::{ComponentCatalog, ComponentSpec};
use crate::hooks::ShutdownHooks;
use crate::probe::ReadinessProbe;
use crate::registry::{ComponentEntry, ComponentRegistry};
use crate::supervisor::{ProcessSupervisor, Started, SupervisorOptions};
use localgrid_common::{
    ArtifactSelection, ArtifactStore, ComponentKind, ComponentState, DownloadRequest, Error,
    GridTarget, OsFamily, Result,
};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Lifecycle callbacks, registered explicitly at startup
pub trait GridListener: Send + Sync {
    fn on_component_up(&self, _kind: ComponentKind, _host: &str, _port: u16) {}

    fn on_component_stopped(&self, _kind: ComponentKind) {}
}

/// What happens when a component fails to come up
pub trait FatalHandler: Send + Sync {
    fn on_fatal(&self, component: &str, error: &Error);
}

/// Kill every registered child and exit the host process with status 1
pub struct ProcessExit {
    hooks: ShutdownHooks,
}

impl ProcessExit {
    pub fn new(hooks: ShutdownHooks) -> Self {
        Self { hooks }
    }
}

impl FatalHandler for ProcessExit {
    fn on_fatal(&self, component: &str, error: &Error) {
        error!("Failed to start the {}: {}. Exiting.", component, error);
        self.hooks.fire();
        std::process::exit(1);
    }
}

/// Brings the local grid up and down
pub struct Orchestrator {
    registry: Mutex<ComponentRegistry>,
    store: Arc<ArtifactStore>,
    probe: ReadinessProbe,
    hooks: ShutdownHooks,
    fatal: Arc<dyn FatalHandler>,
    listeners: RwLock<Vec<Arc<dyn GridListener>>>,
    /// Manifest to provision from; `None` skips provisioning
    manifest_path: Option<PathBuf>,
    host_os: OsFamily,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<dyn ComponentCatalog>,
        store: Arc<ArtifactStore>,
        probe: ReadinessProbe,
        hooks: ShutdownHooks,
        fatal: Arc<dyn FatalHandler>,
        manifest_path: Option<PathBuf>,
    ) -> Self {
        Self {
            registry: Mutex::new(ComponentRegistry::new(catalog)),
            store,
            probe,
            hooks,
            fatal,
            listeners: RwLock::new(Vec::new()),
            manifest_path,
            host_os: OsFamily::current(),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn GridListener>) {
        self.listeners.write().push(listener);
    }

    pub fn hooks(&self) -> &ShutdownHooks {
        &self.hooks
    }

    /// Bring up every component applicable to `target`, in order.
    ///
    /// Components already running are skipped. On the first failure the fatal handler is
    /// invoked with the failing component; the error is also returned for handlers that
    /// do not exit.
    pub async fn bring_up(&self, target: GridTarget) -> Result<()> {
        let mut registry = self.registry.lock().await;
        info!("Bringing up local grid for {}", target);

        let entries = match registry.entries_mut() {
            Ok(entries) => entries,
            Err(e) => {
                self.fatal.on_fatal("grid", &e);
                return Err(e);
            }
        };

        for entry in entries.iter_mut() {
            if !entry.spec.applies_to(&target) {
                debug!("{} does not apply to {}", entry.kind(), target);
                continue;
            }
            if entry.state == ComponentState::Running {
                debug!("{} is already running", entry.kind());
                continue;
            }

            entry.state = ComponentState::Starting;
            match self.start_component(entry).await {
                Ok(()) => {
                    entry.state = ComponentState::Running;
                    info!("{} spawned on {}:{}", entry.kind(), entry.spec.host, entry.spec.port);
                    for listener in self.listeners.read().iter() {
                        listener.on_component_up(entry.kind(), &entry.spec.host, entry.spec.port);
                    }
                }
                Err(e) => {
                    entry.state = ComponentState::Failed;
                    self.fatal.on_fatal(&entry.spec.name(), &e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn start_component(&self, entry: &mut ComponentEntry) -> Result<()> {
        let spec = &entry.spec;
        spec.validate(self.host_os)?;
        self.provision(spec).await?;

        let supervisor = ProcessSupervisor::new(
            spec.name(),
            spec.command.clone(),
            self.hooks.clone(),
            SupervisorOptions {
                client: Some(self.probe.client().clone()),
                ..spec.supervisor_options()
            },
        );

        if let Started::Completed { status, .. } = supervisor.start().await? {
            return Err(Error::Spawn {
                component: spec.name(),
                reason: format!("exited immediately ({})", status),
            });
        }

        let endpoint = spec.status_endpoint();
        if let Err(e) = self
            .probe
            .wait_until_up(&endpoint, spec.probe.interval(), spec.probe.max_attempts)
            .await
        {
            let _ = supervisor.shutdown().await;
            return Err(e);
        }

        entry.supervisor = Some(supervisor);
        Ok(())
    }

    async fn provision(&self, spec: &ComponentSpec) -> Result<()> {
        let Some(manifest_path) = &self.manifest_path else {
            return Ok(());
        };
        if spec.artifacts.is_empty() {
            return Ok(());
        }

        let request = DownloadRequest {
            manifest_path: manifest_path.clone(),
            selection: ArtifactSelection::names(spec.artifacts.iter().cloned()),
            check_timestamp: false,
            cleanup: false,
        };
        self.store.check_for_downloads(&request).await?;
        Ok(())
    }

    /// Stop every component in insertion order and clear the registry.
    ///
    /// A failing component is logged and the loop moves on. Returns the final state of
    /// every entry: `Stopped` for those that were shut down, unchanged for the rest.
    pub async fn shutdown_all(&self) -> Vec<(ComponentKind, ComponentState)> {
        let mut registry = self.registry.lock().await;
        let mut entries = registry.take();

        for entry in entries.iter_mut() {
            let Some(supervisor) = entry.supervisor.take() else {
                continue;
            };
            match supervisor.shutdown().await {
                Ok(()) => {
                    entry.state = ComponentState::Stopped;
                    for listener in self.listeners.read().iter() {
                        listener.on_component_stopped(entry.kind());
                    }
                }
                Err(e) => {
                    entry.state = ComponentState::Failed;
                    error!(
                        "An error occurred while shutting down the {}: {}",
                        entry.kind(),
                        e
                    );
                }
            }
        }
        info!("Local grid shut down");
        entries.iter().map(|e| (e.kind(), e.state)).collect()
    }

    pub async fn states(&self) -> Vec<(ComponentKind, ComponentState)> {
        self.registry.lock().await.states()
    }

    /// How many times the component list has been constructed
    pub async fn build_count(&self) -> u32 {
        self.registry.lock().await.build_count()
    }
}
