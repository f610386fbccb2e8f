//! LocalGrid Launcher
//!
//! Provisions, launches, supervises and tears down a local hub and its nodes.

pub mod command;
pub mod component;
pub mod config;
pub mod hooks;
pub mod orchestrator;
pub mod probe;
pub mod reaper;
pub mod registry;
pub mod supervisor;

pub use command::{CommandLine, JavaLaunch, LaunchOptions};
pub use component::{ComponentCatalog, ComponentSpec, StandardCatalog};
pub use config::GridConfig;
pub use hooks::ShutdownHooks;
pub use orchestrator::{FatalHandler, GridListener, Orchestrator, ProcessExit};
pub use probe::{HttpStatusClient, ReadinessProbe, StatusClient, StatusEndpoint, StatusShape};
pub use registry::ComponentRegistry;
pub use supervisor::{ProcessSupervisor, Started, SupervisorOptions};
