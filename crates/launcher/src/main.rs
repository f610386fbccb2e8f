//! LocalGrid CLI
//!
//! Brings a local grid up, runs a single grid role in the foreground, or manages the
//! artifact cache.

use anyhow::Context;
use clap::{Parser, Subcommand};
use localgrid_common::{
    executable_names, ArtifactSelection, ArtifactStore, AutomationPlatform, DownloadRequest,
    GridTarget, InstanceRole, MobileNodeType, OsFamily,
};
use localgrid_launcher::command::{has_flag, JavaLaunch, LaunchOptions, NO_CONTINUOUS_RESTART};
use localgrid_launcher::supervisor::Reprovisioner;
use localgrid_launcher::{
    GridConfig, Orchestrator, ProcessExit, ProcessSupervisor, ReadinessProbe, ShutdownHooks,
    StandardCatalog, Started, SupervisorOptions,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "localgrid")]
#[command(author, version, about = "LocalGrid - local test grid launcher", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LOCALGRID_CONFIG")]
    config: Option<PathBuf>,

    /// Home directory for jars, downloads and config
    #[arg(long, env = "LOCALGRID_HOME")]
    home: Option<PathBuf>,

    /// Override the hub port
    #[arg(long)]
    hub_port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up the hub and the nodes for a platform, then wait for Ctrl+C
    Up {
        /// Target platform (web, android, ios)
        #[arg(short, long, default_value = "web")]
        platform: AutomationPlatform,

        /// Mobile driver family (selendroid, ios-driver, appium)
        #[arg(short, long)]
        mobile_node: Option<MobileNodeType>,
    },

    /// Run one grid role in the foreground, relaunching it whenever it exits
    Launch {
        /// Role to run (hub, node, standalone)
        role: InstanceRole,

        /// Arguments passed through to the grid process
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Download and extract artifacts from the manifest
    Download {
        /// Provision everything required by this role
        #[arg(short, long)]
        role: Option<InstanceRole>,

        /// Artifact names from the manifest
        names: Vec<String>,
    },

    /// Remove downloaded archives and extracted drivers
    Clean,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("LocalGrid v{}", localgrid_common::VERSION);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(localgrid_common::default_config_path);
    let mut config = GridConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(home) = cli.home {
        config.home_dir = home;
    }
    if let Some(port) = cli.hub_port {
        config.hub.port = port;
    }
    config.validate()?;

    match cli.command {
        Commands::Up {
            platform,
            mobile_node,
        } => {
            let target = match mobile_node {
                Some(node) if platform != AutomationPlatform::Web => {
                    GridTarget::mobile(platform, node)
                }
                _ => GridTarget::for_platform(platform),
            };
            up(config, target).await
        }
        Commands::Launch { role, args } => launch(config, role, args).await,
        Commands::Download { role, names } => download(config, role, names).await,
        Commands::Clean => clean(config).await,
    }
}

async fn up(config: GridConfig, target: GridTarget) -> anyhow::Result<()> {
    let store = Arc::new(ArtifactStore::with_http(config.store_config())?);
    let manifest_path = config.download.enabled.then(|| config.manifest_path());
    let hooks = ShutdownHooks::new();
    let catalog = Arc::new(StandardCatalog::new(config)?);

    let orchestrator = Orchestrator::new(
        catalog,
        store,
        ReadinessProbe::http()?,
        hooks.clone(),
        Arc::new(ProcessExit::new(hooks)),
        manifest_path,
    );

    orchestrator.bring_up(target).await?;
    info!("Local grid is up. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    orchestrator.shutdown_all().await;
    Ok(())
}

async fn launch(config: GridConfig, role: InstanceRole, args: Vec<String>) -> anyhow::Result<()> {
    if !matches!(role, InstanceRole::Hub | InstanceRole::Node | InstanceRole::Standalone) {
        anyhow::bail!("{} is launched through `localgrid up`", role);
    }

    let mut args = args;
    if !has_flag(&args, "-role") {
        args.splice(0..0, ["-role".to_string(), role.to_string()]);
    }

    let options = LaunchOptions {
        home_jar_prefix: Some("selenium-server".to_string()),
        continuous_restart: config.process.continuous_restart,
        restart_cycle: config.process.restart_cycle(),
        ..Default::default()
    };
    let continuous_restart = options.continuous_restart && !has_flag(&args, NO_CONTINUOUS_RESTART);

    let store = Arc::new(ArtifactStore::with_http(config.store_config())?);
    let request = DownloadRequest {
        manifest_path: config.manifest_path(),
        selection: ArtifactSelection::role(role),
        check_timestamp: options.check_timestamp,
        cleanup: options.cleanup_on_invocation,
    };
    let reprovision = if config.download.enabled {
        store.check_for_downloads(&request).await?;
        Some(Reprovisioner {
            store: store.clone(),
            request,
        })
    } else {
        None
    };

    let java = JavaLaunch {
        java_binary: config.process.java_binary.clone(),
        main_class: config.hub.main_class.clone(),
        role,
        home_dir: config.home_dir.clone(),
        working_dir: std::env::current_dir()?,
        grid_config: config.config_dir().join("gridConfig.json"),
        os: OsFamily::current(),
        options,
        system_properties: config.process.system_properties.clone(),
        deny_properties: config.process.deny_properties.clone(),
        extra_classpath: Vec::new(),
        default_args: Vec::new(),
    };
    let restart_cycle = java.options.restart_cycle;

    let hooks = ShutdownHooks::new();
    let supervisor = ProcessSupervisor::new(
        role.to_string(),
        Arc::new(move || java.command_line(&args)),
        hooks,
        SupervisorOptions {
            continuous_restart,
            restart_cycle,
            reprovision,
            ..Default::default()
        },
    );

    match supervisor.start().await? {
        Started::Completed { status, output } => {
            println!("{}", output.trim_end());
            std::process::exit(status.code().unwrap_or(1));
        }
        Started::Running { pid } => {
            info!("{} running (pid: {}). Press Ctrl+C to stop.", role, pid);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    if let Err(e) = supervisor.shutdown().await {
        error!("Failed to stop {}: {}", role, e);
    }
    Ok(())
}

async fn download(
    config: GridConfig,
    role: Option<InstanceRole>,
    names: Vec<String>,
) -> anyhow::Result<()> {
    let selection = ArtifactSelection { role, names };
    if selection.is_empty() {
        anyhow::bail!("nothing to download: pass --role or artifact names");
    }

    let store = ArtifactStore::with_http(config.store_config())?;
    let request = DownloadRequest {
        manifest_path: config.manifest_path(),
        selection,
        check_timestamp: false,
        cleanup: false,
    };

    let artifacts = store.check_for_downloads(&request).await?.unwrap_or_default();
    for artifact in artifacts {
        println!("{}", artifact.path.display());
        for path in artifact.extracted {
            println!("  {}", path.display());
        }
    }
    Ok(())
}

async fn clean(config: GridConfig) -> anyhow::Result<()> {
    let mut removed = 0;

    let downloads = config.downloads_dir();
    if downloads.exists() {
        for entry in WalkDir::new(&downloads).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
                }
            }
        }
    }

    for name in executable_names(OsFamily::current()) {
        let path = config.home_dir.join(&name);
        if path.is_file() {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
    }

    println!("Removed {} files", removed);
    Ok(())
}
