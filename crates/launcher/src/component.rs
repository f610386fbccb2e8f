//! Grid components
//!
//! A [`ComponentSpec`] is the static description of one launchable component: where it
//! listens, what it needs from the manifest, how its command line is built and when it
//! applies. The [`StandardCatalog`] produces the fixed hub / node / mobile-node set.

use crate::command::{has_flag, JavaLaunch, LaunchOptions, NO_CONTINUOUS_RESTART};
use crate::config::{GridConfig, MobileDriverConfig, ProbeConfig};
use crate::probe::{StatusEndpoint, StatusShape};
use crate::supervisor::{CommandFactory, SupervisorOptions};
use localgrid_common::{
    AutomationPlatform, ComponentKind, Error, GridTarget, InstanceRole, MobileNodeType, OsFamily,
    Result,
};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Find a free local port
pub fn find_free_port() -> Result<u16> {
    Ok(TcpListener::bind("127.0.0.1:0")?.local_addr()?.port())
}

/// Whether `port` can be bound on `host`
pub fn port_is_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Static description of a launchable component
#[derive(Clone)]
pub struct ComponentSpec {
    pub kind: ComponentKind,
    pub host: String,
    pub port: u16,
    /// Manifest names that must be provisioned first
    pub artifacts: Vec<String>,
    pub probe: ProbeConfig,
    pub continuous_restart: bool,
    pub restart_cycle: Duration,
    /// Path of the endpoint that asks the component to exit
    pub force_restart_path: Option<String>,
    /// Additional ports the component binds (port, what for)
    pub extra_ports: Vec<(u16, String)>,
    /// Driver session timeout, validated to be at least one second
    pub session_timeout_ms: Option<u64>,
    /// OS the component can only run on
    pub required_os: Option<OsFamily>,
    pub command: CommandFactory,
}

impl ComponentSpec {
    pub fn name(&self) -> String {
        self.kind.to_string()
    }

    /// Hub: always. Web node: web runs. Mobile nodes: their platform and driver family only.
    pub fn applies_to(&self, target: &GridTarget) -> bool {
        match self.kind {
            ComponentKind::Hub => true,
            ComponentKind::Node => target.platform == AutomationPlatform::Web,
            ComponentKind::IosNode => {
                target.platform == AutomationPlatform::Ios
                    && target.mobile_node == Some(MobileNodeType::IosDriver)
            }
            ComponentKind::SelendroidNode => {
                target.platform == AutomationPlatform::Android
                    && target.mobile_node == Some(MobileNodeType::Selendroid)
            }
        }
    }

    /// Pre-launch checks: ports free, sane session timeout, supported host OS
    pub fn validate(&self, host_os: OsFamily) -> Result<()> {
        if let Some(required) = self.required_os {
            if required != host_os {
                return Err(Error::UnsupportedPlatform(format!(
                    "{} can only run on {}, this host is {}",
                    self.kind, required, host_os
                )));
            }
        }

        if let Some(timeout) = self.session_timeout_ms {
            if timeout / 1000 == 0 {
                return Err(Error::InvalidConfig(format!(
                    "Insufficient session timeout for the {}: {} ms, probably less than 1000 milliseconds",
                    self.kind, timeout
                )));
            }
        }

        if !port_is_free(&self.host, self.port) {
            return Err(Error::PortInUse {
                port: self.port,
                component: self.kind.to_string(),
            });
        }
        for (port, purpose) in &self.extra_ports {
            if !port_is_free(&self.host, *port) {
                return Err(Error::PortInUse {
                    port: *port,
                    component: purpose.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn status_endpoint(&self) -> StatusEndpoint {
        StatusEndpoint {
            component: self.name(),
            host: self.host.clone(),
            port: self.port,
            shape: StatusShape::for_kind(self.kind),
        }
    }

    pub fn force_restart_url(&self) -> Option<String> {
        self.force_restart_path
            .as_ref()
            .map(|path| format!("http://{}:{}{}", self.host, self.port, path))
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            continuous_restart: self.continuous_restart,
            restart_cycle: self.restart_cycle,
            force_restart_url: self.force_restart_url(),
            ..Default::default()
        }
    }
}

/// Source of the fixed component list
pub trait ComponentCatalog: Send + Sync {
    /// Construct every component spec, in bring-up order
    fn build(&self) -> Result<Vec<ComponentSpec>>;
}

/// Hub, web node, iOS node and Selendroid node from a [`GridConfig`]
pub struct StandardCatalog {
    config: GridConfig,
    working_dir: PathBuf,
}

impl StandardCatalog {
    pub fn new(config: GridConfig) -> Result<Self> {
        Ok(Self {
            config,
            working_dir: std::env::current_dir()?,
        })
    }

    fn hub_register_url(&self) -> String {
        format!(
            "http://{}:{}/grid/register",
            self.config.hub.host, self.config.hub.port
        )
    }

    fn java(&self, role: InstanceRole, main_class: &str, options: LaunchOptions) -> JavaLaunch {
        JavaLaunch {
            java_binary: self.config.process.java_binary.clone(),
            main_class: main_class.to_string(),
            role,
            home_dir: self.config.home_dir.clone(),
            working_dir: self.working_dir.clone(),
            grid_config: self.config.config_dir().join("gridConfig.json"),
            os: OsFamily::current(),
            options,
            system_properties: self.config.process.system_properties.clone(),
            deny_properties: self.config.process.deny_properties.clone(),
            extra_classpath: Vec::new(),
            default_args: Vec::new(),
        }
    }

    fn grid_options(&self) -> LaunchOptions {
        LaunchOptions {
            home_jar_prefix: Some("selenium-server".to_string()),
            continuous_restart: self.config.process.continuous_restart,
            restart_cycle: self.config.process.restart_cycle(),
            check_timestamp: false,
            cleanup_on_invocation: false,
            ..Default::default()
        }
    }

    fn spec(
        &self,
        kind: ComponentKind,
        host: &str,
        port: u16,
        artifacts: &[String],
        probe: ProbeConfig,
        launch: JavaLaunch,
        args: Vec<String>,
    ) -> ComponentSpec {
        let continuous_restart =
            launch.options.continuous_restart && !has_flag(&args, NO_CONTINUOUS_RESTART);
        let restart_cycle = launch.options.restart_cycle;

        ComponentSpec {
            kind,
            host: host.to_string(),
            port,
            artifacts: artifacts.to_vec(),
            probe,
            continuous_restart,
            restart_cycle,
            force_restart_path: None,
            extra_ports: Vec::new(),
            session_timeout_ms: None,
            required_os: None,
            command: Arc::new(move || launch.command_line(&args)),
        }
    }

    fn hub(&self) -> ComponentSpec {
        let hub = &self.config.hub;
        let launch = self.java(InstanceRole::Hub, &hub.main_class, self.grid_options());
        let args = strings(["-role", "hub", "-port", &hub.port.to_string(), "-host", &hub.host]);
        self.spec(
            ComponentKind::Hub,
            &hub.host,
            hub.port,
            &hub.artifacts,
            hub.probe,
            launch,
            args,
        )
    }

    fn node(&self) -> Result<ComponentSpec> {
        let node = &self.config.node;
        let port = resolve_port(node.port)?;
        let launch = self.java(InstanceRole::Node, &node.main_class, self.grid_options());
        let args = strings([
            "-role",
            "node",
            "-port",
            &port.to_string(),
            "-host",
            &node.host,
            "-hub",
            &self.hub_register_url(),
        ]);

        let mut spec = self.spec(
            ComponentKind::Node,
            &node.host,
            port,
            &node.artifacts,
            node.probe,
            launch,
            args,
        );
        spec.force_restart_path = node.force_restart_path.clone();
        Ok(spec)
    }

    fn mobile(
        &self,
        kind: ComponentKind,
        driver: &MobileDriverConfig,
        extra_args: Vec<String>,
    ) -> Result<ComponentSpec> {
        let mobile = &self.config.mobile;
        let host = self.config.node.host.clone();
        let port = find_free_port()?;

        let prefix = driver.artifacts.first().cloned();
        let options = LaunchOptions {
            home_jar_prefix: prefix,
            restart_cycle: self.config.process.restart_cycle(),
            ..LaunchOptions::isolated()
        };
        let mut launch = self.java(kind.role(), &driver.main_class, options);
        launch.default_args = driver.default_args.clone();

        let mut args = strings([
            "-port",
            &port.to_string(),
            "-host",
            &host,
            "-hub",
            &self.hub_register_url(),
        ]);
        if let Some(folder) = &mobile.app_folder {
            args.push("-folder".to_string());
            args.push(folder.display().to_string());
        }
        args.extend(extra_args);
        args.push("-sessionTimeout".to_string());
        args.push((mobile.session_timeout_ms / 1000).to_string());

        let mut spec = self.spec(kind, &host, port, &driver.artifacts, mobile.probe, launch, args);
        spec.session_timeout_ms = Some(mobile.session_timeout_ms);
        Ok(spec)
    }

    fn selendroid_node(&self) -> Result<ComponentSpec> {
        let mobile = &self.config.mobile;
        let mut extra = strings([
            "-selendroidServerPort",
            &mobile.selendroid_server_port.to_string(),
            "-timeoutEmulatorStart",
            &mobile.emulator_start_timeout_ms.to_string(),
            "-serverStartTimeout",
            &mobile.server_start_timeout_ms.to_string(),
        ]);
        if mobile.force_reinstall {
            extra.push("-forceReinstall".to_string());
        }

        let mut spec = self.mobile(ComponentKind::SelendroidNode, &mobile.selendroid, extra)?;
        spec.extra_ports.push((
            mobile.selendroid_server_port,
            "selendroid server".to_string(),
        ));
        Ok(spec)
    }

    fn ios_node(&self) -> Result<ComponentSpec> {
        let mut spec = self.mobile(
            ComponentKind::IosNode,
            &self.config.mobile.ios_driver,
            Vec::new(),
        )?;
        spec.required_os = Some(OsFamily::Mac);
        Ok(spec)
    }
}

impl ComponentCatalog for StandardCatalog {
    fn build(&self) -> Result<Vec<ComponentSpec>> {
        let specs = vec![
            self.hub(),
            self.node()?,
            self.ios_node()?,
            self.selendroid_node()?,
        ];
        for spec in &specs {
            debug!("Component {} on {}:{}", spec.kind, spec.host, spec.port);
        }
        Ok(specs)
    }
}

fn resolve_port(port: u16) -> Result<u16> {
    if port == 0 {
        find_free_port()
    } else {
        Ok(port)
    }
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::GRID_CONFIG;

    fn catalog() -> StandardCatalog {
        let dir = std::env::temp_dir().join("localgrid-catalog-test");
        let mut config = GridConfig {
            home_dir: dir.clone(),
            ..Default::default()
        };
        config.hub.port = find_free_port().unwrap();
        StandardCatalog {
            config,
            working_dir: dir,
        }
    }

    #[test]
    fn test_catalog_order_and_applicability() {
        let specs = catalog().build().unwrap();
        let kinds: Vec<_> = specs.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, ComponentKind::ALL.to_vec());

        let web = GridTarget::web();
        let android = GridTarget::for_platform(AutomationPlatform::Android);
        let appium = GridTarget::mobile(AutomationPlatform::Ios, MobileNodeType::Appium);

        let applicable = |target: &GridTarget| -> Vec<ComponentKind> {
            specs.iter().filter(|s| s.applies_to(target)).map(|s| s.kind).collect()
        };
        assert_eq!(applicable(&web), vec![ComponentKind::Hub, ComponentKind::Node]);
        assert_eq!(
            applicable(&android),
            vec![ComponentKind::Hub, ComponentKind::SelendroidNode]
        );
        assert_eq!(applicable(&appium), vec![ComponentKind::Hub]);
    }

    #[test]
    fn test_node_command_registers_with_hub() {
        let catalog = catalog();
        let hub_port = catalog.config.hub.port;
        let specs = catalog.build().unwrap();
        let node = &specs[1];

        let cmd = (node.command)().unwrap();
        let register = format!("http://127.0.0.1:{}/grid/register", hub_port);
        assert!(cmd.args.contains(&register));
        assert!(cmd.args.contains(&"-nodeConfig".to_string()));
        assert_eq!(
            node.force_restart_url(),
            Some(format!(
                "http://127.0.0.1:{}/extra/NodeForceRestartServlet",
                node.port
            ))
        );
    }

    #[test]
    fn test_selendroid_args_and_validation() {
        let specs = catalog().build().unwrap();
        let selendroid = &specs[3];

        let cmd = (selendroid.command)().unwrap();
        assert!(cmd.args.contains(&"-selendroidServerPort".to_string()));
        assert!(cmd.args.contains(&"-keepAdbAlive".to_string()));
        assert!(!cmd.args.contains(&GRID_CONFIG.to_string()));
        assert!(!selendroid.continuous_restart);

        let mut short = selendroid.clone();
        short.session_timeout_ms = Some(999);
        short.extra_ports.clear();
        assert!(matches!(short.validate(OsFamily::Linux), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_ios_node_requires_mac() {
        let specs = catalog().build().unwrap();
        let ios = &specs[2];
        assert!(matches!(
            ios.validate(OsFamily::Linux),
            Err(Error::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_port_in_use_names_component() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();

        let mut hub = catalog().build().unwrap().remove(0);
        hub.port = taken;
        match hub.validate(OsFamily::Linux) {
            Err(Error::PortInUse { port, component }) => {
                assert_eq!(port, taken);
                assert_eq!(component, "hub");
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }
}
