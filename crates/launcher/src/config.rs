//! Launcher configuration

use localgrid_common::{Error, OsFamily, Result, StoreConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Grid configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Home directory for jars, extracted drivers and config files
    pub home_dir: PathBuf,

    /// Download manifest (defaults to `<home>/config/download.json`)
    pub manifest_path: Option<PathBuf>,

    /// Hub configuration
    pub hub: HubConfig,

    /// Web node configuration
    pub node: NodeConfig,

    /// Mobile node configuration
    pub mobile: MobileConfig,

    /// Child process configuration
    pub process: ProcessConfig,

    /// Artifact download configuration
    pub download: DownloadConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            home_dir: localgrid_common::default_home_dir(),
            manifest_path: None,
            hub: HubConfig::default(),
            node: NodeConfig::default(),
            mobile: MobileConfig::default(),
            process: ProcessConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

/// Readiness polling cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub main_class: String,
    /// Manifest names the hub needs
    pub artifacts: Vec<String>,
    pub probe: ProbeConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4444,
            main_class: "org.openqa.grid.selenium.GridLauncher".to_string(),
            artifacts: vec!["selenium-server".to_string()],
            probe: ProbeConfig {
                interval_ms: 1_000,
                max_attempts: 60,
            },
        }
    }
}

/// Web node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    /// 0 picks a free port at bring-up
    pub port: u16,
    pub main_class: String,
    pub artifacts: Vec<String>,
    pub probe: ProbeConfig,
    /// Servlet that asks the node to exit on its own
    pub force_restart_path: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            main_class: "org.openqa.grid.selenium.GridLauncher".to_string(),
            artifacts: vec![
                "selenium-server".to_string(),
                "chromedriver".to_string(),
                "phantomjs".to_string(),
            ],
            probe: ProbeConfig {
                interval_ms: 1_000,
                max_attempts: 60,
            },
            force_restart_path: Some("/extra/NodeForceRestartServlet".to_string()),
        }
    }
}

/// Mobile node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MobileConfig {
    /// Folder holding the apps under test
    pub app_folder: Option<PathBuf>,
    /// Driver session timeout in milliseconds (at least 1000)
    pub session_timeout_ms: u64,
    /// Port of the selendroid server running on the device
    pub selendroid_server_port: u16,
    pub emulator_start_timeout_ms: u64,
    pub server_start_timeout_ms: u64,
    pub force_reinstall: bool,
    pub probe: ProbeConfig,
    pub selendroid: MobileDriverConfig,
    pub ios_driver: MobileDriverConfig,
}

impl Default for MobileConfig {
    fn default() -> Self {
        Self {
            app_folder: None,
            session_timeout_ms: 1_800_000,
            selendroid_server_port: 8080,
            emulator_start_timeout_ms: 300_000,
            server_start_timeout_ms: 20_000,
            force_reinstall: false,
            probe: ProbeConfig {
                interval_ms: 10_000,
                max_attempts: 5,
            },
            selendroid: MobileDriverConfig {
                main_class: "io.selendroid.standalone.SelendroidLauncher".to_string(),
                artifacts: vec!["selendroid-standalone".to_string()],
                default_args: vec!["-keepAdbAlive".to_string()],
            },
            ios_driver: MobileDriverConfig {
                main_class: "org.uiautomation.ios.IOSServer".to_string(),
                artifacts: vec!["ios-server".to_string()],
                default_args: vec!["-beta".to_string()],
            },
        }
    }
}

/// Per-driver launch settings for mobile nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MobileDriverConfig {
    pub main_class: String,
    pub artifacts: Vec<String>,
    /// Merged into the command line for flags the caller did not pass
    pub default_args: Vec<String>,
}

/// Child process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Java binary used to launch components
    pub java_binary: String,
    /// Relaunch children that exit on their own
    pub continuous_restart: bool,
    /// Poll interval of the restart loop
    pub restart_cycle_secs: u64,
    /// Properties never forwarded
    pub deny_properties: Vec<String>,
    /// System properties forwarded to every child as `-Dkey=value`
    pub system_properties: BTreeMap<String, String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            java_binary: "java".to_string(),
            continuous_restart: true,
            restart_cycle_secs: 60,
            deny_properties: vec!["java.util.logging.config.file".to_string()],
            system_properties: BTreeMap::new(),
        }
    }
}

impl ProcessConfig {
    pub fn restart_cycle(&self) -> Duration {
        Duration::from_secs(self.restart_cycle_secs)
    }
}

/// Artifact download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Provision artifacts before launching components
    pub enabled: bool,
    /// Network failures tolerated per artifact
    pub max_network_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_network_attempts: 5,
            retry_delay_secs: 2,
        }
    }
}

impl GridConfig {
    /// Load configuration from file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(format!("cannot serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values no component could run with
    pub fn validate(&self) -> Result<()> {
        for (name, probe) in [
            ("hub", &self.hub.probe),
            ("node", &self.node.probe),
            ("mobile", &self.mobile.probe),
        ] {
            if probe.max_attempts == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{}.probe.max_attempts must be at least 1",
                    name
                )));
            }
        }
        if self.process.restart_cycle_secs == 0 {
            return Err(Error::InvalidConfig(
                "process.restart_cycle_secs must be at least 1".to_string(),
            ));
        }
        if self.hub.port == 0 {
            return Err(Error::InvalidConfig("hub.port must be fixed".to_string()));
        }
        Ok(())
    }

    /// Get the config directory
    pub fn config_dir(&self) -> PathBuf {
        self.home_dir.join("config")
    }

    /// Get the downloads directory
    pub fn downloads_dir(&self) -> PathBuf {
        self.home_dir.join("downloads")
    }

    /// Get the download manifest path
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_path
            .clone()
            .unwrap_or_else(|| self.config_dir().join("download.json"))
    }

    /// Artifact store settings derived from this config
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            home_dir: self.home_dir.clone(),
            downloads_dir: self.downloads_dir(),
            os: OsFamily::current(),
            max_network_attempts: self.download.max_network_attempts.max(1),
            retry_delay: Duration::from_secs(self.download.retry_delay_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GridConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.hub.port, 4444);
        assert_eq!(config.mobile.probe.max_attempts, 5);
        assert_eq!(config.process.restart_cycle(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "home_dir = \"/srv/grid\"\n[hub]\nport = 5555\n[process]\ncontinuous_restart = false\n",
        )
        .unwrap();

        let config = GridConfig::load(&path).unwrap();
        assert_eq!(config.hub.port, 5555);
        assert_eq!(config.hub.host, "127.0.0.1");
        assert!(!config.process.continuous_restart);
        assert_eq!(config.manifest_path(), PathBuf::from("/srv/grid/config/download.json"));
        assert_eq!(config.downloads_dir(), PathBuf::from("/srv/grid/downloads"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = GridConfig::default();
        config.node.port = 5556;
        config
            .process
            .system_properties
            .insert("selenium.LOGGER".into(), "/tmp/grid.log".into());

        config.save(&path).unwrap();
        let loaded = GridConfig::load(&path).unwrap();
        assert_eq!(loaded.node.port, 5556);
        assert_eq!(
            loaded.process.system_properties.get("selenium.LOGGER").map(String::as_str),
            Some("/tmp/grid.log")
        );
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = GridConfig::default();
        assert!(config.validate().is_ok());
        config.node.probe.max_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
