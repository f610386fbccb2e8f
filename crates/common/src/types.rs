//! Core types for LocalGrid

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Operating system family used to resolve manifest entries and binary names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Linux,
    Mac,
    Windows,
}

impl OsFamily {
    /// The OS family of the running host
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            OsFamily::Windows
        } else if cfg!(target_os = "macos") {
            OsFamily::Mac
        } else {
            OsFamily::Linux
        }
    }

    /// Manifest key for this family
    pub fn manifest_key(&self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::Mac => "mac",
            OsFamily::Windows => "windows",
        }
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, OsFamily::Windows)
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.manifest_key())
    }
}

/// Role a launched process plays in the grid.
///
/// The friendly name is what the manifest's `roles` lists refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceRole {
    Hub,
    Node,
    Standalone,
    Selendroid,
    IosDriver,
}

impl InstanceRole {
    pub fn friendly_name(&self) -> &'static str {
        match self {
            InstanceRole::Hub => "hub",
            InstanceRole::Node => "node",
            InstanceRole::Standalone => "standalone",
            InstanceRole::Selendroid => "selendroid",
            InstanceRole::IosDriver => "ios-driver",
        }
    }
}

impl std::fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.friendly_name())
    }
}

impl FromStr for InstanceRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hub" => Ok(InstanceRole::Hub),
            "node" => Ok(InstanceRole::Node),
            "standalone" => Ok(InstanceRole::Standalone),
            "selendroid" => Ok(InstanceRole::Selendroid),
            "ios-driver" => Ok(InstanceRole::IosDriver),
            other => Err(Error::InvalidConfig(format!("unknown role '{}'", other))),
        }
    }
}

/// Kinds of component the orchestrator knows how to bring up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Hub,
    Node,
    IosNode,
    SelendroidNode,
}

impl ComponentKind {
    /// Bring-up order. Nodes register against the hub, so the hub comes first.
    pub const ALL: [ComponentKind; 4] = [
        ComponentKind::Hub,
        ComponentKind::Node,
        ComponentKind::IosNode,
        ComponentKind::SelendroidNode,
    ];

    pub fn role(&self) -> InstanceRole {
        match self {
            ComponentKind::Hub => InstanceRole::Hub,
            ComponentKind::Node => InstanceRole::Node,
            ComponentKind::IosNode => InstanceRole::IosDriver,
            ComponentKind::SelendroidNode => InstanceRole::Selendroid,
        }
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self, ComponentKind::IosNode | ComponentKind::SelendroidNode)
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentKind::Hub => write!(f, "hub"),
            ComponentKind::Node => write!(f, "node"),
            ComponentKind::IosNode => write!(f, "ios-node"),
            ComponentKind::SelendroidNode => write!(f, "selendroid-node"),
        }
    }
}

/// Automation platform a test run targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationPlatform {
    Web,
    Android,
    Ios,
}

impl std::fmt::Display for AutomationPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutomationPlatform::Web => write!(f, "web"),
            AutomationPlatform::Android => write!(f, "android"),
            AutomationPlatform::Ios => write!(f, "ios"),
        }
    }
}

impl FromStr for AutomationPlatform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "web" => Ok(AutomationPlatform::Web),
            "android" => Ok(AutomationPlatform::Android),
            "ios" => Ok(AutomationPlatform::Ios),
            other => Err(Error::UnsupportedPlatform(other.to_string())),
        }
    }
}

/// Which mobile driver serves a mobile run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MobileNodeType {
    Selendroid,
    IosDriver,
    Appium,
}

impl FromStr for MobileNodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "selendroid" => Ok(MobileNodeType::Selendroid),
            "ios-driver" | "iosdriver" => Ok(MobileNodeType::IosDriver),
            "appium" => Ok(MobileNodeType::Appium),
            other => Err(Error::InvalidConfig(format!("unknown mobile node type '{}'", other))),
        }
    }
}

/// What a bring-up request is for: the platform plus, for mobile runs, the driver family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridTarget {
    pub platform: AutomationPlatform,
    pub mobile_node: Option<MobileNodeType>,
}

impl GridTarget {
    pub fn web() -> Self {
        Self {
            platform: AutomationPlatform::Web,
            mobile_node: None,
        }
    }

    pub fn mobile(platform: AutomationPlatform, node: MobileNodeType) -> Self {
        Self {
            platform,
            mobile_node: Some(node),
        }
    }

    /// Default driver family per platform: selendroid for android, ios-driver for ios
    pub fn for_platform(platform: AutomationPlatform) -> Self {
        match platform {
            AutomationPlatform::Web => Self::web(),
            AutomationPlatform::Android => Self::mobile(platform, MobileNodeType::Selendroid),
            AutomationPlatform::Ios => Self::mobile(platform, MobileNodeType::IosDriver),
        }
    }
}

impl std::fmt::Display for GridTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mobile_node {
            Some(node) => write!(f, "{} ({:?})", self.platform, node),
            None => write!(f, "{}", self.platform),
        }
    }
}

/// Runtime state of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    #[default]
    NotStarted,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentState::NotStarted => write!(f, "not_started"),
            ComponentState::Starting => write!(f, "starting"),
            ComponentState::Running => write!(f, "running"),
            ComponentState::Stopped => write!(f, "stopped"),
            ComponentState::Failed => write!(f, "failed"),
        }
    }
}

/// Driver executables shipped inside downloaded archives.
///
/// Also the set of process names the reaper is allowed to kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownProcess {
    Chromedriver,
    Phantomjs,
    IeDriver,
}

impl KnownProcess {
    pub const ALL: [KnownProcess; 3] = [
        KnownProcess::Chromedriver,
        KnownProcess::Phantomjs,
        KnownProcess::IeDriver,
    ];

    pub fn unix_image_name(&self) -> &'static str {
        match self {
            KnownProcess::Chromedriver => "chromedriver",
            KnownProcess::Phantomjs => "phantomjs",
            KnownProcess::IeDriver => "IEDriverServer",
        }
    }

    pub fn windows_image_name(&self) -> &'static str {
        match self {
            KnownProcess::Chromedriver => "chromedriver.exe",
            KnownProcess::Phantomjs => "phantomjs.exe",
            KnownProcess::IeDriver => "IEDriverServer.exe",
        }
    }

    /// System property the WebDriver client reads the binary location from
    pub fn driver_property(&self) -> &'static str {
        match self {
            KnownProcess::Chromedriver => "webdriver.chrome.driver",
            KnownProcess::Phantomjs => "phantomjs.binary.path",
            KnownProcess::IeDriver => "webdriver.ie.driver",
        }
    }

    /// Drivers available on the given OS family
    pub fn for_os(os: OsFamily) -> Vec<KnownProcess> {
        if os.is_windows() {
            Self::ALL.to_vec()
        } else {
            vec![KnownProcess::Phantomjs, KnownProcess::Chromedriver]
        }
    }

    pub fn image_name(&self, os: OsFamily) -> &'static str {
        if os.is_windows() {
            self.windows_image_name()
        } else {
            self.unix_image_name()
        }
    }
}

/// Executable basenames to look for when extracting archives on `os`
pub fn executable_names(os: OsFamily) -> Vec<String> {
    KnownProcess::for_os(os)
        .iter()
        .map(|p| p.image_name(os).to_string())
        .collect()
}
