//! Command line assembly
//!
//! Java components are launched as
//! `java [-Dkey=value ...] -cp <entries> <main class> [program args]`.
//! Program arguments are dash-style flags, optionally followed by one value.

use localgrid_common::{Error, InstanceRole, KnownProcess, OsFamily, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Disables the restart loop. Never forwarded to the child.
pub const NO_CONTINUOUS_RESTART: &str = "-noContinuousRestart";

/// Grid config file handed to grid components. Stripped for mobile drivers.
pub const GRID_CONFIG: &str = "-gridConfig";

pub const HUB_CONFIG: &str = "-hubConfig";
pub const NODE_CONFIG: &str = "-nodeConfig";

const HELP_FLAGS: [&str; 2] = ["-help", "-h"];

/// A program plus its argument vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Tokio command with piped output and no stdin
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Per-launch switches
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Put jars from the home directory on the classpath
    pub include_home_jars: bool,
    /// Only home jars whose name starts with this prefix
    pub home_jar_prefix: Option<String>,
    /// Put jars from the working directory on the classpath
    pub include_cwd_jars: bool,
    /// Append the inherited `CLASSPATH`
    pub include_parent_classpath: bool,
    /// Forward configured system properties
    pub forward_system_properties: bool,
    /// Point the WebDriver client at drivers in the home directory
    pub add_driver_properties: bool,
    pub continuous_restart: bool,
    pub restart_cycle: Duration,
    /// Re-run the manifest timestamp gate before each relaunch
    pub check_timestamp: bool,
    /// Remove previous downloads when the manifest changed
    pub cleanup_on_invocation: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            include_home_jars: true,
            home_jar_prefix: None,
            include_cwd_jars: true,
            include_parent_classpath: true,
            forward_system_properties: true,
            add_driver_properties: true,
            continuous_restart: true,
            restart_cycle: Duration::from_secs(60),
            check_timestamp: true,
            cleanup_on_invocation: true,
        }
    }
}

impl LaunchOptions {
    /// Settings for mobile drivers: isolated classpath, no restart loop, no re-provisioning
    pub fn isolated() -> Self {
        Self {
            include_cwd_jars: false,
            include_parent_classpath: false,
            forward_system_properties: false,
            add_driver_properties: false,
            continuous_restart: false,
            check_timestamp: false,
            cleanup_on_invocation: false,
            ..Default::default()
        }
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Value following `flag`, if any
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .filter(|v| !v.starts_with('-'))
        .map(String::as_str)
}

pub fn is_help(args: &[String]) -> bool {
    args.iter().any(|a| HELP_FLAGS.contains(&a.as_str()))
}

/// Remove `flag` and, when `with_value`, the value that follows it
pub fn strip_flag(args: &[String], flag: &str, with_value: bool) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == flag {
            if with_value && iter.peek().is_some_and(|v| !v.starts_with('-')) {
                iter.next();
            }
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// Append each `-flag [value]` group of `defaults` whose flag is not already in `args`
pub fn merge_defaults(args: &[String], defaults: &[String]) -> Vec<String> {
    let mut merged = args.to_vec();
    let mut i = 0;
    while i < defaults.len() {
        let flag = &defaults[i];
        let value = defaults
            .get(i + 1)
            .filter(|v| !v.starts_with('-'))
            .cloned();
        i += if value.is_some() { 2 } else { 1 };

        if has_flag(args, flag) {
            continue;
        }
        merged.push(flag.clone());
        merged.extend(value);
    }
    merged
}

// ============================================================================
// Java launches
// ============================================================================

/// Everything needed to turn component arguments into a java command line
#[derive(Debug, Clone)]
pub struct JavaLaunch {
    pub java_binary: String,
    pub main_class: String,
    pub role: InstanceRole,
    pub home_dir: PathBuf,
    pub working_dir: PathBuf,
    pub grid_config: PathBuf,
    pub os: OsFamily,
    pub options: LaunchOptions,
    pub system_properties: BTreeMap<String, String>,
    pub deny_properties: Vec<String>,
    /// Classpath entries added after the discovered ones
    pub extra_classpath: Vec<PathBuf>,
    /// Merged in for flags the caller did not pass
    pub default_args: Vec<String>,
}

impl JavaLaunch {
    /// Assemble the full command line for `args`
    pub fn command_line(&self, args: &[String]) -> Result<CommandLine> {
        let classpath = std::env::join_paths(self.classpath()?)
            .map_err(|e| Error::InvalidConfig(format!("invalid classpath entry: {}", e)))?;

        let cmd = CommandLine::new(&self.java_binary)
            .args(self.jvm_properties())
            .arg("-cp")
            .arg(classpath.to_string_lossy())
            .arg(&self.main_class)
            .args(self.program_args(args))
            .current_dir(&self.working_dir);

        debug!("Command line for {}: {}", self.role, cmd);
        Ok(cmd)
    }

    /// Deduplicated classpath in discovery order
    pub fn classpath(&self) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();

        if self.options.include_home_jars {
            entries.extend(jars_in(&self.home_dir, self.options.home_jar_prefix.as_deref())?);
        }
        if self.options.include_cwd_jars {
            entries.extend(jars_in(&self.working_dir, None)?);
        }
        if self.options.include_parent_classpath {
            if let Some(inherited) = std::env::var_os("CLASSPATH") {
                entries.extend(
                    std::env::split_paths(&inherited).filter(|p| !p.as_os_str().is_empty()),
                );
            }
        }
        entries.extend(self.extra_classpath.iter().cloned());

        let mut seen = HashSet::new();
        entries.retain(|p| seen.insert(p.clone()));
        Ok(entries)
    }

    /// `-Dkey=value` arguments
    pub fn jvm_properties(&self) -> Vec<String> {
        let mut props = Vec::new();

        if self.options.forward_system_properties {
            for (key, value) in &self.system_properties {
                if self.deny_properties.contains(key) {
                    continue;
                }
                props.push(format!("-D{}={}", key, value));
            }
        }

        let wants_drivers = matches!(self.role, InstanceRole::Node | InstanceRole::Standalone);
        if self.options.add_driver_properties && wants_drivers {
            for driver in KnownProcess::for_os(self.os) {
                let key = driver.driver_property();
                let forwarded = self.options.forward_system_properties
                    && self.system_properties.contains_key(key);
                if !forwarded {
                    let path = self.home_dir.join(driver.image_name(self.os));
                    props.push(format!("-D{}={}", key, path.display()));
                }
            }
        }
        props
    }

    /// Caller arguments plus role defaults, minus orchestration-only flags
    pub fn program_args(&self, args: &[String]) -> Vec<String> {
        let mut out = args.to_vec();
        let config_dir = self.home_dir.join("config");

        match self.role {
            InstanceRole::Node if !has_flag(&out, NODE_CONFIG) => {
                out.push(NODE_CONFIG.to_string());
                out.push(config_dir.join("nodeConfig.json").display().to_string());
            }
            InstanceRole::Hub if !has_flag(&out, HUB_CONFIG) => {
                out.push(HUB_CONFIG.to_string());
                out.push(config_dir.join("hubConfig.json").display().to_string());
            }
            _ => {}
        }

        if self.role != InstanceRole::Standalone && !has_flag(&out, GRID_CONFIG) {
            out.push(GRID_CONFIG.to_string());
            out.push(self.grid_config.display().to_string());
        }

        if is_mobile_role(self.role) {
            out = merge_defaults(&out, &self.default_args);
            out = strip_flag(&out, GRID_CONFIG, true);
        }
        strip_flag(&out, NO_CONTINUOUS_RESTART, false)
    }
}

fn is_mobile_role(role: InstanceRole) -> bool {
    matches!(role, InstanceRole::Selendroid | InstanceRole::IosDriver)
}

/// `*.jar` files directly inside `dir`, sorted by name
fn jars_in(dir: &Path, prefix: Option<&str>) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut jars: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            path.is_file()
                && name.to_ascii_lowercase().ends_with(".jar")
                && prefix.map_or(true, |p| name.starts_with(p))
        })
        .collect();
    jars.sort();
    Ok(jars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    fn launch(role: InstanceRole, home: &Path) -> JavaLaunch {
        JavaLaunch {
            java_binary: "java".into(),
            main_class: "org.openqa.grid.selenium.GridLauncher".into(),
            role,
            home_dir: home.to_path_buf(),
            working_dir: home.join("work"),
            grid_config: home.join("config/gridConfig.json"),
            os: OsFamily::Linux,
            options: LaunchOptions {
                include_parent_classpath: false,
                ..Default::default()
            },
            system_properties: BTreeMap::new(),
            deny_properties: vec!["java.util.logging.config.file".into()],
            extra_classpath: vec![],
            default_args: vec![],
        }
    }

    #[test]
    fn test_strip_and_merge() {
        let args = s(&["-port", "5555", "-gridConfig", "/tmp/g.json", "-noContinuousRestart"]);
        assert_eq!(
            strip_flag(&args, GRID_CONFIG, true),
            s(&["-port", "5555", "-noContinuousRestart"])
        );
        assert_eq!(flag_value(&args, "-port"), Some("5555"));

        let merged = merge_defaults(
            &s(&["-port", "5555"]),
            &s(&["-port", "1", "-keepAdbAlive", "-x", "y"]),
        );
        assert_eq!(merged, s(&["-port", "5555", "-keepAdbAlive", "-x", "y"]));
    }

    #[test]
    fn test_node_defaults_and_driver_properties() {
        let home = tempfile::tempdir().unwrap();
        let mut node = launch(InstanceRole::Node, home.path());
        node.system_properties
            .insert("java.util.logging.config.file".into(), "/etc/log.properties".into());
        node.system_properties
            .insert("webdriver.chrome.driver".into(), "/opt/chromedriver".into());

        let cmd = node.command_line(&s(&["-role", "node", NO_CONTINUOUS_RESTART])).unwrap();

        assert!(!cmd.args.iter().any(|a| a.contains("logging.config")));
        assert!(cmd.args.contains(&"-Dwebdriver.chrome.driver=/opt/chromedriver".to_string()));
        let phantom = format!(
            "-Dphantomjs.binary.path={}",
            home.path().join("phantomjs").display()
        );
        assert!(cmd.args.contains(&phantom));
        assert!(has_flag(&cmd.args, NODE_CONFIG));
        assert!(has_flag(&cmd.args, GRID_CONFIG));
        assert!(!has_flag(&cmd.args, NO_CONTINUOUS_RESTART));
    }

    #[test]
    fn test_mobile_args_drop_orchestration_flags() {
        let home = tempfile::tempdir().unwrap();
        let mut selendroid = launch(InstanceRole::Selendroid, home.path());
        selendroid.options = LaunchOptions::isolated();
        selendroid.default_args = s(&["-keepAdbAlive", "-port", "4444"]);

        let args = selendroid.program_args(&s(&["-port", "5555", "-gridConfig", "custom.json"]));
        assert_eq!(args, s(&["-port", "5555", "-keepAdbAlive"]));
        assert!(selendroid.jvm_properties().is_empty());
    }

    #[test]
    fn test_classpath_dedups_home_and_cwd_jars() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join("selenium-server-3.0.jar"), b"").unwrap();
        std::fs::write(home.path().join("other.jar"), b"").unwrap();
        std::fs::write(home.path().join("notes.txt"), b"").unwrap();

        let mut hub = launch(InstanceRole::Hub, home.path());
        hub.working_dir = home.path().to_path_buf();
        hub.options.home_jar_prefix = Some("selenium-server".into());

        let classpath = hub.classpath().unwrap();
        assert_eq!(
            classpath,
            vec![
                home.path().join("selenium-server-3.0.jar"),
                home.path().join("other.jar"),
            ]
        );
    }

    #[test]
    fn test_help_detection() {
        assert!(is_help(&s(&["-role", "hub", "-h"])));
        assert!(!is_help(&s(&["-hubConfig", "x"])));
    }
}
