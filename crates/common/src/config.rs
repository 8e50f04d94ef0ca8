//! TOML configuration of the shim module and the launcher.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::identity::TargetIdentity;

/// File name of the shim configuration, looked up next to the shim module.
pub const SHIM_CONFIG_FILE: &str = "gfx-shim.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid target identity `{text}`: {reason}")]
    InvalidIdentity { text: String, reason: &'static str },

    #[error("invalid `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Verbosity of the shim's diagnostic log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "none")]
    Off,
    Error,
    Warn,
    #[default]
    Info,
    #[serde(alias = "verbose")]
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn to_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// One configured interception point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookPointConfig {
    /// Target identity in text form, parsed by [`HookPointConfig::identity`].
    pub target: String,

    /// Whether the hook point's rewrite is applied.
    #[serde(default)]
    pub rewrite: bool,
}

impl HookPointConfig {
    pub fn identity(&self) -> Result<TargetIdentity, ConfigError> {
        self.target.parse()
    }
}

/// Configuration of the shim module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShimConfig {
    pub log_level: LogLevel,

    /// Call record log. Relative paths are resolved against the module directory.
    pub log_file_path: PathBuf,

    /// Interception points to install. `None` selects every known point with
    /// rewrites disabled.
    pub hook_points: Option<Vec<HookPointConfig>>,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_file_path: PathBuf::from("logs/calls.jsonl"),
            hook_points: None,
        }
    }
}

impl ShimConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    /// Like [`ShimConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            res => res,
        }
    }

    pub fn call_log_path(&self, module_dir: &Path) -> PathBuf {
        module_dir.join(&self.log_file_path)
    }
}

/// Configuration of the launcher. Command line flags override these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherConfig {
    pub target_process_names: Vec<String>,
    pub poll_interval_seconds: f64,
    pub settle_delay_seconds: f64,
    pub max_crash_count: u32,
    pub inject_timeout_seconds: f64,

    /// Shim module for targets of the launcher's own architecture.
    pub module_path: Option<PathBuf>,

    /// Shim module for 32-bit targets when the launcher is 64-bit.
    pub module_path_x86: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            target_process_names: Vec::new(),
            poll_interval_seconds: 1.0,
            settle_delay_seconds: 3.0,
            max_crash_count: 3,
            inject_timeout_seconds: 5.0,
            module_path: None,
            module_path_x86: None,
        }
    }
}

impl LauncherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    /// Check values that the type system cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_process_names.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "target_process_names",
                reason: "no target process names given".to_owned(),
            });
        }
        if let Some(name) = self.target_process_names.iter().find(|name| name.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: "target_process_names",
                reason: format!("blank name {name:?}"),
            });
        }

        seconds("poll_interval_seconds", self.poll_interval_seconds, false)?;
        seconds("settle_delay_seconds", self.settle_delay_seconds, true)?;
        seconds("inject_timeout_seconds", self.inject_timeout_seconds, false)?;

        if self.max_crash_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_crash_count",
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.settle_delay_seconds)
    }

    pub fn inject_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.inject_timeout_seconds)
    }
}

fn seconds(key: &'static str, value: f64, allow_zero: bool) -> Result<(), ConfigError> {
    let valid = value.is_finite() && value < 86_400.0 && (value > 0.0 || (allow_zero && value == 0.0));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key,
            reason: format!("{value} is not a usable number of seconds"),
        })
    }
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;

    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_shim_config_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ShimConfig::load_or_default(&dir.path().join(SHIM_CONFIG_FILE)).unwrap();

        assert_eq!(config, ShimConfig::default());
        assert_eq!(config.hook_points, None);
        assert_eq!(
            config.call_log_path(Path::new("/opt/shim")),
            Path::new("/opt/shim/logs/calls.jsonl")
        );
    }

    #[test]
    fn parses_shim_config() {
        let file = write_config(
            r#"
            log_level = "verbose"
            log_file_path = "trace/calls.jsonl"

            [[hook_points]]
            target = "ID3D11Device#5"
            rewrite = true

            [[hook_points]]
            target = "IDXGISwapChain#8"
            "#,
        );
        let config = ShimConfig::load(file.path()).unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.log_file_path, Path::new("trace/calls.jsonl"));

        let points = config.hook_points.unwrap();
        assert_eq!(points.len(), 2);
        assert!(points[0].rewrite);
        assert!(!points[1].rewrite);
        assert_eq!(
            points[1].identity().unwrap(),
            TargetIdentity::vtable_slot("IDXGISwapChain", 8)
        );
    }

    #[test]
    fn bad_identity_fails_only_its_entry() {
        let file = write_config(
            r#"
            [[hook_points]]
            target = "not an identity"

            [[hook_points]]
            target = "d3d11.dll!D3D11CreateDevice"
            "#,
        );
        let points = ShimConfig::load(file.path()).unwrap().hook_points.unwrap();

        assert!(points[0].identity().is_err());
        assert!(points[1].identity().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config("log_levle = \"info\"\n");
        assert!(matches!(
            ShimConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn launcher_defaults_and_overrides() {
        let file = write_config(
            r#"
            target_process_names = ["PotPlayerMini64.exe", "mpc-hc64.exe"]
            settle_delay_seconds = 0.5
            max_crash_count = 5
            "#,
        );
        let config = LauncherConfig::load(file.path()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.target_process_names.len(), 2);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.settle_delay(), Duration::from_millis(500));
        assert_eq!(config.inject_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_crash_count, 5);
        assert_eq!(config.module_path, None);
    }

    #[test]
    fn launcher_validation() {
        assert!(LauncherConfig::default().validate().is_err());

        let valid = LauncherConfig {
            target_process_names: vec!["player.exe".to_owned()],
            ..Default::default()
        };
        valid.validate().unwrap();

        for invalid in [
            LauncherConfig {
                poll_interval_seconds: 0.0,
                ..valid.clone()
            },
            LauncherConfig {
                settle_delay_seconds: f64::NAN,
                ..valid.clone()
            },
            LauncherConfig {
                max_crash_count: 0,
                ..valid.clone()
            },
            LauncherConfig {
                target_process_names: vec![" ".to_owned()],
                ..valid.clone()
            },
        ] {
            assert!(matches!(
                invalid.validate(),
                Err(ConfigError::InvalidValue { .. })
            ));
        }
    }

    #[test]
    fn level_filters() {
        assert_eq!(LogLevel::Off.to_level_filter(), LevelFilter::OFF);
        assert_eq!(LogLevel::default().to_level_filter(), LevelFilter::INFO);
        assert!(LogLevel::Trace > LogLevel::Info);
    }
}
