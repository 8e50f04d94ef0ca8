use std::{env, path::PathBuf};

use clap::Parser;
use gfx_shim_common::config::{ConfigError, LauncherConfig};

/// File name of the module built by `gfx-shim-dll`.
pub const DEFAULT_MODULE: &str = "gfx_shim_dll.dll";

#[derive(Parser, Debug, Default)]
#[command(name = "gfx-shim-launcher", version)]
#[command(about = "Load the gfx-shim module into processes as they start")]
pub struct Args {
    /// Process names to watch for, like `PotPlayerMini64.exe`
    #[arg(value_name = "NAMES")]
    pub names: Vec<String>,

    /// Module for targets of the launcher's architecture
    #[arg(long, value_name = "PATH")]
    pub module: Option<PathBuf>,

    /// Module for 32-bit targets
    #[arg(long, value_name = "PATH")]
    pub module_x86: Option<PathBuf>,

    /// Exit after the first injection attempt
    #[arg(long)]
    pub once: bool,

    /// Unload the module from running target processes and exit
    #[arg(long, conflicts_with = "once")]
    pub eject: bool,

    /// Seconds a process must live before it is injected
    #[arg(long, value_name = "SECS")]
    pub delay: Option<f64>,

    /// Seconds between process list polls
    #[arg(long, value_name = "SECS")]
    pub poll: Option<f64>,

    /// Consecutive failures of one process name before it is suspended
    #[arg(long, value_name = "N")]
    pub max_crashes: Option<u32>,

    /// Launcher configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Do not require an elevated launcher
    #[arg(long)]
    pub allow_unelevated: bool,
}

impl Args {
    /// Load the configuration file, if any, and apply flags over it.
    pub fn launcher_config(&self) -> Result<LauncherConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => LauncherConfig::load(path)?,
            None => LauncherConfig::default(),
        };

        if !self.names.is_empty() {
            config.target_process_names = self.names.clone();
        }
        if let Some(module) = &self.module {
            config.module_path = Some(module.clone());
        }
        if let Some(module) = &self.module_x86 {
            config.module_path_x86 = Some(module.clone());
        }
        if let Some(delay) = self.delay {
            config.settle_delay_seconds = delay;
        }
        if let Some(poll) = self.poll {
            config.poll_interval_seconds = poll;
        }
        if let Some(max_crashes) = self.max_crashes {
            config.max_crash_count = max_crashes;
        }

        if config.module_path.is_none() {
            config.module_path = Some(default_module());
        }

        config.validate()?;
        Ok(config)
    }
}

fn default_module() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| Some(exe.parent()?.join(DEFAULT_MODULE)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MODULE))
}

/// Module builds to hand to the loader, native first.
pub fn module_paths(config: &LauncherConfig) -> Vec<PathBuf> {
    config
        .module_path
        .iter()
        .chain(config.module_path_x86.iter())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::Path};

    use super::*;

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from([
            "gfx-shim-launcher",
            "PotPlayerMini64.exe",
            "drtm.exe",
            "--module",
            "C:\\shim\\gfx_shim_dll.dll",
            "--once",
            "--delay",
            "0.5",
            "--max-crashes",
            "2",
        ])
        .unwrap();

        assert_eq!(args.names, ["PotPlayerMini64.exe", "drtm.exe"]);
        assert!(args.once);
        assert!(!args.allow_unelevated);

        let config = args.launcher_config().unwrap();
        assert_eq!(config.settle_delay_seconds, 0.5);
        assert_eq!(config.poll_interval_seconds, 1.0);
        assert_eq!(config.max_crash_count, 2);
        assert_eq!(
            module_paths(&config),
            [PathBuf::from("C:\\shim\\gfx_shim_dll.dll")]
        );
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
            target_process_names = ["player.exe"]
            poll_interval_seconds = 2.0
            module_path_x86 = "shim32.dll"
            "#,
        )
        .unwrap();

        let args = Args {
            config: Some(file.path().to_owned()),
            poll: Some(0.25),
            module: Some(PathBuf::from("shim64.dll")),
            ..Default::default()
        };
        let config = args.launcher_config().unwrap();

        assert_eq!(config.target_process_names, ["player.exe"]);
        assert_eq!(config.poll_interval_seconds, 0.25);
        assert_eq!(
            module_paths(&config),
            [Path::new("shim64.dll"), Path::new("shim32.dll")]
        );
    }

    #[test]
    fn missing_names_are_a_config_error() {
        let args = Args::try_parse_from(["gfx-shim-launcher", "--once"]).unwrap();

        assert!(matches!(
            args.launcher_config(),
            Err(ConfigError::InvalidValue {
                key: "target_process_names",
                ..
            })
        ));
    }

    #[test]
    fn eject_conflicts_with_once() {
        let args = Args::try_parse_from(["gfx-shim-launcher", "player.exe", "--eject"]).unwrap();
        assert!(args.eject);

        assert!(Args::try_parse_from(["gfx-shim-launcher", "player.exe", "--eject", "--once"]).is_err());
    }

    #[test]
    fn default_module_sits_next_to_launcher() {
        let args = Args {
            names: vec!["player.exe".to_owned()],
            ..Default::default()
        };
        let config = args.launcher_config().unwrap();

        assert_eq!(
            config.module_path.as_deref().and_then(Path::file_name),
            Some(DEFAULT_MODULE.as_ref())
        );
    }
}
