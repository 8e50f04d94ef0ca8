//! Command line host of the lifecycle controller.

mod args;
mod process;

use core::pin::pin;
use std::{process::ExitCode, time::Instant};

use anyhow::Context;
use args::Args;
use clap::Parser;
use gfx_shim_common::config::LauncherConfig;
use gfx_shim_injector::{
    ErrorCategory, InjectError, RemoteLoader,
    lifecycle::{Controller, ControllerConfig, ControllerEvent},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Shutdown = 0,
    AttemptFailed = 1,
    Config = 2,
    NotElevated = 3,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(exit as u8)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    run(&args).into()
}

fn run(args: &Args) -> Exit {
    let config = match args.launcher_config() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration. err: {err}");
            return Exit::Config;
        }
    };

    let loader = match RemoteLoader::new(args::module_paths(&config), config.inject_timeout()) {
        Ok(loader) => loader,
        Err(err) => {
            error!("cannot use module. err: {err}");
            return Exit::Config;
        }
    };

    if !args.allow_unelevated && !process::is_elevated() {
        error!("the launcher must run elevated to open other processes, pass --allow-unelevated to try anyway");
        return Exit::NotElevated;
    }

    if args.eject {
        return eject(&config, &loader);
    }

    match watch(&config, loader, args.once) {
        Ok(exit) => exit,
        Err(err) => {
            error!("launcher stopped. err: {err:?}");
            Exit::Config
        }
    }
}

/// Unload the module from every running target. Fails if any target refused.
fn eject(config: &LauncherConfig, loader: &RemoteLoader) -> Exit {
    let observed = match process::list() {
        Ok(observed) => observed,
        Err(err) => {
            error!("cannot list processes. err: {err:?}");
            return Exit::AttemptFailed;
        }
    };

    let mut exit = Exit::Shutdown;
    let targets = observed.iter().filter(|process| {
        config
            .target_process_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&process.name))
    });
    for process in targets {
        let (pid, name) = (process.pid, &process.name);
        match loader.eject(pid) {
            Ok(()) => info!(pid, name, "module unloaded"),
            Err(InjectError::NotLoaded) => debug!(pid, name, "module not loaded"),
            Err(err) => {
                warn!(pid, name, stage = %err.stage(), "cannot unload module. err: {err}");
                exit = Exit::AttemptFailed;
            }
        }
    }

    exit
}

fn watch(config: &LauncherConfig, loader: RemoteLoader, once: bool) -> anyhow::Result<Exit> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot start runtime")?
        .block_on(poll(config, loader, once))
}

async fn poll(config: &LauncherConfig, mut loader: RemoteLoader, once: bool) -> anyhow::Result<Exit> {
    let mut controller = Controller::new(ControllerConfig::from(config));
    let interval = config.poll_interval();
    let mut shutdown = pin!(tokio::signal::ctrl_c());

    info!(
        targets = ?config.target_process_names,
        modules = loader.modules().len(),
        "watching for target processes"
    );

    loop {
        match process::list() {
            Ok(observed) => {
                // Attempts block this task until they finish or time out.
                for event in controller.tick(Instant::now(), &observed, &mut loader) {
                    report(&event);

                    if once {
                        match event {
                            ControllerEvent::Injected { .. } => return Ok(Exit::Shutdown),
                            ControllerEvent::AttemptFailed { .. } => return Ok(Exit::AttemptFailed),
                            _ => {}
                        }
                    }
                }
            }

            // A failed poll must not look like every process exited.
            Err(err) => warn!("cannot list processes. err: {err:?}"),
        }

        tokio::select! {
            res = &mut shutdown => {
                res.context("cannot listen for Ctrl-C")?;
                info!(attempts = controller.attempts().len(), "stopping");
                return Ok(Exit::Shutdown);
            }

            _ = tokio::time::sleep(interval) => {}
        }
    }
}

fn report(event: &ControllerEvent) {
    match event {
        ControllerEvent::Detected { pid, name } => {
            info!(pid, name, "target process detected");
        }

        ControllerEvent::Injecting { pid, name, attempt } => {
            info!(pid, name, attempt, "injecting");
        }

        ControllerEvent::Injected { pid, name, module } => {
            info!(pid, name, %module, "module loaded");
        }

        ControllerEvent::AttemptFailed {
            pid,
            name,
            stage,
            category: ErrorCategory::Permission,
            error,
        } => {
            error!(pid, name, %stage, "injection denied, run the launcher elevated. err: {error}");
        }

        ControllerEvent::AttemptFailed {
            pid,
            name,
            stage,
            category: ErrorCategory::TransientTimeout,
            error,
        } => {
            warn!(pid, name, %stage, "module load unconfirmed, it may still have loaded. err: {error}");
        }

        ControllerEvent::AttemptFailed {
            pid,
            name,
            stage,
            category,
            error,
        } => {
            warn!(pid, name, %stage, %category, "injection failed. err: {error}");
        }

        ControllerEvent::Suspended { name, failures } => {
            error!(
                name,
                failures,
                "injection suspended after {failures} consecutive failures, restart the launcher to retry"
            );
        }

        ControllerEvent::Exited { pid, name, state } => {
            info!(pid, name, ?state, "target process exited");
        }
    }
}
