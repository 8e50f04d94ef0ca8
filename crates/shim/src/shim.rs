//! Process-wide shim state.

use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::bail;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    registry::{InstallReport, Registry},
    sink::CallSink,
};

static SHIM: OnceCell<Shim> = OnceCell::new();

static GATE: Gate = Gate::new();

/// Orders initialization against unload.
///
/// Initialization runs with the gate held. Once closed, the gate refuses
/// further initialization.
#[derive(Debug)]
struct Gate {
    closed: Mutex<bool>,
}

impl Gate {
    const fn new() -> Self {
        Self {
            closed: parking_lot::const_mutex(false),
        }
    }

    fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let closed = self.closed.lock();
        if *closed {
            return None;
        }

        Some(f())
    }

    /// Wait for a running `run` to return, then close the gate and run `f`.
    fn close<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut closed = self.closed.lock();
        *closed = true;
        f()
    }
}

/// The registry and call sink of the running shim.
///
/// Set once with [`Shim::set_global`] and torn down at most once.
pub struct Shim {
    registry: Registry,
    sink: Box<dyn CallSink>,
    torn_down: AtomicBool,
}

impl Shim {
    pub fn new(registry: Registry, sink: Box<dyn CallSink>) -> Self {
        Self {
            registry,
            sink,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Make this the process-wide instance.
    pub fn set_global(self) -> anyhow::Result<&'static Shim> {
        match SHIM.try_insert(self) {
            Ok(shim) => Ok(shim),
            Err(_) => bail!("shim is already initialized"),
        }
    }

    #[inline]
    pub fn get() -> Option<&'static Shim> {
        SHIM.get()
    }

    /// Block until the process-wide instance is set.
    #[inline]
    pub fn wait() -> &'static Shim {
        SHIM.wait()
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn sink(&self) -> &dyn CallSink {
        &*self.sink
    }

    /// Run process initialization unless unloading has started.
    ///
    /// Returns `None` without calling `init` once [`Shim::unload`] ran.
    /// [`Shim::unload`] waits for a running `init` to return.
    pub fn run_init<R>(init: impl FnOnce() -> R) -> Option<R> {
        let res = GATE.run(init);
        if res.is_none() {
            debug!("unloading, initialization skipped");
        }

        res
    }

    /// Refuse further initialization and tear down the process-wide
    /// instance, if there is one.
    ///
    /// Returns `true` if this call tore it down.
    pub fn unload(drain: Duration) -> bool {
        GATE.close(|| Self::get().is_some_and(|shim| shim.teardown(drain)))
    }

    /// Install every resolved hook. Does nothing once torn down.
    pub fn install(&self) -> InstallReport {
        if self.is_torn_down() {
            debug!("shim torn down, hooks not installed");
            return InstallReport::default();
        }

        let report = self.registry.install_all();
        for target in &report.installed {
            debug!(identity = %target, "hook active");
        }

        report
    }

    /// Remove every hook and close the sink. Later calls do nothing.
    ///
    /// Returns `false` if already torn down.
    pub fn teardown(&self, drain: Duration) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.registry.uninstall_all(drain);
        self.sink.close();
        info!("shim torn down");
        true
    }

    #[inline]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}
