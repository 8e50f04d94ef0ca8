//! Direct3D 11 and DXGI interception.

mod hooks;
mod resolver;
mod window;

use anyhow::Context;
use gfx_shim_common::config::ShimConfig;
use tracing::{info, warn};
use windows::Win32::Foundation::HINSTANCE;

use crate::{Shim, catalog, registry::Registry, sink::CallSink};

/// Build the registry, publish the process-wide [`Shim`] and install its hooks.
///
/// Targets are resolved while a throwaway device exists, so virtual tables are
/// read from live instances. Hook points that fail to resolve or install are
/// logged and skipped.
#[tracing::instrument(skip_all)]
pub fn initialize(
    hinstance: HINSTANCE,
    config: &ShimConfig,
    sink: Box<dyn CallSink>,
) -> anyhow::Result<&'static Shim> {
    let specs = catalog::select(config, hooks::detour);

    let registry = window::with_dummy_hwnd(hinstance, |hwnd| {
        let resolver = resolver::DeviceResolver::new(hwnd);
        Registry::build(specs, &resolver)
    })
    .context("cannot create dummy window")?;

    let shim = Shim::new(registry, sink).set_global()?;
    hooks::bind(shim.registry());

    let report = shim.install();
    for (target, err) in &report.unresolved {
        warn!(identity = %target, "hook point skipped. err: {err}");
    }
    info!(
        installed = report.installed.len(),
        skipped = report.unresolved.len() + report.failed.len(),
        "shim initialized"
    );

    Ok(shim)
}
