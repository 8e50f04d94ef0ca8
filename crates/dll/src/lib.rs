//! The gfx-shim module.
//!
//! Loading the module reads `gfx-shim.toml` next to it, sets up logging, opens
//! the call log and starts a thread that installs the hooks.
//!
//! Every thread the module starts holds its own reference to the module and
//! drops it on exit, so the image stays mapped while any of them runs. The
//! [`gfx_shim_unload`] export removes every hook, stops those threads and
//! releases the reference taken by `LoadLibraryW`.

#![cfg(windows)]

#[cfg(debug_assertions)]
mod dbg;

use core::{
    ffi::c_void,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io,
    os::windows::ffi::OsStringExt,
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
};

use anyhow::{Context, bail};
use gfx_shim::{Shim, d3d11, sink::JsonLinesSink};
use gfx_shim_common::config::{LogLevel, SHIM_CONFIG_FILE, ShimConfig};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*};
use windows::{
    Win32::{
        Foundation::{FreeLibrary, HINSTANCE, HMODULE, MAX_PATH},
        System::{
            LibraryLoader::{
                DisableThreadLibraryCalls, FreeLibraryAndExitThread,
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                GetModuleFileNameW, GetModuleHandleExW,
            },
            SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH},
        },
    },
    core::PCWSTR,
};

/// How long unloading waits for calls still inside interceptors.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Set by the first [`gfx_shim_unload`] call.
static UNLOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

#[unsafe(no_mangle)]
#[allow(non_snake_case)]
/// # Safety
/// Can be called by loader only. Must not be called manually.
pub unsafe extern "system" fn DllMain(
    dll_module: HINSTANCE,
    fdw_reason: u32,
    reserved: *mut (),
) -> bool {
    match fdw_reason {
        DLL_PROCESS_ATTACH => attach(dll_module),

        // A null `reserved` means FreeLibrary, not process exit. Module threads
        // hold references, so none of them is running here.
        DLL_PROCESS_DETACH if reserved.is_null() => {
            Shim::unload(DRAIN_TIMEOUT);
            true
        }

        _ => true,
    }
}

/// Remove every hook and unload the module.
///
/// Meant to be the start routine of a thread created in the target process.
/// Only the first call drops the reference taken by `LoadLibraryW`. The module
/// unmaps once its own threads have exited.
///
/// # Safety
/// Must run on a thread of its own. On success the thread exits inside this call.
#[unsafe(no_mangle)]
pub unsafe extern "system" fn gfx_shim_unload(_: *mut c_void) -> u32 {
    if UNLOAD_REQUESTED.swap(true, Ordering::AcqRel) {
        return 0;
    }

    let torn_down = Shim::unload(DRAIN_TIMEOUT);
    info!(torn_down, "gfx-shim unloading");

    match own_module(GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT) {
        Ok(module) => unsafe { FreeLibraryAndExitThread(module, 0) },
        Err(err) => {
            error!("cannot find own module. err: {err}");
            1
        }
    }
}

/// Handle of this module. Takes a reference unless `flags` says otherwise.
fn own_module(flags: u32) -> io::Result<HMODULE> {
    let mut module = HMODULE::default();
    unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | flags,
            PCWSTR(own_module as *const () as *const u16),
            &mut module,
        )
    }
    .map_err(io::Error::other)?;

    Ok(module)
}

/// Spawn a thread that keeps the module loaded until `f` returns.
fn module_thread(name: &str, f: impl FnOnce() + Send + 'static) -> io::Result<()> {
    let module = own_module(0)?.0 as usize;

    let spawned = thread::Builder::new().name(name.to_owned()).spawn(move || {
        f();
        unsafe { FreeLibraryAndExitThread(HMODULE(module as _), 0) }
    });

    if let Err(err) = spawned {
        _ = unsafe { FreeLibrary(HMODULE(module as _)) };
        return Err(err);
    }

    Ok(())
}
fn attach(dll_module: HINSTANCE) -> bool {
    _ = unsafe { DisableThreadLibraryCalls(HMODULE(dll_module.0)) };

    let Ok(dir) = module_dir(dll_module) else {
        return false;
    };

    let config = ShimConfig::load_or_default(&dir.join(SHIM_CONFIG_FILE));
    setup_tracing(
        &dir,
        config.as_ref().map_or(LogLevel::default(), |config| config.log_level),
    );

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            error!("cannot load configuration. err: {err}");
            return false;
        }
    };

    match start(dll_module, &dir, config) {
        Ok(()) => true,
        Err(err) => {
            error!("cannot start shim. err: {err:?}");
            false
        }
    }
}

fn start(dll_module: HINSTANCE, dir: &Path, config: ShimConfig) -> anyhow::Result<()> {
    let call_log = config.call_log_path(dir);
    let sink = JsonLinesSink::open_with(&call_log, |name, writer| module_thread(name, writer))
        .with_context(|| format!("cannot open call log {}", call_log.display()))?;
    info!(call_log = %call_log.display(), "gfx-shim loaded");

    // Hooks are installed off the loader lock. Dropping an unused sink stops its writer.
    let hinstance = dll_module.0 as usize;
    module_thread("gfx-shim init", move || {
        let sink = Box::new(sink);
        match Shim::run_init(|| d3d11::initialize(HINSTANCE(hinstance as _), &config, sink)) {
            Some(Ok(shim)) => debug!(hooks = shim.registry().len(), "initialization finished"),
            Some(Err(err)) => error!("initialization failed. err: {err:?}"),
            None => {}
        }
    })
    .context("cannot spawn initialization thread")?;

    Ok(())
}

fn module_dir(dll_module: HINSTANCE) -> anyhow::Result<PathBuf> {
    let mut buf = vec![0u16; MAX_PATH as usize];
    loop {
        let len = unsafe { GetModuleFileNameW(Some(HMODULE(dll_module.0)), &mut buf) } as usize;
        if len == 0 {
            bail!("GetModuleFileNameW call failed");
        }

        if len < buf.len() {
            let path = PathBuf::from(OsString::from_wide(&buf[..len]));
            return path
                .parent()
                .map(Path::to_path_buf)
                .context("module path has no parent");
        }

        buf.resize(buf.len() * 2, 0);
    }
}

fn open_log_file(dir: &Path) -> Option<File> {
    let logs = dir.join("logs");
    fs::create_dir_all(&logs).ok()?;

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs.join("gfx-shim.log"))
        .ok()
}

fn setup_tracing(dir: &Path, level: LogLevel) {
    let file_layer = (level != LogLevel::Off)
        .then(|| open_log_file(dir))
        .flatten()
        .map(|file| {
            fmt::layer()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_writer(Mutex::new(file))
        });

    let subscriber = tracing_subscriber::registry()
        .with(level.to_level_filter())
        .with(file_layer);

    #[cfg(debug_assertions)]
    let subscriber = subscriber.with(
        fmt::layer()
            .with_ansi(false)
            .with_thread_ids(true)
            .with_writer(dbg::DebuggerMakeWriter::default()),
    );

    _ = subscriber.try_init();
}
