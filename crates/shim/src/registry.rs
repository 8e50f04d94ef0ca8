//! Table of interception points and their install state.
//!
//! The registry is built once, before any hook is installed, and is read-only
//! afterwards apart from each descriptor's atomic state.

use core::{
    ffi::c_void,
    mem::size_of,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};
use std::{
    thread,
    time::{Duration, Instant},
};

use gfx_shim_common::identity::TargetIdentity;
use gfx_shim_hook::{HookError, InlineHook, PreparedInlineHook, PreparedSlotHook, SlotHook};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a target has no address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("module `{0}` is not loaded")]
    ModuleNotLoaded(String),

    #[error("`{module}` does not export `{symbol}`")]
    SymbolNotFound { module: String, symbol: String },

    #[error("no instance of `{0}` is available")]
    InterfaceUnavailable(String),

    #[error("virtual table slot is empty")]
    NullSlot,

    #[error("no interceptor exists for this target")]
    NoInterceptor,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("target is unresolved: {0}")]
    Unresolved(#[from] ResolutionError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("an earlier install attempt failed")]
    PreviouslyFailed,

    #[error("hook was removed")]
    Removed,

    #[error("hook is not installed")]
    NotInstalled,
}

/// Finds the addresses behind target identities.
///
/// # Safety
/// [`TargetResolver::vtable`] must return the address of a virtual table that
/// stays mapped for the rest of the process and holds every slot index the
/// registry is asked to hook.
pub unsafe trait TargetResolver {
    /// Address of `symbol` exported by `module`.
    fn export(&self, module: &str, symbol: &str) -> Result<usize, ResolutionError>;

    /// Address of the virtual table used by instances of `interface`.
    fn vtable(&self, interface: &str) -> Result<usize, ResolutionError>;
}

/// A requested interception point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub target: TargetIdentity,

    /// Address of the interceptor stub. `None` when none is compiled in.
    pub detour: Option<usize>,

    pub rewrite: bool,
}

/// Where a target was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Export { address: usize },
    VTableSlot { slot: usize, address: usize },
}

impl Resolved {
    /// Address of the original function.
    pub const fn address(&self) -> usize {
        match *self {
            Self::Export { address } | Self::VTableSlot { address, .. } => address,
        }
    }
}

const IDLE: u8 = 0;
const INSTALLING: u8 = 1;
const INSTALLED: u8 = 2;
const FAILED: u8 = 3;
const REMOVING: u8 = 4;
const REMOVED: u8 = 5;

#[derive(Debug)]
enum Patch {
    Inline(InlineHook),
    Slot(SlotHook),
}

impl Patch {
    unsafe fn detach(&self) -> Result<(), HookError> {
        match self {
            Self::Inline(hook) => unsafe { hook.detach() },
            Self::Slot(hook) => unsafe { hook.detach() },
        }
    }

    unsafe fn release(self) {
        match self {
            Self::Inline(hook) => unsafe { hook.release() },
            Self::Slot(_) => {}
        }
    }
}

/// One interception point.
#[derive(Debug)]
pub struct HookDescriptor {
    target: TargetIdentity,
    rewrite: bool,
    detour: usize,
    resolution: Result<Resolved, ResolutionError>,
    state: AtomicU8,

    /// Address that runs the original function. Published before the redirect.
    trampoline: AtomicUsize,
    patch: Mutex<Option<Patch>>,
    in_flight: AtomicUsize,
}

impl HookDescriptor {
    fn new(spec: HookSpec, resolution: Result<Resolved, ResolutionError>) -> Self {
        Self {
            target: spec.target,
            rewrite: spec.rewrite,
            detour: spec.detour.unwrap_or_default(),
            resolution,
            state: AtomicU8::new(IDLE),
            trampoline: AtomicUsize::new(0),
            patch: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn target(&self) -> &TargetIdentity {
        &self.target
    }

    #[inline]
    pub fn rewrite_enabled(&self) -> bool {
        self.rewrite
    }

    #[inline]
    pub fn resolution(&self) -> Result<&Resolved, &ResolutionError> {
        self.resolution.as_ref()
    }

    pub fn original_address(&self) -> Option<usize> {
        self.resolution.as_ref().ok().map(Resolved::address)
    }

    /// Trampoline of an installed hook.
    pub fn trampoline(&self) -> Option<usize> {
        self.is_installed()
            .then(|| self.trampoline.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_installed(&self) -> bool {
        self.state.load(Ordering::Acquire) == INSTALLED
    }

    /// Address interceptors call to reach the original function.
    ///
    /// Set before the redirect is written and kept after removal, so a call
    /// that entered the interceptor always finds it.
    #[inline]
    pub fn forward_address(&self) -> usize {
        self.trampoline.load(Ordering::Acquire)
    }

    /// Count a call as running through the interceptor until the guard drops.
    #[inline]
    pub fn enter(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(&self.in_flight)
    }

    /// Redirect the target to its interceptor.
    ///
    /// Returns the trampoline address. Once installed, further calls return
    /// the same address without patching again. A call racing with an install
    /// in progress waits for it to finish.
    #[tracing::instrument(level = "debug", skip(self), fields(identity = %self.target))]
    pub fn install(&self) -> Result<usize, InstallError> {
        let resolved = *self.resolution.as_ref().map_err(Clone::clone)?;

        loop {
            match self
                .state
                .compare_exchange(IDLE, INSTALLING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(INSTALLING) => thread::yield_now(),
                Err(INSTALLED) => return Ok(self.trampoline.load(Ordering::Acquire)),
                Err(FAILED) => return Err(InstallError::PreviouslyFailed),
                Err(_) => return Err(InstallError::Removed),
            }
        }

        match unsafe { self.apply(resolved) } {
            Ok(patch) => {
                *self.patch.lock() = Some(patch);
                self.state.store(INSTALLED, Ordering::Release);

                let trampoline = self.trampoline.load(Ordering::Acquire);
                debug!(trampoline, "hook installed");
                Ok(trampoline)
            }

            Err(err) => {
                self.trampoline.store(0, Ordering::Release);
                self.state.store(FAILED, Ordering::Release);
                Err(err.into())
            }
        }
    }

    unsafe fn apply(&self, resolved: Resolved) -> Result<Patch, HookError> {
        let detour = self.detour as *const c_void;

        match resolved {
            Resolved::Export { address } => {
                let prepared = unsafe { PreparedInlineHook::new(address as *const c_void, detour) }?;
                self.trampoline
                    .store(prepared.trampoline() as usize, Ordering::Release);
                Ok(Patch::Inline(unsafe { prepared.commit() }?))
            }

            Resolved::VTableSlot { slot, .. } => {
                let prepared = unsafe { PreparedSlotHook::new(slot as *mut *const c_void, detour) }?;
                self.trampoline
                    .store(prepared.original() as usize, Ordering::Release);
                Ok(Patch::Slot(unsafe { prepared.commit() }?))
            }
        }
    }

    /// Restore the target's original code or slot.
    ///
    /// Waits up to `drain` for calls already inside the interceptor to return
    /// before freeing the trampoline. If they do not, the trampoline is leaked.
    /// A patch replaced by someone else is left in place and the hook stays
    /// installed.
    #[tracing::instrument(level = "debug", skip(self), fields(identity = %self.target))]
    pub fn uninstall(&self, drain: Duration) -> Result<(), InstallError> {
        if self
            .state
            .compare_exchange(INSTALLED, REMOVING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(InstallError::NotInstalled);
        }

        let mut guard = self.patch.lock();
        let Some(patch) = guard.take() else {
            self.state.store(REMOVED, Ordering::Release);
            return Ok(());
        };

        if let Err(err) = unsafe { patch.detach() } {
            *guard = Some(patch);
            self.state.store(INSTALLED, Ordering::Release);
            return Err(err.into());
        }
        drop(guard);

        let deadline = Instant::now() + drain;
        while self.in_flight.load(Ordering::Acquire) != 0 {
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.in_flight.load(Ordering::Relaxed),
                    "calls still running after unhook, leaking trampoline"
                );
                self.state.store(REMOVED, Ordering::Release);
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }

        unsafe { patch.release() };
        self.state.store(REMOVED, Ordering::Release);
        debug!("hook removed");
        Ok(())
    }
}

/// A call running through an interceptor.
#[derive(Debug)]
pub struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Outcome of [`Registry::install_all`].
#[derive(Debug, Default)]
pub struct InstallReport {
    pub installed: Vec<TargetIdentity>,
    pub unresolved: Vec<(TargetIdentity, ResolutionError)>,
    pub failed: Vec<(TargetIdentity, InstallError)>,
}

/// Every configured interception point.
#[derive(Debug, Default)]
pub struct Registry {
    descriptors: Vec<HookDescriptor>,
    index: FxHashMap<TargetIdentity, usize>,
}

impl Registry {
    /// Resolve each spec. Failures mark only their own descriptor as unresolved.
    ///
    /// Specs naming an already listed target are dropped.
    pub fn build(specs: impl IntoIterator<Item = HookSpec>, resolver: &dyn TargetResolver) -> Self {
        let mut registry = Self::default();

        for spec in specs {
            if registry.index.contains_key(&spec.target) {
                warn!(identity = %spec.target, "duplicate hook point ignored");
                continue;
            }

            let resolution = match spec.detour {
                Some(_) => resolve(&spec.target, resolver),
                None => Err(ResolutionError::NoInterceptor),
            };
            match &resolution {
                Ok(resolved) => {
                    debug!(identity = %spec.target, address = resolved.address(), "target resolved")
                }
                Err(err) => warn!(identity = %spec.target, "target unresolved. err: {err}"),
            }

            registry
                .index
                .insert(spec.target.clone(), registry.descriptors.len());
            registry.descriptors.push(HookDescriptor::new(spec, resolution));
        }

        registry
    }

    pub fn get(&self, target: &TargetIdentity) -> Option<&HookDescriptor> {
        self.index.get(target).map(|&i| &self.descriptors[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &HookDescriptor> {
        self.descriptors.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptors that will never be installed.
    pub fn unresolved(&self) -> impl Iterator<Item = (&TargetIdentity, &ResolutionError)> {
        self.descriptors
            .iter()
            .filter_map(|descriptor| Some((&descriptor.target, descriptor.resolution.as_ref().err()?)))
    }

    /// Install every resolved descriptor. One failure does not stop the rest.
    pub fn install_all(&self) -> InstallReport {
        let mut report = InstallReport::default();

        for descriptor in &self.descriptors {
            let target = descriptor.target.clone();
            match descriptor.install() {
                Ok(_) => report.installed.push(target),
                Err(InstallError::Unresolved(err)) => report.unresolved.push((target, err)),
                Err(err) => {
                    warn!(identity = %target, "hook install failed. err: {err}");
                    report.failed.push((target, err));
                }
            }
        }

        info!(
            installed = report.installed.len(),
            unresolved = report.unresolved.len(),
            failed = report.failed.len(),
            "hooks installed"
        );
        report
    }

    /// Uninstall every installed descriptor, latest first.
    pub fn uninstall_all(&self, drain: Duration) {
        for descriptor in self.descriptors.iter().rev() {
            if !descriptor.is_installed() {
                continue;
            }

            if let Err(err) = descriptor.uninstall(drain) {
                warn!(identity = %descriptor.target, "hook removal failed. err: {err}");
            }
        }
    }
}

fn resolve(target: &TargetIdentity, resolver: &dyn TargetResolver) -> Result<Resolved, ResolutionError> {
    match target {
        TargetIdentity::Export { module, symbol } => Ok(Resolved::Export {
            address: resolver.export(module, symbol)?,
        }),

        TargetIdentity::VTableSlot { interface, index } => {
            let vtable = resolver.vtable(interface)?;
            if vtable == 0 {
                return Err(ResolutionError::InterfaceUnavailable(interface.to_string()));
            }

            let slot = vtable + index * size_of::<usize>();
            // SAFETY: guaranteed by the TargetResolver contract
            let address = unsafe { *(slot as *const usize) };
            if address == 0 {
                return Err(ResolutionError::NullSlot);
            }

            Ok(Resolved::VTableSlot { slot, address })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Missing;

    unsafe impl TargetResolver for Missing {
        fn export(&self, module: &str, symbol: &str) -> Result<usize, ResolutionError> {
            Err(ResolutionError::SymbolNotFound {
                module: module.to_owned(),
                symbol: symbol.to_owned(),
            })
        }

        fn vtable(&self, interface: &str) -> Result<usize, ResolutionError> {
            Err(ResolutionError::InterfaceUnavailable(interface.to_owned()))
        }
    }

    fn spec(target: TargetIdentity, detour: Option<usize>) -> HookSpec {
        HookSpec {
            target,
            detour,
            rewrite: false,
        }
    }

    #[test]
    fn unresolved_descriptors_never_install() {
        let registry = Registry::build(
            [
                spec(TargetIdentity::export("a.dll", "f"), Some(0x1000)),
                spec(TargetIdentity::vtable_slot("IFoo", 3), None),
                spec(TargetIdentity::export("a.dll", "f"), Some(0x2000)),
            ],
            &Missing,
        );

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.unresolved().count(), 2);
        assert!(matches!(
            registry.get(&TargetIdentity::vtable_slot("IFoo", 3)).unwrap().resolution(),
            Err(ResolutionError::NoInterceptor)
        ));

        let report = registry.install_all();
        assert!(report.installed.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(report.unresolved.len(), 2);

        let descriptor = registry.get(&TargetIdentity::export("a.dll", "f")).unwrap();
        assert!(!descriptor.is_installed());
        assert_eq!(descriptor.trampoline(), None);
        assert!(matches!(
            descriptor.uninstall(Duration::ZERO),
            Err(InstallError::NotInstalled)
        ));
    }

    #[test]
    fn in_flight_guard_counts_calls() {
        let registry = Registry::build([spec(TargetIdentity::export("a.dll", "f"), None)], &Missing);
        let descriptor = registry.iter().next().unwrap();

        let outer = descriptor.enter();
        let inner = descriptor.enter();
        assert_eq!(descriptor.in_flight.load(Ordering::Relaxed), 2);
        drop(inner);
        drop(outer);
        assert_eq!(descriptor.in_flight.load(Ordering::Relaxed), 0);
    }
}
