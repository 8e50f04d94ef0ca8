//! Loading the gfx-shim module into running processes.
//!
//! [`inject`] places the module into one process. [`lifecycle::Controller`]
//! decides when to call it for processes matching configured names, making
//! sure every process is attempted at most once.

pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod module;

use core::fmt::{self, Display, Formatter};

pub use error::{ErrorCategory, InjectError, Stage};
pub use loader::{RemoteLoader, UNLOAD_EXPORT, eject, inject};

/// Base address of a module loaded into another process.
///
/// Only meaningful inside that process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

impl Display for ModuleHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
