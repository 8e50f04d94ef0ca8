use core::{
    fmt::{self, Display, Formatter},
    time::Duration,
};
use std::path::PathBuf;

use thiserror::Error;

use crate::module::Architecture;

/// Step of an injection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Inspect,
    OpenProcess,
    QueryArchitecture,
    ResolveLoader,
    Allocate,
    Write,
    CreateThread,
    Wait,
    Confirm,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inspect => "module inspection",
            Self::OpenProcess => "opening process",
            Self::QueryArchitecture => "querying process architecture",
            Self::ResolveLoader => "resolving LoadLibraryW",
            Self::Allocate => "remote allocation",
            Self::Write => "remote write",
            Self::CreateThread => "remote thread creation",
            Self::Wait => "waiting for remote thread",
            Self::Confirm => "load confirmation",
        })
    }
}

/// How the lifecycle controller treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Missing rights on the target. Needs elevation, never retried.
    Permission,

    /// The module cannot run in the target. Never retried.
    Compatibility,

    /// The target failed to load or initialize the module.
    LoadFailure,

    /// Completion was not confirmed in time. The module may still have loaded.
    TransientTimeout,
}

impl ErrorCategory {
    /// Whether the failure counts towards the crash-loop breaker.
    pub const fn counts_as_crash(self) -> bool {
        matches!(self, Self::LoadFailure | Self::TransientTimeout)
    }
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Permission => "permission",
            Self::Compatibility => "compatibility",
            Self::LoadFailure => "load failure",
            Self::TransientTimeout => "timeout",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InjectError {
    #[error("access denied to process {pid}, try running elevated")]
    AccessDenied { pid: u32 },

    #[error("module is built for {module}, target process is {target}")]
    ArchitectureMismatch {
        module: Architecture,
        target: Architecture,
    },

    #[error("target process refused to load the module")]
    ModuleRefused,

    #[error("module load was not confirmed within {0:?}")]
    Timeout(Duration),

    #[error("{stage} failed. code: {code:#x}")]
    Os { stage: Stage, code: i32 },

    #[error("module {} does not exist", .0.display())]
    ModuleNotFound(PathBuf),

    #[error("invalid module {}: {reason}", path.display())]
    InvalidModule { path: PathBuf, reason: String },

    #[error("module is not loaded in the target process")]
    NotLoaded,

    #[error("injection is not supported on this platform")]
    Unsupported,
}

impl InjectError {
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::AccessDenied { .. } => ErrorCategory::Permission,
            Self::ArchitectureMismatch { .. }
            | Self::ModuleNotFound(_)
            | Self::InvalidModule { .. }
            | Self::NotLoaded
            | Self::Unsupported => ErrorCategory::Compatibility,
            Self::ModuleRefused | Self::Os { .. } => ErrorCategory::LoadFailure,
            Self::Timeout(_) => ErrorCategory::TransientTimeout,
        }
    }

    /// Step the attempt failed at.
    pub const fn stage(&self) -> Stage {
        match self {
            Self::AccessDenied { .. } | Self::Unsupported => Stage::OpenProcess,
            Self::ArchitectureMismatch { .. } => Stage::QueryArchitecture,
            Self::ModuleRefused | Self::NotLoaded => Stage::Confirm,
            Self::Timeout(_) => Stage::Wait,
            Self::Os { stage, .. } => *stage,
            Self::ModuleNotFound(_) | Self::InvalidModule { .. } => Stage::Inspect,
        }
    }

    /// Raw OS code, when there is one.
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Os { code, .. } => Some(*code),
            _ => None,
        }
    }
}
