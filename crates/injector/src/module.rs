//! PE inspection of module files.

use core::fmt::{self, Display, Formatter};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use goblin::pe::{PE, characteristic::IMAGE_FILE_DLL, header};

use crate::InjectError;

/// Instruction set of a module or process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86,
    X64,
    Arm64,
}

impl Architecture {
    /// Map a PE machine field.
    pub const fn from_machine(machine: u16) -> Option<Self> {
        match machine {
            header::COFF_MACHINE_X86 => Some(Self::X86),
            header::COFF_MACHINE_X86_64 => Some(Self::X64),
            header::COFF_MACHINE_ARM64 => Some(Self::Arm64),
            _ => None,
        }
    }

    /// Architecture of the running process.
    pub const fn current() -> Self {
        if cfg!(target_arch = "x86") {
            Self::X86
        } else if cfg!(target_arch = "aarch64") {
            Self::Arm64
        } else {
            Self::X64
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::X86 => "x86",
            Self::X64 => "x64",
            Self::Arm64 => "arm64",
        })
    }
}

/// A module file checked to be a loadable DLL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    /// Absolute path, the form handed to the target's loader.
    pub path: PathBuf,
    pub architecture: Architecture,
}

impl ModuleImage {
    #[tracing::instrument]
    pub fn inspect(path: &Path) -> Result<Self, InjectError> {
        let invalid = |reason: String| InjectError::InvalidModule {
            path: path.to_owned(),
            reason,
        };

        let bytes = fs::read(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => InjectError::ModuleNotFound(path.to_owned()),
            _ => invalid(err.to_string()),
        })?;

        let pe = PE::parse(&bytes).map_err(|err| invalid(err.to_string()))?;
        let coff = &pe.header.coff_header;
        if coff.characteristics & IMAGE_FILE_DLL == 0 {
            return Err(invalid("not a DLL".to_owned()));
        }

        let architecture = Architecture::from_machine(coff.machine)
            .ok_or_else(|| invalid(format!("unsupported machine {:#x}", coff.machine)))?;
        let path = std::path::absolute(path).map_err(|err| invalid(err.to_string()))?;

        Ok(Self { path, architecture })
    }
}

/// Relative address of the exported function `symbol`.
///
/// Forwarded exports have no code in the module and are not reported.
pub fn export_rva(bytes: &[u8], symbol: &str) -> Option<u32> {
    let pe = PE::parse(bytes).ok()?;
    pe.exports
        .iter()
        .find(|export| export.name == Some(symbol) && export.reexport.is_none())
        .and_then(|export| u32::try_from(export.rva).ok())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn machine_mapping() {
        assert_eq!(Architecture::from_machine(0x14c), Some(Architecture::X86));
        assert_eq!(Architecture::from_machine(0x8664), Some(Architecture::X64));
        assert_eq!(Architecture::from_machine(0xaa64), Some(Architecture::Arm64));
        assert_eq!(Architecture::from_machine(0x1c0), None);
    }

    #[test]
    fn missing_module_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gfx_shim.dll");

        assert_eq!(
            ModuleImage::inspect(&path),
            Err(InjectError::ModuleNotFound(path))
        );
    }

    #[test]
    fn non_pe_file_is_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho not a module\n").unwrap();

        assert!(matches!(
            ModuleImage::inspect(file.path()),
            Err(InjectError::InvalidModule { .. })
        ));
        assert_eq!(export_rva(b"MZ", "LoadLibraryW"), None);
    }

    #[cfg(all(windows, target_arch = "x86_64"))]
    #[test]
    fn system_kernel32_exports_load_library() {
        let mut dir = vec![0u16; 260];
        let len = unsafe {
            windows::Win32::System::SystemInformation::GetSystemDirectoryW(Some(&mut dir))
        } as usize;
        let system = PathBuf::from(String::from_utf16_lossy(&dir[..len]));
        let kernel32 = system.join("kernel32.dll");

        let image = ModuleImage::inspect(&kernel32).unwrap();
        assert_eq!(image.architecture, Architecture::X64);
        assert!(export_rva(&fs::read(&kernel32).unwrap(), "LoadLibraryW").is_some());
    }
}
