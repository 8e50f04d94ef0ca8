//! Remote Module Loader.

use core::time::Duration;
use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    InjectError, ModuleHandle,
    lifecycle::{ModuleLoader, ObservedProcess},
    module::{self, ModuleImage},
};

/// Export of the module that removes its hooks and unloads it.
pub const UNLOAD_EXPORT: &str = "gfx_shim_unload";

/// Load the module at `module` into process `pid` and wait for its
/// initialization to finish.
///
/// Remote memory and handles are released on every path, including
/// [`InjectError::Timeout`]. A timeout does not mean the module failed to
/// load, only that loading was not confirmed.
#[tracing::instrument]
pub fn inject(pid: u32, module: &Path, timeout: Duration) -> Result<ModuleHandle, InjectError> {
    let image = ModuleImage::inspect(module)?;
    os::inject(pid, &[image], timeout)
}

/// Ask the module loaded from `module` in process `pid` to unload itself.
///
/// Runs the module's [`UNLOAD_EXPORT`] on a new thread of the target and waits
/// up to `timeout` for it. The module unmaps once its own threads have exited.
#[tracing::instrument]
pub fn eject(pid: u32, module: &Path, timeout: Duration) -> Result<(), InjectError> {
    let image = ModuleImage::inspect(module)?;
    let rva = unload_rva(&image)?;
    os::eject(pid, &image, rva, timeout)
}

fn unload_rva(image: &ModuleImage) -> Result<u32, InjectError> {
    let bytes = fs::read(&image.path).map_err(|_| InjectError::ModuleNotFound(image.path.clone()))?;
    module::export_rva(&bytes, UNLOAD_EXPORT).ok_or_else(|| InjectError::InvalidModule {
        path: image.path.clone(),
        reason: format!("no {UNLOAD_EXPORT} export"),
    })
}

/// [`ModuleLoader`] loading one of several builds of the module, whichever
/// matches the target's architecture.
#[derive(Debug)]
pub struct RemoteLoader {
    modules: Vec<ModuleImage>,
    timeout: Duration,
}

impl RemoteLoader {
    /// Inspect `modules` up front so a bad path fails before any attempt.
    pub fn new(
        modules: impl IntoIterator<Item = PathBuf>,
        timeout: Duration,
    ) -> Result<Self, InjectError> {
        let modules = modules
            .into_iter()
            .map(|path| ModuleImage::inspect(&path))
            .collect::<Result<Vec<_>, _>>()?;

        if modules.is_empty() {
            return Err(InjectError::ModuleNotFound(PathBuf::new()));
        }

        for image in &modules {
            debug!(module = %image.path.display(), architecture = %image.architecture, "module ready");
        }

        Ok(Self { modules, timeout })
    }

    pub fn modules(&self) -> &[ModuleImage] {
        &self.modules
    }

    /// Unload whichever of the modules process `pid` has loaded.
    pub fn eject(&self, pid: u32) -> Result<(), InjectError> {
        let mut last = InjectError::NotLoaded;
        for image in &self.modules {
            match unload_rva(image).and_then(|rva| os::eject(pid, image, rva, self.timeout)) {
                Ok(()) => return Ok(()),
                Err(InjectError::NotLoaded) => {}
                Err(err) => last = err,
            }
        }

        Err(last)
    }
}

impl ModuleLoader for RemoteLoader {
    fn load(&mut self, process: &ObservedProcess) -> Result<ModuleHandle, InjectError> {
        os::inject(process.pid, &self.modules, self.timeout)
    }
}

#[cfg(windows)]
mod os {
    use core::{mem, ptr, time::Duration};
    use std::{
        ffi::OsString,
        fs, io,
        os::windows::ffi::{OsStrExt, OsStringExt},
        path::{Path, PathBuf},
    };

    use ntapi::{
        ntapi_base::CLIENT_ID,
        ntmmapi::{NtAllocateVirtualMemory, NtFreeVirtualMemory, NtWriteVirtualMemory},
        ntpsapi::NtOpenProcess,
        ntrtl::{PUSER_THREAD_START_ROUTINE, RtlCreateUserThread},
    };
    use scopeguard::defer;
    use tracing::{debug, trace};
    use windows::{
        Wdk::Foundation::OBJECT_ATTRIBUTES,
        Win32::{
            Foundation::{
                CloseHandle, ERROR_MOD_NOT_FOUND, ERROR_PROC_NOT_FOUND, HANDLE, HMODULE, NTSTATUS,
                STATUS_ACCESS_DENIED, WAIT_OBJECT_0, WAIT_TIMEOUT,
            },
            System::{
                LibraryLoader::{GetModuleHandleW, GetProcAddress},
                Memory::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
                ProcessStatus::{
                    ENUM_PROCESS_MODULES_EX_FLAGS, EnumProcessModulesEx, GetModuleFileNameExW,
                    LIST_MODULES_32BIT, LIST_MODULES_ALL,
                },
                SystemInformation::{GetSystemWow64DirectoryW, IMAGE_FILE_MACHINE_UNKNOWN},
                Threading::{
                    GetExitCodeThread, IsWow64Process2, PROCESS_ACCESS_RIGHTS,
                    PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION,
                    PROCESS_VM_READ, PROCESS_VM_WRITE, WaitForSingleObject,
                },
            },
        },
        core::{s, w},
    };

    use crate::{
        InjectError, ModuleHandle, Stage,
        module::{self, Architecture, ModuleImage},
    };

    const ACCESS: PROCESS_ACCESS_RIGHTS = PROCESS_ACCESS_RIGHTS(
        PROCESS_QUERY_INFORMATION.0
            | PROCESS_CREATE_THREAD.0
            | PROCESS_VM_OPERATION.0
            | PROCESS_VM_READ.0
            | PROCESS_VM_WRITE.0,
    );

    fn os_error(stage: Stage, code: i32) -> InjectError {
        InjectError::Os { stage, code }
    }

    fn last_error(stage: Stage) -> InjectError {
        os_error(stage, io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    fn check(stage: Stage, status: i32) -> Result<(), InjectError> {
        if NTSTATUS(status).is_ok() {
            Ok(())
        } else {
            Err(os_error(stage, status))
        }
    }

    pub fn inject(
        pid: u32,
        modules: &[ModuleImage],
        timeout: Duration,
    ) -> Result<ModuleHandle, InjectError> {
        let process = open_process(pid)?;
        defer!(unsafe {
            _ = CloseHandle(process);
        });

        let target = process_architecture(process)?;
        let image = modules
            .iter()
            .find(|image| image.architecture == target)
            .ok_or_else(|| InjectError::ArchitectureMismatch {
                module: modules
                    .first()
                    .map_or(Architecture::current(), |image| image.architecture),
                target,
            })?;

        let load_library = load_library_address(process, target)?;
        debug!(
            pid,
            %target,
            load_library = format_args!("{load_library:#x}"),
            module = %image.path.display(),
            "loading module"
        );

        unsafe { load_module(process, &image.path, load_library, timeout) }
    }

    pub fn eject(
        pid: u32,
        image: &ModuleImage,
        unload_rva: u32,
        timeout: Duration,
    ) -> Result<(), InjectError> {
        let process = open_process(pid)?;
        defer!(unsafe {
            _ = CloseHandle(process);
        });

        let base = find_module(process, LIST_MODULES_ALL, |loaded| same_path(loaded, &image.path))
            .ok_or(InjectError::NotLoaded)?;
        let start = base + unload_rva as usize;
        debug!(
            pid,
            base = format_args!("{base:#x}"),
            module = %image.path.display(),
            "unloading module"
        );

        let exit_code = unsafe { run_remote_thread(process, start, 0, timeout) }?;
        trace!(exit_code, "unload thread finished");
        Ok(())
    }

    fn open_process(pid: u32) -> Result<HANDLE, InjectError> {
        let mut handle = HANDLE::default();
        let mut attributes = OBJECT_ATTRIBUTES {
            Length: size_of::<OBJECT_ATTRIBUTES>() as _,
            ..Default::default()
        };

        let status = unsafe {
            NtOpenProcess(
                &mut handle as *mut _ as _,
                ACCESS.0,
                &mut attributes as *mut _ as _,
                &mut CLIENT_ID {
                    UniqueProcess: pid as _,
                    UniqueThread: 0 as _,
                },
            )
        };

        if NTSTATUS(status) == STATUS_ACCESS_DENIED {
            return Err(InjectError::AccessDenied { pid });
        }
        check(Stage::OpenProcess, status)?;

        Ok(handle)
    }

    fn process_architecture(process: HANDLE) -> Result<Architecture, InjectError> {
        let mut process_machine = IMAGE_FILE_MACHINE_UNKNOWN;
        let mut native_machine = IMAGE_FILE_MACHINE_UNKNOWN;
        unsafe { IsWow64Process2(process, &mut process_machine, Some(&mut native_machine)) }
            .map_err(|err| os_error(Stage::QueryArchitecture, err.code().0))?;

        // Unknown means the process is not running under WOW64.
        let machine = if process_machine == IMAGE_FILE_MACHINE_UNKNOWN {
            native_machine
        } else {
            process_machine
        };

        Architecture::from_machine(machine.0).ok_or(os_error(
            Stage::QueryArchitecture,
            i32::from(machine.0),
        ))
    }

    fn load_library_address(process: HANDLE, target: Architecture) -> Result<usize, InjectError> {
        let current = Architecture::current();
        if target == current {
            // kernel32 is mapped at the same base in every process of one architecture.
            let kernel32 = unsafe { GetModuleHandleW(w!("kernel32.dll")) }
                .map_err(|err| os_error(Stage::ResolveLoader, err.code().0))?;
            let address = unsafe { GetProcAddress(kernel32, s!("LoadLibraryW")) }
                .ok_or(os_error(Stage::ResolveLoader, ERROR_PROC_NOT_FOUND.0 as i32))?;

            return Ok(address as usize);
        }

        match (current, target) {
            (Architecture::X64 | Architecture::Arm64, Architecture::X86) => {
                wow64_load_library_address(process)
            }

            _ => Err(InjectError::ArchitectureMismatch {
                module: current,
                target,
            }),
        }
    }

    fn wow64_load_library_address(process: HANDLE) -> Result<usize, InjectError> {
        let base = find_module(process, LIST_MODULES_32BIT, |path| {
            path.file_name()
                .is_some_and(|name| name.eq_ignore_ascii_case("kernel32.dll"))
        })
        .ok_or(os_error(Stage::ResolveLoader, ERROR_MOD_NOT_FOUND.0 as i32))?;

        let mut buf = [0u16; 260];
        let len = unsafe { GetSystemWow64DirectoryW(Some(&mut buf)) } as usize;
        if len == 0 || len >= buf.len() {
            return Err(last_error(Stage::ResolveLoader));
        }

        let kernel32 = PathBuf::from(OsString::from_wide(&buf[..len])).join("kernel32.dll");
        let bytes = fs::read(&kernel32).map_err(|err| {
            os_error(Stage::ResolveLoader, err.raw_os_error().unwrap_or(0))
        })?;
        let rva = module::export_rva(&bytes, "LoadLibraryW")
            .ok_or(os_error(Stage::ResolveLoader, ERROR_PROC_NOT_FOUND.0 as i32))?;

        trace!(base = format_args!("{base:#x}"), rva, "found 32-bit kernel32");
        Ok(base + rva as usize)
    }

    /// Base address of the first module in `process` whose file path
    /// satisfies `pred`.
    fn find_module(
        process: HANDLE,
        filter: ENUM_PROCESS_MODULES_EX_FLAGS,
        pred: impl Fn(&Path) -> bool,
    ) -> Option<usize> {
        let mut modules = vec![HMODULE::default(); 256];
        loop {
            let mut needed = 0u32;
            unsafe {
                EnumProcessModulesEx(
                    process,
                    modules.as_mut_ptr(),
                    (modules.len() * size_of::<HMODULE>()) as u32,
                    &mut needed,
                    filter,
                )
            }
            .ok()?;

            let count = needed as usize / size_of::<HMODULE>();
            if count <= modules.len() {
                modules.truncate(count);
                break;
            }
            modules.resize(count, HMODULE::default());
        }

        let mut buf = vec![0u16; 1024];
        modules.into_iter().find_map(|module| {
            let len = unsafe { GetModuleFileNameExW(Some(process), Some(module), &mut buf) } as usize;
            let path = PathBuf::from(OsString::from_wide(&buf[..len]));
            (len > 0 && pred(&path)).then_some(module.0 as usize)
        })
    }

    fn same_path(a: &Path, b: &Path) -> bool {
        a.as_os_str()
            .to_string_lossy()
            .eq_ignore_ascii_case(&b.as_os_str().to_string_lossy())
    }

    /// Run `start(param)` on a new thread of `process` and return its exit code.
    unsafe fn run_remote_thread(
        process: HANDLE,
        start: usize,
        param: usize,
        timeout: Duration,
    ) -> Result<u32, InjectError> {
        unsafe {
            let mut thread = HANDLE::default();
            check(
                Stage::CreateThread,
                RtlCreateUserThread(
                    process.0 as _,
                    ptr::null_mut(),
                    0,
                    0,
                    0,
                    0,
                    mem::transmute::<usize, PUSER_THREAD_START_ROUTINE>(start),
                    param as _,
                    &mut thread as *mut _ as _,
                    ptr::null_mut(),
                ),
            )?;
            defer!({
                _ = CloseHandle(thread);
            });

            let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
            let wait = WaitForSingleObject(thread, millis);
            if wait == WAIT_TIMEOUT {
                return Err(InjectError::Timeout(timeout));
            }
            if wait != WAIT_OBJECT_0 {
                return Err(last_error(Stage::Wait));
            }

            let mut exit_code = 0u32;
            GetExitCodeThread(thread, &mut exit_code)
                .map_err(|err| os_error(Stage::Wait, err.code().0))?;
            Ok(exit_code)
        }
    }

    unsafe fn load_module(
        process: HANDLE,
        path: &Path,
        load_library: usize,
        timeout: Duration,
    ) -> Result<ModuleHandle, InjectError> {
        let wide = path
            .as_os_str()
            .encode_wide()
            .chain(Some(0))
            .collect::<Vec<u16>>();
        let bytes = bytemuck::cast_slice::<u16, u8>(&wide);

        unsafe {
            let mut base = 0usize;
            let mut size = bytes.len();
            check(
                Stage::Allocate,
                NtAllocateVirtualMemory(
                    process.0 as _,
                    &raw mut base as _,
                    0,
                    &mut size,
                    (MEM_COMMIT | MEM_RESERVE).0,
                    PAGE_READWRITE.0,
                ),
            )?;
            defer!({
                let mut base = base;
                let mut size = 0usize;
                _ = NtFreeVirtualMemory(process.0 as _, &raw mut base as _, &mut size, MEM_RELEASE.0);
            });

            check(
                Stage::Write,
                NtWriteVirtualMemory(
                    process.0 as _,
                    base as _,
                    bytes.as_ptr() as _,
                    bytes.len(),
                    ptr::null_mut(),
                ),
            )?;

            let exit_code = run_remote_thread(process, load_library, base, timeout)?;
            trace!(exit_code = format_args!("{exit_code:#x}"), "remote thread finished");

            // The exit code only carries the low 32 bits of the module handle,
            // and can be zero for a valid handle on 64-bit targets.
            match (
                find_module(process, LIST_MODULES_ALL, |loaded| same_path(loaded, path)),
                exit_code,
            ) {
                (Some(base), _) => Ok(ModuleHandle(base)),
                (None, 0) => Err(InjectError::ModuleRefused),
                (None, code) => Ok(ModuleHandle(code as usize)),
            }
        }
    }
}

#[cfg(not(windows))]
mod os {
    use core::time::Duration;

    use crate::{InjectError, ModuleHandle, module::ModuleImage};

    pub fn inject(
        _pid: u32,
        _modules: &[ModuleImage],
        _timeout: Duration,
    ) -> Result<ModuleHandle, InjectError> {
        Err(InjectError::Unsupported)
    }

    pub fn eject(
        _pid: u32,
        _image: &ModuleImage,
        _unload_rva: u32,
        _timeout: Duration,
    ) -> Result<(), InjectError> {
        Err(InjectError::Unsupported)
    }
}
