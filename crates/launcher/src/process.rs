//! Process enumeration.

pub use os::{is_elevated, list};

#[cfg(windows)]
mod os {
    use anyhow::Context;
    use gfx_shim_injector::lifecycle::ObservedProcess;
    use scopeguard::defer;
    use windows::Win32::{
        Foundation::{CloseHandle, HANDLE},
        Security::{GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation},
        System::{
            Diagnostics::ToolHelp::{
                CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
                TH32CS_SNAPPROCESS,
            },
            Threading::{GetCurrentProcess, OpenProcessToken},
        },
    };

    use super::entry_name;

    pub fn list() -> anyhow::Result<Vec<ObservedProcess>> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
            .context("cannot snapshot process list")?;
        defer!(unsafe {
            _ = CloseHandle(snapshot);
        });

        let mut entry = PROCESSENTRY32W {
            dwSize: size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        let mut processes = Vec::new();
        let mut next = unsafe { Process32FirstW(snapshot, &mut entry) };
        while next.is_ok() {
            processes.push(ObservedProcess::new(
                entry.th32ProcessID,
                entry_name(&entry.szExeFile),
            ));
            next = unsafe { Process32NextW(snapshot, &mut entry) };
        }

        Ok(processes)
    }

    pub fn is_elevated() -> bool {
        let mut token = HANDLE::default();
        if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) }.is_err() {
            return false;
        }
        defer!(unsafe {
            _ = CloseHandle(token);
        });

        let mut elevation = TOKEN_ELEVATION::default();
        let mut len = 0u32;
        let queried = unsafe {
            GetTokenInformation(
                token,
                TokenElevation,
                Some(&mut elevation as *mut _ as *mut _),
                size_of::<TOKEN_ELEVATION>() as u32,
                &mut len,
            )
        };

        queried.is_ok() && elevation.TokenIsElevated != 0
    }
}

#[cfg(not(windows))]
mod os {
    use std::fs;

    use anyhow::Context;
    use gfx_shim_injector::lifecycle::ObservedProcess;

    pub fn list() -> anyhow::Result<Vec<ObservedProcess>> {
        let mut processes = Vec::new();
        for entry in fs::read_dir("/proc").context("cannot read /proc")? {
            let Ok(entry) = entry else {
                continue;
            };
            let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) else {
                continue;
            };

            // The process may exit between listing and reading.
            if let Ok(comm) = fs::read_to_string(entry.path().join("comm")) {
                processes.push(ObservedProcess::new(pid, comm.trim_end()));
            }
        }

        Ok(processes)
    }

    // Nothing can be injected here, so there is nothing to elevate for.
    pub fn is_elevated() -> bool {
        true
    }
}

/// Executable name stored in a fixed, NUL padded buffer.
#[cfg_attr(not(windows), allow(dead_code))]
fn entry_name(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_names_stop_at_nul() {
        let mut buf = [0u16; 260];
        for (slot, c) in buf.iter_mut().zip("player.exe".encode_utf16()) {
            *slot = c;
        }

        assert_eq!(entry_name(&buf), "player.exe");
        assert_eq!(entry_name(&[]), "");
    }

    #[test]
    fn lists_own_process() {
        let pid = std::process::id();
        assert!(list().unwrap().iter().any(|process| process.pid == pid));
    }
}
