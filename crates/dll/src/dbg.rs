//! Diagnostic output to an attached debugger.
//!
//! Target processes rarely have a console, so debug builds also send the shim's
//! log to `OutputDebugStringW`, where DebugView or a debugger can show it.

use std::io::{self, Write};

use parking_lot::{Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use windows::{Win32::System::Diagnostics::Debug::OutputDebugStringW, core::PCWSTR};

const PREFIX: &str = "[gfx-shim] ";

/// Hands out writers that each emit one debugger message when dropped.
#[derive(Default)]
pub struct DebuggerMakeWriter {
    buf: Mutex<Vec<u16>>,
}

impl<'a> MakeWriter<'a> for DebuggerMakeWriter {
    type Writer = DebuggerWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let mut buf = self.buf.lock();
        buf.clear();
        buf.extend(PREFIX.encode_utf16());

        DebuggerWriter { buf }
    }
}

pub struct DebuggerWriter<'a> {
    buf: MutexGuard<'a, Vec<u16>>,
}

impl Write for DebuggerWriter<'_> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf
            .extend(String::from_utf8_lossy(bytes).encode_utf16());
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for DebuggerWriter<'_> {
    fn drop(&mut self) {
        self.buf.push(0);
        unsafe { OutputDebugStringW(PCWSTR(self.buf.as_ptr())) };
    }
}
