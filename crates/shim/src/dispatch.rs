//! The body shared by every interceptor stub.
//!
//! A stub converts its raw arguments into an argument struct and hands it to
//! [`intercept`] together with a closure that calls the original function.

use core::cell::Cell;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use gfx_shim_common::record::{ArgumentSnapshot, CallRecord, Value};
use thiserror::Error;
use tracing::{trace, warn};

use crate::{registry::HookDescriptor, sink::CallSink};

/// A rewrite that cannot be applied. The call is forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteError {
    #[error("argument `{0}` is null")]
    NullArgument(&'static str),

    #[error("rewriting `{0}` leaves nothing to request")]
    Empty(&'static str),
}

/// Arguments of one hooked function.
pub trait CallArgs {
    /// Summaries of the argument values.
    ///
    /// Only pointer values are recorded unless the pointee is known to be valid
    /// for the duration of the call.
    fn snapshot(&self) -> ArgumentSnapshot;
}

/// Return type of one hooked function.
pub trait CallReturn {
    fn summarize(&self) -> Value;
}

impl CallReturn for () {
    fn summarize(&self) -> Value {
        Value::Null
    }
}

impl CallReturn for u32 {
    fn summarize(&self) -> Value {
        Value::U64(u64::from(*self))
    }
}

impl CallReturn for u64 {
    fn summarize(&self) -> Value {
        Value::U64(*self)
    }
}

impl CallReturn for i32 {
    fn summarize(&self) -> Value {
        Value::I64(i64::from(*self))
    }
}

#[cfg(windows)]
impl CallReturn for windows::core::HRESULT {
    fn summarize(&self) -> Value {
        Value::Hex(u64::from(self.0 as u32))
    }
}

/// Optional substitution of arguments before forwarding and of the result after.
pub trait Rewrite<A, R>: Sync {
    /// Replacement arguments, or `None` to forward the originals.
    fn rewrite_args(&self, _args: &A) -> Result<Option<A>, RewriteError> {
        Ok(None)
    }

    /// Replacement result, or `None` to return the original.
    fn rewrite_result(&self, _args: &A, _ret: &R) -> Result<Option<R>, RewriteError> {
        Ok(None)
    }
}

/// Passthrough for hook points without a rewrite.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRewrite;

impl<A, R> Rewrite<A, R> for NoRewrite {}

thread_local! {
    static SEQUENCE: Cell<u64> = const { Cell::new(0) };
}

/// Intercept one call of `descriptor`'s target.
///
/// `forward` receives the address that runs the original function and the
/// arguments to pass, which are `args` unless a rewrite replaced them.
/// Rewrite failures are logged and the call passes through unchanged.
pub fn intercept<A, R>(
    descriptor: &HookDescriptor,
    sink: &dyn CallSink,
    rewrite: &dyn Rewrite<A, R>,
    args: A,
    forward: impl FnOnce(usize, &A) -> R,
) -> R
where
    A: CallArgs,
    R: CallReturn,
{
    let _in_flight = descriptor.enter();

    let sequence = SEQUENCE.with(|sequence| {
        let next = sequence.get();
        sequence.set(next.wrapping_add(1));
        next
    });
    let timestamp_micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_micros() as u64);
    let arguments = args.snapshot();

    let rewrite_enabled = descriptor.rewrite_enabled();
    let replaced = if rewrite_enabled {
        rewrite.rewrite_args(&args).unwrap_or_else(|err| {
            warn!(identity = %descriptor.target(), "argument rewrite skipped. err: {err}");
            None
        })
    } else {
        None
    };
    let forwarded = replaced.as_ref().unwrap_or(&args);

    let start = Instant::now();
    let ret = forward(descriptor.forward_address(), forwarded);
    let duration_micros = start.elapsed().as_micros() as u64;

    let return_value = ret.summarize();
    let replaced_ret = if rewrite_enabled {
        rewrite.rewrite_result(forwarded, &ret).unwrap_or_else(|err| {
            warn!(identity = %descriptor.target(), "result rewrite skipped. err: {err}");
            None
        })
    } else {
        None
    };

    let record = CallRecord {
        timestamp_micros,
        target: descriptor.target().clone(),
        thread_id: thread_id(),
        sequence,
        arguments,
        rewritten_arguments: replaced.as_ref().map(CallArgs::snapshot),
        return_value,
        rewritten_return: replaced_ret.as_ref().map(CallReturn::summarize),
        duration_micros,
    };
    trace!(identity = %record.target, sequence, "call intercepted");
    sink.submit(record);

    replaced_ret.unwrap_or(ret)
}

#[cfg(windows)]
fn thread_id() -> u64 {
    u64::from(unsafe { windows::Win32::System::Threading::GetCurrentThreadId() })
}

#[cfg(not(windows))]
fn thread_id() -> u64 {
    use core::sync::atomic::{AtomicU64, Ordering};

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }

    ID.with(|id| *id)
}
