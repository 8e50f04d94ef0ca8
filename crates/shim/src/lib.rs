//! In-process engine of the gfx-shim module.
//!
//! A [`Registry`](registry::Registry) resolves every configured interception
//! point once. Installing it redirects each resolved target to an interceptor
//! stub, which records the call through [`dispatch::intercept`] and forwards it
//! to the original function. Call records go to a [`CallSink`](sink::CallSink).
//!
//! The Direct3D 11 catalog and its stubs live in the Windows-only `d3d11` module.
//! Everything else is platform independent.

pub mod catalog;
pub mod dispatch;
pub mod registry;
pub mod rules;
pub mod sink;

mod shim;

#[cfg(windows)]
pub mod d3d11;

pub use shim::Shim;
