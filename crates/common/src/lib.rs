//! Types shared between the `gfx-shim` module, its injector and its launcher.
//! This crate is not intended to be used directly by end users.

pub mod config;
pub mod identity;
pub mod record;
