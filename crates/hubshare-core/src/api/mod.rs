//! API implementation submodules.
//!
//! Each submodule contains `impl SharedConnection` blocks. The struct
//! definition remains in `lib.rs`.

mod builder;
mod channel;
mod lifecycle;
mod state;

pub use builder::SharedConnectionBuilder;
