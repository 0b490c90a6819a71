//! The real duplex connection.
//!
//! - `traits` - the interface the owner drives
//! - `loopback` - a programmable in-process service for tests and demos

pub mod loopback;
pub mod traits;

pub use loopback::{LoopbackPush, LoopbackTransport, ServerMethodFn};
pub use traits::{ClientHandlerFn, Transport};
