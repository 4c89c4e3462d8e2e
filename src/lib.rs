//! mibridge - a Debug Adapter Protocol server backed by gdb's machine
//! interface (MI2).
//!
//! The crate is split along the protocol boundary: [`mi`] owns the gdb
//! subprocess and its line-oriented textual interface, [`dap`] owns the
//! editor-facing request/response/event surface and the session state
//! reconstructed from MI output.

pub mod dap;
pub mod mi;
