//! The editor side of the bridge: DAP framing, envelopes, session state and
//! the request handlers.

pub mod io;
pub mod protocol;
pub mod session;
pub mod state;
pub mod tracer;
