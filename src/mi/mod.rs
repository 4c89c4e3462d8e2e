//! The backend side of the bridge: gdb subprocess lifecycle, MI output
//! classification and lenient field extraction.

pub mod connection;
pub mod error;
pub mod fields;
pub mod record;
