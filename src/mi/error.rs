use std::io;

/// Errors produced by the backend connection.
///
/// A command-level failure never escapes a request handler as a fault: the
/// bridge converts it into a diagnostic output event and still answers the
/// corresponding request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backend is not running")]
    NotRunning,
    #[error("backend exited")]
    Exited,
    #[error("command timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Command(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
