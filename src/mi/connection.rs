//! Ownership of the gdb subprocess and command/response correlation.
//!
//! All backend I/O funnels through here: commands go out as
//! `{token}{command}\n`, every incoming line is classified and either
//! resolves the pending command with the matching token or is handed to the
//! unsolicited-line callback. Correlation is strictly by token, not by send
//! order - the backend interleaves asynchronous records freely and may
//! answer pipelined commands out of order.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::mi::error::Error;
use crate::mi::record::{self, Record, RecordKind};

/// Per-command deadline when the caller does not supply one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Deadline for the exit command sent on disconnect. The backend usually
/// quits without answering it, so the wait stays short.
pub const EXIT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Callback invoked for every line that is not a response to an outstanding
/// command. Runs on the reader threads, in per-stream arrival order,
/// serialized through the slot lock.
pub type UnsolicitedHandler = Box<dyn Fn(Record) + Send + 'static>;

type PendingTable = Arc<Mutex<HashMap<u64, mpsc::Sender<Result<String, Error>>>>>;
type CallbackSlot = Arc<Mutex<Option<UnsolicitedHandler>>>;

pub struct GdbConnection {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    next_token: AtomicU64,
    pending: PendingTable,
    callback: CallbackSlot,
    running: Arc<AtomicBool>,
}

impl GdbConnection {
    pub fn new(program: impl Into<String>, args: &[&str]) -> GdbConnection {
        GdbConnection {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            child: None,
            stdin: Mutex::new(None),
            next_token: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register the unsolicited-line callback. Must happen before [`start`]
    /// for early diagnostics to be visible.
    ///
    /// [`start`]: GdbConnection::start
    pub fn set_callback(&self, callback: UnsolicitedHandler) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = Some(callback);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the backend in `cwd`. No-op when already running. A spawn
    /// failure is surfaced as a console diagnostic through the callback
    /// instead of an error: the session must keep answering requests either
    /// way, and subsequent commands fail fast with [`Error::NotRunning`].
    pub fn start(&mut self, cwd: Option<&Path>) {
        if self.is_running() {
            return;
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                log::warn!(target: "mi", "failed to spawn `{}`: {err}", self.program);
                emit(
                    &self.callback,
                    Record::console(&format!(
                        "failed to start backend `{}`: {err}",
                        self.program
                    )),
                );
                return;
            }
        };

        log::info!(target: "mi", "backend `{}` started", self.program);
        self.running.store(true, Ordering::SeqCst);

        if let Ok(mut stdin) = self.stdin.lock() {
            *stdin = child.stdin.take();
        }

        if let Some(stdout) = child.stdout.take() {
            let pending = self.pending.clone();
            let callback = self.callback.clone();
            let running = self.running.clone();
            thread::spawn(move || {
                read_loop(stdout, Origin::Stdout, &pending, &callback);
                // Backend is gone: nothing outstanding can complete anymore.
                running.store(false, Ordering::SeqCst);
                reject_all(&pending);
                emit(&callback, Record::console("backend exited"));
                log::info!(target: "mi", "backend stdout closed");
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let pending = self.pending.clone();
            let callback = self.callback.clone();
            thread::spawn(move || read_loop(stderr, Origin::Stderr, &pending, &callback));
        }

        self.child = Some(child);
    }

    /// Send one MI command and block until its correlated result record
    /// arrives or the deadline elapses. Commands may be pipelined from
    /// multiple callers; each gets exactly one resolution.
    pub fn send_command(&self, cmd: &str, timeout: Duration) -> Result<String, Error> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(token, tx);
        }

        if let Err(err) = self.write_line(&format!("{token}{cmd}\n")) {
            self.forget(token);
            return Err(err);
        }
        log::debug!(target: "mi", "-> {token}{cmd}");

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // A late line bearing this token is ignored from now on.
                self.forget(token);
                Err(Error::Timeout(cmd.to_string()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::Exited),
        }
    }

    /// Best-effort termination. Errors are swallowed; the running flag is
    /// always cleared.
    pub fn stop(&mut self) {
        if let Ok(mut stdin) = self.stdin.lock() {
            *stdin = None;
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.running.store(false, Ordering::SeqCst);
        reject_all(&self.pending);
    }

    fn write_line(&self, line: &str) -> Result<(), Error> {
        let guard = self.stdin.lock().map_err(|_| Error::NotRunning)?;
        let mut stdin = guard.as_ref().ok_or(Error::NotRunning)?;
        stdin.write_all(line.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    fn forget(&self, token: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&token);
        }
    }
}

impl Drop for GdbConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Which pipe a line arrived on. Only stdout carries records that may
/// resolve a pending command; a stray sigil on stderr must not.
#[derive(Clone, Copy)]
enum Origin {
    Stdout,
    Stderr,
}

fn read_loop<R: Read>(stream: R, origin: Origin, pending: &PendingTable, callback: &CallbackSlot) {
    let mut reader = BufReader::new(stream);
    let mut buf = String::new();
    loop {
        buf.clear();
        match reader.read_line(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = buf.trim_end_matches(['\r', '\n']);
        // The MI prompt separates output batches, it carries no content.
        if line.is_empty() || line.trim_end() == "(gdb)" {
            continue;
        }
        match origin {
            Origin::Stdout => dispatch(line, pending, callback),
            Origin::Stderr => {
                // Classified for payload decoding, then re-tagged as log
                // stream text so the origin survives downstream.
                log::debug!(target: "mi", "<- [stderr] {line}");
                let mut record = Record::classify(line);
                record.token = None;
                record.kind = RecordKind::Log;
                emit(callback, record);
            }
        }
    }
}

/// Route one classified line: a result record with a known token resolves
/// its pending command, everything else is unsolicited. The classifier knows
/// nothing about the pending table; the split happens here.
fn dispatch(line: &str, pending: &PendingTable, callback: &CallbackSlot) {
    let record = Record::classify(line);
    log::debug!(target: "mi", "<- {line}");

    if record.kind == RecordKind::Result {
        if let Some(token) = record.token {
            let waiter = match pending.lock() {
                Ok(mut pending) => pending.remove(&token),
                Err(_) => None,
            };
            if let Some(tx) = waiter {
                let _ = tx.send(result_of(&record.payload));
                return;
            }
        }
    }

    emit(callback, record);
}

/// Interpret a result payload. `done` resolves, `error` rejects with the
/// extracted message, any other leading word resolves with the raw payload
/// (lenient default: `running`, `connected`, `exit` are all fine).
fn result_of(payload: &str) -> Result<String, Error> {
    if payload.starts_with("error") {
        Err(Error::Command(record::error_message(payload)))
    } else {
        Ok(payload.to_string())
    }
}

fn reject_all(pending: &PendingTable) {
    let drained: Vec<_> = match pending.lock() {
        Ok(mut pending) => pending.drain().collect(),
        Err(_) => return,
    };
    for (_, tx) in drained {
        let _ = tx.send(Err(Error::Exited));
    }
}

fn emit(callback: &CallbackSlot, record: Record) {
    if let Ok(slot) = callback.lock() {
        if let Some(cb) = slot.as_ref() {
            cb(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_payload_interpretation() {
        assert_eq!(result_of("done,value=\"4\"").unwrap(), "done,value=\"4\"");
        assert_eq!(result_of("running").unwrap(), "running");
        let err = result_of("error,msg=\"boom\"").unwrap_err();
        assert!(matches!(err, Error::Command(msg) if msg == "boom"));
    }
}
