//! Debug session state machine: DAP request handlers on one side, MI
//! command emission and unsolicited-record translation on the other.
//!
//! Every handler answers its request exactly once. A failed or timed-out
//! backend command never fails the enclosing request - it degrades into a
//! diagnostic output event plus an unverified/empty result field, so the
//! editor-facing session never stalls because of a backend-side failure.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use itertools::Itertools;
use serde_json::json;

use crate::dap::io::{DapReader, DapWriter};
use crate::dap::protocol::DapRequest;
use crate::dap::state::{BreakpointRec, FrameInfo, ScopeKind, SessionState};
use crate::mi::connection::{GdbConnection, DEFAULT_COMMAND_TIMEOUT, EXIT_COMMAND_TIMEOUT};
use crate::mi::record::{self, Record, RecordKind};
use crate::mi::{error, fields};

/// Placeholder for a frame whose function name the backend did not report.
const UNKNOWN_FUNCTION: &str = "??";
/// Placeholder for a variable whose value could not be parsed.
const UNAVAILABLE_VALUE: &str = "(unavailable)";

pub struct DebugSession {
    reader: DapReader,
    out: DapWriter,
    gdb_path: String,
    connection: Option<GdbConnection>,
    state: Arc<Mutex<SessionState>>,
    stop_at_entry: bool,
}

impl DebugSession {
    pub fn new(reader: DapReader, out: DapWriter, gdb_path: String) -> DebugSession {
        DebugSession {
            reader,
            out,
            gdb_path,
            connection: None,
            state: Arc::new(Mutex::new(SessionState::new())),
            stop_at_entry: false,
        }
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        loop {
            let msg = self.reader.read_message()?;
            let req: DapRequest = serde_json::from_value(msg)?;
            if req.r#type != "request" {
                continue;
            }
            log::debug!(target: "dap", "{}: {}", req.seq, req.command);

            let cont = match self.dispatch(&req) {
                Ok(cont) => cont,
                Err(err) => {
                    let _ = self.out.respond(&req, false, Some(format!("{err:#}")), None);
                    true
                }
            };
            if !cont {
                break;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, req: &DapRequest) -> anyhow::Result<bool> {
        match req.command.as_str() {
            "initialize" => self.handle_initialize(req)?,
            "launch" => self.handle_launch(req)?,
            "configurationDone" => self.handle_configuration_done(req)?,
            "setBreakpoints" => self.handle_set_breakpoints(req)?,
            "threads" => self.handle_threads(req)?,
            "stackTrace" => self.handle_stack_trace(req)?,
            "scopes" => self.handle_scopes(req)?,
            "variables" => self.handle_variables(req)?,
            "evaluate" => self.handle_evaluate(req)?,
            "continue" => {
                self.run_control("-exec-continue");
                self.out.respond(
                    req,
                    true,
                    None,
                    Some(json!({"allThreadsContinued": true})),
                )?;
            }
            "next" => {
                self.run_control("-exec-next");
                self.out.respond(req, true, None, None)?;
            }
            "stepIn" => {
                self.run_control("-exec-step");
                self.out.respond(req, true, None, None)?;
            }
            "stepOut" => {
                self.run_control("-exec-finish");
                self.out.respond(req, true, None, None)?;
            }
            "pause" => {
                self.run_control("-exec-interrupt");
                self.out.respond(req, true, None, None)?;
            }
            "disconnect" => {
                self.handle_disconnect(req)?;
                return Ok(false);
            }
            other => {
                log::warn!(target: "dap", "unsupported DAP command: {other}");
                self.out.respond(
                    req,
                    false,
                    Some(format!("Unsupported DAP command: {other}")),
                    None,
                )?;
            }
        }
        Ok(true)
    }

    fn handle_initialize(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        // Breakpoints arrive before the target runs: configurationDone is a
        // separate step.
        let body = json!({
            "supportsConfigurationDoneRequest": true,
            "supportsEvaluateForHovers": true,
            "supportsSetVariable": false,
            "supportsRestartRequest": false,
            "supportsStepBack": false,
        });
        self.out.respond(req, true, None, Some(body))?;
        self.out.event("initialized", None)
    }

    fn handle_launch(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let Some(program) = req.arguments.get("program").and_then(|v| v.as_str()) else {
            self.out
                .respond(req, false, Some("launch: missing arguments.program".into()), None)?;
            return Ok(());
        };
        let program = normalize_path(program);

        if !Path::new(&program).exists() {
            // Answer the request anyway so the protocol does not hang; no
            // session starts.
            self.diagnostic(&format!("launch failed: program not found: {program}"))?;
            self.out
                .respond(req, false, Some(format!("program not found: {program}")), None)?;
            return Ok(());
        }

        let cwd = req
            .arguments
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(normalize_path)
            .unwrap_or_else(|| parent_dir(&program));
        self.stop_at_entry = req
            .arguments
            .get("stopAtEntry")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut connection = GdbConnection::new(&self.gdb_path, &["--interpreter=mi2"]);
        connection.set_callback(unsolicited_handler(self.out.clone(), self.state.clone()));
        connection.start(Some(Path::new(&cwd)));
        self.connection = Some(connection);

        // Asynchronous execution mode first, then symbols and cwd. Failures
        // degrade to diagnostics; the launch response still completes.
        self.command_or_diag("-gdb-set mi-async on");
        self.command_or_diag(&format!(
            "-file-exec-and-symbols \"{}\"",
            escape_mi_string(&program)
        ));
        self.command_or_diag(&format!("-environment-cd \"{}\"", escape_mi_string(&cwd)));

        log::info!(target: "dap", "launch: {program}");
        self.out.respond(req, true, None, None)
    }

    fn handle_configuration_done(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        // All breakpoints are installed by now; actually run the target.
        let cmd = if self.stop_at_entry {
            "-exec-run --start"
        } else {
            "-exec-run"
        };
        self.command_or_diag(cmd);
        self.out.respond(req, true, None, None)
    }

    fn handle_set_breakpoints(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let Some(source_path) = req
            .arguments
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(|p| p.as_str())
        else {
            self.out.respond(
                req,
                false,
                Some("setBreakpoints: missing arguments.source.path".into()),
                None,
            )?;
            return Ok(());
        };
        let source_path = backend_source_path(source_path);

        let lines: Vec<i64> = req
            .arguments
            .get("breakpoints")
            .and_then(|v| v.as_array())
            .map(|bps| {
                bps.iter()
                    .filter_map(|bp| bp.get("line").and_then(|l| l.as_i64()))
                    .collect()
            })
            .unwrap_or_default();

        // The client sends the complete desired set every time: delete all
        // previously inserted backend breakpoints for this source in one
        // batch, then insert the new set.
        let old_ids = match self.state.lock() {
            Ok(mut state) => state.take_breakpoint_ids(&source_path),
            Err(_) => vec![],
        };
        if !old_ids.is_empty() {
            self.command_or_diag(&format!(
                "-break-delete {}",
                old_ids.iter().map(|id| id.to_string()).join(" ")
            ));
        }

        let mut recs = Vec::with_capacity(lines.len());
        let mut rsp = Vec::with_capacity(lines.len());
        for line in lines {
            let cmd = format!(
                "-break-insert \"{}:{line}\"",
                escape_mi_string(&source_path)
            );
            // One failed line must not abort the others.
            match self.send(&cmd) {
                Ok(payload) => {
                    let id = fields::breakpoint_number(&payload);
                    rsp.push(json!({"verified": true, "line": line, "id": id}));
                    recs.push(BreakpointRec {
                        line,
                        backend_id: id,
                        verified: true,
                    });
                }
                Err(err) => {
                    rsp.push(json!({
                        "verified": false,
                        "line": line,
                        "message": err.to_string(),
                    }));
                    recs.push(BreakpointRec {
                        line,
                        backend_id: None,
                        verified: false,
                    });
                }
            }
        }

        if let Ok(mut state) = self.state.lock() {
            state.record_breakpoints(source_path, recs);
        }
        self.out
            .respond(req, true, None, Some(json!({"breakpoints": rsp})))
    }

    fn handle_threads(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let threads = match self.state.lock() {
            Ok(state) => state.threads(),
            Err(_) => vec![],
        };
        let threads = threads
            .iter()
            .map(|t| json!({"id": t.id, "name": t.name}))
            .collect_vec();
        self.out
            .respond(req, true, None, Some(json!({"threads": threads})))
    }

    fn handle_stack_trace(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let thread_id = req
            .arguments
            .get("threadId")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| {
                self.state
                    .lock()
                    .map(|s| s.current_thread())
                    .unwrap_or(1)
            });

        // The backend lists the currently selected thread's frames unless
        // told otherwise; name the requested thread explicitly.
        let frames = match self.send(&format!("-stack-list-frames --thread {thread_id}")) {
            Ok(payload) => fields::frames(&payload),
            Err(err) => {
                self.diagnostic(&format!("stack trace failed: {err}"))?;
                vec![]
            }
        };

        let infos = frames
            .iter()
            .enumerate()
            .map(|(idx, f)| FrameInfo {
                index: f.level.unwrap_or(idx as u32),
                function: f
                    .func
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_FUNCTION.to_string()),
                source: f.file.clone(),
                // Zero-or-absent lines still need a displayable location.
                line: f.line.unwrap_or(0).max(1),
            })
            .collect_vec();

        let rsp_frames = infos
            .iter()
            .map(|f| {
                json!({
                    "id": encode_frame_id(thread_id, f.index),
                    "name": f.function,
                    "source": f.source.as_ref().map(|p| json!({"path": p})),
                    "line": f.line,
                    "column": 0,
                })
            })
            .collect_vec();

        if let Ok(mut state) = self.state.lock() {
            state.set_frames(thread_id, infos);
        }
        self.out.respond(
            req,
            true,
            None,
            Some(json!({"stackFrames": rsp_frames, "totalFrames": rsp_frames.len()})),
        )
    }

    fn handle_scopes(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let Some(frame_id) = req.arguments.get("frameId").and_then(|v| v.as_i64()) else {
            self.out.respond(
                req,
                false,
                Some("scopes: missing arguments.frameId".into()),
                None,
            )?;
            return Ok(());
        };
        let (thread_id, frame_index) = decode_frame_id(frame_id);

        let (locals_ref, globals_ref) = match self.state.lock() {
            Ok(mut state) => {
                state.select_frame(thread_id, frame_index);
                (
                    state.alloc_scope(ScopeKind::Locals, thread_id, frame_index),
                    state.alloc_scope(ScopeKind::Globals, thread_id, frame_index),
                )
            }
            Err(_) => return Err(anyhow!("session state poisoned")),
        };

        let scopes = vec![
            json!({"name": "Locals", "variablesReference": locals_ref, "expensive": false}),
            // Globals resolution is a declared limitation: the reference is
            // allocated but resolves to an empty set.
            json!({"name": "Globals", "variablesReference": globals_ref, "expensive": true}),
        ];
        self.out
            .respond(req, true, None, Some(json!({"scopes": scopes})))
    }

    fn handle_variables(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let reference = req
            .arguments
            .get("variablesReference")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        let scope = match self.state.lock() {
            Ok(state) => state.scope(reference),
            Err(_) => None,
        };

        let variables = match scope {
            Some(scope) if scope.kind == ScopeKind::Locals => {
                // The listing must run in the thread and frame the reference
                // was bound to; the backend's own selection may have moved.
                let cmd = format!(
                    "-stack-list-variables --thread {} --frame {} --all-values",
                    scope.thread_id, scope.frame_index
                );
                match self.send(&cmd) {
                    Ok(payload) => fields::variables(&payload)
                        .into_iter()
                        .map(|v| {
                            json!({
                                "name": v.name,
                                "value": v.value.unwrap_or_else(|| UNAVAILABLE_VALUE.to_string()),
                                "variablesReference": 0,
                            })
                        })
                        .collect_vec(),
                    Err(err) => {
                        self.diagnostic(&format!("variables failed: {err}"))?;
                        vec![]
                    }
                }
            }
            // Globals and stale/unknown references resolve to an empty set.
            _ => vec![],
        };

        self.out
            .respond(req, true, None, Some(json!({"variables": variables})))
    }

    fn handle_evaluate(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let Some(expression) = req.arguments.get("expression").and_then(|v| v.as_str()) else {
            self.out.respond(
                req,
                false,
                Some("evaluate: missing arguments.expression".into()),
                None,
            )?;
            return Ok(());
        };
        let context = req
            .arguments
            .get("context")
            .and_then(|v| v.as_str())
            .unwrap_or("repl");

        let result = if context == "repl" {
            // MI commands pass through verbatim, anything else is wrapped as
            // a console command; either way the raw backend text comes back.
            let cmd = if expression.starts_with('-') {
                expression.to_string()
            } else {
                format!("-interpreter-exec console \"{}\"", escape_mi_string(expression))
            };
            match self.send(&cmd) {
                Ok(payload) => payload,
                Err(err) => err.to_string(),
            }
        } else {
            // watch / hover: only the extracted value field is returned.
            let cmd = format!(
                "-data-evaluate-expression \"{}\"",
                escape_mi_string(expression)
            );
            match self.send(&cmd) {
                Ok(payload) => fields::value(&payload)
                    .unwrap_or_else(|| UNAVAILABLE_VALUE.to_string()),
                Err(err) => err.to_string(),
            }
        };

        self.out.respond(
            req,
            true,
            None,
            Some(json!({"result": result, "variablesReference": 0})),
        )
    }

    fn handle_disconnect(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        if let Some(mut connection) = self.connection.take() {
            // Ask the backend to leave on its own terms before killing it.
            // It usually exits without answering, hence the short deadline.
            let _ = connection.send_command("-gdb-exit", EXIT_COMMAND_TIMEOUT);
            connection.stop();
        }
        self.out.respond(req, true, None, None)?;
        self.out.event("terminated", None)?;
        log::info!(target: "dap", "session disconnected");
        Ok(())
    }

    /// Send one MI command; `NotRunning` when no session was launched.
    fn send(&self, cmd: &str) -> Result<String, error::Error> {
        match &self.connection {
            Some(connection) => connection.send_command(cmd, DEFAULT_COMMAND_TIMEOUT),
            None => Err(error::Error::NotRunning),
        }
    }

    /// Send one MI command, converting any failure into a diagnostic output
    /// event. Used where the surrounding request must complete regardless.
    fn command_or_diag(&self, cmd: &str) -> Option<String> {
        match self.send(cmd) {
            Ok(payload) => Some(payload),
            Err(err) => {
                let _ = self.diagnostic(&format!("{cmd}: {err}"));
                None
            }
        }
    }

    /// Run-control commands map to exactly one backend command each; the
    /// stop event arrives later as an unsolicited `*stopped` record.
    fn run_control(&self, cmd: &str) {
        self.command_or_diag(cmd);
    }

    fn diagnostic(&self, text: &str) -> anyhow::Result<()> {
        log::warn!(target: "dap", "{text}");
        self.out.event(
            "output",
            Some(json!({"category": "console", "output": format!("{text}\n")})),
        )
    }
}

/// Build the unsolicited-record handler installed on the backend connection.
/// It runs on the reader threads and is the second writer of the session
/// state; events go straight to the shared DAP writer so stops are not
/// delayed behind the request loop.
fn unsolicited_handler(
    out: DapWriter,
    state: Arc<Mutex<SessionState>>,
) -> Box<dyn Fn(Record) + Send + 'static> {
    Box::new(move |record| {
        if let Err(err) = translate_unsolicited(&out, &state, &record) {
            log::warn!(target: "dap", "event delivery failed: {err:#}");
        }
    })
}

fn translate_unsolicited(
    out: &DapWriter,
    state: &Arc<Mutex<SessionState>>,
    record: &Record,
) -> anyhow::Result<()> {
    match record.kind {
        RecordKind::ExecAsync => {
            if record.payload.starts_with("stopped") {
                let reason_raw = fields::stop_reason(&record.payload).unwrap_or_default();
                let reason = map_stop_reason(&reason_raw);
                let thread_id = fields::thread_id(&record.payload).unwrap_or(1);
                if let Ok(mut state) = state.lock() {
                    state.on_stop(thread_id);
                }
                out.event(
                    "stopped",
                    Some(json!({
                        "reason": reason,
                        "threadId": thread_id,
                        "allThreadsStopped": true,
                    })),
                )?;
            }
            // `*running` and friends need no client-side translation.
        }
        RecordKind::Notify => {
            if record.payload.starts_with("thread-created") {
                let id = fields::notify_thread_id(&record.payload);
                let info = match state.lock() {
                    Ok(mut state) => state.thread_created(id),
                    Err(_) => return Ok(()),
                };
                out.event(
                    "thread",
                    Some(json!({"reason": "started", "threadId": info.id})),
                )?;
            } else if record.payload.starts_with("thread-exited") {
                let id = fields::notify_thread_id(&record.payload);
                let id = match state.lock() {
                    Ok(mut state) => state.thread_exited(id),
                    Err(_) => return Ok(()),
                };
                out.event("thread", Some(json!({"reason": "exited", "threadId": id})))?;
            }
            // Other notifications (library loads, breakpoint modifications)
            // have no client-side counterpart here.
        }
        RecordKind::Console | RecordKind::Log | RecordKind::Target => {
            let mut text = record::decode_stream_text(&record.payload);
            if !text.ends_with('\n') {
                text.push('\n');
            }
            let category = match record.kind {
                RecordKind::Target => "stdout",
                _ => "console",
            };
            out.event(
                "output",
                Some(json!({"category": category, "output": text})),
            )?;
        }
        RecordKind::Result => {
            // An orphaned response: nobody awaited it (tokenless, or its
            // waiter timed out). Observable in the trace, nothing to emit.
            log::debug!(target: "dap", "orphaned result record: {}", record.payload);
        }
    }
    Ok(())
}

/// Fixed total mapping from backend stop reasons to the control protocol's
/// vocabulary. Unknown and terminal-exit reasons fall back to `pause`.
pub fn map_stop_reason(raw: &str) -> &'static str {
    match raw {
        "breakpoint-hit" => "breakpoint",
        "end-stepping-range" | "function-finished" | "location-reached" => "step",
        "signal-received" | "exception-received" => "exception",
        "watchpoint-trigger" | "read-watchpoint-trigger" | "access-watchpoint-trigger"
        | "watchpoint-scope" => "data breakpoint",
        _ => "pause",
    }
}

fn encode_frame_id(thread_id: i64, frame_index: u32) -> i64 {
    (thread_id << 16) | frame_index as i64
}

fn decode_frame_id(frame_id: i64) -> (i64, u32) {
    (frame_id >> 16, (frame_id & 0xFFFF) as u32)
}

/// The backend expects forward slashes regardless of client platform.
fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Absolute, backend-normalized form of a client source path.
fn backend_source_path(path: &str) -> String {
    let normalized = normalize_path(path);
    if Path::new(&normalized).is_absolute() {
        return normalized;
    }
    std::fs::canonicalize(&normalized)
        .map(|p| normalize_path(&p.to_string_lossy()))
        .unwrap_or(normalized)
}

fn parent_dir(program: &str) -> String {
    Path::new(program)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string())
}

/// Escape a value for embedding in a double-quoted MI argument.
fn escape_mi_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_mapping_is_total() {
        assert_eq!(map_stop_reason("breakpoint-hit"), "breakpoint");
        assert_eq!(map_stop_reason("end-stepping-range"), "step");
        assert_eq!(map_stop_reason("function-finished"), "step");
        assert_eq!(map_stop_reason("signal-received"), "exception");
        assert_eq!(map_stop_reason("watchpoint-trigger"), "data breakpoint");
        // Unknown and terminal-exit reasons fall back to pause.
        assert_eq!(map_stop_reason("exited-normally"), "pause");
        assert_eq!(map_stop_reason("exited-signalled"), "pause");
        assert_eq!(map_stop_reason(""), "pause");
        assert_eq!(map_stop_reason("something-new"), "pause");
    }

    #[test]
    fn frame_id_round_trip() {
        let id = encode_frame_id(7, 3);
        assert_eq!(decode_frame_id(id), (7, 3));
        let id = encode_frame_id(1, 0);
        assert_eq!(decode_frame_id(id), (1, 0));
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path(r"C:\work\a.cpp"), "C:/work/a.cpp");
        assert_eq!(normalize_path("/tmp/a.cpp"), "/tmp/a.cpp");
        assert_eq!(backend_source_path("/tmp/does-not-exist.cpp"), "/tmp/does-not-exist.cpp");
    }

    #[test]
    fn parent_dir_of_program() {
        assert_eq!(parent_dir("/tmp/a.out"), "/tmp");
        assert_eq!(parent_dir("a.out"), ".");
    }

    #[test]
    fn mi_string_escaping() {
        assert_eq!(escape_mi_string(r#"a "b" c"#), r#"a \"b\" c"#);
        assert_eq!(escape_mi_string(r"C:\x"), r"C:\\x");
    }
}
