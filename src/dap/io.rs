//! DAP Content-Length framing over TCP.
//!
//! The stream is split into a read half owned by the request loop and a
//! cloneable, mutex-guarded write half. Splitting matters: stop events
//! originate on the backend reader threads while the request loop is blocked
//! in [`DapReader::read_message`], so events must not queue up behind it.

use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use crate::dap::protocol::{DapEvent, DapRequest, DapResponse};
use crate::dap::tracer::WireTrace;

pub fn split(
    stream: TcpStream,
    tracer: Option<WireTrace>,
    trace: bool,
) -> anyhow::Result<(DapReader, DapWriter)> {
    stream.set_nodelay(true)?;
    let reader = DapReader {
        reader: BufReader::new(stream.try_clone()?),
        tracer: tracer.clone(),
        trace,
    };
    let writer = DapWriter {
        inner: Arc::new(Mutex::new(WriterInner {
            stream,
            seq: 1,
            tracer,
            trace,
        })),
    };
    Ok((reader, writer))
}

pub struct DapReader {
    reader: BufReader<TcpStream>,
    tracer: Option<WireTrace>,
    trace: bool,
}

impl DapReader {
    pub fn read_message(&mut self) -> anyhow::Result<Value> {
        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line)?;
            if read_n == 0 {
                return Err(anyhow!("DAP connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.strip_prefix("Content-Length:") {
                content_length = Some(v.trim().parse()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        let msg: Value = serde_json::from_slice(&buf)?;
        if self.trace {
            if let (Some(tracer), Ok(line)) = (&self.tracer, serde_json::to_string(&msg)) {
                tracer.line("dap", &format!("<- {line}"));
            }
        }
        Ok(msg)
    }
}

/// Shared write half. Responses (request loop) and events (backend reader
/// threads) go through the same lock, which also owns the outgoing sequence
/// counter.
#[derive(Clone)]
pub struct DapWriter {
    inner: Arc<Mutex<WriterInner>>,
}

struct WriterInner {
    stream: TcpStream,
    seq: i64,
    tracer: Option<WireTrace>,
    trace: bool,
}

impl DapWriter {
    pub fn respond(
        &self,
        req: &DapRequest,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("DAP writer poisoned"))?;
        let rsp = DapResponse {
            seq: inner.next_seq(),
            r#type: "response",
            request_seq: req.seq,
            success,
            command: req.command.clone(),
            message,
            body,
        };
        inner.write_message(&rsp)
    }

    pub fn event(&self, name: &'static str, body: Option<Value>) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("DAP writer poisoned"))?;
        let ev = DapEvent {
            seq: inner.next_seq(),
            r#type: "event",
            event: name,
            body,
        };
        inner.write_message(&ev)
    }
}

impl WriterInner {
    fn next_seq(&mut self) -> i64 {
        let s = self.seq;
        self.seq += 1;
        s
    }

    fn write_message<T: Serialize>(&mut self, v: &T) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(v)?;
        if self.trace {
            if let (Some(tracer), Ok(line)) = (&self.tracer, serde_json::to_string(v)) {
                tracer.line("dap", &format!("-> {line}"));
            }
        }
        write!(self.stream, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.stream.write_all(&payload)?;
        self.stream.flush()?;
        Ok(())
    }
}
