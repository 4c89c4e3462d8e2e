//! mibridge - Debug Adapter Protocol server backed by gdb's MI2 interface.
//!
//! Exposes a DAP server over TCP. Intended as a building block for IDE
//! integrations (VSCode, etc.): the editor connects, drives one debug
//! session, and the bridge translates between DAP and the gdb subprocess.

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::net::{SocketAddr, TcpListener};

use mibridge::dap::io;
use mibridge::dap::session::DebugSession;
use mibridge::dap::tracer::WireTrace;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on (default: 127.0.0.1:4711)
    #[clap(long, default_value = "127.0.0.1:4711")]
    listen: String,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    oneshot: bool,

    /// Path of the gdb executable to drive.
    #[clap(long, default_value = "gdb", env = "MIBRIDGE_GDB")]
    gdb: String,

    /// Optional log file for adapter diagnostics (no output to stdout).
    #[clap(long)]
    log_file: Option<std::path::PathBuf>,

    /// Trace DAP traffic (requests/responses/events) into the log file.
    /// Requires --log-file.
    #[clap(long)]
    trace_dap: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let addr: SocketAddr = args.listen.parse().context("Invalid listen address")?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    info!(target: "dap", "mibridge listening on {addr}");

    let tracer = match &args.log_file {
        Some(path) => Some(WireTrace::open(path)?),
        None => None,
    };
    if args.trace_dap && tracer.is_none() {
        warn!(target: "dap", "--trace-dap requires --log-file; tracing disabled");
    }

    // Server mode: accept multiple clients sequentially. One client == one
    // debug session == one gdb subprocess.
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "dap", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "dap", "DAP client connected: {peer}");
        if let Some(t) = &tracer {
            t.line("session", &format!("client connected: {peer}"));
        }

        let (reader, writer) = match io::split(stream, tracer.clone(), args.trace_dap) {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "dap", "failed to init DAP I/O: {err:#}");
                continue;
            }
        };

        let res = DebugSession::new(reader, writer, args.gdb.clone()).run();
        if let Err(err) = res {
            warn!(target: "dap", "session ended with error: {err:#}");
            if let Some(t) = &tracer {
                t.line("session", &format!("session error: {err:#}"));
            }
        } else if let Some(t) = &tracer {
            t.line("session", "session finished OK");
        }

        if args.oneshot {
            break;
        }
    }
    Ok(())
}
