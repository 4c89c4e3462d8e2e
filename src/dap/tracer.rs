use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Appends wire traffic and session diagnostics to a file, one entry per
/// line, each tagged with the channel it came from so interleaved DAP
/// traffic and lifecycle notes stay distinguishable. The DAP client owns
/// stdout/stderr, so a file is the only place such diagnostics can go.
#[derive(Clone)]
pub struct WireTrace {
    file: Arc<Mutex<std::fs::File>>,
}

impl WireTrace {
    pub fn open(path: &Path) -> anyhow::Result<WireTrace> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        Ok(WireTrace {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn line(&self, channel: &str, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "[{channel}] {text}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_carry_their_channel() {
        let path = std::env::temp_dir().join(format!("wiretrace-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let trace = WireTrace::open(&path).unwrap();
        trace.line("dap", "-> {\"seq\":1}");
        trace.line("session", "client connected");

        let contents = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(contents.contains("[dap] -> {\"seq\":1}"));
        assert!(contents.contains("[session] client connected"));
    }
}
