//! Live output surfaces for stage scripts.
//!
//! The runner streams the combined stdout/stderr of every stage script into
//! an [`OutputSink`]. [`TerminalSink`] keeps a terminal screen model so a
//! front end can render script output (progress bars included) as a terminal
//! would.

use std::io::Write;
use std::sync::Mutex;

use crate::config::lock_or_recover;

/// Receiver of script output.
pub trait OutputSink: Send + Sync {
    /// Called with each chunk of output, usually one line.
    fn write(&self, bytes: &[u8]);
}

/// Terminal emulation of script output.
pub struct TerminalSink {
    parser: Mutex<vt100::Parser>,
}

impl TerminalSink {
    /// Create a terminal of the given size with scrollback.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: Mutex::new(vt100::Parser::new(rows, cols, 1000)),
        }
    }

    /// Visible screen contents as plain text.
    pub fn contents(&self) -> String {
        lock_or_recover(&self.parser, "terminal").screen().contents()
    }
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl OutputSink for TerminalSink {
    fn write(&self, bytes: &[u8]) {
        // Pipes have no line discipline, translate newlines like a tty would
        let mut translated = Vec::with_capacity(bytes.len() + 8);
        for &byte in bytes {
            if byte == b'\n' {
                translated.push(b'\r');
            }
            translated.push(byte);
        }
        lock_or_recover(&self.parser, "terminal").process(&translated);
    }
}

/// Forwards every line to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn write(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        for line in text.lines() {
            log::info!("[script] {}", line);
        }
    }
}

/// Passes output straight through to stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&self, bytes: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(bytes).and_then(|()| stdout.flush()) {
            log::warn!("Failed to forward script output: {}", e);
        }
    }
}
