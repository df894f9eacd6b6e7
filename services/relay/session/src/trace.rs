//! Operator-facing trace output.
//!
//! Connection lifecycle events, received messages and errors are written to
//! a [`TraceSink`] supplied by the caller. Every sink serializes its own
//! output, so concurrent sessions can share one `Arc<dyn TraceSink>` without
//! any locking at the call sites.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

/// Destination for trace output
pub trait TraceSink: Send + Sync {
    /// Write text without a line terminator
    fn trace(&self, text: &str);

    /// Write text followed by a line terminator
    fn trace_line(&self, text: &str);
}

/// Writes to standard output under the stdout lock
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl TraceSink for ConsoleSink {
    fn trace(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        if out.write_all(text.as_bytes()).and_then(|_| out.flush()).is_err() {
            tracing::warn!("stdout trace write failed");
        }
    }

    fn trace_line(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        if writeln!(out, "{text}").is_err() {
            tracing::warn!("stdout trace write failed");
        }
    }
}

/// Forwards trace output to `tracing` at INFO under the `relay::trace` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn trace(&self, text: &str) {
        tracing::info!(target: "relay::trace", "{}", text);
    }

    fn trace_line(&self, text: &str) {
        tracing::info!(target: "relay::trace", "{}", text);
    }
}

/// Keeps trace output in memory; used by embedders and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<(Vec<String>, String)>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed lines so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).0.clone()
    }

    /// Number of completed lines containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl TraceSink for MemorySink {
    fn trace(&self, text: &str) {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).1.push_str(text);
    }

    fn trace_line(&self, text: &str) {
        let mut guard = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let (lines, partial) = &mut *guard;
        let mut line = std::mem::take(partial);
        line.push_str(text);
        lines.push(line);
    }
}

/// Wall-clock prefix for trace lines, `HH:MM:SS.mmm`
pub fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_joins_partial_output() {
        let sink = MemorySink::new();
        sink.trace("Connect(");
        sink.trace("ws://x)");
        sink.trace_line("");
        sink.trace_line("Connected");

        assert_eq!(sink.lines(), vec!["Connect(ws://x)", "Connected"]);
        assert_eq!(sink.count("Connect"), 2);
    }

    #[test]
    fn test_stamp_shape() {
        let stamp = stamp();
        assert_eq!(stamp.len(), 12);
        assert_eq!(&stamp[2..3], ":");
        assert_eq!(&stamp[8..9], ".");
    }
}
