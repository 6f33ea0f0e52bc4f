//! User-facing log lines.
//!
//! Components report progress ("Image saved: ...", "Manual re-authorization
//! required") through a [`LogSink`] so the front end decides where the lines
//! end up. Diagnostic logging goes through `tracing` independently.

/// Receives human-readable progress lines.
pub trait LogSink: Send + Sync {
    fn append_log(&self, line: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn append_log(&self, line: &str) {
        self(line)
    }
}

/// Forwards every line to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn append_log(&self, line: &str) {
        tracing::info!(target: "stcapture::ui", "{}", line);
    }
}

/// Discards every line.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn append_log(&self, _line: &str) {}
}
