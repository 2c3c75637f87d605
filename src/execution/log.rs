//! Execution log sinks for step narration

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One appended line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: LogLevel,
    pub text: String,
}

/// Append-only log, ordered per scope
pub trait LogSink: Send + Sync {
    fn append_line(&self, scope: &str, level: LogLevel, text: &str);
}

/// Keeps lines in memory, grouped by scope
#[derive(Default)]
pub struct InMemoryLogSink {
    lines: Mutex<HashMap<String, Vec<LogLine>>>,
}

impl InMemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines_for(&self, scope: &str) -> Vec<LogLine> {
        let lines = self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lines.get(scope).cloned().unwrap_or_default()
    }

    /// Text of every line of `scope`, in append order
    pub fn texts_for(&self, scope: &str) -> Vec<String> {
        self.lines_for(scope).into_iter().map(|l| l.text).collect()
    }
}

impl LogSink for InMemoryLogSink {
    fn append_line(&self, scope: &str, level: LogLevel, text: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lines.entry(scope.to_string()).or_default().push(LogLine {
            level,
            text: text.to_string(),
        });
    }
}

/// Forwards lines to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append_line(&self, scope: &str, level: LogLevel, text: &str) {
        match level {
            LogLevel::Info => info!(scope, "{}", text),
            LogLevel::Warn => warn!(scope, "{}", text),
            LogLevel::Error => error!(scope, "{}", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_kept_in_order_per_scope() {
        let sink = InMemoryLogSink::new();
        sink.append_line("a", LogLevel::Info, "first");
        sink.append_line("b", LogLevel::Info, "other");
        sink.append_line("a", LogLevel::Error, "second");

        assert_eq!(sink.texts_for("a"), vec!["first", "second"]);
        assert_eq!(sink.lines_for("a")[1].level, LogLevel::Error);
        assert!(sink.lines_for("missing").is_empty());
    }
}
