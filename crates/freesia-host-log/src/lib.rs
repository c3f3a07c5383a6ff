//! Script logging capability.
//!
//! Scripts log through six levels (`print` plus `error`/`warn`/`info`/
//! `debug`/`trace`). Entries are collected into a per-execution [`LogBuffer`]
//! that becomes the `stdout` field of the execution envelope, and every entry
//! is mirrored to the host's `tracing` subscriber as it is written.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a script log entry.
///
/// `Print` is the plain output level; the rest mirror the usual log levels.
/// Entries persist the numeric code, `print` = 0 through `trace` = 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LogLevel {
  Print,
  Error,
  Warn,
  Info,
  Debug,
  Trace,
}

impl LogLevel {
  /// Numeric code of the level.
  pub fn code(&self) -> u8 {
    match self {
      LogLevel::Print => 0,
      LogLevel::Error => 1,
      LogLevel::Warn => 2,
      LogLevel::Info => 3,
      LogLevel::Debug => 4,
      LogLevel::Trace => 5,
    }
  }
}

impl From<LogLevel> for u8 {
  fn from(level: LogLevel) -> Self {
    level.code()
  }
}

impl TryFrom<u8> for LogLevel {
  type Error = String;

  fn try_from(code: u8) -> Result<Self, <LogLevel as TryFrom<u8>>::Error> {
    match code {
      0 => Ok(LogLevel::Print),
      1 => Ok(LogLevel::Error),
      2 => Ok(LogLevel::Warn),
      3 => Ok(LogLevel::Info),
      4 => Ok(LogLevel::Debug),
      5 => Ok(LogLevel::Trace),
      other => Err(format!("unknown log level code: {other}")),
    }
  }
}

/// A single timestamped log entry produced by a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
  pub text: String,
  pub level: LogLevel,
  pub timestamp: DateTime<Utc>,
}

/// Collects log entries for one execution.
///
/// Clones share the same underlying buffer, so the engine can hand a handle
/// to script callbacks and still drain the entries when the execution ends
/// (including after a timeout).
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
  inner: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogBuffer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append an entry and mirror it to the host tracing subscriber.
  pub fn push(&self, level: LogLevel, text: impl Into<String>) {
    let text = text.into();

    match level {
      LogLevel::Print | LogLevel::Info => tracing::info!(target: "freesia::script", "{}", text),
      LogLevel::Error => tracing::error!(target: "freesia::script", "{}", text),
      LogLevel::Warn => tracing::warn!(target: "freesia::script", "{}", text),
      LogLevel::Debug => tracing::debug!(target: "freesia::script", "{}", text),
      LogLevel::Trace => tracing::trace!(target: "freesia::script", "{}", text),
    }

    let entry = LogEntry {
      text,
      level,
      timestamp: Utc::now(),
    };

    let mut entries = self.inner.lock().unwrap();
    entries.push(entry);
  }

  /// Take all entries out of the buffer, leaving it empty.
  pub fn drain(&self) -> Vec<LogEntry> {
    let mut entries = self.inner.lock().unwrap();
    std::mem::take(&mut *entries)
  }

  /// Snapshot of the entries collected so far.
  pub fn entries(&self) -> Vec<LogEntry> {
    self.inner.lock().unwrap().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_push_preserves_order_and_level() {
    let buffer = LogBuffer::new();

    buffer.push(LogLevel::Print, "first");
    buffer.push(LogLevel::Error, "second");

    let entries = buffer.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].text, "first");
    assert_eq!(entries[0].level, LogLevel::Print);
    assert_eq!(entries[1].text, "second");
    assert_eq!(entries[1].level, LogLevel::Error);
  }

  #[test]
  fn test_drain_empties_buffer() {
    let buffer = LogBuffer::new();
    buffer.push(LogLevel::Info, "hello");

    let drained = buffer.drain();
    assert_eq!(drained.len(), 1);
    assert!(buffer.entries().is_empty());
  }

  #[test]
  fn test_clones_share_entries() {
    let buffer = LogBuffer::new();
    let handle = buffer.clone();

    handle.push(LogLevel::Debug, "shared");
    assert_eq!(buffer.entries().len(), 1);
  }

  #[test]
  fn test_level_codes() {
    assert_eq!(LogLevel::Print.code(), 0);
    assert_eq!(LogLevel::Trace.code(), 5);
  }

  #[test]
  fn test_level_serializes_as_its_code() {
    let json = serde_json::to_string(&LogLevel::Warn).unwrap();
    assert_eq!(json, "2");

    let back: LogLevel = serde_json::from_str("2").unwrap();
    assert_eq!(back, LogLevel::Warn);
  }
}
