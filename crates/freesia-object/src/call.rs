use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use freesia_host_http::NetEvent;
use freesia_host_log::LogEntry;

/// Kind of a script-visible execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// The source failed to compile.
  Compile,
  /// A capability was used before `declare_meta`.
  MetaRequired,
  /// The declared id is already used, or meta was declared twice.
  DuplicateMeta,
  /// The declared id was missing or empty.
  EmptyId,
  /// A dependency resolves back into the running call chain.
  CyclicDependency,
  /// The depended-on id has no declared object.
  DependencyNotDeclared,
  /// A declared schedule expression failed to parse.
  InvalidSchedule,
  /// The execution exceeded its time budget.
  Timeout,
  /// The script itself raised an error.
  Script,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::Compile => "compile",
      ErrorKind::MetaRequired => "meta_required",
      ErrorKind::DuplicateMeta => "duplicate_meta",
      ErrorKind::EmptyId => "empty_id",
      ErrorKind::CyclicDependency => "cyclic_dependency",
      ErrorKind::DependencyNotDeclared => "dependency_not_declared",
      ErrorKind::InvalidSchedule => "invalid_schedule",
      ErrorKind::Timeout => "timeout",
      ErrorKind::Script => "script",
    }
  }
}

/// An execution error carried as data inside the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallError {
  pub kind: ErrorKind,
  pub message: String,
}

impl CallError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }
}

impl std::fmt::Display for CallError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}: {}", self.kind.as_str(), self.message)
  }
}

/// Wall-clock cost of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
  pub millis: f64,
}

/// The envelope every execution produces.
///
/// Exactly one of `result` and `error` is meaningful; the buffers and the
/// performance figure are always populated, including on timeouts, where
/// they capture whatever the script produced before being cut off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vme {
  pub result: Option<Value>,
  pub error: Option<CallError>,
  pub result_types: Option<Value>,
  pub performance: Performance,
  pub stdout: Vec<LogEntry>,
  pub net_trace: Vec<NetEvent>,
}

/// One completed execution, immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
  pub call_id: String,
  pub object_hash: String,
  pub time: DateTime<Utc>,
  pub is_scheduled: bool,
  #[serde(flatten)]
  pub vme: Vme,
}

impl CallRecord {
  /// Stamp a fresh record for an execution that just finished.
  pub fn new(object_hash: impl Into<String>, is_scheduled: bool, vme: Vme) -> Self {
    Self {
      call_id: uuid::Uuid::new_v4().to_string(),
      object_hash: object_hash.into(),
      time: Utc::now(),
      is_scheduled,
      vme,
    }
  }
}
