use freesia_object::{CallError, ErrorKind};

/// Errors raised by the capability surface while a script is running.
///
/// These are carried through Lua as external errors and recovered on the
/// host side, so a failing capability aborts the script with a typed error
/// instead of a bare string.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
  #[error("declare_meta must be called before this capability")]
  MetaRequired,
  #[error("{message}")]
  DuplicateMeta { message: String },
  #[error("meta id must be a non-empty string")]
  EmptyId,
  #[error("invalid schedule '{expr}': {message}")]
  InvalidSchedule { expr: String, message: String },
  #[error("cyclic dependency on '{id}'")]
  CyclicDependency { id: String },
  #[error("no object declares the id '{id}'")]
  DependencyNotDeclared { id: String },
  #[error("store error: {source}")]
  Store {
    #[source]
    source: freesia_store::Error,
  },
}

impl SandboxError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      SandboxError::MetaRequired => ErrorKind::MetaRequired,
      SandboxError::DuplicateMeta { .. } => ErrorKind::DuplicateMeta,
      SandboxError::EmptyId => ErrorKind::EmptyId,
      SandboxError::InvalidSchedule { .. } => ErrorKind::InvalidSchedule,
      SandboxError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
      SandboxError::DependencyNotDeclared { .. } => ErrorKind::DependencyNotDeclared,
      SandboxError::Store { .. } => ErrorKind::Script,
    }
  }

  pub fn to_call_error(&self) -> CallError {
    CallError::new(self.kind(), self.to_string())
  }
}
