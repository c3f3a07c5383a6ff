//! Sandboxed execution of content-addressed Lua script objects.
//!
//! - a fresh Lua state per execution, with a narrow capability surface
//! - typed script-visible errors recovered into the call envelope
//! - a wall-clock timeout covering the whole call, dependencies included
//! - process-wide lazy and time-bounded memoization shared across runs

mod context;
mod engine;
mod error;

pub use engine::{EngineConfig, SandboxEngine};
pub use error::SandboxError;
