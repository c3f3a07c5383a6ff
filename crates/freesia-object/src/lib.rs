//! Freesia data model.
//!
//! This crate defines the types shared across the workspace:
//! - Script objects and their declared metadata ([`ObjectMeta`],
//!   [`DeclaredMeta`])
//! - The execution envelope ([`Vme`]) and typed script errors
//!   ([`CallError`], [`ErrorKind`])
//! - Immutable per-execution records ([`CallRecord`])
//!
//! Objects are identified by the content hash of their source; the optional
//! declared `id` is the human handle other scripts use to depend on them.

mod call;
mod meta;

pub use call::{CallError, CallRecord, ErrorKind, Performance, Vme};
pub use meta::{DeclaredMeta, ObjectMeta, ObjectUpsert, ScheduleDecl};
