//! Freesia Store
//!
//! This crate provides the storage traits and implementations for declared
//! script objects and their call records. Data is persisted to SQLite.
//!
//! The [`ObjectStore`] trait defines operations for:
//! - Finding objects by content hash or declared id
//! - Upserting declared metadata (never touching learned fields)
//! - Appending dependency edges and storing result type descriptors
//!
//! The [`CallStore`] trait covers the immutable per-execution records.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;

use freesia_object::{CallRecord, ObjectMeta, ObjectUpsert};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage trait for declared script objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
  /// Get an object by its content hash.
  async fn find_object_by_hash(&self, object_hash: &str) -> Result<Option<ObjectMeta>, Error>;

  /// Get an object by its declared id.
  async fn find_object_by_id(&self, id: &str) -> Result<Option<ObjectMeta>, Error>;

  /// Insert or update an object's declared metadata.
  ///
  /// Declared fields are last-write-wins; `deps` and `result_types` are
  /// left exactly as stored.
  async fn upsert_object(&self, upsert: &ObjectUpsert) -> Result<(), Error>;

  /// Record that `object_hash` depends on the object declared as `dep_id`.
  ///
  /// Edges are deduplicated; appending an existing edge is a no-op.
  async fn append_dependency_edge(&self, object_hash: &str, dep_id: &str) -> Result<(), Error>;

  /// Store the result type descriptor for an object.
  async fn set_result_types(&self, object_hash: &str, result_types: &Value) -> Result<(), Error>;

  /// List all declared objects.
  async fn list_objects(&self) -> Result<Vec<ObjectMeta>, Error>;
}

/// Storage trait for call records.
#[async_trait]
pub trait CallStore: Send + Sync {
  /// Insert a completed call record.
  async fn insert_call(&self, record: &CallRecord) -> Result<(), Error>;

  /// Get a call record by id.
  async fn find_call(&self, call_id: &str) -> Result<Option<CallRecord>, Error>;

  /// List the most recent call records, newest first.
  async fn list_calls(&self, limit: i64) -> Result<Vec<CallRecord>, Error>;
}
