use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};

use freesia_object::{CallError, CallRecord, ObjectMeta, ObjectUpsert, Performance, Vme};
use freesia_host_http::NetEvent;
use freesia_host_log::LogEntry;

use crate::{CallStore, Error, ObjectStore};

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

#[derive(FromRow)]
struct ObjectRow {
  object_hash: String,
  id: Option<String>,
  name: Option<String>,
  group_name: Option<String>,
  description: Option<String>,
  deps: Json<Vec<String>>,
  schedule: Json<Vec<String>>,
  result_types: Option<Json<Value>>,
}

impl From<ObjectRow> for ObjectMeta {
  fn from(row: ObjectRow) -> Self {
    ObjectMeta {
      object_hash: row.object_hash,
      id: row.id,
      name: row.name,
      group: row.group_name,
      description: row.description,
      deps: row.deps.0,
      schedule: row.schedule.0,
      result_types: row.result_types.map(|json| json.0),
    }
  }
}

#[derive(FromRow)]
struct CallRow {
  call_id: String,
  object_hash: String,
  time: DateTime<Utc>,
  is_scheduled: bool,
  result: Option<Json<Value>>,
  error: Option<Json<CallError>>,
  result_types: Option<Json<Value>>,
  millis: f64,
  stdout: Json<Vec<LogEntry>>,
  net_trace: Json<Vec<NetEvent>>,
}

impl From<CallRow> for CallRecord {
  fn from(row: CallRow) -> Self {
    CallRecord {
      call_id: row.call_id,
      object_hash: row.object_hash,
      time: row.time,
      is_scheduled: row.is_scheduled,
      vme: Vme {
        result: row.result.map(|json| json.0),
        error: row.error.map(|json| json.0),
        result_types: row.result_types.map(|json| json.0),
        performance: Performance { millis: row.millis },
        stdout: row.stdout.0,
        net_trace: row.net_trace.0,
      },
    }
  }
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) a database file and wrap it in a store.
  pub async fn connect(path: &Path) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }
}

#[async_trait]
impl ObjectStore for SqliteStore {
  async fn find_object_by_hash(&self, object_hash: &str) -> Result<Option<ObjectMeta>, Error> {
    let row: Option<ObjectRow> = sqlx::query_as(
      r#"
            SELECT object_hash, id, name, group_name, description, deps, schedule, result_types
            FROM objects
            WHERE object_hash = ?
            "#,
    )
    .bind(object_hash)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.map(Into::into))
  }

  async fn find_object_by_id(&self, id: &str) -> Result<Option<ObjectMeta>, Error> {
    let row: Option<ObjectRow> = sqlx::query_as(
      r#"
            SELECT object_hash, id, name, group_name, description, deps, schedule, result_types
            FROM objects
            WHERE id = ?
            "#,
    )
    .bind(id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.map(Into::into))
  }

  async fn upsert_object(&self, upsert: &ObjectUpsert) -> Result<(), Error> {
    sqlx::query(
      r#"
            INSERT INTO objects (object_hash, id, name, group_name, description, deps, schedule, result_types)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(object_hash) DO UPDATE SET
              id = excluded.id,
              name = excluded.name,
              group_name = excluded.group_name,
              description = excluded.description,
              schedule = excluded.schedule
            "#,
    )
    .bind(&upsert.object_hash)
    .bind(&upsert.id)
    .bind(&upsert.name)
    .bind(&upsert.group)
    .bind(&upsert.description)
    .bind(Json(Vec::<String>::new()))
    .bind(Json(&upsert.schedule))
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn append_dependency_edge(&self, object_hash: &str, dep_id: &str) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;

    let row: Option<(Json<Vec<String>>,)> =
      sqlx::query_as("SELECT deps FROM objects WHERE object_hash = ?")
        .bind(object_hash)
        .fetch_optional(&mut *tx)
        .await?;

    let Some((Json(mut deps),)) = row else {
      return Err(Error::NotFound(format!("object '{}'", object_hash)));
    };

    if !deps.iter().any(|dep| dep == dep_id) {
      deps.push(dep_id.to_string());
      sqlx::query("UPDATE objects SET deps = ? WHERE object_hash = ?")
        .bind(Json(deps))
        .bind(object_hash)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
  }

  async fn set_result_types(&self, object_hash: &str, result_types: &Value) -> Result<(), Error> {
    let result = sqlx::query("UPDATE objects SET result_types = ? WHERE object_hash = ?")
      .bind(Json(result_types))
      .bind(object_hash)
      .execute(&self.pool)
      .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("object '{}'", object_hash)));
    }

    Ok(())
  }

  async fn list_objects(&self) -> Result<Vec<ObjectMeta>, Error> {
    let rows: Vec<ObjectRow> = sqlx::query_as(
      r#"
            SELECT object_hash, id, name, group_name, description, deps, schedule, result_types
            FROM objects
            ORDER BY object_hash ASC
            "#,
    )
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
  }
}

#[async_trait]
impl CallStore for SqliteStore {
  async fn insert_call(&self, record: &CallRecord) -> Result<(), Error> {
    sqlx::query(
            r#"
            INSERT INTO calls (call_id, object_hash, time, is_scheduled, result, error, result_types, millis, stdout, net_trace)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.call_id)
        .bind(&record.object_hash)
        .bind(record.time)
        .bind(record.is_scheduled)
        .bind(record.vme.result.as_ref().map(Json))
        .bind(record.vme.error.as_ref().map(Json))
        .bind(record.vme.result_types.as_ref().map(Json))
        .bind(record.vme.performance.millis)
        .bind(Json(&record.vme.stdout))
        .bind(Json(&record.vme.net_trace))
        .execute(&self.pool)
        .await?;

    Ok(())
  }

  async fn find_call(&self, call_id: &str) -> Result<Option<CallRecord>, Error> {
    let row: Option<CallRow> = sqlx::query_as(
            r#"
            SELECT call_id, object_hash, time, is_scheduled, result, error, result_types, millis, stdout, net_trace
            FROM calls
            WHERE call_id = ?
            "#,
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;

    Ok(row.map(Into::into))
  }

  async fn list_calls(&self, limit: i64) -> Result<Vec<CallRecord>, Error> {
    let rows: Vec<CallRow> = sqlx::query_as(
            r#"
            SELECT call_id, object_hash, time, is_scheduled, result, error, result_types, millis, stdout, net_trace
            FROM calls
            ORDER BY time DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

    Ok(rows.into_iter().map(Into::into).collect())
  }
}
