use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A script object's stored metadata.
///
/// `deps` holds the ids of objects this one was observed to depend on; it
/// only grows, and only through resolved dependency declarations. `schedule`
/// holds cron expressions as declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
  pub object_hash: String,
  pub id: Option<String>,
  pub name: Option<String>,
  pub group: Option<String>,
  pub description: Option<String>,
  pub deps: Vec<String>,
  pub schedule: Vec<String>,
  pub result_types: Option<Value>,
}

/// A schedule as scripts declare it: a single expression or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleDecl {
  One(String),
  Many(Vec<String>),
}

impl ScheduleDecl {
  pub fn into_vec(self) -> Vec<String> {
    match self {
      ScheduleDecl::One(expr) => vec![expr],
      ScheduleDecl::Many(exprs) => exprs,
    }
  }
}

/// Metadata as a script declares it, before validation and normalization.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeclaredMeta {
  pub id: Option<String>,
  pub name: Option<String>,
  pub group: Option<String>,
  pub description: Option<String>,
  pub schedule: Option<ScheduleDecl>,
}

impl DeclaredMeta {
  /// Normalize into the fields a metadata upsert writes.
  pub fn into_upsert(self, object_hash: String) -> ObjectUpsert {
    ObjectUpsert {
      object_hash,
      id: self.id,
      name: self.name,
      group: self.group,
      description: self.description,
      schedule: self.schedule.map(ScheduleDecl::into_vec).unwrap_or_default(),
    }
  }
}

/// The fields a metadata declaration writes.
///
/// Deliberately excludes `deps` and `result_types`: declarations replace the
/// descriptive fields but never touch what the store has learned about an
/// object's edges or result shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectUpsert {
  pub object_hash: String,
  pub id: Option<String>,
  pub name: Option<String>,
  pub group: Option<String>,
  pub description: Option<String>,
  pub schedule: Vec<String>,
}
