use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use freesia_object::{CallRecord, ObjectMeta, ObjectUpsert};

use crate::{CallStore, Error, ObjectStore};

/// In-memory store implementation.
///
/// Backs tests and embedding. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  objects: Arc<RwLock<HashMap<String, ObjectMeta>>>,
  calls: Arc<RwLock<Vec<CallRecord>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl ObjectStore for MemoryStore {
  async fn find_object_by_hash(&self, object_hash: &str) -> Result<Option<ObjectMeta>, Error> {
    let objects = self.objects.read().unwrap();
    Ok(objects.get(object_hash).cloned())
  }

  async fn find_object_by_id(&self, id: &str) -> Result<Option<ObjectMeta>, Error> {
    let objects = self.objects.read().unwrap();
    Ok(
      objects
        .values()
        .find(|meta| meta.id.as_deref() == Some(id))
        .cloned(),
    )
  }

  async fn upsert_object(&self, upsert: &ObjectUpsert) -> Result<(), Error> {
    let mut objects = self.objects.write().unwrap();

    match objects.get_mut(&upsert.object_hash) {
      Some(existing) => {
        existing.id = upsert.id.clone();
        existing.name = upsert.name.clone();
        existing.group = upsert.group.clone();
        existing.description = upsert.description.clone();
        existing.schedule = upsert.schedule.clone();
      }
      None => {
        objects.insert(
          upsert.object_hash.clone(),
          ObjectMeta {
            object_hash: upsert.object_hash.clone(),
            id: upsert.id.clone(),
            name: upsert.name.clone(),
            group: upsert.group.clone(),
            description: upsert.description.clone(),
            deps: Vec::new(),
            schedule: upsert.schedule.clone(),
            result_types: None,
          },
        );
      }
    }

    Ok(())
  }

  async fn append_dependency_edge(&self, object_hash: &str, dep_id: &str) -> Result<(), Error> {
    let mut objects = self.objects.write().unwrap();

    let Some(meta) = objects.get_mut(object_hash) else {
      return Err(Error::NotFound(format!("object '{}'", object_hash)));
    };

    if !meta.deps.iter().any(|dep| dep == dep_id) {
      meta.deps.push(dep_id.to_string());
    }

    Ok(())
  }

  async fn set_result_types(&self, object_hash: &str, result_types: &Value) -> Result<(), Error> {
    let mut objects = self.objects.write().unwrap();

    let Some(meta) = objects.get_mut(object_hash) else {
      return Err(Error::NotFound(format!("object '{}'", object_hash)));
    };

    meta.result_types = Some(result_types.clone());
    Ok(())
  }

  async fn list_objects(&self) -> Result<Vec<ObjectMeta>, Error> {
    let objects = self.objects.read().unwrap();
    let mut listed: Vec<ObjectMeta> = objects.values().cloned().collect();
    listed.sort_by(|a, b| a.object_hash.cmp(&b.object_hash));
    Ok(listed)
  }
}

#[async_trait]
impl CallStore for MemoryStore {
  async fn insert_call(&self, record: &CallRecord) -> Result<(), Error> {
    let mut calls = self.calls.write().unwrap();
    calls.push(record.clone());
    Ok(())
  }

  async fn find_call(&self, call_id: &str) -> Result<Option<CallRecord>, Error> {
    let calls = self.calls.read().unwrap();
    Ok(calls.iter().find(|call| call.call_id == call_id).cloned())
  }

  async fn list_calls(&self, limit: i64) -> Result<Vec<CallRecord>, Error> {
    let calls = self.calls.read().unwrap();
    let mut listed: Vec<CallRecord> = calls.clone();
    listed.sort_by(|a, b| b.time.cmp(&a.time));
    listed.truncate(limit.max(0) as usize);
    Ok(listed)
  }
}
