//! Structural type descriptors.
//!
//! [`describe`] summarizes the shape of a JSON result: scalars map to type
//! names, arrays to `Array<T>` with `T` derived from the element types, and
//! objects to a flattened map from dot-separated leaf paths to descriptors.
//! The descriptor is stored alongside the object so callers can see what a
//! script produces without re-running it.

use serde_json::{Map, Value};

/// Describe the shape of a JSON value.
///
/// Returns a JSON string for scalars and arrays, or a JSON object mapping
/// dot-separated paths to descriptors when the value is an object.
pub fn describe(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut out = Map::new();
      flatten(String::new(), map, &mut out);
      Value::Object(out)
    }
    other => Value::String(describe_leaf(other)),
  }
}

/// Descriptor for a non-object value.
fn describe_leaf(value: &Value) -> String {
  match value {
    Value::Array(items) => array_descriptor(items),
    other => scalar_name(other).to_string(),
  }
}

/// Type name of a single value, used for scalars and array elements.
fn scalar_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "Null",
    Value::Bool(_) => "Boolean",
    Value::Number(n) => {
      if n.is_i64() || n.is_u64() {
        "Int"
      } else {
        "Float"
      }
    }
    Value::String(_) => "String",
    Value::Array(_) => "Array",
    Value::Object(_) => "Object",
  }
}

fn array_descriptor(items: &[Value]) -> String {
  if items.is_empty() {
    return "Array<Empty>".to_string();
  }

  let first = scalar_name(&items[0]);
  let uniform = items.iter().all(|item| scalar_name(item) == first);
  if uniform {
    format!("Array<{}>", first)
  } else {
    "Array<Mixed>".to_string()
  }
}

/// Walk an object, emitting one entry per leaf at its dot-separated path.
/// Arrays count as leaves; nested objects recurse.
fn flatten(prefix: String, map: &Map<String, Value>, out: &mut Map<String, Value>) {
  for (key, value) in map {
    let path = if prefix.is_empty() {
      key.clone()
    } else {
      format!("{}.{}", prefix, key)
    };

    match value {
      Value::Object(inner) => flatten(path, inner, out),
      other => {
        out.insert(path, Value::String(describe_leaf(other)));
      }
    }
  }
}
