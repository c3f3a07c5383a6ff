//! Per-execution state and the capability surface scripts see.
//!
//! Every execution builds a fresh Lua state carrying only the `table`,
//! `string`, and `math` standard libraries plus the globals registered
//! here. Capabilities share one [`ExecCtx`] handle holding the engine
//! services and the buffers that end up in the envelope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::{
  DeserializeOptions, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, Variadic,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use freesia_host_http::{NetTrace, TracedClient};
use freesia_host_log::{LogBuffer, LogLevel};
use freesia_object::DeclaredMeta;

use crate::engine::{CallStack, EngineInner, run_vm};
use crate::error::SandboxError;

/// Shared state for one script execution.
pub(crate) struct ExecCtx {
  pub inner: Arc<EngineInner>,
  pub object_hash: String,
  pub debug: bool,
  pub stack: CallStack,
  pub logs: LogBuffer,
  pub net: NetTrace,
  meta: Mutex<Option<String>>,
  resolve_tx: Mutex<Option<oneshot::Sender<Value>>>,
}

impl ExecCtx {
  pub fn new(
    inner: Arc<EngineInner>,
    object_hash: String,
    debug: bool,
    stack: CallStack,
    logs: LogBuffer,
    net: NetTrace,
  ) -> Self {
    Self {
      inner,
      object_hash,
      debug,
      stack,
      logs,
      net,
      meta: Mutex::new(None),
      resolve_tx: Mutex::new(None),
    }
  }

  pub fn set_resolver(&self, tx: oneshot::Sender<Value>) {
    *self.resolve_tx.lock().unwrap() = Some(tx);
  }

  /// The first resolve wins; later calls are ignored.
  pub fn try_resolve(&self, value: Value) {
    if let Some(tx) = self.resolve_tx.lock().unwrap().take() {
      let _ = tx.send(value);
    }
  }

  fn declared_id(&self) -> Option<String> {
    self.meta.lock().unwrap().clone()
  }

  fn set_declared(&self, id: String) {
    *self.meta.lock().unwrap() = Some(id);
  }

  fn require_meta(&self) -> mlua::Result<()> {
    if self.meta.lock().unwrap().is_some() {
      Ok(())
    } else {
      Err(mlua::Error::external(SandboxError::MetaRequired))
    }
  }
}

/// Build the Lua state for one execution and wire every capability into it.
pub(crate) fn build_lua(ctx: &Arc<ExecCtx>) -> mlua::Result<Lua> {
  let lua = Lua::new_with(
    StdLib::TABLE | StdLib::STRING | StdLib::MATH,
    LuaOptions::default(),
  )?;

  {
    let globals = lua.globals();
    globals.set("current_object", ctx.object_hash.as_str())?;
    globals.set("is_debug", ctx.debug)?;
    // the base library ships with filesystem entry points
    globals.set("dofile", mlua::Value::Nil)?;
    globals.set("loadfile", mlua::Value::Nil)?;
  }

  register_declarations(&lua, ctx)?;
  register_caching(&lua, ctx)?;
  register_logging(&lua, ctx)?;
  register_http(&lua, ctx)?;
  register_control(&lua, ctx)?;

  Ok(lua)
}

fn register_declarations(lua: &Lua, ctx: &Arc<ExecCtx>) -> mlua::Result<()> {
  let globals = lua.globals();

  let declare_meta = {
    let ctx = ctx.clone();
    lua.create_async_function(move |lua, table: mlua::Table| {
      let ctx = ctx.clone();
      async move {
        let declared: DeclaredMeta =
          lua.from_value_with(mlua::Value::Table(table), deserialize_options())?;
        declare_meta_impl(&ctx, declared).await
      }
    })?
  };
  globals.set("declare_meta", declare_meta)?;

  let declare_dependency = {
    let ctx = ctx.clone();
    lua.create_async_function(move |lua, id: String| {
      let ctx = ctx.clone();
      async move { declare_dependency_impl(&lua, &ctx, id).await }
    })?
  };
  globals.set("declare_dependency", declare_dependency)?;

  let declare_flow = {
    let ctx = ctx.clone();
    lua.create_async_function(move |_, callback: mlua::Function| {
      let ctx = ctx.clone();
      async move { declare_flow_impl(&ctx, callback).await }
    })?
  };
  globals.set("declare_flow", declare_flow)?;

  Ok(())
}

async fn declare_meta_impl(ctx: &ExecCtx, mut declared: DeclaredMeta) -> mlua::Result<()> {
  if ctx.declared_id().is_some() {
    return Err(mlua::Error::external(SandboxError::DuplicateMeta {
      message: "meta was already declared by this execution".to_string(),
    }));
  }

  let id = match declared.id.as_deref().map(str::trim) {
    Some(id) if !id.is_empty() => id.to_string(),
    _ => return Err(mlua::Error::external(SandboxError::EmptyId)),
  };
  declared.id = Some(id.clone());

  if let Some(schedule) = declared.schedule.clone() {
    for expr in schedule.into_vec() {
      if let Err(e) = freesia_cron::validate(&expr) {
        return Err(mlua::Error::external(SandboxError::InvalidSchedule {
          expr,
          message: e.to_string(),
        }));
      }
    }
  }

  let existing = ctx
    .inner
    .objects
    .find_object_by_id(&id)
    .await
    .map_err(store_error)?;
  if let Some(existing) = existing
    && existing.object_hash != ctx.object_hash
  {
    return Err(mlua::Error::external(SandboxError::DuplicateMeta {
      message: format!(
        "id '{}' is already declared by object '{}'",
        id, existing.object_hash
      ),
    }));
  }

  let upsert = declared.into_upsert(ctx.object_hash.clone());
  ctx
    .inner
    .objects
    .upsert_object(&upsert)
    .await
    .map_err(store_error)?;

  ctx.set_declared(id);
  Ok(())
}

async fn declare_dependency_impl(
  lua: &Lua,
  ctx: &ExecCtx,
  id: String,
) -> mlua::Result<mlua::Value> {
  if ctx.debug {
    return Ok(mlua::Value::Nil);
  }
  ctx.require_meta()?;

  if ctx.declared_id().as_deref() == Some(id.as_str()) {
    return Err(mlua::Error::external(SandboxError::CyclicDependency { id }));
  }

  let Some(dep) = ctx
    .inner
    .objects
    .find_object_by_id(&id)
    .await
    .map_err(store_error)?
  else {
    return Err(mlua::Error::external(SandboxError::DependencyNotDeclared {
      id,
    }));
  };

  if ctx.stack.contains(&dep.object_hash) {
    return Err(mlua::Error::external(SandboxError::CyclicDependency { id }));
  }

  debug!(
    object_hash = %ctx.object_hash,
    dep_id = %id,
    dep_hash = %dep.object_hash,
    "resolving dependency"
  );

  let nested = run_vm(ctx.inner.clone(), dep.object_hash.clone(), false, ctx.stack.clone()).await;

  // the edge records the attempt, whether or not the dependency succeeded
  if let Err(e) = ctx
    .inner
    .objects
    .append_dependency_edge(&ctx.object_hash, &id)
    .await
  {
    warn!(object_hash = %ctx.object_hash, dep_id = %id, error = %e, "failed to record dependency edge");
  }

  let result = lua.create_table()?;
  if let Some(value) = &nested.result {
    result.set("value", json_to_lua(lua, value)?)?;
  }
  if let Some(error) = &nested.error {
    let error = serde_json::to_value(error).map_err(mlua::Error::external)?;
    result.set("error", json_to_lua(lua, &error)?)?;
  }
  Ok(mlua::Value::Table(result))
}

async fn declare_flow_impl(ctx: &ExecCtx, callback: mlua::Function) -> mlua::Result<mlua::Value> {
  if ctx.debug {
    ctx.try_resolve(Value::Null);
    return Ok(mlua::Value::Nil);
  }
  ctx.require_meta()?;

  debug!(object_hash = %ctx.object_hash, "flow started");
  let value = callback.call_async::<mlua::Value>(()).await?;
  debug!(object_hash = %ctx.object_hash, "flow completed");
  Ok(value)
}

fn register_caching(lua: &Lua, ctx: &Arc<ExecCtx>) -> mlua::Result<()> {
  let globals = lua.globals();

  let lazy_once = {
    let ctx = ctx.clone();
    lua.create_async_function(move |lua, (key, producer): (String, mlua::Function)| {
      let ctx = ctx.clone();
      async move { lazy_once_impl(&lua, &ctx, key, producer).await }
    })?
  };
  globals.set("lazy_once", lazy_once)?;

  let memoize = {
    let ctx = ctx.clone();
    lua.create_async_function(
      move |lua, (key, producer, ttl): (String, mlua::Function, Option<f64>)| {
        let ctx = ctx.clone();
        async move { memoize_impl(&lua, &ctx, key, producer, ttl).await }
      },
    )?
  };
  globals.set("memoize", memoize)?;

  Ok(())
}

async fn lazy_once_impl(
  lua: &Lua,
  ctx: &ExecCtx,
  key: String,
  producer: mlua::Function,
) -> mlua::Result<mlua::Value> {
  if let Some(cached) = ctx.inner.memo.get_lazy(&key) {
    return json_to_lua(lua, &cached);
  }

  let produced = producer.call_async::<mlua::Value>(()).await?;
  let value = lua_to_json(lua, produced.clone())?;
  ctx.inner.memo.insert_lazy(&key, value);
  Ok(produced)
}

async fn memoize_impl(
  lua: &Lua,
  ctx: &ExecCtx,
  key: String,
  producer: mlua::Function,
  ttl_secs: Option<f64>,
) -> mlua::Result<mlua::Value> {
  if let Some(cached) = ctx.inner.memo.get_timed(&key) {
    return json_to_lua(lua, &cached);
  }

  let produced = producer.call_async::<mlua::Value>(()).await?;
  let value = lua_to_json(lua, produced.clone())?;
  let ttl = ttl_secs.map(|secs| Duration::from_secs_f64(secs.max(0.0)));
  ctx.inner.memo.insert_timed(&key, value, ttl);
  Ok(produced)
}

fn register_logging(lua: &Lua, ctx: &Arc<ExecCtx>) -> mlua::Result<()> {
  let globals = lua.globals();

  globals.set("print", log_fn(lua, ctx, LogLevel::Print)?)?;

  let log = lua.create_table()?;
  log.set("error", log_fn(lua, ctx, LogLevel::Error)?)?;
  log.set("warn", log_fn(lua, ctx, LogLevel::Warn)?)?;
  log.set("info", log_fn(lua, ctx, LogLevel::Info)?)?;
  log.set("debug", log_fn(lua, ctx, LogLevel::Debug)?)?;
  log.set("trace", log_fn(lua, ctx, LogLevel::Trace)?)?;
  globals.set("log", log)?;

  Ok(())
}

fn log_fn(lua: &Lua, ctx: &Arc<ExecCtx>, level: LogLevel) -> mlua::Result<mlua::Function> {
  let logs = ctx.logs.clone();
  lua.create_function(move |lua, args: Variadic<mlua::Value>| {
    logs.push(level, format_log_args(lua, args)?);
    Ok(())
  })
}

fn format_log_args(lua: &Lua, args: Variadic<mlua::Value>) -> mlua::Result<String> {
  let mut parts = Vec::with_capacity(args.len());
  for arg in args {
    match arg {
      mlua::Value::String(s) => parts.push(s.to_str()?.to_string()),
      other => {
        let json = lua_to_json(lua, other)?;
        parts.push(serde_json::to_string(&json).unwrap_or_else(|_| "null".to_string()));
      }
    }
  }
  Ok(parts.join(" "))
}

#[derive(Debug, Deserialize)]
struct RequestOpts {
  method: Option<String>,
  url: String,
  headers: Option<HashMap<String, String>>,
  body: Option<Value>,
}

fn register_http(lua: &Lua, ctx: &Arc<ExecCtx>) -> mlua::Result<()> {
  let globals = lua.globals();
  let client = TracedClient::new(ctx.net.clone());

  let http = lua.create_table()?;

  let request = {
    let client = client.clone();
    lua.create_async_function(move |lua, opts: mlua::Table| {
      let client = client.clone();
      async move {
        let opts: RequestOpts =
          lua.from_value_with(mlua::Value::Table(opts), deserialize_options())?;
        let output = client
          .request(
            opts.method.as_deref().unwrap_or("GET"),
            &opts.url,
            opts.headers,
            opts.body,
          )
          .await
          .map_err(mlua::Error::external)?;
        json_to_lua(&lua, &output)
      }
    })?
  };
  http.set("request", request)?;

  let get = {
    let client = client.clone();
    lua.create_async_function(move |lua, url: String| {
      let client = client.clone();
      async move {
        let output = client
          .request("GET", &url, None, None)
          .await
          .map_err(mlua::Error::external)?;
        json_to_lua(&lua, &output)
      }
    })?
  };
  http.set("get", get)?;

  let post = {
    let client = client.clone();
    lua.create_async_function(move |lua, (url, body): (String, Option<mlua::Value>)| {
      let client = client.clone();
      async move {
        let body = match body {
          Some(value) if !value.is_nil() => Some(lua_to_json(&lua, value)?),
          _ => None,
        };
        let output = client
          .request("POST", &url, None, body)
          .await
          .map_err(mlua::Error::external)?;
        json_to_lua(&lua, &output)
      }
    })?
  };
  http.set("post", post)?;

  globals.set("http", http)?;
  Ok(())
}

fn register_control(lua: &Lua, ctx: &Arc<ExecCtx>) -> mlua::Result<()> {
  let globals = lua.globals();

  let sleep = lua.create_async_function(|_, ms: f64| async move {
    tokio::time::sleep(Duration::from_millis(ms.max(0.0) as u64)).await;
    Ok(())
  })?;
  globals.set("sleep", sleep)?;

  let resolve = {
    let ctx = ctx.clone();
    lua.create_function(move |lua, value: Option<mlua::Value>| {
      let value = match value {
        Some(value) => lua_to_json(lua, value)?,
        None => Value::Null,
      };
      ctx.try_resolve(value);
      Ok(())
    })?
  };
  globals.set("resolve", resolve)?;

  // timers need an event loop that outlives the call; there is none here
  for name in ["set_timeout", "set_interval", "clear_timeout", "clear_interval"] {
    let stub = lua.create_function(move |_, _: Variadic<mlua::Value>| -> mlua::Result<()> {
      Err(mlua::Error::RuntimeError(format!(
        "{name} is not available in this runtime; use sleep(ms) instead"
      )))
    })?;
    globals.set(name, stub)?;
  }

  Ok(())
}

fn store_error(source: freesia_store::Error) -> mlua::Error {
  mlua::Error::external(SandboxError::Store { source })
}

fn deserialize_options() -> DeserializeOptions {
  DeserializeOptions::new()
    .deny_unsupported_types(false)
    .deny_recursive_tables(false)
}

fn serialize_options() -> SerializeOptions {
  SerializeOptions::new()
    .serialize_none_to_null(false)
    .serialize_unit_to_null(false)
}

/// Convert a Lua value into JSON. Unsupported values such as functions
/// become null instead of failing the conversion.
pub(crate) fn lua_to_json(lua: &Lua, value: mlua::Value) -> mlua::Result<Value> {
  if value.is_nil() {
    return Ok(Value::Null);
  }
  lua.from_value_with(value, deserialize_options())
}

/// Convert a JSON value into a Lua value, with JSON null mapping to nil.
pub(crate) fn json_to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
  lua.to_value_with(value, serialize_options())
}
