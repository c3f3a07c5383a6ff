//! The execution engine.
//!
//! An engine owns the stores and the process-wide memo cache and runs one
//! fresh Lua state per execution. Every run produces an envelope with the
//! result or a typed error plus the captured log and network buffers, and
//! non-debug runs are persisted as immutable call records.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use freesia_host_http::NetTrace;
use freesia_host_log::LogBuffer;
use freesia_memo::MemoCache;
use freesia_object::{CallError, CallRecord, ErrorKind, Performance, Vme};
use freesia_source::SourceStore;
use freesia_store::{CallStore, ObjectStore};

use crate::context::{ExecCtx, build_lua, lua_to_json};
use crate::error::SandboxError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Wall-clock budget for a single execution, nested dependencies included.
  pub timeout: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_TIMEOUT,
    }
  }
}

/// Runs script objects in isolated Lua states.
#[derive(Clone)]
pub struct SandboxEngine {
  inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
  pub objects: Arc<dyn ObjectStore>,
  pub calls: Arc<dyn CallStore>,
  pub sources: Arc<dyn SourceStore>,
  pub memo: MemoCache,
  pub config: EngineConfig,
}

impl SandboxEngine {
  pub fn new(
    objects: Arc<dyn ObjectStore>,
    calls: Arc<dyn CallStore>,
    sources: Arc<dyn SourceStore>,
    config: EngineConfig,
  ) -> Self {
    Self {
      inner: Arc::new(EngineInner {
        objects,
        calls,
        sources,
        memo: MemoCache::new(),
        config,
      }),
    }
  }

  /// Execute an object by hash. Debug runs still validate and upsert
  /// declarations but skip dependencies and leave no call record.
  // `is_debug` is recorded manually: a parameter literally named `debug`
  // breaks `#[instrument]` (tokio-rs/tracing#2332).
  #[instrument(name = "execute_object", skip(self, is_debug), fields(object_hash = %object_hash, debug = is_debug))]
  pub async fn execute(&self, object_hash: &str, is_debug: bool) -> CallRecord {
    self.run_and_record(object_hash, is_debug, false).await
  }

  /// Execute an object on behalf of the scheduler.
  #[instrument(name = "execute_scheduled", skip(self), fields(object_hash = %object_hash))]
  pub async fn execute_scheduled(&self, object_hash: &str) -> CallRecord {
    self.run_and_record(object_hash, false, true).await
  }

  async fn run_and_record(&self, object_hash: &str, debug: bool, is_scheduled: bool) -> CallRecord {
    let vme = run_vm(
      self.inner.clone(),
      object_hash.to_string(),
      debug,
      CallStack::root(),
    )
    .await;

    match &vme.error {
      None => info!(millis = vme.performance.millis, "execution completed"),
      Some(error) => error!(%error, millis = vme.performance.millis, "execution failed"),
    }

    let record = CallRecord::new(object_hash, is_scheduled, vme);
    if !debug
      && let Err(e) = self.inner.calls.insert_call(&record).await
    {
      warn!(error = %e, "failed to persist call record");
    }
    record
  }
}

/// The chain of object hashes from the outermost call down to the current
/// one. Shared immutably so sibling dependencies do not see each other.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallStack(Arc<Vec<String>>);

impl CallStack {
  pub fn root() -> Self {
    Self::default()
  }

  pub fn push(&self, object_hash: &str) -> Self {
    let mut hashes = self.0.as_ref().clone();
    hashes.push(object_hash.to_string());
    Self(Arc::new(hashes))
  }

  pub fn contains(&self, object_hash: &str) -> bool {
    self.0.iter().any(|hash| hash == object_hash)
  }
}

enum ChunkOutcome {
  /// The script settled its result through `resolve`.
  Resolved(Value),
  /// The chunk ran to completion or raised.
  Finished(Result<mlua::Value, mlua::Error>),
}

/// Run one object in a fresh Lua state and build its envelope.
///
/// Boxed because dependency resolution recurses through here.
pub(crate) fn run_vm(
  inner: Arc<EngineInner>,
  object_hash: String,
  debug: bool,
  parent: CallStack,
) -> BoxFuture<'static, Vme> {
  async move {
    let started = Instant::now();
    let logs = LogBuffer::new();
    let net = NetTrace::new();

    let source = match inner.sources.read_by_hash(&object_hash).await {
      Ok(Some(source)) => source,
      Ok(None) => {
        return failure_vme(
          CallError::new(
            ErrorKind::Script,
            format!("no source stored for object '{object_hash}'"),
          ),
          started,
          &logs,
          &net,
        );
      }
      Err(e) => {
        return failure_vme(
          CallError::new(ErrorKind::Script, format!("failed to read source: {e}")),
          started,
          &logs,
          &net,
        );
      }
    };

    let ctx = Arc::new(ExecCtx::new(
      inner.clone(),
      object_hash.clone(),
      debug,
      parent.push(&object_hash),
      logs.clone(),
      net.clone(),
    ));

    let (tx, mut rx) = oneshot::channel();
    ctx.set_resolver(tx);

    let lua = match build_lua(&ctx) {
      Ok(lua) => lua,
      Err(e) => {
        return failure_vme(
          CallError::new(ErrorKind::Script, format!("failed to build sandbox: {e}")),
          started,
          &logs,
          &net,
        );
      }
    };

    let chunk = match lua.load(&source).set_name(chunk_name(&object_hash)).into_function() {
      Ok(chunk) => chunk,
      Err(e) => {
        return failure_vme(
          CallError::new(ErrorKind::Compile, e.to_string()),
          started,
          &logs,
          &net,
        );
      }
    };

    let mut call_fut = Box::pin(chunk.call_async::<mlua::Value>(()));

    let raced = tokio::time::timeout(inner.config.timeout, async {
      tokio::select! {
        resolved = &mut rx => ChunkOutcome::Resolved(resolved.unwrap_or(Value::Null)),
        finished = &mut call_fut => ChunkOutcome::Finished(finished),
      }
    })
    .await;

    // a resolve that raced the chunk's own completion still wins
    let outcome = match raced {
      Ok(ChunkOutcome::Finished(finished)) => match rx.try_recv() {
        Ok(resolved) => ChunkOutcome::Resolved(resolved),
        Err(_) => ChunkOutcome::Finished(finished),
      },
      Ok(resolved) => resolved,
      Err(_) => match rx.try_recv() {
        Ok(resolved) => ChunkOutcome::Resolved(resolved),
        Err(_) => {
          return failure_vme(
            CallError::new(
              ErrorKind::Timeout,
              format!(
                "execution exceeded {}ms",
                inner.config.timeout.as_millis()
              ),
            ),
            started,
            &logs,
            &net,
          );
        }
      },
    };

    let (result, error) = match outcome {
      ChunkOutcome::Resolved(value) => (Some(value), None),
      ChunkOutcome::Finished(Ok(value)) => {
        if value.is_nil() {
          (None, None)
        } else {
          match lua_to_json(&lua, value) {
            Ok(json) => (Some(json), None),
            Err(e) => (
              None,
              Some(CallError::new(
                ErrorKind::Script,
                format!("failed to serialize result: {e}"),
              )),
            ),
          }
        }
      }
      ChunkOutcome::Finished(Err(e)) => (None, Some(recover_error(&e))),
    };

    let result_types = result.as_ref().map(freesia_typemap::describe);
    if !debug
      && let Some(descriptor) = result_types.clone()
    {
      persist_result_types(inner.clone(), object_hash.clone(), descriptor);
    }

    Vme {
      result,
      error,
      result_types,
      performance: Performance {
        millis: elapsed_millis(started),
      },
      stdout: logs.drain(),
      net_trace: net.drain(),
    }
  }
  .boxed()
}

/// Best-effort write of the observed result shape. Objects that never
/// declared meta have no row to update, which is not an error.
fn persist_result_types(inner: Arc<EngineInner>, object_hash: String, descriptor: Value) {
  tokio::spawn(async move {
    match inner.objects.set_result_types(&object_hash, &descriptor).await {
      Ok(()) => {}
      Err(freesia_store::Error::NotFound(_)) => {
        debug!(object_hash = %object_hash, "no object row for result types");
      }
      Err(e) => {
        warn!(object_hash = %object_hash, error = %e, "failed to persist result types");
      }
    }
  });
}

/// Map a Lua-side error back to the typed error the capability raised,
/// or fall back to a plain script error.
fn recover_error(err: &mlua::Error) -> CallError {
  match err {
    mlua::Error::CallbackError { cause, .. } => recover_error(cause),
    mlua::Error::WithContext { cause, .. } => recover_error(cause),
    mlua::Error::ExternalError(external) => match external.downcast_ref::<SandboxError>() {
      Some(sandbox) => sandbox.to_call_error(),
      None => CallError::new(ErrorKind::Script, external.to_string()),
    },
    other => CallError::new(ErrorKind::Script, other.to_string()),
  }
}

fn failure_vme(error: CallError, started: Instant, logs: &LogBuffer, net: &NetTrace) -> Vme {
  Vme {
    result: None,
    error: Some(error),
    result_types: None,
    performance: Performance {
      millis: elapsed_millis(started),
    },
    stdout: logs.drain(),
    net_trace: net.drain(),
  }
}

fn elapsed_millis(started: Instant) -> f64 {
  started.elapsed().as_secs_f64() * 1000.0
}

fn chunk_name(object_hash: &str) -> String {
  let short = if object_hash.len() > 12 {
    &object_hash[..12]
  } else {
    object_hash
  };
  format!("@{short}")
}
