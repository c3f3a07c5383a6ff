use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use freesia_host_http::NetDirection;
use freesia_host_log::LogLevel;
use freesia_object::ErrorKind;
use freesia_sandbox::{EngineConfig, SandboxEngine};
use freesia_source::{MemorySourceStore, SourceStore};
use freesia_store::{CallStore, MemoryStore, ObjectStore};

struct Harness {
  engine: SandboxEngine,
  store: MemoryStore,
  sources: MemorySourceStore,
}

fn harness() -> Harness {
  harness_with_timeout(Duration::from_secs(10))
}

fn harness_with_timeout(timeout: Duration) -> Harness {
  let store = MemoryStore::new();
  let sources = MemorySourceStore::new();
  let engine = SandboxEngine::new(
    Arc::new(store.clone()),
    Arc::new(store.clone()),
    Arc::new(sources.clone()),
    EngineConfig { timeout },
  );
  Harness {
    engine,
    store,
    sources,
  }
}

async fn add_script(harness: &Harness, source: &str) -> String {
  harness.sources.write(source).await.unwrap()
}

fn error_kind(record: &freesia_object::CallRecord) -> ErrorKind {
  record.vme.error.as_ref().expect("expected an error").kind
}

#[tokio::test]
async fn test_returned_value_becomes_result() {
  let h = harness();
  let hash = add_script(&h, "return 42").await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(record.vme.result, Some(json!(42)));
  assert!(record.vme.error.is_none());
  assert_eq!(record.vme.result_types, Some(json!("Int")));
  assert!(!record.is_scheduled);
  assert!(record.vme.performance.millis >= 0.0);
}

#[tokio::test]
async fn test_execution_is_recorded() {
  let h = harness();
  let hash = add_script(&h, "return 1").await;

  let record = h.engine.execute(&hash, false).await;

  let stored = h.store.find_call(&record.call_id).await.unwrap().unwrap();
  assert_eq!(stored.object_hash, hash);
  assert_eq!(stored.vme.result, Some(json!(1)));
  assert_eq!(h.store.list_calls(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_resolve_wins_over_return() {
  let h = harness();
  let hash = add_script(&h, "resolve(1)\nreturn 2").await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(record.vme.result, Some(json!(1)));
  assert!(record.vme.error.is_none());
}

#[tokio::test]
async fn test_first_resolve_wins() {
  let h = harness();
  let hash = add_script(&h, "resolve(1)\nresolve(2)").await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(record.vme.result, Some(json!(1)));
}

#[tokio::test]
async fn test_resolve_table() {
  let h = harness();
  let hash = add_script(&h, r#"resolve({ count = 3, tags = { "a", "b" } })"#).await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(record.vme.result, Some(json!({ "count": 3, "tags": ["a", "b"] })));
  assert_eq!(
    record.vme.result_types,
    Some(json!({ "count": "Int", "tags": "Array<String>" }))
  );
}

#[tokio::test]
async fn test_script_without_result() {
  let h = harness();
  let hash = add_script(&h, "local x = 1 + 1").await;

  let record = h.engine.execute(&hash, false).await;

  assert!(record.vme.result.is_none());
  assert!(record.vme.error.is_none());
  assert!(record.vme.result_types.is_none());
}

#[tokio::test]
async fn test_syntax_error_is_compile_kind() {
  let h = harness();
  let hash = add_script(&h, "return return").await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(error_kind(&record), ErrorKind::Compile);
  assert!(record.vme.result.is_none());
}

#[tokio::test]
async fn test_raised_error_is_script_kind() {
  let h = harness();
  let hash = add_script(&h, r#"error("kaput")"#).await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(error_kind(&record), ErrorKind::Script);
  assert!(record.vme.error.unwrap().message.contains("kaput"));
}

#[tokio::test]
async fn test_missing_source() {
  let h = harness();

  let record = h.engine.execute("deadbeef", false).await;

  assert_eq!(error_kind(&record), ErrorKind::Script);
  assert!(record.vme.error.unwrap().message.contains("no source"));
}

#[tokio::test]
async fn test_declare_meta_persists_object() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"
declare_meta({
  id = "report",
  name = "Daily report",
  group = "analytics",
  description = "Builds the daily report",
  schedule = "0 30 9 * * *",
})
resolve(true)
"#,
  )
  .await;

  let record = h.engine.execute(&hash, false).await;
  assert!(record.vme.error.is_none());

  let meta = h.store.find_object_by_hash(&hash).await.unwrap().unwrap();
  assert_eq!(meta.id.as_deref(), Some("report"));
  assert_eq!(meta.name.as_deref(), Some("Daily report"));
  assert_eq!(meta.group.as_deref(), Some("analytics"));
  assert_eq!(meta.schedule, vec!["0 30 9 * * *".to_string()]);
  assert!(meta.deps.is_empty());

  let by_id = h.store.find_object_by_id("report").await.unwrap().unwrap();
  assert_eq!(by_id.object_hash, hash);

  // the same object may redeclare its own id
  let again = h.engine.execute(&hash, false).await;
  assert!(again.vme.error.is_none());
}

#[tokio::test]
async fn test_declare_meta_keeps_five_field_schedules_as_declared() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"declare_meta({ id = "five", schedule = "*/5 * * * *" })
resolve(1)"#,
  )
  .await;

  let record = h.engine.execute(&hash, false).await;
  assert!(record.vme.error.is_none());

  let meta = h.store.find_object_by_id("five").await.unwrap().unwrap();
  assert_eq!(meta.schedule, vec!["*/5 * * * *".to_string()]);
}

#[tokio::test]
async fn test_declare_meta_twice_fails() {
  let h = harness();
  let hash = add_script(&h, r#"declare_meta({ id = "a" })
declare_meta({ id = "a" })"#)
    .await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(error_kind(&record), ErrorKind::DuplicateMeta);
}

#[tokio::test]
async fn test_declare_meta_requires_id() {
  let h = harness();

  let missing = add_script(&h, r#"declare_meta({ name = "missing id" })"#).await;
  let record = h.engine.execute(&missing, false).await;
  assert_eq!(error_kind(&record), ErrorKind::EmptyId);

  let blank = add_script(&h, r#"declare_meta({ id = "   " })"#).await;
  let record = h.engine.execute(&blank, false).await;
  assert_eq!(error_kind(&record), ErrorKind::EmptyId);
}

#[tokio::test]
async fn test_declare_meta_rejects_bad_schedule() {
  let h = harness();
  let hash = add_script(&h, r#"declare_meta({ id = "sched", schedule = "not a cron" })"#).await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(error_kind(&record), ErrorKind::InvalidSchedule);
  // nothing was persisted for the failed declaration
  assert!(h.store.find_object_by_id("sched").await.unwrap().is_none());
}

#[tokio::test]
async fn test_declared_id_is_exclusive_across_objects() {
  let h = harness();
  let first = add_script(&h, r#"declare_meta({ id = "shared" })
resolve(1)"#).await;
  let second = add_script(&h, r#"declare_meta({ id = "shared" })
resolve(2)"#).await;
  assert_ne!(first, second);

  let ok = h.engine.execute(&first, false).await;
  assert!(ok.vme.error.is_none());

  let conflict = h.engine.execute(&second, false).await;
  assert_eq!(error_kind(&conflict), ErrorKind::DuplicateMeta);

  let meta = h.store.find_object_by_id("shared").await.unwrap().unwrap();
  assert_eq!(meta.object_hash, first);
}

#[tokio::test]
async fn test_dependency_requires_meta() {
  let h = harness();
  let hash = add_script(&h, r#"declare_dependency("anything")"#).await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(error_kind(&record), ErrorKind::MetaRequired);
}

#[tokio::test]
async fn test_dependency_value_flows_into_consumer() {
  let h = harness();
  let producer = add_script(&h, r#"declare_meta({ id = "source-data" })
resolve(5)"#).await;
  let consumer = add_script(
    &h,
    r#"declare_meta({ id = "combiner" })
local dep = declare_dependency("source-data")
resolve(dep.value + 1)"#,
  )
  .await;

  let record = h.engine.execute(&producer, false).await;
  assert_eq!(record.vme.result, Some(json!(5)));

  let record = h.engine.execute(&consumer, false).await;
  assert_eq!(record.vme.result, Some(json!(6)));

  let meta = h.store.find_object_by_hash(&consumer).await.unwrap().unwrap();
  assert_eq!(meta.deps, vec!["source-data".to_string()]);

  // nested runs leave no record of their own
  assert_eq!(h.store.list_calls(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_dependency_error_is_handed_back_as_data() {
  let h = harness();
  let failing = add_script(&h, r#"declare_meta({ id = "boom" })
error("exploded")"#).await;
  let observer = add_script(
    &h,
    r#"declare_meta({ id = "observer" })
local dep = declare_dependency("boom")
resolve({ kind = dep.error.kind, got_value = dep.value ~= nil })"#,
  )
  .await;

  let record = h.engine.execute(&failing, false).await;
  assert_eq!(error_kind(&record), ErrorKind::Script);

  let record = h.engine.execute(&observer, false).await;
  assert!(record.vme.error.is_none());
  assert_eq!(
    record.vme.result,
    Some(json!({ "kind": "script", "got_value": false }))
  );

  // the edge is recorded even though the dependency failed
  let meta = h.store.find_object_by_hash(&observer).await.unwrap().unwrap();
  assert_eq!(meta.deps, vec!["boom".to_string()]);
}

#[tokio::test]
async fn test_dependency_on_undeclared_id() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"declare_meta({ id = "lonely" })
declare_dependency("ghost")"#,
  )
  .await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(error_kind(&record), ErrorKind::DependencyNotDeclared);
  assert!(record.vme.error.unwrap().message.contains("ghost"));
}

#[tokio::test]
async fn test_dependency_on_own_id_is_cyclic() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"declare_meta({ id = "selfy" })
declare_dependency("selfy")"#,
  )
  .await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(error_kind(&record), ErrorKind::CyclicDependency);
}

#[tokio::test]
async fn test_transitive_cycle_is_cut_inside_the_nested_run() {
  let h = harness();
  let a = add_script(
    &h,
    r#"declare_meta({ id = "cycle-a" })
local dep = declare_dependency("cycle-b")
resolve({ err = dep.error and dep.error.kind or "none" })"#,
  )
  .await;
  let b = add_script(
    &h,
    r#"declare_meta({ id = "cycle-b" })
local dep = declare_dependency("cycle-a")
resolve({ err = dep.error and dep.error.kind or "none" })"#,
  )
  .await;

  // cycle-b is not declared yet, so the first run aborts early
  let record = h.engine.execute(&a, false).await;
  assert_eq!(error_kind(&record), ErrorKind::DependencyNotDeclared);

  // now both ids exist; the nested run of a sees b on the stack and stops
  let record = h.engine.execute(&b, false).await;
  assert!(record.vme.error.is_none());
  assert_eq!(record.vme.result, Some(json!({ "err": "cyclic_dependency" })));
}

#[tokio::test]
async fn test_timeout_keeps_partial_output() {
  let h = harness_with_timeout(Duration::from_millis(100));
  let hash = add_script(&h, r#"print("starting")
sleep(60000)"#).await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(error_kind(&record), ErrorKind::Timeout);
  assert!(record.vme.performance.millis >= 99.0);
  assert_eq!(record.vme.stdout.len(), 1);
  assert_eq!(record.vme.stdout[0].text, "starting");
}

#[tokio::test]
async fn test_log_levels_are_captured_in_order() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"
print("plain", 42)
log.error("bad")
log.warn("careful")
log.info("fyi")
log.debug("detail")
log.trace("deep")
resolve(true)
"#,
  )
  .await;

  let record = h.engine.execute(&hash, false).await;
  assert!(record.vme.error.is_none());

  let stdout = &record.vme.stdout;
  assert_eq!(stdout.len(), 6);
  assert_eq!(stdout[0].text, "plain 42");
  assert_eq!(stdout[0].level, LogLevel::Print);
  let codes: Vec<u8> = stdout.iter().map(|entry| entry.level.code()).collect();
  assert_eq!(codes, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_lazy_once_is_shared_across_objects() {
  let h = harness();
  let first = add_script(&h, r#"resolve(lazy_once("seed", function() return 11 end))"#).await;
  let second = add_script(&h, r#"resolve(lazy_once("seed", function() return 99 end))"#).await;

  let record = h.engine.execute(&first, false).await;
  assert_eq!(record.vme.result, Some(json!(11)));

  let record = h.engine.execute(&second, false).await;
  assert_eq!(record.vme.result, Some(json!(11)));
}

#[tokio::test]
async fn test_memoize_skips_recomputation_within_ttl() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"
local v = memoize("mkey", function()
  print("computed")
  return 5
end)
resolve(v)
"#,
  )
  .await;

  let record = h.engine.execute(&hash, false).await;
  assert_eq!(record.vme.result, Some(json!(5)));
  assert_eq!(record.vme.stdout.len(), 1);

  let record = h.engine.execute(&hash, false).await;
  assert_eq!(record.vme.result, Some(json!(5)));
  assert!(record.vme.stdout.is_empty());
}

#[tokio::test]
async fn test_debug_run_skips_dependencies_and_records() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"declare_meta({ id = "dbg" })
local dep = declare_dependency("whatever")
resolve({ dep_is_nil = dep == nil, debug = is_debug })"#,
  )
  .await;

  let record = h.engine.execute(&hash, true).await;

  assert!(record.vme.error.is_none());
  assert_eq!(
    record.vme.result,
    Some(json!({ "dep_is_nil": true, "debug": true }))
  );

  // declarations are still validated and persisted in debug
  let meta = h.store.find_object_by_id("dbg").await.unwrap().unwrap();
  assert_eq!(meta.object_hash, hash);
  assert!(meta.result_types.is_none());

  // but the run itself leaves no trace
  assert!(h.store.list_calls(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_result_types_are_persisted_on_success() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"declare_meta({ id = "typed" })
resolve({ count = 3, name = "x" })"#,
  )
  .await;

  let record = h.engine.execute(&hash, false).await;
  assert_eq!(
    record.vme.result_types,
    Some(json!({ "count": "Int", "name": "String" }))
  );

  // persistence is fire-and-forget; give the task a moment
  tokio::time::sleep(Duration::from_millis(100)).await;
  let meta = h.store.find_object_by_id("typed").await.unwrap().unwrap();
  assert_eq!(
    meta.result_types,
    Some(json!({ "count": "Int", "name": "String" }))
  );
}

#[tokio::test]
async fn test_flow_runs_its_callback() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"declare_meta({ id = "flowing" })
declare_flow(function()
  resolve(7)
end)"#,
  )
  .await;

  let record = h.engine.execute(&hash, false).await;

  assert!(record.vme.error.is_none());
  assert_eq!(record.vme.result, Some(json!(7)));
}

#[tokio::test]
async fn test_flow_resolves_to_nothing_in_debug() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"declare_meta({ id = "flow-dbg" })
declare_flow(function()
  resolve(7)
end)"#,
  )
  .await;

  let record = h.engine.execute(&hash, true).await;

  assert!(record.vme.error.is_none());
  assert_eq!(record.vme.result, Some(Value::Null));
}

#[tokio::test]
async fn test_timer_capabilities_always_fail() {
  let h = harness();

  let caught = add_script(
    &h,
    r#"
local ok = pcall(function()
  set_timeout(function() end, 100)
end)
resolve(ok)
"#,
  )
  .await;
  let record = h.engine.execute(&caught, false).await;
  assert_eq!(record.vme.result, Some(json!(false)));

  let uncaught = add_script(&h, r#"set_interval(function() end, 5)"#).await;
  let record = h.engine.execute(&uncaught, false).await;
  assert_eq!(error_kind(&record), ErrorKind::Script);
  assert!(
    record
      .vme
      .error
      .unwrap()
      .message
      .contains("set_interval is not available")
  );
}

#[tokio::test]
async fn test_failed_http_request_is_traced() {
  let h = harness();
  let hash = add_script(
    &h,
    r#"
local ok = pcall(function()
  http.get("http://127.0.0.1:1/unreachable")
end)
resolve({ failed = not ok })
"#,
  )
  .await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(record.vme.result, Some(json!({ "failed": true })));
  assert_eq!(record.vme.net_trace.len(), 1);
  assert_eq!(record.vme.net_trace[0].direction, NetDirection::Request);
  assert!(record.vme.net_trace[0].request.url.contains("127.0.0.1:1"));
}

#[tokio::test]
async fn test_current_object_global() {
  let h = harness();
  let hash = add_script(&h, "resolve(current_object)").await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(record.vme.result, Some(json!(hash)));
}

#[tokio::test]
async fn test_sleep_yields_and_resumes() {
  let h = harness();
  let hash = add_script(&h, r#"sleep(20)
resolve("rested")"#).await;

  let record = h.engine.execute(&hash, false).await;

  assert_eq!(record.vme.result, Some(json!("rested")));
  assert!(record.vme.performance.millis >= 20.0);
}
