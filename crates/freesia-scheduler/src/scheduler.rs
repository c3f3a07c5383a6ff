//! The scheduling loop.
//!
//! The scheduler keeps two tables: the declared cron expressions per object
//! hash, refreshed from the store, and the computed upcoming fire times per
//! hash, re-derived on every pass. A fire time counts as due while it lies
//! within the fire window around now; a per-object high-water mark of
//! consumed times keeps a due time from firing more than once while it
//! stays inside the window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use freesia_sandbox::SandboxEngine;
use freesia_store::ObjectStore;

use crate::gate::MinInterval;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// How often fire times are collected and re-derived.
  pub retime_interval: Duration,
  /// How often declared schedules are re-read from the store.
  pub refresh_interval: Duration,
  /// Half-width of the window around now within which a fire time is due.
  pub fire_window: Duration,
  /// How long without an external nudge counts as idle.
  pub idle_threshold: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      retime_interval: Duration::from_secs(1),
      refresh_interval: Duration::from_secs(10),
      fire_window: Duration::from_secs(10),
      idle_threshold: Duration::from_secs(10),
    }
  }
}

#[derive(Debug, Default)]
struct SchedulerTables {
  /// Declared cron expressions per object hash.
  schedule_map: HashMap<String, Vec<String>>,
  /// Upcoming fire times per object hash, replaced on every retime.
  future_calls: HashMap<String, Vec<DateTime<Utc>>>,
  /// Latest consumed fire time per object hash.
  consumed: HashMap<String, DateTime<Utc>>,
}

struct SchedulerInner {
  tables: SchedulerTables,
  retime_gate: MinInterval,
  refresh_gate: MinInterval,
  last_external_call: Option<DateTime<Utc>>,
}

/// A point-in-time snapshot of the scheduler for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
  pub now: DateTime<Utc>,
  pub last_external_call: Option<DateTime<Utc>>,
  pub idle_seconds: i64,
  pub is_idle: bool,
  pub schedule_map: HashMap<String, Vec<String>>,
  pub future_call_map: HashMap<String, Vec<DateTime<Utc>>>,
}

/// Fires declared schedules through the execution engine.
pub struct Scheduler {
  objects: Arc<dyn ObjectStore>,
  engine: SandboxEngine,
  config: SchedulerConfig,
  inner: Mutex<SchedulerInner>,
  started_at: DateTime<Utc>,
}

impl Scheduler {
  pub fn new(
    objects: Arc<dyn ObjectStore>,
    engine: SandboxEngine,
    config: SchedulerConfig,
  ) -> Self {
    Self {
      objects,
      engine,
      inner: Mutex::new(SchedulerInner {
        tables: SchedulerTables::default(),
        retime_gate: MinInterval::new(config.retime_interval),
        refresh_gate: MinInterval::new(config.refresh_interval),
        last_external_call: None,
      }),
      config,
      started_at: Utc::now(),
    }
  }

  /// One scheduler pass.
  ///
  /// Gated internally, so callers may invoke this as often as they like:
  /// the retime work runs at most once per `retime_interval` and the store
  /// refresh at most once per `refresh_interval`.
  pub async fn pass(&self) {
    let now = Utc::now();
    let instant = Instant::now();

    let refresh = {
      let mut inner = self.inner.lock().unwrap();
      inner.refresh_gate.ready(instant)
    };
    if refresh {
      self.refresh_schedules().await;
    }

    let due = {
      let mut inner = self.inner.lock().unwrap();
      if !inner.retime_gate.ready(instant) {
        return;
      }
      let due = collect_due(&mut inner.tables, now, self.config.fire_window);
      retime_futures(&mut inner.tables, now);
      due
    };

    for object_hash in due {
      let engine = self.engine.clone();
      tokio::spawn(async move {
        align_to_next_second().await;
        let record = engine.execute_scheduled(&object_hash).await;
        match &record.vme.error {
          None => {
            info!(object_hash = %object_hash, call_id = %record.call_id, "scheduled run completed");
          }
          Some(error) => {
            error!(object_hash = %object_hash, call_id = %record.call_id, %error, "scheduled run failed");
          }
        }
      });
    }
  }

  /// Note an external nudge and run a pass immediately.
  #[instrument(name = "scheduler_tick", skip(self))]
  pub async fn tick(&self) {
    {
      let mut inner = self.inner.lock().unwrap();
      inner.last_external_call = Some(Utc::now());
    }
    self.pass().await;
  }

  pub fn status(&self) -> SchedulerStatus {
    let now = Utc::now();
    let inner = self.inner.lock().unwrap();
    let last_seen = inner.last_external_call.unwrap_or(self.started_at);
    let idle_seconds = (now - last_seen).num_seconds();

    SchedulerStatus {
      now,
      last_external_call: inner.last_external_call,
      idle_seconds,
      is_idle: idle_seconds > self.config.idle_threshold.as_secs() as i64,
      schedule_map: inner.tables.schedule_map.clone(),
      future_call_map: inner.tables.future_calls.clone(),
    }
  }

  /// Drive passes until the token is cancelled.
  pub async fn run(&self, cancel: CancellationToken) {
    info!(
      retime_ms = self.config.retime_interval.as_millis() as u64,
      refresh_ms = self.config.refresh_interval.as_millis() as u64,
      "scheduler started"
    );

    let mut interval = tokio::time::interval(self.config.retime_interval);
    let mut status_interval = tokio::time::interval(Duration::from_secs(30));
    // the first tick of an interval resolves immediately
    status_interval.tick().await;

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("scheduler cancelled");
          break;
        }
        _ = interval.tick() => {
          self.pass().await;
        }
        _ = status_interval.tick() => {
          let status = self.status();
          info!(
            tracked = status.schedule_map.len(),
            upcoming = status.future_call_map.values().map(Vec::len).sum::<usize>(),
            idle_seconds = status.idle_seconds,
            is_idle = status.is_idle,
            "scheduler status"
          );
        }
      }
    }
  }

  async fn refresh_schedules(&self) {
    let objects = match self.objects.list_objects().await {
      Ok(objects) => objects,
      Err(e) => {
        error!(error = %e, "failed to refresh schedules; keeping previous tables");
        return;
      }
    };

    let mut entries = Vec::new();
    for object in objects {
      let has_id = object.id.as_deref().is_some_and(|id| !id.is_empty());
      if has_id && !object.schedule.is_empty() {
        entries.push((object.object_hash, object.schedule));
      }
    }

    let mut inner = self.inner.lock().unwrap();
    let scheduled = entries.len();
    for (object_hash, schedule) in entries {
      inner.tables.schedule_map.insert(object_hash, schedule);
    }
    // objects deleted from the store keep their entry until restart

    info!(
      scheduled,
      tracked = inner.tables.schedule_map.len(),
      idle = inner.last_external_call.is_none(),
      "schedule refresh completed"
    );
  }
}

/// Collect the object hashes with a fire time inside the window and mark
/// those times consumed. At most one time fires per object per pass.
fn collect_due(tables: &mut SchedulerTables, now: DateTime<Utc>, window: Duration) -> Vec<String> {
  let window =
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(10));
  let mut due = Vec::new();

  for (object_hash, times) in tables.future_calls.iter_mut() {
    let high_water = tables.consumed.get(object_hash).copied();
    let mut fired: Option<DateTime<Utc>> = None;

    times.retain(|time| {
      if fired.is_some() {
        return true;
      }
      let distance = (*time - now).abs();
      let already_consumed = high_water.is_some_and(|mark| *time <= mark);
      if distance <= window && !already_consumed {
        fired = Some(*time);
        false
      } else {
        true
      }
    });

    if let Some(time) = fired {
      due.push(object_hash.clone());
      tables
        .consumed
        .entry(object_hash.clone())
        .and_modify(|mark| {
          if time > *mark {
            *mark = time;
          }
        })
        .or_insert(time);
    }
  }

  due
}

/// Replace the future fire times from the schedule map. Expressions that no
/// longer parse are skipped rather than failing the pass.
fn retime_futures(tables: &mut SchedulerTables, now: DateTime<Utc>) {
  let mut future_calls = HashMap::new();

  for (object_hash, exprs) in &tables.schedule_map {
    let mut times = Vec::new();
    for expr in exprs {
      match freesia_cron::next_fire(expr, now) {
        Ok(Some(time)) => times.push(time),
        Ok(None) => {}
        Err(e) => {
          debug!(object_hash = %object_hash, error = %e, "skipping unparseable schedule");
        }
      }
    }
    if !times.is_empty() {
      times.sort();
      future_calls.insert(object_hash.clone(), times);
    }
  }

  tables.future_calls = future_calls;
}

/// Wait out the fractional second so scheduled runs land on whole-second
/// boundaries regardless of where in the second the pass happened.
async fn align_to_next_second() {
  let millis = 1000u64.saturating_sub(Utc::now().timestamp_subsec_millis() as u64);
  if millis < 1000 {
    tokio::time::sleep(Duration::from_millis(millis)).await;
  }
}
