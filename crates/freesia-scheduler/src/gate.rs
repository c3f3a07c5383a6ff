use std::time::{Duration, Instant};

/// Admits an action at most once per interval.
///
/// The first call is always admitted; after that a call is admitted only
/// when at least the interval has passed since the last admitted one.
#[derive(Debug)]
pub(crate) struct MinInterval {
  interval: Duration,
  last: Option<Instant>,
}

impl MinInterval {
  pub fn new(interval: Duration) -> Self {
    Self {
      interval,
      last: None,
    }
  }

  pub fn ready(&mut self, now: Instant) -> bool {
    match self.last {
      Some(last) if now.duration_since(last) < self.interval => false,
      _ => {
        self.last = Some(now);
        true
      }
    }
  }
}
