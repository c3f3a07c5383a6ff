//! Cron scheduling for declared script objects.
//!
//! - re-reads declared schedules from the store on a fixed cadence
//! - derives upcoming fire times and fires them through the engine
//! - marks fired times consumed so a slot can only run once
//! - reports idle status based on the last external nudge

mod gate;
mod scheduler;

pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStatus};
