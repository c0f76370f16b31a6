//! drivemesh sched - cron parsing and the scheduled-task ticker
//!
//! [`cron::CronExpr`] implements the 5-field grammar (aliases, `?`, lists,
//! ranges, steps, clamping) and next-occurrence computation with a one-year
//! horizon. [`ticker::Scheduler`] is the single logical tick loop that scans
//! for due tasks and hands them to a [`ticker::TaskDispatcher`].

pub mod cron;
pub mod ticker;

pub use cron::CronExpr;
pub use ticker::{Scheduler, TaskDispatcher};
