//! Policy evaluation for pending markers
//!
//! Pure functions over a project's policy, its last sync and the current
//! time. The tick loop in the engine feeds these into
//! [`Debouncer::drain_due`](crate::debounce::Debouncer::drain_due).

use chrono::{DateTime, Duration, Local, Timelike, Utc};
use std::time::Duration as StdDuration;

use crate::config::Config;
use crate::debounce::Decision;
use crate::project::{SyncMode, SyncPolicy, WatchedProject};

/// Scheduling constants shared by every project
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    min_interval_seconds: u64,
    fixed_guard: Duration,
}

impl SchedulePolicy {
    pub fn new(tick: StdDuration, min_interval_seconds: u64) -> Self {
        Self {
            min_interval_seconds,
            fixed_guard: fixed_time_guard(tick),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.tick_interval(), config.scheduler.min_interval_seconds)
    }

    pub fn fixed_guard(&self) -> Duration {
        self.fixed_guard
    }

    /// Whether a project with pending changes should sync now
    pub fn is_due(&self, policy: &SyncPolicy, last_sync: Option<DateTime<Utc>>, now: DateTime<Local>) -> bool {
        match policy.mode {
            SyncMode::Interval => {
                let Some(last) = last_sync else {
                    return true;
                };
                let interval = policy.effective_interval(self.min_interval_seconds);
                now.with_timezone(&Utc) - last > Duration::seconds(interval as i64)
            }
            SyncMode::Fixed => {
                let Some((hour, minute)) = policy.fixed_target() else {
                    return false;
                };
                if now.hour() != hour || now.minute() != minute {
                    return false;
                }
                match last_sync {
                    Some(last) => now.with_timezone(&Utc) - last > self.fixed_guard,
                    None => true,
                }
            }
        }
    }

    /// Decide what happens to a pending marker.
    ///
    /// `project` is the live registry view; `None` means it was removed.
    pub fn decide(&self, project: Option<&WatchedProject>, syncing: bool, now: DateTime<Local>) -> Decision {
        let Some(project) = project else {
            return Decision::Drop;
        };
        if !project.policy.auto_push {
            return Decision::Drop;
        }
        if syncing {
            return Decision::NotDue;
        }
        if self.is_due(&project.policy, project.last_sync, now) {
            Decision::Due
        } else {
            Decision::NotDue
        }
    }
}

/// Window after a fixed-time sync during which the same target minute cannot
/// fire again: one minute plus five ticks.
pub fn fixed_time_guard(tick: StdDuration) -> Duration {
    let tick = Duration::from_std(tick).unwrap_or_else(|_| Duration::seconds(1));
    Duration::seconds(60) + tick * 5
}
