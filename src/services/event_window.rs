//! Open hours detection
//!
//! An access point's open hours run from 15 minutes before a matching
//! scheduled event starts until 4 hours after, both ends inclusive. Matching
//! events are named "<label> Open Hours".

use crate::infra::clock::Clock;
use crate::io::schedule::{EventSchedule, ScheduledEvent};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

pub const OPEN_HOURS_LEAD_MINUTES: i64 = 15;
pub const OPEN_HOURS_LENGTH_HOURS: i64 = 4;
pub const OPEN_HOURS_SUFFIX: &str = " Open Hours";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    Active,
    Inactive,
    /// The schedule could not be consulted
    Unknown,
}

impl WindowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowStatus::Active => "active",
            WindowStatus::Inactive => "inactive",
            WindowStatus::Unknown => "unknown",
        }
    }
}

/// Whether `now` lies in the open hours around an event starting at `start`
#[inline]
pub fn window_contains(start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    start - Duration::minutes(OPEN_HOURS_LEAD_MINUTES) <= now
        && now <= start + Duration::hours(OPEN_HOURS_LENGTH_HOURS)
}

pub fn event_name(label: &str) -> String {
    format!("{label}{OPEN_HOURS_SUFFIX}")
}

pub struct EventWindowChecker {
    schedule: Arc<dyn EventSchedule>,
    clock: Arc<dyn Clock>,
    lookahead: usize,
}

impl EventWindowChecker {
    pub fn new(schedule: Arc<dyn EventSchedule>, clock: Arc<dyn Clock>, lookahead: usize) -> Self {
        Self { schedule, clock, lookahead: lookahead.max(1) }
    }

    /// Status of the open hours window for `label`. Schedule failures come
    /// back as `Unknown`, never as an error.
    pub async fn is_active(&self, label: &str) -> WindowStatus {
        let events = match self.schedule.upcoming(self.lookahead).await {
            Ok(events) => events,
            Err(e) => {
                warn!(label = %label, error = %e, "schedule_lookup_failed");
                return WindowStatus::Unknown;
            }
        };
        let now = self.clock.now().with_timezone(&Utc);
        let status = status_at(&events, label, now);
        debug!(label = %label, status = %status.as_str(), "open_hours_status");
        status
    }
}

fn status_at(events: &[ScheduledEvent], label: &str, now: DateTime<Utc>) -> WindowStatus {
    let name = event_name(label);
    let active = events.iter().any(|e| e.name == name && window_contains(e.start, now));
    if active {
        WindowStatus::Active
    } else {
        WindowStatus::Inactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::clock::ManualClock;
    use crate::io::memory::StaticSchedule;
    use chrono::{Local, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 18, 0, 0).unwrap()
    }

    #[test]
    fn test_window_boundaries_inclusive() {
        let t = start();
        assert!(window_contains(t, t - Duration::minutes(15)));
        assert!(window_contains(t, t));
        assert!(window_contains(t, t + Duration::hours(4)));
        assert!(!window_contains(t, t - Duration::minutes(15) - Duration::seconds(1)));
        assert!(!window_contains(t, t + Duration::hours(4) + Duration::seconds(1)));
    }

    #[test]
    fn test_only_matching_label() {
        let events = vec![ScheduledEvent { name: "Laser Open Hours".to_string(), start: start() }];
        assert_eq!(status_at(&events, "Laser", start()), WindowStatus::Active);
        assert_eq!(status_at(&events, "Lathe", start()), WindowStatus::Inactive);
        assert_eq!(status_at(&[], "Laser", start()), WindowStatus::Inactive);
    }

    #[tokio::test]
    async fn test_checker_follows_clock_and_schedule() {
        let schedule = Arc::new(StaticSchedule::new(vec![ScheduledEvent {
            name: "Laser Open Hours".to_string(),
            start: start(),
        }]));
        let clock = Arc::new(ManualClock::new(
            (start() - Duration::minutes(20)).with_timezone(&Local),
        ));
        let checker = EventWindowChecker::new(schedule.clone(), clock.clone(), 5);

        assert_eq!(checker.is_active("Laser").await, WindowStatus::Inactive);
        clock.advance(Duration::minutes(5));
        assert_eq!(checker.is_active("Laser").await, WindowStatus::Active);

        schedule.set_online(false);
        assert_eq!(checker.is_active("Laser").await, WindowStatus::Unknown);
    }

    #[tokio::test]
    async fn test_lookahead_bounds_events_considered() {
        let mut events: Vec<ScheduledEvent> = (1..=5)
            .map(|i| ScheduledEvent {
                name: format!("Meetup {i}"),
                start: start() - Duration::hours(1) + Duration::minutes(i),
            })
            .collect();
        events.push(ScheduledEvent { name: "Laser Open Hours".to_string(), start: start() });
        let schedule = Arc::new(StaticSchedule::new(events));
        let clock = Arc::new(ManualClock::new(start().with_timezone(&Local)));

        let narrow = EventWindowChecker::new(schedule.clone(), clock.clone(), 5);
        assert_eq!(narrow.is_active("Laser").await, WindowStatus::Inactive);
        let wide = EventWindowChecker::new(schedule, clock, 6);
        assert_eq!(wide.is_active("Laser").await, WindowStatus::Active);
    }
}
