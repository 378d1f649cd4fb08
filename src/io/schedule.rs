//! Event schedule collaborator - upcoming named events of a group

use crate::io::rest::{CollaboratorError, RestClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub name: String,
    pub start: DateTime<Utc>,
}

/// Schedule row: `time` is the start in epoch milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub name: String,
    pub time: i64,
}

impl EventRow {
    pub fn into_event(self) -> Option<ScheduledEvent> {
        DateTime::from_timestamp_millis(self.time).map(|start| ScheduledEvent { name: self.name, start })
    }
}

impl From<&ScheduledEvent> for EventRow {
    fn from(event: &ScheduledEvent) -> Self {
        EventRow { name: event.name.clone(), time: event.start.timestamp_millis() }
    }
}

#[async_trait]
pub trait EventSchedule: Send + Sync {
    /// Next `limit` events in start order
    async fn upcoming(&self, limit: usize) -> Result<Vec<ScheduledEvent>, CollaboratorError>;
}

pub struct HttpSchedule {
    rest: RestClient,
    group: String,
}

impl HttpSchedule {
    pub fn new(rest: RestClient, group: &str) -> Self {
        Self { rest, group: group.to_string() }
    }
}

#[async_trait]
impl EventSchedule for HttpSchedule {
    async fn upcoming(&self, limit: usize) -> Result<Vec<ScheduledEvent>, CollaboratorError> {
        let rows: Vec<EventRow> = self
            .rest
            .get_json("events", &[("group", self.group.clone()), ("page", limit.to_string())])
            .await?;
        Ok(rows.into_iter().take(limit).filter_map(EventRow::into_event).collect())
    }
}
