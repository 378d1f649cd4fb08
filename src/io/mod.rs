//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `rest` - JSON-over-HTTP client with timeouts and retry
//! - `wire` - Collaborator row formats and boundary validation
//! - `ledger` - Ledger collaborator (charge records, balances)
//! - `directory` - Directory collaborator (access points, card holders)
//! - `schedule` - Event schedule collaborator (open hours)
//! - `memory` - In-memory collaborators for tests and bench setups
//! - `api` - Inbound HTTP API served to access points
//! - `prometheus` - Prometheus text exposition

pub mod api;
pub mod directory;
pub mod ledger;
pub mod memory;
pub mod prometheus;
pub mod rest;
pub mod schedule;
pub mod wire;

// Re-export commonly used types
pub use api::{serve, start_api_server, ApiState};
pub use directory::{Directory, HttpDirectory};
pub use ledger::{HttpLedger, LedgerQuery, LedgerService};
pub use memory::{MemoryDirectory, MemoryLedger, StaticSchedule};
pub use rest::{CollaboratorError, RestClient};
pub use schedule::{EventSchedule, HttpSchedule, ScheduledEvent};
