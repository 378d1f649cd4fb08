//! Services - access decisions and charging
//!
//! This module contains the core business logic services:
//! - `access` - Tap-in state machine and end-of-job charge flow
//! - `charge` - Charge computation and optimistic commit
//! - `balance` - Latest balance lookup
//! - `perdiem` - Once-a-day non-member fee bookkeeping
//! - `event_window` - Open hours detection from the event schedule
//! - `records` - Job history and access point environment queries

pub mod access;
pub mod balance;
pub mod charge;
pub mod event_window;
pub mod perdiem;
pub mod records;

// Re-export commonly used types
pub use access::{AccessDecider, AccessOutcome, AccessPointError, JobError, JobOutcome};
pub use balance::BalanceResolver;
pub use charge::{ChargeEngine, ChargeError, ChargeKind};
pub use event_window::{EventWindowChecker, WindowStatus};
pub use perdiem::PerDiemTracker;
pub use records::RecordsService;
