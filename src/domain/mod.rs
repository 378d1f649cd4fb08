//! Domain models - access decisions, balances and charge records
//!
//! This module contains the canonical data types used throughout the system:
//! - `Contact` / `Membership` - card holder identity
//! - `AccessPoint` - metered machine with its rates and per-diem fee
//! - `BalanceSnapshot` - versioned two-tier balance
//! - `ChargeRecord` - immutable ledger debit
//! - `Decision` / `ErrorCode` - grant or deny verdicts

pub mod decision;
pub mod types;

// Re-export commonly used types at module level
pub use decision::{Decision, ErrorCode, POST_AUTH_THRESHOLD};
pub use types::{
    AccessPoint, AccessPointId, BalanceSnapshot, CardId, ChargeRecord, Contact, ContactId,
    InputError, JobMinutes, LedgerEntry, LedgerVersion, Membership, Rate,
};
