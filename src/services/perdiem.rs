//! Once-a-day flat fee bookkeeping for non-members

use crate::domain::{ContactId, JobMinutes};
use crate::infra::clock::Clock;
use crate::io::ledger::{LedgerQuery, LedgerService};
use crate::io::rest::CollaboratorError;
use std::sync::Arc;
use tracing::debug;

/// Same-day records scanned when looking for an earlier per-diem charge
const PERDIEM_SCAN_LIMIT: usize = 15;

pub struct PerDiemTracker {
    ledger: Arc<dyn LedgerService>,
    clock: Arc<dyn Clock>,
}

impl PerDiemTracker {
    pub fn new(ledger: Arc<dyn LedgerService>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    /// True when the contact already has a charge of exactly `fee` with zero
    /// job time on today's local calendar date.
    ///
    /// A metered record never matches: zero minutes always cost zero, and a
    /// configured fee is positive.
    pub async fn already_charged_today(
        &self,
        contact_id: ContactId,
        fee: i64,
    ) -> Result<bool, CollaboratorError> {
        let today = self.clock.now().date_naive();
        let query = LedgerQuery::page(contact_id, PERDIEM_SCAN_LIMIT, 0)
            .with_date(today)
            .with_amount(fee);
        let records = self.ledger.get(&query).await?;
        let charged = records.iter().any(|r| {
            let entry = r.entry();
            entry.is_debit && entry.job_minutes == JobMinutes::ZERO && entry.amount == fee
        });
        debug!(contact_id = %contact_id, fee = %fee, date = %today, charged = %charged, "perdiem_lookup");
        Ok(charged)
    }
}
