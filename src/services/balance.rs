//! Latest balance lookup

use crate::domain::{BalanceSnapshot, ChargeRecord, ContactId, LedgerVersion};
use crate::io::ledger::{LedgerQuery, LedgerService};
use crate::io::rest::CollaboratorError;
use std::sync::Arc;
use tracing::debug;

pub struct BalanceResolver {
    ledger: Arc<dyn LedgerService>,
}

impl BalanceResolver {
    pub fn new(ledger: Arc<dyn LedgerService>) -> Self {
        Self { ledger }
    }

    /// Balances after the contact's newest ledger item. A contact without
    /// history has the zero snapshot at version 0.
    pub async fn latest(&self, contact_id: ContactId) -> Result<BalanceSnapshot, CollaboratorError> {
        let records = self.ledger.get(&LedgerQuery::latest(contact_id)).await?;
        let snapshot = match records.first() {
            Some(record) => record.balances(),
            None => {
                debug!(contact_id = %contact_id, "no_job_history");
                BalanceSnapshot::zero(contact_id)
            }
        };
        Ok(snapshot)
    }
}

/// Version of the newest record in a newest-first list
pub(crate) fn newest_version(records: &[ChargeRecord]) -> LedgerVersion {
    records.first().map_or(LedgerVersion::NONE, ChargeRecord::id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryLedger;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_zero_snapshot_without_history() {
        let resolver = BalanceResolver::new(Arc::new(MemoryLedger::new()));
        let snapshot = resolver.latest(ContactId(5)).await.unwrap();
        assert_eq!(snapshot, BalanceSnapshot::zero(ContactId(5)));
        assert_eq!(snapshot.version, LedgerVersion::NONE);
    }

    #[tokio::test]
    async fn test_latest_record_wins() {
        let ledger = Arc::new(MemoryLedger::new());
        let at = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap().and_hms_opt(9, 0, 0).unwrap();
        ledger.seed_balance(ContactId(5), 100, 100, at);
        let newest = ledger.seed_balance(ContactId(5), 500, 1000, at);

        let resolver = BalanceResolver::new(ledger);
        let snapshot = resolver.latest(ContactId(5)).await.unwrap();
        assert_eq!(snapshot.member_store, 500);
        assert_eq!(snapshot.pocket_store, 1000);
        assert_eq!(snapshot.version, newest.id());
    }

    #[tokio::test]
    async fn test_unreachable_ledger_is_an_error() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_online(false);
        let resolver = BalanceResolver::new(ledger);
        assert!(resolver.latest(ContactId(5)).await.unwrap_err().is_unavailable());
    }
}
