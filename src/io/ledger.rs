//! Ledger collaborator - append-only store of charge records

use crate::domain::{ChargeRecord, ContactId, LedgerEntry};
use crate::io::rest::{CollaboratorError, RestClient};
use crate::io::wire::LedgerItemRow;
use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, warn};

/// Filter for ledger reads. Results are always newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerQuery {
    pub contact_id: ContactId,
    pub date: Option<NaiveDate>,
    pub amount: Option<i64>,
    pub limit: usize,
    pub offset: usize,
}

impl LedgerQuery {
    /// The single newest record of a contact
    pub fn latest(contact_id: ContactId) -> Self {
        Self { contact_id, date: None, amount: None, limit: 1, offset: 0 }
    }

    pub fn page(contact_id: ContactId, limit: usize, offset: usize) -> Self {
        Self { contact_id, date: None, amount: None, limit, offset }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn matches(&self, record: &ChargeRecord) -> bool {
        let entry = record.entry();
        entry.contact_id == self.contact_id
            && self.date.map_or(true, |d| entry.date == d)
            && self.amount.map_or(true, |a| entry.amount == a)
    }

    fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("contact_id", self.contact_id.to_string()),
            ("limit", self.limit.to_string()),
            ("offset", self.offset.to_string()),
            ("sort", "id_desc".to_string()),
        ];
        if let Some(date) = self.date {
            params.push(("date", date.format("%Y-%m-%d").to_string()));
        }
        if let Some(amount) = self.amount {
            params.push(("amount", amount.to_string()));
        }
        params
    }
}

#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Records matching `query`, newest first
    async fn get(&self, query: &LedgerQuery) -> Result<Vec<ChargeRecord>, CollaboratorError>;

    /// Persist a new record. Fails with `Conflict` when
    /// `entry.prev_ledger_item` is no longer the contact's newest record.
    async fn create(&self, entry: &LedgerEntry) -> Result<ChargeRecord, CollaboratorError>;
}

/// Ledger reached over its REST interface
pub struct HttpLedger {
    rest: RestClient,
}

impl HttpLedger {
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl LedgerService for HttpLedger {
    async fn get(&self, query: &LedgerQuery) -> Result<Vec<ChargeRecord>, CollaboratorError> {
        let params = query.to_params();
        let rows: Vec<LedgerItemRow> = match self.rest.get_json("ledger_items", &params).await {
            Ok(rows) => rows,
            Err(CollaboratorError::NotFound) => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = ChargeRecord::try_from(row).map_err(|e| {
                warn!(contact_id = %query.contact_id, error = %e, "ledger_row_invalid");
                CollaboratorError::Unexpected(e.to_string())
            })?;
            records.push(record);
        }
        debug!(contact_id = %query.contact_id, count = %records.len(), "ledger_items_fetched");
        Ok(records)
    }

    async fn create(&self, entry: &LedgerEntry) -> Result<ChargeRecord, CollaboratorError> {
        let row: LedgerItemRow = self.rest.post_json("ledger_items", entry).await?;
        ChargeRecord::try_from(row).map_err(|e| CollaboratorError::OutcomeUnknown(e.to_string()))
    }
}
