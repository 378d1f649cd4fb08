//! In-memory collaborators
//!
//! Back the unit and integration tests and the `mock_ledger` bench server.
//! Each store can be switched offline to exercise connectivity failures.

use crate::domain::{
    AccessPoint, AccessPointId, BalanceSnapshot, CardId, ChargeRecord, Contact, ContactId,
    JobMinutes, LedgerEntry, LedgerVersion, Rate,
};
use crate::io::directory::Directory;
use crate::io::ledger::{LedgerQuery, LedgerService};
use crate::io::rest::CollaboratorError;
use crate::io::schedule::{EventSchedule, ScheduledEvent};
use crate::io::wire::ErrorLabel;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

fn offline() -> CollaboratorError {
    CollaboratorError::Unavailable("offline".to_string())
}

struct LedgerState {
    records: Vec<ChargeRecord>,
    next_id: u64,
}

/// Ledger with conditional append: a create must name the contact's newest
/// record as `prev_ledger_item`
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    online: AtomicBool,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState { records: Vec::new(), next_id: 1 }),
            online: AtomicBool::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Append a record without the version check (fixtures, top-ups)
    pub fn seed(&self, entry: LedgerEntry) -> ChargeRecord {
        let mut state = self.state.lock();
        let record = ChargeRecord::new(LedgerVersion(state.next_id), entry);
        state.next_id += 1;
        state.records.push(record.clone());
        record
    }

    /// Set a contact's balances with a zero-amount credit record
    pub fn seed_balance(
        &self,
        contact_id: ContactId,
        member_store: i64,
        pocket_store: i64,
        at: NaiveDateTime,
    ) -> ChargeRecord {
        let prev = self
            .state
            .lock()
            .records
            .iter()
            .rev()
            .find(|r| r.contact_id() == contact_id)
            .map(ChargeRecord::balances)
            .unwrap_or_else(|| BalanceSnapshot::zero(contact_id));
        self.seed(LedgerEntry {
            date: at.date(),
            datetime: at,
            contact_id,
            is_debit: false,
            job_minutes: JobMinutes::ZERO,
            access_point_id: AccessPointId(0),
            rate: Rate::ZERO,
            amount: 0,
            member_store,
            pocket_store,
            prev_ledger_item: prev.version,
            prev_member_store: prev.member_store,
            prev_pocket_store: prev.pocket_store,
            notes: "balance adjustment".to_string(),
        })
    }

    /// All records, oldest first
    pub fn records(&self) -> Vec<ChargeRecord> {
        self.state.lock().records.clone()
    }

    fn check_online(&self) -> Result<(), CollaboratorError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(offline())
        }
    }
}

#[async_trait]
impl LedgerService for MemoryLedger {
    async fn get(&self, query: &LedgerQuery) -> Result<Vec<ChargeRecord>, CollaboratorError> {
        self.check_online()?;
        let state = self.state.lock();
        Ok(state
            .records
            .iter()
            .rev()
            .filter(|r| query.matches(r))
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn create(&self, entry: &LedgerEntry) -> Result<ChargeRecord, CollaboratorError> {
        self.check_online()?;
        let mut state = self.state.lock();
        let latest = state
            .records
            .iter()
            .rev()
            .find(|r| r.contact_id() == entry.contact_id)
            .map_or(LedgerVersion::NONE, ChargeRecord::id);
        if latest != entry.prev_ledger_item {
            return Err(CollaboratorError::Conflict);
        }
        let record = ChargeRecord::new(LedgerVersion(state.next_id), entry.clone());
        state.next_id += 1;
        state.records.push(record.clone());
        Ok(record)
    }
}

/// Ledger shared with another writer that tops up the contact just before
/// the selected creates land, so those creates fail with `Conflict`
#[cfg(test)]
pub(crate) struct ContendedLedger {
    inner: std::sync::Arc<MemoryLedger>,
    creates: std::sync::atomic::AtomicUsize,
    contend: fn(usize) -> bool,
}

#[cfg(test)]
impl ContendedLedger {
    pub(crate) const TOP_UP: i64 = 1000;

    /// `contend` gets the zero-based index of each create
    pub(crate) fn new(inner: std::sync::Arc<MemoryLedger>, contend: fn(usize) -> bool) -> Self {
        Self { inner, creates: std::sync::atomic::AtomicUsize::new(0), contend }
    }
}

#[cfg(test)]
#[async_trait]
impl LedgerService for ContendedLedger {
    async fn get(&self, query: &LedgerQuery) -> Result<Vec<ChargeRecord>, CollaboratorError> {
        self.inner.get(query).await
    }

    async fn create(&self, entry: &LedgerEntry) -> Result<ChargeRecord, CollaboratorError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        if (self.contend)(n) {
            let latest = self
                .inner
                .records()
                .iter()
                .rev()
                .find(|r| r.contact_id() == entry.contact_id)
                .map(ChargeRecord::balances)
                .unwrap_or_else(|| BalanceSnapshot::zero(entry.contact_id));
            self.inner.seed_balance(
                entry.contact_id,
                latest.member_store,
                latest.pocket_store + Self::TOP_UP,
                entry.datetime,
            );
        }
        self.inner.create(entry).await
    }
}

#[derive(Default)]
struct DirectoryState {
    by_origin: FxHashMap<IpAddr, AccessPointId>,
    access_points: Vec<AccessPoint>,
    contacts: FxHashMap<String, Contact>,
    labels: FxHashMap<AccessPointId, Vec<ErrorLabel>>,
}

pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
    online: AtomicBool,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self { state: Mutex::new(DirectoryState::default()), online: AtomicBool::new(true) }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn add_access_point(&self, origin: IpAddr, access_point: AccessPoint) {
        let mut state = self.state.lock();
        state.by_origin.insert(origin, access_point.id);
        state.access_points.retain(|ap| ap.id != access_point.id);
        state.access_points.push(access_point);
    }

    pub fn add_contact(&self, card: &str, contact: Contact) {
        self.state.lock().contacts.insert(card.to_string(), contact);
    }

    pub fn add_error_label(&self, id: AccessPointId, key: &str, value: &str) {
        self.state
            .lock()
            .labels
            .entry(id)
            .or_default()
            .push(ErrorLabel { error_key: key.to_string(), error_value: value.to_string() });
    }

    fn check_online(&self) -> Result<(), CollaboratorError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(offline())
        }
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn access_point_by_origin(&self, origin: IpAddr) -> Result<AccessPoint, CollaboratorError> {
        self.check_online()?;
        let state = self.state.lock();
        let id = state.by_origin.get(&origin).ok_or(CollaboratorError::NotFound)?;
        state
            .access_points
            .iter()
            .find(|ap| ap.id == *id)
            .cloned()
            .ok_or(CollaboratorError::NotFound)
    }

    async fn contact_by_card(&self, card: &CardId) -> Result<Contact, CollaboratorError> {
        self.check_online()?;
        self.state.lock().contacts.get(card.as_str()).cloned().ok_or(CollaboratorError::NotFound)
    }

    async fn access_points(&self) -> Result<Vec<AccessPoint>, CollaboratorError> {
        self.check_online()?;
        let mut access_points = self.state.lock().access_points.clone();
        access_points.sort_by_key(|ap| ap.id);
        Ok(access_points)
    }

    async fn error_labels(&self, id: AccessPointId) -> Result<Vec<ErrorLabel>, CollaboratorError> {
        self.check_online()?;
        self.state.lock().labels.get(&id).cloned().ok_or(CollaboratorError::NotFound)
    }
}

/// Fixed list of events
pub struct StaticSchedule {
    events: Mutex<Vec<ScheduledEvent>>,
    online: AtomicBool,
}

impl StaticSchedule {
    pub fn new(events: Vec<ScheduledEvent>) -> Self {
        Self { events: Mutex::new(events), online: AtomicBool::new(true) }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventSchedule for StaticSchedule {
    async fn upcoming(&self, limit: usize) -> Result<Vec<ScheduledEvent>, CollaboratorError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(offline());
        }
        let mut events = self.events.lock().clone();
        events.sort_by_key(|e| e.start);
        events.truncate(limit);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_create_requires_latest_version() {
        let ledger = MemoryLedger::new();
        let seeded = ledger.seed_balance(ContactId(42), 500, 1000, at(9));

        let mut entry = seeded.entry().clone();
        entry.prev_ledger_item = LedgerVersion::NONE;
        assert_eq!(ledger.create(&entry).await, Err(CollaboratorError::Conflict));

        entry.prev_ledger_item = seeded.id();
        let created = ledger.create(&entry).await.unwrap();
        assert_eq!(created.id(), LedgerVersion(2));

        // The old version is now superseded
        assert_eq!(ledger.create(&entry).await, Err(CollaboratorError::Conflict));
    }

    #[tokio::test]
    async fn test_get_newest_first_with_paging() {
        let ledger = MemoryLedger::new();
        for pocket in [100, 200, 300] {
            ledger.seed_balance(ContactId(7), 0, pocket, at(10));
        }
        ledger.seed_balance(ContactId(8), 0, 999, at(10));

        let latest = ledger.get(&LedgerQuery::latest(ContactId(7))).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].balances().pocket_store, 300);

        let page = ledger.get(&LedgerQuery::page(ContactId(7), 2, 1)).await.unwrap();
        let pockets: Vec<i64> = page.iter().map(|r| r.balances().pocket_store).collect();
        assert_eq!(pockets, vec![200, 100]);
    }

    #[tokio::test]
    async fn test_offline_ledger_is_unavailable() {
        let ledger = MemoryLedger::new();
        ledger.set_online(false);
        let result = ledger.get(&LedgerQuery::latest(ContactId(1))).await;
        assert!(matches!(result, Err(CollaboratorError::Unavailable(_))));
    }
}
