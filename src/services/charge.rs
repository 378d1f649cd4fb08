//! Charge computation and commit
//!
//! Amounts are computed in integer minor units. A member's charge drains
//! member_store first and the shortfall moves to pocket_store; non-members
//! pay from pocket_store only. pocket_store may end negative, the charge is
//! still persisted.
//!
//! Commits are optimistic: the entry names the ledger version its balances
//! were computed from, and the commit is refused with `StaleBalance` when the
//! contact's newest ledger item has moved on. Commits for one contact are
//! serialized in-process so the version check and the create cannot
//! interleave; the ledger also enforces the check for other processes.

use crate::domain::{
    AccessPoint, BalanceSnapshot, ChargeRecord, ContactId, JobMinutes, LedgerEntry,
    LedgerVersion, Membership, Rate,
};
use crate::infra::clock::Clock;
use crate::io::ledger::{LedgerQuery, LedgerService};
use crate::io::rest::CollaboratorError;
use crate::services::balance::newest_version;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const PERDIEM_NOTE: &str = "Non-member per diem charge.";
pub const METERED_NOTE: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChargeError {
    /// `found` is `None` when the ledger refused the create without telling
    /// us which item superseded `expected`
    #[error("balance of contact {contact_id} is no longer at version {expected}")]
    StaleBalance { contact_id: ContactId, expected: LedgerVersion, found: Option<LedgerVersion> },
    #[error("charge for contact {contact_id} does not fit in a ledger amount")]
    AmountOverflow { contact_id: ContactId },
    #[error("ledger: {0}")]
    Ledger(#[from] CollaboratorError),
}

impl ChargeError {
    #[inline]
    pub fn is_stale(&self) -> bool {
        matches!(self, ChargeError::StaleBalance { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeKind {
    /// Duration-based charge at an hourly rate
    Metered { minutes: JobMinutes, rate: Rate },
    /// Flat daily non-member fee; recorded with zero job time and rate
    PerDiem { fee: i64 },
}

/// `minutes * rate / 60` rounded half to even, `None` past `i64`
pub fn metered_amount(minutes: JobMinutes, rate: Rate) -> Option<i64> {
    let numerator = i128::from(minutes.0) * i128::from(rate.minor_per_hour());
    let quotient = numerator / 60;
    let remainder = numerator % 60;
    let rounded = match (remainder * 2).cmp(&60) {
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Equal if quotient % 2 == 0 => quotient,
        std::cmp::Ordering::Equal => quotient + 1,
    };
    i64::try_from(rounded).ok()
}

/// Balances after deducting `amount` as (member_store, pocket_store), `None`
/// when pocket_store would overflow
pub fn deduct(
    amount: i64,
    snapshot: &BalanceSnapshot,
    membership: Membership,
) -> Option<(i64, i64)> {
    match membership {
        Membership::Member => {
            let from_member = amount.min(snapshot.member_store.max(0));
            let from_pocket = amount.checked_sub(from_member)?;
            Some((
                snapshot.member_store.checked_sub(from_member)?,
                snapshot.pocket_store.checked_sub(from_pocket)?,
            ))
        }
        Membership::NonMember => {
            Some((snapshot.member_store, snapshot.pocket_store.checked_sub(amount)?))
        }
    }
}

/// Per-contact commit locks. Entries are dropped once nobody holds them.
#[derive(Default)]
struct ContactLocks {
    inner: Mutex<FxHashMap<ContactId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContactLocks {
    fn acquire(&self, contact_id: ContactId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner.lock().entry(contact_id).or_default().clone()
    }

    fn release(&self, contact_id: ContactId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut inner = self.inner.lock();
        drop(lock);
        if inner.get(&contact_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            inner.remove(&contact_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

pub struct ChargeEngine {
    ledger: Arc<dyn LedgerService>,
    clock: Arc<dyn Clock>,
    locks: ContactLocks,
}

impl ChargeEngine {
    pub fn new(ledger: Arc<dyn LedgerService>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock, locks: ContactLocks::default() }
    }

    /// Build the ledger entry for a charge against `snapshot`. Nothing is
    /// persisted.
    pub fn compute(
        &self,
        kind: ChargeKind,
        access_point: &AccessPoint,
        snapshot: &BalanceSnapshot,
        membership: Membership,
    ) -> Result<LedgerEntry, ChargeError> {
        let overflow = || ChargeError::AmountOverflow { contact_id: snapshot.contact_id };
        let (minutes, rate, amount, notes) = match kind {
            ChargeKind::Metered { minutes, rate } => {
                let amount = metered_amount(minutes, rate).ok_or_else(overflow)?;
                (minutes, rate, amount, METERED_NOTE)
            }
            ChargeKind::PerDiem { fee } => (JobMinutes::ZERO, Rate::ZERO, fee.max(0), PERDIEM_NOTE),
        };
        let (member_store, pocket_store) =
            deduct(amount, snapshot, membership).ok_or_else(overflow)?;
        let now = self.clock.now().naive_local();

        Ok(LedgerEntry {
            date: now.date(),
            datetime: now,
            contact_id: snapshot.contact_id,
            is_debit: true,
            job_minutes: minutes,
            access_point_id: access_point.id,
            rate,
            amount,
            member_store,
            pocket_store,
            prev_ledger_item: snapshot.version,
            prev_member_store: snapshot.member_store,
            prev_pocket_store: snapshot.pocket_store,
            notes: notes.to_string(),
        })
    }

    /// Persist `entry` if its `prev_ledger_item` is still the contact's
    /// newest ledger item
    pub async fn commit(&self, entry: &LedgerEntry) -> Result<ChargeRecord, ChargeError> {
        let contact_id = entry.contact_id;
        let lock = self.locks.acquire(contact_id);
        let result = {
            let _guard = lock.lock().await;
            self.commit_locked(entry).await
        };
        self.locks.release(contact_id, lock);

        match &result {
            Ok(record) => info!(
                contact_id = %contact_id,
                ledger_item = %record.id(),
                access_point_id = %entry.access_point_id,
                amount = %entry.amount,
                job_minutes = %entry.job_minutes.0,
                member_store = %entry.member_store,
                pocket_store = %entry.pocket_store,
                "charge_committed"
            ),
            Err(e) => warn!(contact_id = %contact_id, amount = %entry.amount, error = %e, "charge_rejected"),
        }
        result
    }

    async fn commit_locked(&self, entry: &LedgerEntry) -> Result<ChargeRecord, ChargeError> {
        let latest = self.ledger.get(&LedgerQuery::latest(entry.contact_id)).await?;
        let found = newest_version(&latest);
        if found != entry.prev_ledger_item {
            return Err(ChargeError::StaleBalance {
                contact_id: entry.contact_id,
                expected: entry.prev_ledger_item,
                found: Some(found),
            });
        }
        match self.ledger.create(entry).await {
            Ok(record) => Ok(record),
            // Another process committed between our check and the create
            Err(CollaboratorError::Conflict) => Err(ChargeError::StaleBalance {
                contact_id: entry.contact_id,
                expected: entry.prev_ledger_item,
                found: None,
            }),
            Err(e) => Err(ChargeError::Ledger(e)),
        }
    }

    /// Compute and commit in one step
    pub async fn charge(
        &self,
        kind: ChargeKind,
        access_point: &AccessPoint,
        snapshot: &BalanceSnapshot,
        membership: Membership,
    ) -> Result<ChargeRecord, ChargeError> {
        let entry = self.compute(kind, access_point, snapshot, membership)?;
        self.commit(&entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AccessPointId;
    use crate::infra::clock::ManualClock;
    use crate::io::memory::{ContendedLedger, MemoryLedger};
    use chrono::{Local, NaiveDate, TimeZone};

    fn laser() -> AccessPoint {
        AccessPoint {
            id: AccessPointId(3),
            short_name: "Laser".to_string(),
            member_rate: Rate::per_hour(1400),
            non_member_rate: Rate::per_hour(2000),
            non_member_perdiem: Some(200),
            operational: true,
            open_hours_label: None,
        }
    }

    fn clock() -> Arc<ManualClock> {
        let now = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap().and_hms_opt(14, 3, 0).unwrap();
        Arc::new(ManualClock::new(Local.from_local_datetime(&now).unwrap()))
    }

    fn setup() -> (Arc<MemoryLedger>, ChargeEngine) {
        let ledger = Arc::new(MemoryLedger::new());
        let engine = ChargeEngine::new(ledger.clone(), clock());
        (ledger, engine)
    }

    fn snapshot(member_store: i64, pocket_store: i64, version: u64) -> BalanceSnapshot {
        BalanceSnapshot {
            contact_id: ContactId(42),
            member_store,
            pocket_store,
            version: LedgerVersion(version),
        }
    }

    #[test]
    fn test_metered_amount_rounds_half_even() {
        assert_eq!(metered_amount(JobMinutes(30), Rate::per_hour(1400)), Some(700));
        assert_eq!(metered_amount(JobMinutes(0), Rate::per_hour(1400)), Some(0));
        // 1 * 90 / 60 = 1.5 -> 2, 1 * 30 / 60 = 0.5 -> 0
        assert_eq!(metered_amount(JobMinutes(1), Rate::per_hour(90)), Some(2));
        assert_eq!(metered_amount(JobMinutes(1), Rate::per_hour(30)), Some(0));
        // 1 * 100 / 60 = 1.67 -> 2, 1 * 80 / 60 = 1.33 -> 1
        assert_eq!(metered_amount(JobMinutes(1), Rate::per_hour(100)), Some(2));
        assert_eq!(metered_amount(JobMinutes(1), Rate::per_hour(80)), Some(1));
    }

    #[test]
    fn test_metered_amount_overflow_is_none() {
        assert_eq!(metered_amount(JobMinutes(u32::MAX), Rate::per_hour(i64::MAX)), None);
        assert!(metered_amount(JobMinutes(60), Rate::per_hour(i64::MAX)).is_some());
    }

    #[test]
    fn test_deduct_overflow_is_none() {
        let s = snapshot(0, i64::MIN + 10, 1);
        assert_eq!(deduct(11, &s, Membership::NonMember), None);
        assert_eq!(deduct(11, &s, Membership::Member), None);
        assert_eq!(deduct(10, &s, Membership::Member), Some((0, i64::MIN)));
    }

    #[test]
    fn test_member_drains_member_store_first() {
        let s = snapshot(500, 1000, 1);
        assert_eq!(deduct(700, &s, Membership::Member), Some((0, 800)));
        assert_eq!(deduct(300, &s, Membership::Member), Some((200, 1000)));
        assert_eq!(deduct(2000, &s, Membership::Member), Some((0, -500)));
    }

    #[test]
    fn test_negative_member_store_is_not_drained() {
        let s = snapshot(-50, 1000, 1);
        assert_eq!(deduct(100, &s, Membership::Member), Some((-50, 900)));
    }

    #[test]
    fn test_non_member_pays_from_pocket_only() {
        let s = snapshot(0, 1500, 1);
        assert_eq!(deduct(200, &s, Membership::NonMember), Some((0, 1300)));
    }

    #[test]
    fn test_deduction_conserves_amount() {
        for (member, pocket) in [(0, 0), (500, 1000), (1000, -200), (30, 30)] {
            for amount in [0, 1, 29, 30, 31, 700, 5000] {
                for membership in [Membership::Member, Membership::NonMember] {
                    let s = snapshot(member, pocket, 1);
                    let (m, p) = deduct(amount, &s, membership).unwrap();
                    assert_eq!((member - m) + (pocket - p), amount);
                    assert!(m >= member.min(0));
                }
            }
        }
    }

    #[test]
    fn test_compute_metered_entry() {
        let (_, engine) = setup();
        let kind = ChargeKind::Metered { minutes: JobMinutes(30), rate: Rate::per_hour(1400) };
        let entry =
            engine.compute(kind, &laser(), &snapshot(500, 1000, 11), Membership::Member).unwrap();
        assert_eq!(entry.amount, 700);
        assert_eq!(entry.member_store, 0);
        assert_eq!(entry.pocket_store, 800);
        assert_eq!(entry.prev_ledger_item, LedgerVersion(11));
        assert_eq!(entry.prev_member_store, 500);
        assert_eq!(entry.prev_pocket_store, 1000);
        assert_eq!(entry.notes, METERED_NOTE);
        assert_eq!(entry.access_point_id, AccessPointId(3));
        assert_eq!(entry.date, NaiveDate::from_ymd_opt(2026, 10, 18).unwrap());
        assert!(entry.is_debit);
    }

    #[test]
    fn test_compute_perdiem_entry() {
        let (_, engine) = setup();
        let entry = engine.compute(
            ChargeKind::PerDiem { fee: 200 },
            &laser(),
            &snapshot(0, 1500, 4),
            Membership::NonMember,
        )
        .unwrap();
        assert_eq!(entry.amount, 200);
        assert_eq!(entry.job_minutes, JobMinutes::ZERO);
        assert_eq!(entry.rate, Rate::ZERO);
        assert_eq!(entry.pocket_store, 1300);
        assert_eq!(entry.notes, PERDIEM_NOTE);
    }

    #[tokio::test]
    async fn test_commit_rejects_superseded_version() {
        let (ledger, engine) = setup();
        let at = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let first = ledger.seed_balance(ContactId(42), 500, 1000, at);
        ledger.seed_balance(ContactId(42), 500, 5000, at);

        let stale = first.balances();
        let kind = ChargeKind::Metered { minutes: JobMinutes(30), rate: Rate::per_hour(1400) };
        let err = engine.charge(kind, &laser(), &stale, Membership::Member).await.unwrap_err();
        assert!(err.is_stale());
        assert_eq!(ledger.records().len(), 2);
        match err {
            ChargeError::StaleBalance { expected, found, .. } => {
                assert_eq!(expected, first.id());
                assert!(found.is_some_and(|v| v != expected));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_ledger_conflict_has_no_found_version() {
        let ledger = Arc::new(MemoryLedger::new());
        let at = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let seeded = ledger.seed_balance(ContactId(42), 500, 1000, at);
        let contended = Arc::new(ContendedLedger::new(ledger.clone(), |_| true));
        let engine = ChargeEngine::new(contended, clock());

        let kind = ChargeKind::Metered { minutes: JobMinutes(30), rate: Rate::per_hour(1400) };
        let err = engine
            .charge(kind, &laser(), &seeded.balances(), Membership::Member)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChargeError::StaleBalance { contact_id: ContactId(42), expected: seeded.id(), found: None }
        );
        // Seed plus the other writer's top-up, our debit never landed
        assert_eq!(ledger.records().len(), 2);
        assert!(ledger.records().iter().all(|r| !r.entry().is_debit));
    }

    #[tokio::test]
    async fn test_overflowing_charge_is_refused() {
        let (ledger, engine) = setup();
        let kind =
            ChargeKind::Metered { minutes: JobMinutes(u32::MAX), rate: Rate::per_hour(200_000_000_000) };
        let err = engine
            .charge(kind, &laser(), &BalanceSnapshot::zero(ContactId(42)), Membership::Member)
            .await
            .unwrap_err();
        assert_eq!(err, ChargeError::AmountOverflow { contact_id: ContactId(42) });
        assert!(ledger.records().is_empty());
    }

    #[tokio::test]
    async fn test_overdraft_is_still_persisted() {
        let (ledger, engine) = setup();
        let kind = ChargeKind::Metered { minutes: JobMinutes(60), rate: Rate::per_hour(2000) };
        let record = engine
            .charge(kind, &laser(), &BalanceSnapshot::zero(ContactId(42)), Membership::NonMember)
            .await
            .unwrap();
        assert_eq!(record.balances().pocket_store, -2000);
        assert!(record.balances().is_overdrawn());
        assert_eq!(ledger.records().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_on_same_version() {
        let (ledger, engine) = setup();
        let at = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let seeded = ledger.seed_balance(ContactId(42), 500, 1000, at);
        let engine = Arc::new(engine);
        let snapshot = seeded.balances();
        let kind = ChargeKind::Metered { minutes: JobMinutes(30), rate: Rate::per_hour(1400) };

        let a = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.charge(kind, &laser(), &snapshot, Membership::Member).await
            })
        };
        let b = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.charge(kind, &laser(), &snapshot, Membership::Member).await
            })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(results.iter().filter(|r| matches!(r, Err(e) if e.is_stale())).count(), 1);
        assert_eq!(ledger.records().len(), 2);
        assert_eq!(engine.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_ledger_outage_is_surfaced() {
        let (ledger, engine) = setup();
        ledger.set_online(false);
        let kind = ChargeKind::Metered { minutes: JobMinutes(5), rate: Rate::per_hour(1400) };
        let err = engine
            .charge(kind, &laser(), &BalanceSnapshot::zero(ContactId(42)), Membership::Member)
            .await
            .unwrap_err();
        assert!(matches!(err, ChargeError::Ledger(CollaboratorError::Unavailable(_))));
    }
}
