//! Tap-in decisions and end-of-job charging
//!
//! A tap-in walks a fixed sequence and stops at the first denial:
//! access point → card → balance → open hours (when enabled) → overdraft.
//! A job charge resolves the same contact and balance, then commits one
//! or two charge records. Its overdraft verdict is advisory and never
//! blocks the charge.

use crate::domain::{
    AccessPoint, BalanceSnapshot, CardId, ChargeRecord, Contact, Decision, ErrorCode, InputError,
    JobMinutes, Membership,
};
use crate::infra::context::AppContext;
use crate::infra::metrics::Metrics;
use crate::io::directory::Directory;
use crate::io::rest::CollaboratorError;
use crate::services::balance::BalanceResolver;
use crate::services::charge::{ChargeEngine, ChargeError, ChargeKind, PERDIEM_NOTE};
use crate::services::event_window::{EventWindowChecker, WindowStatus};
use crate::services::perdiem::PerDiemTracker;
use smallvec::SmallVec;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Failure to identify the calling access point
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessPointError {
    #[error("no access point registered for {0}")]
    Unrecognized(IpAddr),
    #[error("directory unreachable: {0}")]
    Unreachable(CollaboratorError),
}

impl AccessPointError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AccessPointError::Unrecognized(_) => ErrorCode::UnrecognizedAccessPoint,
            AccessPointError::Unreachable(_) => ErrorCode::UpstreamUnreachable,
        }
    }
}

/// Failure of a job charge or history request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InputError),
    #[error("access point out of service")]
    OutOfService,
    #[error("unknown card")]
    UnknownCard,
    /// A collaborator failed before anything was charged
    #[error("collaborator unavailable: {0}")]
    Unavailable(CollaboratorError),
    /// The charge could not be committed; nothing was silently dropped
    #[error("charge failed: {0}")]
    Charge(ChargeError),
}

impl JobError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            JobError::InvalidInput(_) | JobError::Charge(ChargeError::AmountOverflow { .. }) => {
                ErrorCode::InvalidInput
            }
            JobError::OutOfService => ErrorCode::OutOfService,
            JobError::UnknownCard => ErrorCode::UnknownCard,
            JobError::Unavailable(_) | JobError::Charge(_) => ErrorCode::ServiceUnavailable,
        }
    }
}

/// Result of a tap-in check. Contact and balance are present once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessOutcome {
    pub decision: Decision,
    pub contact: Option<Contact>,
    pub balance: Option<BalanceSnapshot>,
}

impl AccessOutcome {
    fn denied(code: ErrorCode) -> Self {
        Self { decision: Decision::deny(code), contact: None, balance: None }
    }
}

/// Result of a committed job charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub contact: Contact,
    /// Committed records in commit order (per-diem first when present)
    pub records: SmallVec<[ChargeRecord; 2]>,
    pub balance: BalanceSnapshot,
    /// `Overdrawn` when the final pocket_store is negative
    pub decision: Decision,
}

pub struct AccessDecider {
    directory: Arc<dyn Directory>,
    balances: BalanceResolver,
    perdiem: PerDiemTracker,
    window: Option<EventWindowChecker>,
    charges: ChargeEngine,
    metrics: Arc<Metrics>,
    open_hours_min_balance: i64,
    max_stale_retries: usize,
}

impl AccessDecider {
    pub fn new(ctx: &AppContext) -> Self {
        let window = ctx.schedule.clone().map(|schedule| {
            EventWindowChecker::new(schedule, ctx.clock.clone(), ctx.config.schedule_lookahead())
        });
        Self {
            directory: ctx.directory.clone(),
            balances: BalanceResolver::new(ctx.ledger.clone()),
            perdiem: PerDiemTracker::new(ctx.ledger.clone(), ctx.clock.clone()),
            window,
            charges: ChargeEngine::new(ctx.ledger.clone(), ctx.clock.clone()),
            metrics: ctx.metrics.clone(),
            open_hours_min_balance: ctx.config.open_hours_min_balance(),
            max_stale_retries: ctx.config.max_stale_retries(),
        }
    }

    /// Identify the caller by its network origin
    pub async fn resolve_access_point(&self, origin: IpAddr) -> Result<AccessPoint, AccessPointError> {
        match self.directory.access_point_by_origin(origin).await {
            Ok(ap) => Ok(ap),
            Err(CollaboratorError::NotFound) => {
                warn!(origin = %origin, "access_point_unrecognized");
                Err(AccessPointError::Unrecognized(origin))
            }
            Err(e) => {
                self.metrics.record_collaborator_failure();
                warn!(origin = %origin, error = %e, "access_point_lookup_failed");
                Err(AccessPointError::Unreachable(e))
            }
        }
    }

    async fn resolve_contact(&self, card: &CardId) -> Result<Contact, CollaboratorError> {
        self.directory.contact_by_card(card).await.inspect_err(|e| {
            if *e != CollaboratorError::NotFound {
                self.metrics.record_collaborator_failure();
                warn!(card = %card, error = %e, "contact_lookup_failed");
            }
        })
    }

    /// Tap-in check for `card_raw` at an already resolved access point
    pub async fn check(&self, access_point: &AccessPoint, card_raw: &str) -> AccessOutcome {
        let started = Instant::now();
        let outcome = self.run_check(access_point, card_raw).await;
        let code = outcome.decision.error_code;
        self.metrics.record_access_check(
            outcome.decision.is_granted(),
            code,
            started.elapsed().as_micros() as u64,
        );

        let contact_id = outcome.contact.as_ref().map(|c| c.id.0).unwrap_or_default();
        if outcome.decision.is_granted() {
            info!(access_point_id = %access_point.id, contact_id = %contact_id, "access_granted");
        } else {
            info!(
                access_point_id = %access_point.id,
                contact_id = %contact_id,
                error_code = %code,
                reason = %code.as_str(),
                "access_denied"
            );
        }
        outcome
    }

    async fn run_check(&self, access_point: &AccessPoint, card_raw: &str) -> AccessOutcome {
        if !access_point.operational {
            return AccessOutcome::denied(ErrorCode::OutOfService);
        }
        let card = match CardId::parse(card_raw) {
            Ok(card) => card,
            Err(e) => {
                debug!(access_point_id = %access_point.id, error = %e, "card_rejected");
                return AccessOutcome::denied(ErrorCode::InvalidInput);
            }
        };
        let contact = match self.resolve_contact(&card).await {
            Ok(contact) => contact,
            Err(CollaboratorError::NotFound) => return AccessOutcome::denied(ErrorCode::UnknownCard),
            Err(_) => return AccessOutcome::denied(ErrorCode::UpstreamUnreachable),
        };
        let balance = match self.balances.latest(contact.id).await {
            Ok(balance) => balance,
            Err(e) => {
                self.metrics.record_collaborator_failure();
                warn!(contact_id = %contact.id, error = %e, "balance_lookup_failed");
                return AccessOutcome {
                    decision: Decision::deny(ErrorCode::ServiceUnavailable),
                    contact: Some(contact),
                    balance: None,
                };
            }
        };

        let mut decision = Decision::grant();
        if let Some(window) = &self.window {
            let status = window.is_active(access_point.open_hours_label()).await;
            decision = self.open_hours_decision(status, contact.membership, &balance);
        }
        if balance.is_overdrawn() {
            decision = Decision::deny(ErrorCode::Overdrawn);
        }

        AccessOutcome { decision, contact: Some(contact), balance: Some(balance) }
    }

    fn open_hours_decision(
        &self,
        status: WindowStatus,
        membership: Membership,
        balance: &BalanceSnapshot,
    ) -> Decision {
        match (status, membership) {
            (WindowStatus::Unknown, _) => Decision::deny(ErrorCode::ConnectivityUnknown),
            (WindowStatus::Active, Membership::NonMember)
                if balance.pocket_store <= self.open_hours_min_balance =>
            {
                Decision::deny(ErrorCode::InsufficientBalance)
            }
            (WindowStatus::Active, _) => Decision::grant(),
            (WindowStatus::Inactive, Membership::NonMember) => {
                Decision::deny(ErrorCode::RestrictedOutsideHours)
            }
            (WindowStatus::Inactive, Membership::Member) => Decision::grant(),
        }
    }

    /// Charge a finished job of `minutes_raw` minutes
    pub async fn charge_job(
        &self,
        access_point: &AccessPoint,
        card_raw: &str,
        minutes_raw: &str,
    ) -> Result<JobOutcome, JobError> {
        let minutes = JobMinutes::parse(minutes_raw).inspect_err(|e| {
            warn!(access_point_id = %access_point.id, error = %e, "job_time_rejected");
        })?;
        let card = CardId::parse(card_raw)?;
        if !access_point.operational {
            return Err(JobError::OutOfService);
        }
        let contact = match self.resolve_contact(&card).await {
            Ok(contact) => contact,
            Err(CollaboratorError::NotFound) => return Err(JobError::UnknownCard),
            Err(e) => return Err(JobError::Unavailable(e)),
        };
        info!(
            access_point_id = %access_point.id,
            contact_id = %contact.id,
            membership = %contact.membership.as_str(),
            job_minutes = %minutes.0,
            "job_received"
        );

        let mut records: SmallVec<[ChargeRecord; 2]> = SmallVec::new();
        let mut stale_retries = 0;
        loop {
            match self.charge_once(access_point, &contact, minutes, &mut records).await {
                Ok(()) => break,
                Err(e) if e.is_stale() && stale_retries < self.max_stale_retries => {
                    stale_retries += 1;
                    self.metrics.record_stale_conflict();
                    warn!(contact_id = %contact.id, retry = %stale_retries, "stale_balance_retry");
                }
                Err(e) => return Err(self.charge_failed(&contact, &records, e)),
            }
        }

        let balance = records
            .last()
            .map(ChargeRecord::balances)
            .unwrap_or_else(|| BalanceSnapshot::zero(contact.id));
        let decision = if balance.is_overdrawn() {
            warn!(contact_id = %contact.id, pocket_store = %balance.pocket_store, "contact_overdrawn");
            Decision::deny(ErrorCode::Overdrawn)
        } else {
            Decision::grant()
        };
        Ok(JobOutcome { contact, records, balance, decision })
    }

    /// One attempt at the charge sequence. Records committed by an earlier
    /// attempt stay in `records` and are not charged again.
    async fn charge_once(
        &self,
        access_point: &AccessPoint,
        contact: &Contact,
        minutes: JobMinutes,
        records: &mut SmallVec<[ChargeRecord; 2]>,
    ) -> Result<(), ChargeError> {
        let mut balance = self.balances.latest(contact.id).await?;

        let perdiem_committed = records.iter().any(|r| r.entry().notes == PERDIEM_NOTE);
        if let (Membership::NonMember, Some(fee), false) =
            (contact.membership, access_point.perdiem(), perdiem_committed)
        {
            if !self.perdiem.already_charged_today(contact.id, fee).await? {
                info!(contact_id = %contact.id, fee = %fee, "perdiem_charge");
                let record = self
                    .charges
                    .charge(ChargeKind::PerDiem { fee }, access_point, &balance, contact.membership)
                    .await?;
                self.record_committed(&record, true);
                balance = record.balances();
                records.push(record);
            }
        }

        let rate = access_point.rate_for(contact.membership);
        let record = self
            .charges
            .charge(ChargeKind::Metered { minutes, rate }, access_point, &balance, contact.membership)
            .await?;
        self.record_committed(&record, false);
        records.push(record);
        Ok(())
    }

    fn record_committed(&self, record: &ChargeRecord, perdiem: bool) {
        self.metrics.record_charge(record.amount(), perdiem, record.balances().is_overdrawn());
    }

    fn charge_failed(&self, contact: &Contact, records: &[ChargeRecord], e: ChargeError) -> JobError {
        if e.is_stale() {
            self.metrics.record_stale_conflict();
        }
        self.metrics.record_charge_failure();
        error!(
            contact_id = %contact.id,
            committed = %records.len(),
            error = %e,
            "charge_failed"
        );
        JobError::Charge(e)
    }
}
