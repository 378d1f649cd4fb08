//! Shared types for access decisions and usage charging
//!
//! All money values are integers in minor currency units. Text coming from
//! collaborators or callers is validated into these types at the boundary.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Newtype wrapper for contact IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ContactId(pub u64);

impl std::fmt::Display for ContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for access point IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct AccessPointId(pub u64);

impl std::fmt::Display for AccessPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ledger item id. The id of a contact's newest item is the version token of
/// their balance; 0 means the contact has no history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct LedgerVersion(pub u64);

impl LedgerVersion {
    pub const NONE: LedgerVersion = LedgerVersion(0);
}

impl std::fmt::Display for LedgerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rejected caller or collaborator input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("card id must be 8-10 characters, got {len}")]
    CardLength { len: usize },
    #[error("card id must be ASCII alphanumeric")]
    CardCharacters,
    #[error("negative job duration: {0}")]
    NegativeDuration(i64),
    #[error("malformed job duration: {0:?}")]
    MalformedDuration(String),
    #[error("malformed rate: {0:?}")]
    MalformedRate(String),
    #[error("malformed amount: {0:?}")]
    MalformedAmount(String),
    #[error("malformed membership flag: {0:?}")]
    MalformedMembership(String),
    #[error("malformed id: {0:?}")]
    MalformedId(String),
    #[error("malformed timestamp: {0:?}")]
    MalformedTimestamp(String),
    #[error("malformed page number: {0:?}")]
    MalformedPage(String),
}

/// Parse a numeric id that may arrive as JSON text
pub fn parse_id(text: &str) -> Result<u64, InputError> {
    text.trim().parse::<u64>().map_err(|_| InputError::MalformedId(text.to_string()))
}

/// Parse an integer amount of minor units that may arrive as text
pub fn parse_minor_units(text: &str) -> Result<i64, InputError> {
    text.trim().parse::<i64>().map_err(|_| InputError::MalformedAmount(text.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Member,
    NonMember,
}

impl Membership {
    /// Directory membership flag: "1" for members, "0" for everyone else
    pub fn from_flag(flag: &str) -> Result<Self, InputError> {
        match flag.trim() {
            "1" => Ok(Membership::Member),
            "0" => Ok(Membership::NonMember),
            other => Err(InputError::MalformedMembership(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Membership::Member => "member",
            Membership::NonMember => "non_member",
        }
    }

    #[inline]
    pub fn is_member(&self) -> bool {
        matches!(self, Membership::Member)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: ContactId,
    pub display_name: String,
    pub membership: Membership,
}

/// Presented card serial
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CardId(String);

impl CardId {
    pub const MIN_LEN: usize = 8;
    pub const MAX_LEN: usize = 10;

    pub fn parse(raw: &str) -> Result<Self, InputError> {
        let raw = raw.trim();
        let len = raw.len();
        if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&len) {
            return Err(InputError::CardLength { len });
        }
        if !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(InputError::CardCharacters);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metered job length in whole minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobMinutes(pub u32);

impl JobMinutes {
    pub const ZERO: JobMinutes = JobMinutes(0);

    /// Parse caller-supplied duration text. Negative values are an error,
    /// never a zero-length job.
    pub fn parse(raw: &str) -> Result<Self, InputError> {
        let raw = raw.trim();
        let value: i64 =
            raw.parse().map_err(|_| InputError::MalformedDuration(raw.to_string()))?;
        if value < 0 {
            return Err(InputError::NegativeDuration(value));
        }
        u32::try_from(value)
            .map(JobMinutes)
            .map_err(|_| InputError::MalformedDuration(raw.to_string()))
    }
}

/// Hourly rate in minor units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(i64);

impl Rate {
    pub const ZERO: Rate = Rate(0);

    pub fn per_hour(minor_units: i64) -> Self {
        Self(minor_units.max(0))
    }

    /// Parse a major-unit decimal ("12.50") into minor units per hour
    pub fn parse_major(text: &str) -> Result<Self, InputError> {
        let malformed = || InputError::MalformedRate(text.to_string());
        let trimmed = text.trim();
        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(malformed());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }
        // Sub-minor digits are only accepted when they are zero
        let (cents, rest) = if frac.len() > 2 { frac.split_at(2) } else { (frac, "") };
        if rest.bytes().any(|b| b != b'0') {
            return Err(malformed());
        }
        let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| malformed())? };
        let cents: i64 = format!("{cents:0<2}").parse().map_err(|_| malformed())?;
        whole.checked_mul(100).and_then(|w| w.checked_add(cents)).map(Rate).ok_or_else(malformed)
    }

    #[inline]
    pub fn minor_per_hour(&self) -> i64 {
        self.0
    }
}

/// Latest balances of a contact and the ledger version they were read at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub contact_id: ContactId,
    pub member_store: i64,
    pub pocket_store: i64,
    #[serde(rename = "id")]
    pub version: LedgerVersion,
}

impl BalanceSnapshot {
    /// Balance of a contact with no charge history
    pub fn zero(contact_id: ContactId) -> Self {
        Self { contact_id, member_store: 0, pocket_store: 0, version: LedgerVersion::NONE }
    }

    #[inline]
    pub fn is_overdrawn(&self) -> bool {
        self.pocket_store < 0
    }
}

/// A metered machine or tool, identified by its network origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub id: AccessPointId,
    pub short_name: String,
    pub member_rate: Rate,
    pub non_member_rate: Rate,
    pub non_member_perdiem: Option<i64>,
    pub operational: bool,
    pub open_hours_label: Option<String>,
}

impl AccessPoint {
    pub fn rate_for(&self, membership: Membership) -> Rate {
        match membership {
            Membership::Member => self.member_rate,
            Membership::NonMember => self.non_member_rate,
        }
    }

    /// Flat daily non-member fee, if one is configured
    pub fn perdiem(&self) -> Option<i64> {
        self.non_member_perdiem.filter(|fee| *fee > 0)
    }

    /// Event name prefix used for the open hours lookup
    pub fn open_hours_label(&self) -> &str {
        self.open_hours_label.as_deref().unwrap_or(&self.short_name)
    }
}

/// Ledger timestamp layout, local wall time
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

mod ledger_datetime {
    use super::DATETIME_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&dt.format(DATETIME_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, DATETIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// A debit not yet persisted by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub date: NaiveDate,
    #[serde(with = "ledger_datetime")]
    pub datetime: NaiveDateTime,
    pub contact_id: ContactId,
    pub is_debit: bool,
    #[serde(rename = "job_time")]
    pub job_minutes: JobMinutes,
    #[serde(rename = "machine_id")]
    pub access_point_id: AccessPointId,
    pub rate: Rate,
    pub amount: i64,
    pub member_store: i64,
    pub pocket_store: i64,
    pub prev_ledger_item: LedgerVersion,
    pub prev_member_store: i64,
    pub prev_pocket_store: i64,
    pub notes: String,
}

/// A persisted debit. Records are append-only: nothing in the crate hands
/// out mutable access once the ledger has assigned an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRecord {
    id: LedgerVersion,
    #[serde(flatten)]
    entry: LedgerEntry,
}

impl ChargeRecord {
    pub fn new(id: LedgerVersion, entry: LedgerEntry) -> Self {
        Self { id, entry }
    }

    pub fn id(&self) -> LedgerVersion {
        self.id
    }

    pub fn entry(&self) -> &LedgerEntry {
        &self.entry
    }

    pub fn amount(&self) -> i64 {
        self.entry.amount
    }

    pub fn contact_id(&self) -> ContactId {
        self.entry.contact_id
    }

    /// Balances after this record, versioned at this record
    pub fn balances(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            contact_id: self.entry.contact_id,
            member_store: self.entry.member_store,
            pocket_store: self.entry.pocket_store,
            version: self.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_id_accepts_8_to_10_chars() {
        assert!(CardId::parse("04A1B2C3").is_ok());
        assert!(CardId::parse("04A1B2C3D").is_ok());
        assert!(CardId::parse("04A1B2C3D4").is_ok());
    }

    #[test]
    fn test_card_id_rejects_other_lengths() {
        assert_eq!(CardId::parse("04A1B2C"), Err(InputError::CardLength { len: 7 }));
        assert_eq!(CardId::parse("04A1B2C3D4E"), Err(InputError::CardLength { len: 11 }));
        assert_eq!(CardId::parse(""), Err(InputError::CardLength { len: 0 }));
        assert_eq!(CardId::parse("04A1-2C3D"), Err(InputError::CardCharacters));
    }

    #[test]
    fn test_job_minutes_rejects_negative() {
        assert_eq!(JobMinutes::parse("42"), Ok(JobMinutes(42)));
        assert_eq!(JobMinutes::parse("0"), Ok(JobMinutes::ZERO));
        assert_eq!(JobMinutes::parse("-5"), Err(InputError::NegativeDuration(-5)));
        assert!(matches!(JobMinutes::parse("ten"), Err(InputError::MalformedDuration(_))));
        assert!(matches!(JobMinutes::parse("1.5"), Err(InputError::MalformedDuration(_))));
    }

    #[test]
    fn test_rate_parse_major() {
        assert_eq!(Rate::parse_major("12.50").unwrap().minor_per_hour(), 1250);
        assert_eq!(Rate::parse_major("14").unwrap().minor_per_hour(), 1400);
        assert_eq!(Rate::parse_major("0.5").unwrap().minor_per_hour(), 50);
        assert_eq!(Rate::parse_major(".75").unwrap().minor_per_hour(), 75);
        assert_eq!(Rate::parse_major("3.000").unwrap().minor_per_hour(), 300);
        assert!(Rate::parse_major("3.005").is_err());
        assert!(Rate::parse_major("-1.00").is_err());
        assert!(Rate::parse_major("").is_err());
        assert!(Rate::parse_major("abc").is_err());
    }

    #[test]
    fn test_membership_flag() {
        assert_eq!(Membership::from_flag("1"), Ok(Membership::Member));
        assert_eq!(Membership::from_flag("0"), Ok(Membership::NonMember));
        assert!(Membership::from_flag("yes").is_err());
    }

    #[test]
    fn test_perdiem_zero_means_unset() {
        let mut ap = AccessPoint {
            id: AccessPointId(3),
            short_name: "Laser".to_string(),
            member_rate: Rate::per_hour(600),
            non_member_rate: Rate::per_hour(1200),
            non_member_perdiem: Some(0),
            operational: true,
            open_hours_label: None,
        };
        assert_eq!(ap.perdiem(), None);
        ap.non_member_perdiem = Some(200);
        assert_eq!(ap.perdiem(), Some(200));
        assert_eq!(ap.open_hours_label(), "Laser");
    }
}
