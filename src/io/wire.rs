//! Collaborator row formats
//!
//! The directory and ledger were built on a CRM that reports most numbers as
//! JSON strings. Rows are decoded leniently here and converted into domain
//! types exactly once; nothing downstream sees raw text.

use crate::domain::types::{parse_id, parse_minor_units};
use crate::domain::{
    AccessPoint, AccessPointId, ChargeRecord, Contact, ContactId, InputError, JobMinutes,
    LedgerEntry, LedgerVersion, Membership, Rate,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// JSON value that may be a number or numeric text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumOrText {
    Int(i64),
    Float(f64),
    Text(String),
}

impl NumOrText {
    pub fn to_i64(&self) -> Result<i64, InputError> {
        match self {
            NumOrText::Int(v) => Ok(*v),
            NumOrText::Float(v) if v.fract() == 0.0 => Ok(*v as i64),
            NumOrText::Float(v) => Err(InputError::MalformedAmount(v.to_string())),
            NumOrText::Text(t) => parse_minor_units(t),
        }
    }

    pub fn to_u64(&self) -> Result<u64, InputError> {
        match self {
            NumOrText::Int(v) => u64::try_from(*v).map_err(|_| InputError::MalformedId(v.to_string())),
            NumOrText::Float(v) => Err(InputError::MalformedId(v.to_string())),
            NumOrText::Text(t) => parse_id(t),
        }
    }

    /// Major-unit hourly rate ("12.50", 12.5, 12) into minor units
    pub fn to_rate(&self) -> Result<Rate, InputError> {
        match self {
            NumOrText::Int(v) => Rate::parse_major(&v.to_string()),
            NumOrText::Float(v) => Rate::parse_major(&format!("{v:.2}")),
            NumOrText::Text(t) => Rate::parse_major(t),
        }
    }

    /// Empty text means "not set"
    fn is_blank(&self) -> bool {
        matches!(self, NumOrText::Text(t) if t.trim().is_empty())
    }
}

/// Boolean that may arrive as true/false, 0/1 or "0"/"1"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Flag {
    pub fn to_bool(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Int(v) => *v != 0,
            Flag::Text(t) => matches!(t.trim(), "1" | "true" | "True"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPointRow {
    pub id: NumOrText,
    #[serde(alias = "short_name")]
    pub ap_short_name: String,
    #[serde(alias = ".member_rate")]
    pub member_rate: NumOrText,
    #[serde(alias = ".non_member_rate")]
    pub non_member_rate: NumOrText,
    #[serde(default, alias = ".non_member_perdiem")]
    pub non_member_perdiem: Option<NumOrText>,
    #[serde(default)]
    pub operational: Option<Flag>,
    #[serde(default)]
    pub open_hours_label: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

impl TryFrom<AccessPointRow> for AccessPoint {
    type Error = InputError;

    fn try_from(row: AccessPointRow) -> Result<Self, Self::Error> {
        let non_member_perdiem = match row.non_member_perdiem {
            Some(ref fee) if !fee.is_blank() => Some(fee.to_i64()?),
            _ => None,
        };
        Ok(AccessPoint {
            id: AccessPointId(row.id.to_u64()?),
            short_name: row.ap_short_name,
            member_rate: row.member_rate.to_rate()?,
            non_member_rate: row.non_member_rate.to_rate()?,
            non_member_perdiem,
            operational: row.operational.map(|f| f.to_bool()).unwrap_or(true),
            open_hours_label: row.open_hours_label.filter(|l| !l.trim().is_empty()),
        })
    }
}

/// Rate in the directory's decimal major-unit text form, e.g. "12.50"
fn major_text(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let minor = minor.unsigned_abs();
    format!("{sign}{}.{:02}", minor / 100, minor % 100)
}

impl From<&AccessPoint> for AccessPointRow {
    fn from(ap: &AccessPoint) -> Self {
        AccessPointRow {
            id: NumOrText::Int(ap.id.0 as i64),
            ap_short_name: ap.short_name.clone(),
            member_rate: NumOrText::Text(major_text(ap.member_rate.minor_per_hour())),
            non_member_rate: NumOrText::Text(major_text(ap.non_member_rate.minor_per_hour())),
            non_member_perdiem: ap.non_member_perdiem.map(NumOrText::Int),
            operational: Some(Flag::Bool(ap.operational)),
            open_hours_label: ap.open_hours_label.clone(),
            ip_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRow {
    pub contact_id: NumOrText,
    pub display_name: String,
    pub member_status: NumOrText,
    #[serde(default)]
    pub card: Option<String>,
}

impl TryFrom<ContactRow> for Contact {
    type Error = InputError;

    fn try_from(row: ContactRow) -> Result<Self, Self::Error> {
        let flag = match row.member_status {
            NumOrText::Int(v) => v.to_string(),
            NumOrText::Float(v) => v.to_string(),
            NumOrText::Text(t) => t,
        };
        Ok(Contact {
            id: ContactId(row.contact_id.to_u64()?),
            display_name: row.display_name,
            membership: Membership::from_flag(&flag)?,
        })
    }
}

impl From<&Contact> for ContactRow {
    fn from(contact: &Contact) -> Self {
        let flag = if contact.membership.is_member() { "1" } else { "0" };
        ContactRow {
            contact_id: NumOrText::Int(contact.id.0 as i64),
            display_name: contact.display_name.clone(),
            member_status: NumOrText::Text(flag.to_string()),
            card: None,
        }
    }
}

/// Per access point UI label for an error code key ("x83")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLabel {
    pub error_key: String,
    pub error_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerItemRow {
    pub id: NumOrText,
    pub date: String,
    pub datetime: String,
    pub contact_id: NumOrText,
    pub is_debit: Flag,
    pub job_time: NumOrText,
    pub machine_id: NumOrText,
    pub rate: NumOrText,
    pub amount: NumOrText,
    pub member_store: NumOrText,
    pub pocket_store: NumOrText,
    pub prev_ledger_item: NumOrText,
    pub prev_member_store: NumOrText,
    pub prev_pocket_store: NumOrText,
    #[serde(default)]
    pub notes: Option<String>,
}

fn parse_date(text: &str) -> Result<NaiveDate, InputError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|_| InputError::MalformedTimestamp(text.to_string()))
}

fn parse_datetime(text: &str) -> Result<NaiveDateTime, InputError> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, crate::domain::types::DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| InputError::MalformedTimestamp(text.to_string()))
}

impl TryFrom<LedgerItemRow> for ChargeRecord {
    type Error = InputError;

    fn try_from(row: LedgerItemRow) -> Result<Self, Self::Error> {
        let job_minutes = u32::try_from(row.job_time.to_i64()?)
            .map_err(|_| InputError::MalformedDuration(format!("{:?}", row.job_time)))?;
        let entry = LedgerEntry {
            date: parse_date(&row.date)?,
            datetime: parse_datetime(&row.datetime)?,
            contact_id: ContactId(row.contact_id.to_u64()?),
            is_debit: row.is_debit.to_bool(),
            job_minutes: JobMinutes(job_minutes),
            access_point_id: AccessPointId(row.machine_id.to_u64()?),
            rate: Rate::per_hour(row.rate.to_i64()?),
            amount: row.amount.to_i64()?,
            member_store: row.member_store.to_i64()?,
            pocket_store: row.pocket_store.to_i64()?,
            prev_ledger_item: LedgerVersion(row.prev_ledger_item.to_u64()?),
            prev_member_store: row.prev_member_store.to_i64()?,
            prev_pocket_store: row.prev_pocket_store.to_i64()?,
            notes: row.notes.unwrap_or_default(),
        };
        Ok(ChargeRecord::new(LedgerVersion(row.id.to_u64()?), entry))
    }
}
