//! Access verdicts and the error code table shown by access point UIs
//!
//! Codes below 0x80 are sent before a card holder is identified, codes at or
//! above it after. The UI uses the partition to pick the "no session" flow
//! (no goodbye screen) or the logged-in flow.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

/// First code value of the post-authentication partition
pub const POST_AUTH_THRESHOLD: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0x00,
    UnrecognizedAccessPoint = 0x01,
    UpstreamUnreachable = 0x02,
    InvalidInput = 0x03,
    OutOfService = 0x04,
    UnknownCard = 0x80,
    ServiceUnavailable = 0x81,
    RestrictedOutsideHours = 0x82,
    ConnectivityUnknown = 0x83,
    Overdrawn = 0x84,
    InsufficientBalance = 0x85,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 11] = [
        ErrorCode::Ok,
        ErrorCode::UnrecognizedAccessPoint,
        ErrorCode::UpstreamUnreachable,
        ErrorCode::InvalidInput,
        ErrorCode::OutOfService,
        ErrorCode::UnknownCard,
        ErrorCode::ServiceUnavailable,
        ErrorCode::RestrictedOutsideHours,
        ErrorCode::ConnectivityUnknown,
        ErrorCode::Overdrawn,
        ErrorCode::InsufficientBalance,
    ];

    #[inline]
    pub fn value(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn is_post_auth(self) -> bool {
        self.value() >= POST_AUTH_THRESHOLD
    }

    /// Snake-case name used in logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::UnrecognizedAccessPoint => "unrecognized_access_point",
            ErrorCode::UpstreamUnreachable => "upstream_unreachable",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::OutOfService => "out_of_service",
            ErrorCode::UnknownCard => "unknown_card",
            ErrorCode::ServiceUnavailable => "service_unavailable",
            ErrorCode::RestrictedOutsideHours => "restricted_outside_hours",
            ErrorCode::ConnectivityUnknown => "connectivity_unknown",
            ErrorCode::Overdrawn => "overdrawn",
            ErrorCode::InsufficientBalance => "insufficient_balance",
        }
    }
}

/// Wire form: "x" followed by two hex digits, e.g. "x83"
impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "x{:02x}", self.value())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('x').ok_or_else(|| format!("missing x prefix: {s}"))?;
        let value = u8::from_str_radix(hex, 16).map_err(|_| format!("bad error code: {s}"))?;
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.value() == value)
            .ok_or_else(|| format!("unknown error code: {s}"))
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Terminal state of the access state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    #[serde(serialize_with = "serialize_access")]
    pub access: bool,
    pub error_code: ErrorCode,
}

fn serialize_access<S: Serializer>(access: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*access))
}

impl Decision {
    pub const fn grant() -> Self {
        Self { access: true, error_code: ErrorCode::Ok }
    }

    pub const fn deny(error_code: ErrorCode) -> Self {
        Self { access: false, error_code }
    }

    #[inline]
    pub fn is_granted(&self) -> bool {
        self.access
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition() {
        for code in ErrorCode::ALL {
            let expected = matches!(
                code,
                ErrorCode::UnknownCard
                    | ErrorCode::ServiceUnavailable
                    | ErrorCode::RestrictedOutsideHours
                    | ErrorCode::ConnectivityUnknown
                    | ErrorCode::Overdrawn
                    | ErrorCode::InsufficientBalance
            );
            assert_eq!(code.is_post_auth(), expected, "{}", code.as_str());
        }
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(ErrorCode::Ok.to_string(), "x00");
        assert_eq!(ErrorCode::ConnectivityUnknown.to_string(), "x83");
        assert_eq!("x84".parse::<ErrorCode>().unwrap(), ErrorCode::Overdrawn);
        assert!("x7f".parse::<ErrorCode>().is_err());
        assert!("84".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn test_decision_json() {
        let json = serde_json::to_value(Decision::deny(ErrorCode::UnknownCard)).unwrap();
        assert_eq!(json["access"], 0);
        assert_eq!(json["error_code"], "x80");
        assert_eq!(serde_json::to_value(Decision::grant()).unwrap()["access"], 1);
    }
}
