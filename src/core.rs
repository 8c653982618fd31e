//! Internal domain types shared by the WFE and the VA.
//!
//! Statuses are tagged variants; their RFC 8555 string spellings only
//! appear at the serde boundary and in the RPC marshalling layer.

use chrono::{DateTime, Utc};

use crate::jose::Jwk;
use crate::problem::Problem;

pub const IDENTIFIER_DNS: &str = "dns";
pub const CHALLENGE_HTTP01: &str = "http-01";
pub const HTTP01_BASE_URL: &str = ".well-known/acme-challenge/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Valid => "valid",
            AccountStatus::Deactivated => "deactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(AccountStatus::Valid),
            "deactivated" => Some(AccountStatus::Deactivated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "ready" => Some(OrderStatus::Ready),
            "processing" => Some(OrderStatus::Processing),
            "valid" => Some(OrderStatus::Valid),
            "invalid" => Some(OrderStatus::Invalid),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Valid | OrderStatus::Invalid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthzStatus {
    Pending,
    Valid,
    Invalid,
    Expired,
}

impl AuthzStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthzStatus::Pending => "pending",
            AuthzStatus::Valid => "valid",
            AuthzStatus::Invalid => "invalid",
            AuthzStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AuthzStatus::Pending),
            "valid" => Some(AuthzStatus::Valid),
            "invalid" => Some(AuthzStatus::Invalid),
            "expired" => Some(AuthzStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Processing => "processing",
            ChallengeStatus::Valid => "valid",
            ChallengeStatus::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChallengeStatus::Pending),
            "processing" => Some(ChallengeStatus::Processing),
            "valid" => Some(ChallengeStatus::Valid),
            "invalid" => Some(ChallengeStatus::Invalid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub id_type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Identifier {
            id_type: IDENTIFIER_DNS.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub status: AccountStatus,
    pub contact: Vec<String>,
    pub key: Jwk,
    pub created_at: DateTime<Utc>,
    pub external_identifier: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub expires: DateTime<Utc>,
    pub requested_not_before: Option<String>,
    pub requested_not_after: Option<String>,
    pub account_id: String,
    pub certificate_id: Option<String>,
    pub authz_ids: Vec<String>,
    pub identifiers: Vec<Identifier>,
    pub error: Option<Problem>,
}

#[derive(Debug, Clone)]
pub struct Authorization {
    pub id: String,
    pub status: AuthzStatus,
    pub identifier: Identifier,
    pub expires: DateTime<Utc>,
    pub account_id: String,
    pub challenges: Vec<Challenge>,
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub challenge_type: String,
    pub token: String,
    pub status: ChallengeStatus,
    pub validated_at: Option<DateTime<Utc>>,
    pub error: Option<Problem>,
    pub authz_id: String,
}

/// The internal representation of an issued certificate, owned by storage.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub id: String,
    pub der: Vec<u8>,
    pub issuer_name_hash: Vec<u8>,
    pub serial: Vec<u8>,
    pub revocation_time: Option<DateTime<Utc>>,
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct CaCertificate {
    pub id: String,
    pub der: Vec<u8>,
    pub name_hash: Vec<u8>,
    pub will_issue: bool,
    pub common_name: String,
}

/// Element of the verification queue between the WFE and the VA workers.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub challenge: Challenge,
    pub authorization: Authorization,
    pub account_jwk: Jwk,
    pub trace_id: String,
    pub retries: u32,
}

/// Adding an order is awkward to express with the full `Order` type, so it
/// gets its own exchange structure.
#[derive(Debug, Clone)]
pub struct AddOrderRequest {
    pub authz_ids: Vec<String>,
    pub expires: DateTime<Utc>,
    pub requested_not_before: Option<String>,
    pub requested_not_after: Option<String>,
    pub account_id: String,
}

#[derive(Debug, Clone)]
pub struct AddAuthz {
    pub challenges: Vec<AddChallenge>,
    pub expires: DateTime<Utc>,
    pub identifier: Identifier,
    pub account_id: String,
}

#[derive(Debug, Clone)]
pub struct AddChallenge {
    pub challenge_type: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_their_rfc_spellings() {
        for s in [
            OrderStatus::Pending,
            OrderStatus::Ready,
            OrderStatus::Processing,
            OrderStatus::Valid,
            OrderStatus::Invalid,
        ] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            AuthzStatus::Pending,
            AuthzStatus::Valid,
            AuthzStatus::Invalid,
            AuthzStatus::Expired,
        ] {
            assert_eq!(AuthzStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ChallengeStatus::parse("processing"), Some(ChallengeStatus::Processing));
        assert_eq!(AccountStatus::parse("deactivated"), Some(AccountStatus::Deactivated));
        assert_eq!(OrderStatus::parse("bogus"), None);
    }

    #[test]
    fn status_serde_uses_lowercase_strings() {
        assert_eq!(serde_json::to_string(&OrderStatus::Ready).unwrap(), "\"ready\"");
        assert_eq!(
            serde_json::from_str::<ChallengeStatus>("\"invalid\"").unwrap(),
            ChallengeStatus::Invalid
        );
    }
}
