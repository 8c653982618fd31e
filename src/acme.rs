//! Wire-facing ACME resource documents and request payloads.
//!
//! These carry the RFC 8555 JSON shapes; the WFE converts internal types
//! into them and fills in absolute URLs.

use std::collections::HashMap;

use crate::core::{AccountStatus, AuthzStatus, ChallengeStatus, Identifier, OrderStatus};
use crate::jose::Jwk;
use crate::problem::Problem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAccount {
    pub status: AccountStatus,
    pub contact: Vec<String>,
    pub key: Jwk,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOrder {
    pub status: OrderStatus,
    pub expires: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub identifiers: Vec<Identifier>,
    pub finalize: String,
    #[serde(rename = "notBefore", skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,
    #[serde(rename = "notAfter", skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
    pub authorizations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAuthorization {
    pub status: AuthzStatus,
    pub identifier: Identifier,
    pub challenges: Vec<WireChallenge>,
    pub expires: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireChallenge {
    #[serde(rename = "type")]
    pub challenge_type: String,
    pub url: String,
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

/// Account creation payload, RFC 8555 section 7.3. Terms-of-service
/// agreement is not modelled; this is an enterprise-internal CA.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountCreation {
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(rename = "externalAccountBinding", default)]
    pub external_account_binding: Option<HashMap<String, serde_json::Value>>,
    #[serde(rename = "onlyReturnExisting", default)]
    pub only_return_existing: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountUpdate {
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrderRequest {
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(rename = "notBefore", default)]
    pub not_before: Option<String>,
    #[serde(rename = "notAfter", default)]
    pub not_after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinalizeRequest {
    pub csr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevokeRequest {
    pub certificate: String,
}

/// The RFC 8555 section 8.1 expected key authorization: the challenge
/// token joined with the base64url SHA-256 thumbprint of the account key.
pub fn key_authorization(token: &str, key: &Jwk) -> Result<String, String> {
    Ok(format!("{}.{}", token, key.thumbprint()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::testutil;

    #[test]
    fn key_authorization_is_token_dot_thumbprint() {
        let jwk = testutil::public_jwk(&testutil::rsa_key());
        let ka = key_authorization("tok", &jwk).unwrap();
        let (tok, thumb) = ka.split_once('.').unwrap();
        assert_eq!(tok, "tok");
        assert_eq!(thumb, jwk.thumbprint().unwrap());
    }

    #[test]
    fn account_creation_parses_rfc_field_names() {
        let payload: AccountCreation = serde_json::from_str(
            r#"{"contact": ["mailto:x@example.test"], "onlyReturnExisting": true}"#,
        )
        .unwrap();
        assert!(payload.only_return_existing);
        assert_eq!(payload.contact.len(), 1);
    }

    #[test]
    fn wire_order_drops_empty_optionals() {
        let order = WireOrder {
            status: OrderStatus::Pending,
            expires: "2026-01-01T00:00:00Z".to_string(),
            identifiers: vec![],
            finalize: "https://x/finalize-order/1".to_string(),
            not_before: None,
            not_after: None,
            authorizations: vec!["https://x/authZ/1".to_string()],
            certificate: None,
            error: None,
        };
        let v = serde_json::to_value(&order).unwrap();
        assert!(v.get("notBefore").is_none());
        assert!(v.get("certificate").is_none());
        assert_eq!(v["status"], "pending");
    }

    #[test]
    fn wire_account_round_trips() {
        let account = WireAccount {
            status: AccountStatus::Valid,
            contact: vec!["mailto:a@example.test".to_string(), "mailto:b@example.test".to_string()],
            key: testutil::public_jwk(&testutil::rsa_key()),
            orders: None,
        };
        let json = serde_json::to_string(&account).unwrap();
        let back: WireAccount = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, AccountStatus::Valid);
        assert_eq!(back.key, account.key);
        let mut contacts = back.contact.clone();
        contacts.sort();
        assert_eq!(contacts, account.contact);
    }
}
