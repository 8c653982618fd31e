//! Conversions between the wire (proto) and internal representations.

use chrono::{DateTime, TimeZone, Utc};
use prost_wkt_types::Timestamp;

use crate::certmesh_proto as pb;
use crate::core::{
    Account, AccountStatus, Authorization, AuthzStatus, CaCertificate, Certificate, Challenge,
    ChallengeStatus, Identifier, Order, OrderStatus, VerificationRequest,
};
use crate::errors::Error;
use crate::jose::Jwk;
use crate::problem::Problem;

pub fn datetime_to_ts(t: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

pub fn ts_to_datetime(ts: &Timestamp) -> Result<DateTime<Utc>, Error> {
    Utc.timestamp_opt(ts.seconds, ts.nanos as u32)
        .single()
        .ok_or_else(|| Error::Unknown("timestamp out of range".to_string()))
}

fn parse_required_ts(ts: &Option<Timestamp>, what: &str) -> Result<DateTime<Utc>, Error> {
    match ts {
        Some(ts) => ts_to_datetime(ts),
        None => Err(Error::Unknown(format!("{} is missing its timestamp", what))),
    }
}

fn opt_string(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

pub fn problem_to_proto(p: &Problem) -> pb::Problem {
    pb::Problem {
        r#type: p.error_type.clone(),
        detail: p.detail.clone(),
        status: p.http_status as i32,
    }
}

pub fn proto_to_problem(p: &pb::Problem) -> Problem {
    let mut problem = Problem::server_internal("");
    problem.error_type = p.r#type.clone();
    problem.detail = p.detail.clone();
    problem.http_status = p.status as u16;
    problem
}

pub fn account_to_proto(account: &Account) -> Result<pb::Account, Error> {
    let key = serde_json::to_string(&account.key)
        .map_err(|e| Error::Unknown(format!("could not marshal account key: {}", e)))?;
    Ok(pb::Account {
        id: account.id.clone(),
        status: account.status.as_str().to_string(),
        contact: account.contact.clone(),
        key,
        created_at: Some(datetime_to_ts(account.created_at)),
        external_identifier: account.external_identifier.clone().unwrap_or_default(),
    })
}

pub fn proto_to_account(account: pb::Account) -> Result<Account, Error> {
    let status = AccountStatus::parse(&account.status)
        .ok_or_else(|| Error::Unknown(format!("bad account status '{}'", account.status)))?;
    let key: Jwk = serde_json::from_str(&account.key)
        .map_err(|e| Error::Unknown(format!("could not parse account key: {}", e)))?;
    Ok(Account {
        id: account.id,
        status,
        contact: account.contact,
        key,
        created_at: parse_required_ts(&account.created_at, "account")?,
        external_identifier: opt_string(account.external_identifier),
    })
}

pub fn challenge_to_proto(challenge: &Challenge) -> pb::Challenge {
    pb::Challenge {
        id: challenge.id.clone(),
        r#type: challenge.challenge_type.clone(),
        token: challenge.token.clone(),
        status: challenge.status.as_str().to_string(),
        validated_at: challenge.validated_at.map(datetime_to_ts),
        error: challenge.error.as_ref().map(problem_to_proto),
        authz_id: challenge.authz_id.clone(),
    }
}

pub fn proto_to_challenge(challenge: pb::Challenge) -> Result<Challenge, Error> {
    let status = ChallengeStatus::parse(&challenge.status)
        .ok_or_else(|| Error::Unknown(format!("bad challenge status '{}'", challenge.status)))?;
    let validated_at = match &challenge.validated_at {
        Some(ts) => Some(ts_to_datetime(ts)?),
        None => None,
    };
    Ok(Challenge {
        id: challenge.id,
        challenge_type: challenge.r#type,
        token: challenge.token,
        status,
        validated_at,
        error: challenge.error.as_ref().map(proto_to_problem),
        authz_id: challenge.authz_id,
    })
}

pub fn identifier_to_proto(identifier: &Identifier) -> pb::Identifier {
    pb::Identifier {
        r#type: identifier.id_type.clone(),
        value: identifier.value.clone(),
    }
}

pub fn proto_to_identifier(identifier: pb::Identifier) -> Identifier {
    Identifier {
        id_type: identifier.r#type,
        value: identifier.value,
    }
}

pub fn authorization_to_proto(authz: &Authorization) -> pb::Authorization {
    pb::Authorization {
        id: authz.id.clone(),
        status: authz.status.as_str().to_string(),
        identifier: Some(identifier_to_proto(&authz.identifier)),
        expires: Some(datetime_to_ts(authz.expires)),
        account_id: authz.account_id.clone(),
        challenges: authz.challenges.iter().map(challenge_to_proto).collect(),
    }
}

pub fn proto_to_authorization(authz: pb::Authorization) -> Result<Authorization, Error> {
    let status = AuthzStatus::parse(&authz.status)
        .ok_or_else(|| Error::Unknown(format!("bad authorization status '{}'", authz.status)))?;
    let expires = parse_required_ts(&authz.expires, "authorization")?;
    let identifier = authz
        .identifier
        .map(proto_to_identifier)
        .ok_or_else(|| Error::Unknown("authorization is missing its identifier".to_string()))?;
    let challenges = authz
        .challenges
        .into_iter()
        .map(proto_to_challenge)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Authorization {
        id: authz.id,
        status,
        identifier,
        expires,
        account_id: authz.account_id,
        challenges,
    })
}

pub fn order_to_proto(order: &Order) -> pb::Order {
    pb::Order {
        id: order.id.clone(),
        status: order.status.as_str().to_string(),
        expires: Some(datetime_to_ts(order.expires)),
        requested_not_before: order.requested_not_before.clone().unwrap_or_default(),
        requested_not_after: order.requested_not_after.clone().unwrap_or_default(),
        account_id: order.account_id.clone(),
        certificate_id: order.certificate_id.clone().unwrap_or_default(),
        authz_ids: order.authz_ids.clone(),
        identifiers: order.identifiers.iter().map(identifier_to_proto).collect(),
        error: order.error.as_ref().map(problem_to_proto),
    }
}

pub fn proto_to_order(order: pb::Order) -> Result<Order, Error> {
    let status = OrderStatus::parse(&order.status)
        .ok_or_else(|| Error::Unknown(format!("bad order status '{}'", order.status)))?;
    let expires = parse_required_ts(&order.expires, "order")?;
    Ok(Order {
        id: order.id,
        status,
        expires,
        requested_not_before: opt_string(order.requested_not_before),
        requested_not_after: opt_string(order.requested_not_after),
        account_id: order.account_id,
        certificate_id: opt_string(order.certificate_id),
        authz_ids: order.authz_ids,
        identifiers: order.identifiers.into_iter().map(proto_to_identifier).collect(),
        error: order.error.as_ref().map(proto_to_problem),
    })
}

pub fn proto_to_certificate(cert: pb::Certificate) -> Result<Certificate, Error> {
    let revocation_time = match &cert.revocation_time {
        Some(ts) => Some(ts_to_datetime(ts)?),
        None => None,
    };
    Ok(Certificate {
        id: cert.id,
        der: cert.der,
        issuer_name_hash: cert.issuer_name_hash,
        serial: cert.serial,
        revocation_time,
        order_id: cert.order_id,
    })
}

pub fn proto_to_ca_certificate(cert: pb::CaCertificate) -> CaCertificate {
    CaCertificate {
        id: cert.id,
        der: cert.der,
        name_hash: cert.name_hash,
        will_issue: cert.will_issue,
        common_name: cert.common_name,
    }
}

pub fn validation_to_proto(req: &VerificationRequest) -> Result<pb::ValidationMessage, Error> {
    let account_jwk = serde_json::to_string(&req.account_jwk)
        .map_err(|e| Error::Unknown(format!("could not marshal account key: {}", e)))?;
    Ok(pb::ValidationMessage {
        challenge: Some(challenge_to_proto(&req.challenge)),
        authorization: Some(authorization_to_proto(&req.authorization)),
        account_jwk,
    })
}

/// Builds a fresh `VerificationRequest` from the wire form. The trace id is
/// carried in RPC metadata and filled in by the caller; retries start at 0.
pub fn proto_to_validation(msg: pb::ValidationMessage) -> Result<VerificationRequest, Error> {
    let challenge = msg
        .challenge
        .ok_or_else(|| Error::Unknown("validation message is missing its challenge".to_string()))?;
    let authorization = msg.authorization.ok_or_else(|| {
        Error::Unknown("validation message is missing its authorization".to_string())
    })?;
    let account_jwk: Jwk = serde_json::from_str(&msg.account_jwk)
        .map_err(|e| Error::Unknown(format!("could not parse account key: {}", e)))?;
    Ok(VerificationRequest {
        challenge: proto_to_challenge(challenge)?,
        authorization: proto_to_authorization(authorization)?,
        account_jwk,
        trace_id: String::new(),
        retries: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::testutil;

    fn sample_account() -> Account {
        Account {
            id: "aabbcc".to_string(),
            status: AccountStatus::Valid,
            contact: vec!["mailto:ops@example.test".to_string()],
            key: testutil::public_jwk(&testutil::rsa_key()),
            created_at: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
            external_identifier: Some("user-1".to_string()),
        }
    }

    fn sample_authorization() -> Authorization {
        Authorization {
            id: "authz-1".to_string(),
            status: AuthzStatus::Pending,
            identifier: Identifier::dns("example.test"),
            expires: Utc.with_ymd_and_hms(2026, 5, 9, 12, 0, 0).unwrap(),
            account_id: "aabbcc".to_string(),
            challenges: vec![Challenge {
                id: "chal-1".to_string(),
                challenge_type: "http-01".to_string(),
                token: "tok".to_string(),
                status: ChallengeStatus::Pending,
                validated_at: None,
                error: None,
                authz_id: "authz-1".to_string(),
            }],
        }
    }

    #[test]
    fn account_round_trips() {
        let account = sample_account();
        let back = proto_to_account(account_to_proto(&account).unwrap()).unwrap();
        assert_eq!(back.id, account.id);
        assert_eq!(back.status, account.status);
        assert_eq!(back.key, account.key);
        assert_eq!(back.created_at, account.created_at);
        assert_eq!(back.external_identifier, account.external_identifier);
        let mut contacts = back.contact.clone();
        contacts.sort();
        assert_eq!(contacts, account.contact);
    }

    #[test]
    fn authorization_round_trips() {
        let authz = sample_authorization();
        let back = proto_to_authorization(authorization_to_proto(&authz)).unwrap();
        assert_eq!(back.id, authz.id);
        assert_eq!(back.status, authz.status);
        assert_eq!(back.identifier, authz.identifier);
        assert_eq!(back.challenges.len(), 1);
        assert_eq!(back.challenges[0].token, "tok");
    }

    #[test]
    fn order_round_trips_with_optionals() {
        let order = Order {
            id: "order-1".to_string(),
            status: OrderStatus::Ready,
            expires: Utc.with_ymd_and_hms(2026, 5, 9, 12, 0, 0).unwrap(),
            requested_not_before: None,
            requested_not_after: Some("2026-06-01T00:00:00Z".to_string()),
            account_id: "aabbcc".to_string(),
            certificate_id: None,
            authz_ids: vec!["authz-1".to_string()],
            identifiers: vec![Identifier::dns("example.test")],
            error: None,
        };
        let back = proto_to_order(order_to_proto(&order)).unwrap();
        assert_eq!(back.status, OrderStatus::Ready);
        assert_eq!(back.requested_not_before, None);
        assert_eq!(back.requested_not_after, order.requested_not_after);
        assert_eq!(back.certificate_id, None);
        assert_eq!(back.identifiers, order.identifiers);
    }

    #[test]
    fn bad_status_strings_are_unknown_errors() {
        let mut proto = account_to_proto(&sample_account()).unwrap();
        proto.status = "sideways".to_string();
        assert!(proto_to_account(proto).is_err());
    }

    #[test]
    fn validation_message_round_trips() {
        let req = VerificationRequest {
            challenge: sample_authorization().challenges[0].clone(),
            authorization: sample_authorization(),
            account_jwk: testutil::public_jwk(&testutil::rsa_key()),
            trace_id: "tid".to_string(),
            retries: 3,
        };
        let back = proto_to_validation(validation_to_proto(&req).unwrap()).unwrap();
        assert_eq!(back.challenge.id, req.challenge.id);
        assert_eq!(back.account_jwk, req.account_jwk);
        // Trace rides in metadata and retries restart on the receiving side.
        assert_eq!(back.trace_id, "");
        assert_eq!(back.retries, 0);
    }
}
