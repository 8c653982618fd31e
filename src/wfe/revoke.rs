//! Certificate revocation (RFC 8555 section 7.6).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use base64::prelude::*;
use openssl::hash::MessageDigest;
use openssl::x509::X509;

use crate::acme::RevokeRequest;
use crate::errors::Error;
use crate::problem::Problem;

use super::{map_not_found, HandlerResult, WebFrontEnd};

pub(super) async fn revoke_cert(
    State(wfe): State<Arc<WebFrontEnd>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let (jwk, payload) = wfe
        .verify_post_embedded_jwk(&headers, uri.path(), &body)
        .await?;
    let request: RevokeRequest = serde_json::from_slice(&payload)
        .map_err(|_| Problem::malformed("Error unmarshaling JSON"))?;

    let cert_der = BASE64_URL_SAFE_NO_PAD
        .decode(&request.certificate)
        .map_err(|err| {
            Problem::malformed(format!("Error decoding Base64url-encoded certificate: {}", err))
        })?;
    let cert = X509::from_der(&cert_der)
        .map_err(|err| Problem::malformed(format!("Error parsing certificate: {}", err)))?;

    let issuer_der = cert
        .issuer_name()
        .to_der()
        .map_err(|err| Error::Unknown(format!("could not encode issuer name: {}", err)))?;
    let issuer_name_hash = openssl::hash::hash(MessageDigest::sha1(), &issuer_der)
        .map_err(|err| Error::Unknown(format!("could not hash issuer name: {}", err)))?;
    let serial = cert
        .serial_number()
        .to_bn()
        .map(|bn| bn.to_vec())
        .map_err(|err| Error::Unknown(format!("could not read serial: {}", err)))?;

    let stored = wfe
        .db
        .get_certificate_by_serial(&serial, &issuer_name_hash)
        .await
        .map_err(|err| {
            map_not_found(err, Problem::not_found("This Certificate was not issued here"))
        })?;

    if let Some(revoked_at) = stored.revocation_time {
        return Err(Problem::already_revoked(revoked_at).into());
    }

    // Revocation is authorized iff the JWS is signed with the
    // certificate's own key.
    let jws_key = jwk
        .to_public_key()
        .map_err(|_| Problem::malformed("Error reading Key"))?;
    let stored_cert = X509::from_der(&stored.der)
        .map_err(|err| Error::Unknown(format!("could not parse stored certificate: {}", err)))?;
    let cert_key = stored_cert
        .public_key()
        .map_err(|err| Error::Unknown(format!("could not read certificate key: {}", err)))?;
    if !cert_key.public_eq(&jws_key) {
        debug!("Unauthorized revoke-cert request for serial {}", hex::encode(&serial));
        return Err(Problem::unauthorized("Cert Key does not match JWS Key").into());
    }

    info!("Revoking certificate {}", stored.id);
    wfe.db.revoke_certificate(&stored.id, 0).await?;
    Ok(StatusCode::OK.into_response())
}
