//! Endpoint handlers for the ACME HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::prelude::*;
use chrono::Utc;
use openssl::x509::{X509Req, X509};
use tokio::task::JoinSet;

use crate::acme::{
    AccountCreation, AccountUpdate, FinalizeRequest, NewOrderRequest, WireAccount,
};
use crate::core::{
    Account, AccountStatus, AddOrderRequest, AuthzStatus, OrderStatus,
};
use crate::errors::Error;
use crate::jose;
use crate::policy;
use crate::problem::Problem;
use crate::trace;

use super::{
    map_not_found, HandlerResult, WebFrontEnd, WfeError, ACCT_PATH, NEW_ACCOUNT_PATH,
    NEW_AUTHZ_PATH, NEW_ORDER_PATH, NONCE_PATH, ORDER_PATH, REVOKE_CERT_PATH,
};

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response {
    (status, Json(serde_json::to_value(value).unwrap_or_default())).into_response()
}

pub(super) async fn directory(State(wfe): State<Arc<WebFrontEnd>>) -> HandlerResult {
    let directory = serde_json::json!({
        "newNonce": wfe.relative_path(NONCE_PATH),
        "newAccount": wfe.relative_path(NEW_ACCOUNT_PATH),
        "newOrder": wfe.relative_path(NEW_ORDER_PATH),
        "revokeCert": wfe.relative_path(REVOKE_CERT_PATH),
        "newAuthz": wfe.relative_path(NEW_AUTHZ_PATH),
        "random-string": wfe.tokenizer.next().await,
        "meta": {
            "externalAccountRequired": wfe.require_external_account,
        },
    });
    Ok(Json(directory).into_response())
}

pub(super) async fn new_nonce() -> StatusCode {
    // The Replay-Nonce header itself is added by the middleware.
    StatusCode::NO_CONTENT
}

pub(super) async fn health() -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        "{\"result\" : \"ok\"}",
    )
        .into_response()
}

pub(super) async fn not_found(uri: Uri) -> WfeError {
    Problem::not_found(format!("'{}' is not a path we know of", uri.path())).into()
}

pub(super) async fn new_account(
    State(wfe): State<Arc<WebFrontEnd>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let (jwk, payload) = wfe
        .verify_post_embedded_jwk(&headers, uri.path(), &body)
        .await?;
    let request: AccountCreation = serde_json::from_slice(&payload).map_err(|_| {
        info!("Incapable of parsing new-account JSON");
        Problem::malformed("Error unmarshaling JSON")
    })?;

    let pubkey = jwk
        .to_public_key()
        .map_err(|_| Problem::malformed("Error reading Key"))?;
    let key_id = jose::key_to_id(&pubkey).map_err(|err| {
        error!("Could not derive key id: {}", err);
        Problem::malformed("Error reading Key")
    })?;
    info!("Received new-account request for key {}", key_id);

    match wfe.db.get_account_by_id(&key_id).await {
        Ok(existing) => {
            // The account exists; hand it back with its URL.
            let location = wfe.relative_path(&format!("{}{}", ACCT_PATH, existing.id));
            let account = wire_account(&existing);
            let mut response = json_response(StatusCode::OK, &account);
            insert_location(&mut response, &location);
            return Ok(response);
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => {
            error!("Could not lookup account: {}", err);
            return Err(Problem::server_internal("Error looking up Account").into());
        }
    }

    // Account does not exist (RFC 8555 section 7.3.1)
    if request.only_return_existing {
        return Err(Problem::account_does_not_exist(
            "OnlyReturnExisting was set and Account does not exist",
        )
        .into());
    }

    if wfe.require_external_account
        && request
            .external_account_binding
            .as_ref()
            .map(|b| b.is_empty())
            .unwrap_or(true)
    {
        return Err(Problem::external_account_required(
            "This ACME server is configured to require a binding to another account",
        )
        .into());
    }

    let external_identifier = wfe
        .account_validator
        .validate(request.external_account_binding.as_ref())
        .await?;

    let account = Account {
        id: key_id,
        status: AccountStatus::Valid,
        contact: request.contact,
        key: jwk,
        created_at: Utc::now(),
        external_identifier: if external_identifier.is_empty() {
            None
        } else {
            Some(external_identifier)
        },
    };
    wfe.db.add_account(&account).await?;

    let location = wfe.relative_path(&format!("{}{}", ACCT_PATH, account.id));
    let mut response = json_response(StatusCode::CREATED, &wire_account(&account));
    insert_location(&mut response, &location);
    Ok(response)
}

pub(super) async fn update_account(
    State(wfe): State<Arc<WebFrontEnd>>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let post = wfe.verify_post(&headers, uri.path(), &body).await?;
    if post.account.id != id {
        return Err(Problem::unauthorized("Signing key does not match account URL").into());
    }
    if post.is_post_as_get {
        return Ok(json_response(StatusCode::OK, &wire_account(&post.account)));
    }
    let update: AccountUpdate =
        serde_json::from_slice(&post.body).map_err(|_| Problem::malformed("Error unmarshaling JSON"))?;

    // If this update carries no contacts and no deactivation, simply
    // return the existing account.
    let deactivating = update.status.as_deref() == Some("deactivated");
    if update.contact.is_empty() && !deactivating {
        if let Some(status) = update.status.as_deref() {
            // Account state machine, RFC 8555 section 7.1.2: clients may
            // only ever request deactivation.
            if !status.is_empty() && status != post.account.status.as_str() {
                return Err(Problem::malformed(format!(
                    "Invalid account status: {:?}",
                    status
                ))
                .into());
            }
        }
        return Ok(json_response(StatusCode::OK, &wire_account(&post.account)));
    }

    let mut account = post.account;
    if deactivating {
        if !update.contact.is_empty() {
            return Err(Problem::malformed("'status' can only be updated on its own").into());
        }
        account.status = AccountStatus::Deactivated;
    } else {
        account.contact = update.contact;
    }
    wfe.db.update_account(&account).await?;
    Ok(json_response(StatusCode::OK, &wire_account(&account)))
}

pub(super) async fn new_order(
    State(wfe): State<Arc<WebFrontEnd>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let post = wfe.verify_post(&headers, uri.path(), &body).await?;
    let request: NewOrderRequest = serde_json::from_slice(&post.body)
        .map_err(|_| Problem::malformed("Error unmarshaling JSON"))?;
    if request.identifiers.is_empty() {
        return Err(Problem::malformed("Cannot have 0 Identifiers in a Certificate").into());
    }
    let mut problems = vec![];
    for identifier in &request.identifiers {
        if let Err(problem) = policy::check_identifier(identifier) {
            problems.push(problem);
        }
    }
    match problems.len() {
        0 => {}
        1 => return Err(problems.remove(0).into()),
        _ => {
            return Err(Problem::compound("Multiple identifiers were rejected", problems).into())
        }
    }

    // Check whether valid or pending authorizations already exist, one
    // concurrent subtask per identifier. The first error cancels the rest.
    let mut subtasks = JoinSet::new();
    for identifier in request.identifiers.clone() {
        let wfe = wfe.clone();
        let account = post.account.clone();
        let trace_id = trace::current();
        subtasks.spawn(trace::scope(trace_id, async move {
            wfe.create_or_get_authorization(&account, &identifier).await
        }));
    }
    let mut authz_ids = Vec::with_capacity(request.identifiers.len());
    while let Some(joined) = subtasks.join_next().await {
        match joined {
            Ok(Ok(id)) => authz_ids.push(id),
            Ok(Err(err)) => {
                subtasks.abort_all();
                return Err(err);
            }
            Err(join_err) => {
                subtasks.abort_all();
                error!("Authorization subtask died: {}", join_err);
                return Err(WfeError::Internal(Error::unknown(join_err)));
            }
        }
    }

    let add_order = AddOrderRequest {
        expires: Utc::now() + chrono::Duration::hours(200),
        requested_not_before: request.not_before,
        requested_not_after: request.not_after,
        account_id: post.account.id.clone(),
        authz_ids,
    };
    let order_id = wfe.db.add_order(add_order).await?;
    let (order, _) = wfe.order_for_display(&order_id).await?;

    let location = wfe.relative_path(&format!("{}{}", ORDER_PATH, order_id));
    let mut response = json_response(StatusCode::CREATED, &order);
    insert_location(&mut response, &location);
    Ok(response)
}

pub(super) async fn post_order(
    State(wfe): State<Arc<WebFrontEnd>>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let (order, account_id) = wfe.order_for_display(&id).await?;
    let post = wfe.verify_post(&headers, uri.path(), &body).await?;
    if post.account.id != account_id {
        return Err(Problem::unauthorized("Not your Order").into());
    }
    Ok(order_response(&order))
}

pub(super) async fn get_order(
    State(wfe): State<Arc<WebFrontEnd>>,
    Path(id): Path<String>,
) -> HandlerResult {
    if wfe.prohibit_get {
        return Err(Problem::malformed_405("Use POST-as-GET").into());
    }
    debug!("GET on POST-as-GET resource: order");
    let (order, _) = wfe.order_for_display(&id).await?;
    Ok(order_response(&order))
}

fn order_response(order: &crate::acme::WireOrder) -> Response {
    let mut response = json_response(StatusCode::OK, order);
    if order.status == OrderStatus::Processing {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, header::HeaderValue::from_static("2"));
    }
    response
}

pub(super) async fn finalize_order(
    State(wfe): State<Arc<WebFrontEnd>>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let post = wfe.verify_post(&headers, uri.path(), &body).await?;
    let mut order = wfe
        .db
        .get_order_by_id(&id)
        .await
        .map_err(|err| map_not_found(err, Problem::not_found("Order does not exist")))?;
    if order.account_id != post.account.id {
        return Err(Problem::unauthorized("AccountID and Order AccountID do not match").into());
    }
    if order.status != OrderStatus::Ready {
        return Err(Problem::order_not_ready(format!(
            "Order Status is {}, not ready",
            order.status.as_str()
        ))
        .into());
    }

    let finalize: FinalizeRequest = serde_json::from_slice(&post.body)
        .map_err(|_| Problem::malformed("Error unmarshaling JSON"))?;
    let csr_bytes = BASE64_URL_SAFE_NO_PAD.decode(&finalize.csr).map_err(|err| {
        Problem::malformed(format!("Error decoding Base64url-encoded CSR: {}", err))
    })?;
    let csr = X509Req::from_der(&csr_bytes).map_err(|err| {
        Problem::malformed(format!("Error parsing Base64url-encoded CSR: {}", err))
    })?;

    // The order moves to processing before the CA is invoked.
    order.status = OrderStatus::Processing;
    wfe.db.update_order(&order).await?;
    wfe.ca.complete_order(&order, &csr).await?;

    if wfe.wait_for_issuance {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            info!("Waiting for certificate issuance until returning");
            order = wfe
                .db
                .get_order_by_id(&id)
                .await
                .map_err(|err| map_not_found(err, Problem::not_found("Order does not exist")))?;
            if order.status.is_terminal() {
                info!(
                    "Order reached terminal status {}, quit polling",
                    order.status.as_str()
                );
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let (order, _) = wfe.order_for_display(&id).await?;
    let mut response = json_response(StatusCode::OK, &order);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, header::HeaderValue::from_static("3"));
    Ok(response)
}

pub(super) async fn post_authz(
    State(wfe): State<Arc<WebFrontEnd>>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let post = wfe.verify_post(&headers, uri.path(), &body).await?;
    let authz = wfe.authz_json(&id, Some(&post.account.id)).await?;
    Ok(json_response(StatusCode::OK, &authz))
}

pub(super) async fn get_authz(
    State(wfe): State<Arc<WebFrontEnd>>,
    Path(id): Path<String>,
) -> HandlerResult {
    if wfe.prohibit_get {
        return Err(Problem::malformed_405("Use POST-as-GET").into());
    }
    debug!("GET on POST-as-GET resource: authz");
    let authz = wfe.authz_json(&id, None).await?;
    Ok(json_response(StatusCode::OK, &authz))
}

pub(super) async fn post_challenge(
    State(wfe): State<Arc<WebFrontEnd>>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let post = wfe.verify_post(&headers, uri.path(), &body).await?;
    if !post.is_post_as_get {
        return start_challenge(&wfe, post, &id).await;
    }
    // Not a POST with '{}' content as mandated by RFC 8555 section 7.5.1
    // but POST-as-GET with '' content. Tolerated, but clients should update.
    warn!("Unusual request: POST-as-GET request to challenge URL, expected '{{}}' payload");
    let challenge = wfe.challenge_json(&id).await?;
    Ok(json_response(StatusCode::OK, &challenge))
}

async fn start_challenge(
    wfe: &Arc<WebFrontEnd>,
    post: super::PostRequest,
    id: &str,
) -> HandlerResult {
    let (challenge, owning_account_id, authz_id) = wfe
        .db
        .get_challenge_by_id(id)
        .await
        .map_err(|err| map_not_found(err, Problem::not_found("Challenge does not exist")))?;
    if post.account.id != owning_account_id {
        return Err(Problem::unauthorized(
            "Account authenticating Request is not owner of the challenge",
        )
        .into());
    }
    let authz = wfe
        .db
        .get_authorization_by_id(&authz_id)
        .await
        .map_err(|err| map_not_found(err, Problem::not_found("Authorization does not exist")))?;
    if authz.expires < Utc::now() {
        if let Err(err) = wfe
            .db
            .update_authorization(None, &authz_id, AuthzStatus::Expired)
            .await
        {
            error!("Could not expire authorization {}: {}", authz_id, err);
        }
        return Err(Problem::malformed(format!(
            "The Authorization for {} is already expired",
            authz.identifier.value
        ))
        .into());
    }
    wfe.queue_validate_challenge(&challenge, &authz, &post.account.key)
        .await?;
    // Give the VA a moment to begin processing before the client polls.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let challenge = wfe.challenge_json(id).await?;
    Ok(json_response(StatusCode::OK, &challenge))
}

pub(super) async fn get_challenge(
    State(wfe): State<Arc<WebFrontEnd>>,
    Path(id): Path<String>,
) -> HandlerResult {
    if wfe.prohibit_get {
        return Err(Problem::malformed("Method not allowed").into());
    }
    debug!("GET on POST-as-GET resource: challenge");
    let (challenge, owning_account_id, authz_id) = wfe
        .db
        .get_challenge_by_id(&id)
        .await
        .map_err(|err| map_not_found(err, Problem::not_found("Challenge does not exist")))?;
    let authz = wfe
        .db
        .get_authorization_by_id(&authz_id)
        .await
        .map_err(|err| map_not_found(err, Problem::not_found("Authorization does not exist")))?;
    if authz.expires < Utc::now() {
        return Err(Problem::malformed(format!(
            "The Authorization for {} is already expired",
            authz.identifier.value
        ))
        .into());
    }
    let account = wfe.db.get_account_by_id(&owning_account_id).await?;
    wfe.queue_validate_challenge(&challenge, &authz, &account.key)
        .await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let challenge = wfe.challenge_json(&id).await?;
    Ok(json_response(StatusCode::OK, &challenge))
}

pub(super) async fn post_cert(
    State(wfe): State<Arc<WebFrontEnd>>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let post = wfe.verify_post(&headers, uri.path(), &body).await?;
    if !post.is_post_as_get {
        return Err(
            Problem::malformed("JWS signed payload should be empty for POST-as-GET").into(),
        );
    }
    // Certificate-account ownership is deliberately not checked:
    // certificates end up in CT logs and are a public resource anyway.
    certificate_response(&wfe, &id).await
}

pub(super) async fn get_cert(
    State(wfe): State<Arc<WebFrontEnd>>,
    Path(id): Path<String>,
) -> HandlerResult {
    if wfe.prohibit_get {
        return Err(Problem::malformed_405("Use POST-as-GET requests").into());
    }
    debug!("GET on POST-as-GET resource: cert");
    certificate_response(&wfe, &id).await
}

async fn certificate_response(wfe: &Arc<WebFrontEnd>, id: &str) -> HandlerResult {
    let (_, chain) = wfe
        .db
        .get_certificate_and_chain(id)
        .await
        .map_err(|err| map_not_found(err, Problem::not_found("Certificate does not exist")))?;
    let pem = chain_to_pem(&chain)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/pem-certificate-chain")],
        pem,
    )
        .into_response())
}

/// Renders a DER chain (leaf first) as PEM, omitting the root.
fn chain_to_pem(chain: &[Vec<u8>]) -> Result<Vec<u8>, WfeError> {
    let mut pem = Vec::new();
    let keep = if chain.len() > 1 {
        chain.len() - 1
    } else {
        chain.len()
    };
    for der in &chain[..keep] {
        let cert = X509::from_der(der)
            .map_err(|err| Error::Unknown(format!("could not parse stored certificate: {}", err)))?;
        let mut block = cert
            .to_pem()
            .map_err(|err| Error::Unknown(format!("could not encode certificate: {}", err)))?;
        pem.append(&mut block);
    }
    Ok(pem)
}

fn wire_account(account: &Account) -> WireAccount {
    WireAccount {
        status: account.status,
        contact: account.contact.clone(),
        key: account.key.clone(),
        orders: None,
    }
}

fn insert_location(response: &mut Response, location: &str) {
    if let Ok(value) = header::HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
}
