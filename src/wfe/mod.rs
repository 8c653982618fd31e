//! The ACME web front-end: request authentication, routing and the
//! resource lifecycle handlers.

pub mod handlers;
pub mod revoke;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use openssl::pkey::{PKeyRef, Public};
use openssl::x509::X509Req;
use tower_http::catch_panic::CatchPanicLayer;

use crate::acme::{WireAuthorization, WireChallenge, WireOrder};
use crate::core::{
    Account, AccountStatus, AddAuthz, AddChallenge, Authorization, Challenge, Identifier, Order,
    VerificationRequest, CHALLENGE_HTTP01,
};
use crate::errors::Error;
use crate::external::AccountValidator;
use crate::jose::{self, Jwk, ParsedJws};
use crate::nonce::{MemoryNoncer, NonceService};
use crate::problem::Problem;
use crate::storage::{self, Storage};
use crate::token::Tokenizer;
use crate::trace;
use crate::va::ValidationAuthority;

// Note: we deliberately pick endpoint paths that differ from Boulder to
// exercise clients' processing of the /dir response.
pub const DIRECTORY_PATH: &str = "/dir";
pub const NONCE_PATH: &str = "/new-nonce";
pub const NEW_ACCOUNT_PATH: &str = "/new-acct";
pub const NEW_AUTHZ_PATH: &str = "/new-authz";
pub const ACCT_PATH: &str = "/acct/";
pub const NEW_ORDER_PATH: &str = "/new-order";
pub const ORDER_PATH: &str = "/order/";
pub const ORDER_FINALIZE_PATH: &str = "/finalize-order/";
pub const AUTHZ_PATH: &str = "/authZ/";
pub const CHALLENGE_PATH: &str = "/chalZ/";
pub const CERT_PATH: &str = "/certZ/";
pub const REVOKE_CERT_PATH: &str = "/revoke-cert";
pub const HEALTH_PATH: &str = "/health";

// POST requests MUST have this content type (RFC 8555 section 6.2)
const EXPECTED_JWS_CONTENT_TYPE: &str = "application/jose+json";

const REQUEST_DEADLINE: Duration = Duration::from_secs(4);

fn authz_lifetime() -> chrono::Duration {
    chrono::Duration::hours(200)
}

/// The CA to which certificate generation requests are passed.
#[async_trait]
pub trait Ca: Send + Sync {
    async fn complete_order(&self, order: &Order, csr: &X509Req) -> Result<(), Error>;
}

/// Handler-level error: either a wire-visible problem or an internal error
/// that renders as `serverInternal` at the edge.
#[derive(Debug)]
pub enum WfeError {
    Problem(Problem),
    Internal(Error),
}

impl From<Problem> for WfeError {
    fn from(p: Problem) -> Self {
        WfeError::Problem(p)
    }
}

impl From<Error> for WfeError {
    fn from(e: Error) -> Self {
        WfeError::Internal(e)
    }
}

impl IntoResponse for WfeError {
    fn into_response(self) -> Response {
        match self {
            WfeError::Problem(p) => {
                info!("Returned problem: {}", p);
                p.into_response()
            }
            WfeError::Internal(err) => {
                error!("An unexpected error has occured: {}", err);
                Problem::server_internal("Something went wrong internally").into_response()
            }
        }
    }
}

/// Maps a storage `NotFound` to the given problem and everything else to
/// the internal-error path.
fn map_not_found(err: Error, problem: Problem) -> WfeError {
    if err.is_not_found() {
        WfeError::Problem(problem)
    } else {
        WfeError::Internal(err)
    }
}

pub(crate) type HandlerResult = Result<Response, WfeError>;

/// A verified POST: the authenticated account and the decoded payload.
pub struct PostRequest {
    pub is_post_as_get: bool,
    pub account: Account,
    pub body: Vec<u8>,
}

pub struct WebFrontEnd {
    pub ca: Arc<dyn Ca>,
    pub db: Arc<dyn Storage>,
    pub noncer: Arc<dyn NonceService>,
    pub base_path: String,
    pub tokenizer: Tokenizer,
    pub account_validator: Arc<dyn AccountValidator>,
    pub require_external_account: bool,
    pub prohibit_get: bool,
    pub validation: Arc<dyn ValidationAuthority>,
    pub wait_for_issuance: bool,
    pub debug_valid_authz: bool,
}

impl WebFrontEnd {
    pub fn new(
        ca: Arc<dyn Ca>,
        db: Arc<dyn Storage>,
        validation: Arc<dyn ValidationAuthority>,
    ) -> Self {
        WebFrontEnd {
            ca,
            db,
            noncer: Arc::new(MemoryNoncer::new()),
            base_path: "http://localhost".to_string(),
            tokenizer: Tokenizer::new(),
            account_validator: Arc::new(crate::external::NoopAccountValidator),
            require_external_account: false,
            prohibit_get: false,
            validation,
            wait_for_issuance: false,
            debug_valid_authz: false,
        }
    }

    pub fn relative_path(&self, p: &str) -> String {
        format!("{}{}", self.base_path, p)
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(DIRECTORY_PATH, get(handlers::directory))
            .route(NONCE_PATH, get(handlers::new_nonce))
            .route(NEW_ACCOUNT_PATH, post(handlers::new_account))
            .route(NEW_ORDER_PATH, post(handlers::new_order))
            .route("/acct/{id}", post(handlers::update_account))
            .route("/order/{id}", get(handlers::get_order).post(handlers::post_order))
            .route("/finalize-order/{id}", post(handlers::finalize_order))
            .route("/authZ/{id}", get(handlers::get_authz).post(handlers::post_authz))
            .route(
                "/chalZ/{id}",
                get(handlers::get_challenge).post(handlers::post_challenge),
            )
            .route("/certZ/{id}", get(handlers::get_cert).post(handlers::post_cert))
            .route(REVOKE_CERT_PATH, post(revoke::revoke_cert))
            .route(HEALTH_PATH, get(handlers::health))
            .fallback(handlers::not_found)
            .layer(CatchPanicLayer::custom(handle_panic))
            .layer(middleware::from_fn_with_state(self.clone(), acme_middleware))
            .with_state(self)
    }

    // ----- request authentication -----

    fn valid_post(headers: &HeaderMap) -> Result<(), Problem> {
        match headers.get(header::CONTENT_TYPE) {
            None => {
                return Err(Problem::unsupported_media_type(
                    "missing Content-Type header on POST. Content-Type must be \"application/jose+json\"",
                ))
            }
            Some(ct) if ct.to_str().unwrap_or_default() != EXPECTED_JWS_CONTENT_TYPE => {
                return Err(Problem::unsupported_media_type(
                    "Invalid Content-Type header on POST. Content-Type must be \"application/jose+json\"",
                ))
            }
            Some(_) => {}
        }
        // Clients must not send a Replay-Nonce header; the nonce is part of
        // the signed JWS body (RFC 8555 section 6.5).
        if headers.contains_key("replay-nonce") {
            return Err(Problem::malformed(
                "HTTP requests should NOT contain Replay-Nonce header. Use JWS nonce field",
            ));
        }
        Ok(())
    }

    fn host_of(headers: &HeaderMap) -> String {
        headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost")
            .to_string()
    }

    async fn verify_jws(
        &self,
        pubkey: &PKeyRef<Public>,
        jwk: &Jwk,
        jws: &ParsedJws,
        host: &str,
        path: &str,
    ) -> Result<Vec<u8>, Problem> {
        let verified = jose::verify_signature(
            pubkey,
            &jws.header.alg,
            jws.signing_input().as_bytes(),
            &jws.signature,
        )
        .unwrap_or(false);
        if !verified {
            info!("JWS verification error");
            return Err(Problem::malformed("JWS verification error"));
        }

        if let Err(err) = jose::check_algorithm(jwk, &jws.header.alg) {
            info!("JWS algorithm bad: {}", err);
            return Err(Problem::bad_signature_algorithm(format!(
                "Bad Signature Algorithm : {}",
                err
            )));
        }

        let nonce = jws.header.nonce.as_deref().unwrap_or_default();
        if nonce.is_empty() {
            return Err(Problem::bad_nonce("JWS has no anti-replay nonce"));
        }
        if !self.noncer.valid(nonce).await {
            return Err(Problem::bad_nonce(format!(
                "JWS has an invalid anti-replay nonce: {}",
                nonce
            )));
        }

        let header_url = jws.header.url.as_deref().unwrap_or_default();
        if header_url.is_empty() {
            return Err(Problem::malformed("JWS header parameter 'url' required."));
        }
        // Both schemes are accepted to support reverse-proxied deployments.
        let expected = format!("https://{}{}", host, path);
        let expected_http = format!("http://{}{}", host, path);
        if header_url != expected && header_url != expected_http {
            return Err(Problem::malformed(format!(
                "JWS header parameter 'url' incorrect. Expected {:?}, got {:?}",
                expected, header_url
            )));
        }

        jws.payload().map_err(|err| Problem::malformed(err))
    }

    async fn lookup_jwk(&self, jws: &ParsedJws) -> Result<Account, WfeError> {
        if jws.header.jwk.is_some() {
            return Err(Problem::malformed(
                "jwk and kid header fields are mutually exclusive.",
            )
            .into());
        }
        let account_url = jws.header.kid.as_deref().unwrap_or_default();
        let prefix = self.relative_path(ACCT_PATH);
        let account_id = account_url.strip_prefix(&prefix).ok_or_else(|| {
            Problem::malformed("Key ID (kid) in JWS header missing expected URL prefix")
        })?;
        if account_id.is_empty() {
            return Err(Problem::malformed("No KID in JWS Header").into());
        }
        debug!("Looking up JWK for kid {}", account_id);
        let account = match self.db.get_account_by_id(account_id).await {
            Ok(account) => account,
            Err(err) if err.is_not_found() => {
                return Err(Problem::account_does_not_exist("Account not found").into())
            }
            Err(err) => {
                error!("Error looking up account: {}", err);
                return Err(Problem::server_internal("Error looking up Account").into());
            }
        };
        if account.status == AccountStatus::Deactivated {
            return Err(Problem::unauthorized(format!(
                "Account '{}' has been deactivated",
                account_id
            ))
            .into());
        }
        Ok(account)
    }

    fn extract_jwk(jws: &ParsedJws) -> Result<Jwk, Problem> {
        let key = jws
            .header
            .jwk
            .clone()
            .ok_or_else(|| Problem::malformed("No JWK in JWS header"))?;
        if jws.header.kid.is_some() {
            return Err(Problem::malformed(
                "jwk and kid header fields are mutually exclusive.",
            ));
        }
        Ok(key)
    }

    /// Verifies a POST against an already registered account (`kid` form).
    pub(crate) async fn verify_post(
        &self,
        headers: &HeaderMap,
        path: &str,
        body: &[u8],
    ) -> Result<PostRequest, WfeError> {
        Self::valid_post(headers)?;
        if body.is_empty() {
            debug!("Weird request: no body on POST");
            return Err(Problem::malformed("no body on POST").into());
        }
        let jws = jose::parse_jws(body).map_err(|err| {
            warn!("Could not parse JWS: {}", err);
            Problem::malformed(err)
        })?;
        let account = self.lookup_jwk(&jws).await?;
        let pubkey = account.key.to_public_key().map_err(|err| {
            error!("Failed to decode account public key: {}", err);
            WfeError::Internal(Error::Unknown(err))
        })?;
        let host = Self::host_of(headers);
        let payload = self
            .verify_jws(&pubkey, &account.key, &jws, &host, path)
            .await?;
        debug!("JWS verification successful");
        Ok(PostRequest {
            is_post_as_get: payload.is_empty(),
            account,
            body: payload,
        })
    }

    /// Verifies a POST whose signing key is embedded in the header (`jwk`
    /// form), used for new-account and revoke-cert.
    pub(crate) async fn verify_post_embedded_jwk(
        &self,
        headers: &HeaderMap,
        path: &str,
        body: &[u8],
    ) -> Result<(Jwk, Vec<u8>), WfeError> {
        Self::valid_post(headers)?;
        if body.is_empty() {
            return Err(Problem::malformed("no body on POST").into());
        }
        let jws = jose::parse_jws(body).map_err(|err| {
            warn!("Could not parse JWS: {}", err);
            Problem::malformed(err)
        })?;
        let jwk = Self::extract_jwk(&jws)?;
        let pubkey = jwk
            .to_public_key()
            .map_err(|_| Problem::malformed("Invalid JWK in JWS header"))?;
        let host = Self::host_of(headers);
        let payload = self.verify_jws(&pubkey, &jwk, &jws, &host, path).await?;
        Ok((jwk, payload))
    }

    // ----- authorization creation -----

    /// Returns the id of an active authorization for (account, identifier),
    /// creating a fresh pending one if none exists. Repeated calls
    /// converge on the same id once an active authorization is in place.
    pub(crate) async fn create_or_get_authorization(
        &self,
        account: &Account,
        identifier: &Identifier,
    ) -> Result<String, WfeError> {
        match self.db.get_auth_from_ident(identifier, account).await {
            Ok(authz) => Ok(authz.id),
            Err(err) if err.is_not_found() => self.create_authorization(account, identifier).await,
            Err(err) => Err(err.into()),
        }
    }

    async fn create_authorization(
        &self,
        account: &Account,
        identifier: &Identifier,
    ) -> Result<String, WfeError> {
        if self.debug_valid_authz && identifier.value == "localhost.local" {
            return self.make_default_valid_authz(&account.id).await;
        }
        let add_authz = AddAuthz {
            expires: Utc::now() + authz_lifetime(),
            identifier: identifier.clone(),
            challenges: self.default_challenges().await,
            account_id: account.id.clone(),
        };
        self.db.add_authorization(add_authz).await.map_err(|err| {
            error!("Could not add authorization: {}", err);
            WfeError::Internal(err)
        })
    }

    async fn default_challenges(&self) -> Vec<AddChallenge> {
        // Only HTTP-01 is supported
        vec![AddChallenge {
            challenge_type: CHALLENGE_HTTP01.to_string(),
            token: self.tokenizer.next().await,
        }]
    }

    /// Dev shortcut: an authorization for `localhost.local` that storage
    /// records as already valid via the synthetic valid-01 challenge.
    async fn make_default_valid_authz(&self, account_id: &str) -> Result<String, WfeError> {
        let mut challenges = self.default_challenges().await;
        challenges.push(AddChallenge {
            challenge_type: "valid-01".to_string(),
            token: String::new(),
        });
        let add_authz = AddAuthz {
            expires: Utc::now() + authz_lifetime(),
            identifier: Identifier::dns("localhost.local"),
            challenges,
            account_id: account_id.to_string(),
        };
        Ok(self.db.add_authorization(add_authz).await?)
    }

    // ----- display conversions -----

    pub(crate) fn wire_challenge(&self, challenge: &Challenge) -> WireChallenge {
        WireChallenge {
            challenge_type: challenge.challenge_type.clone(),
            url: self.relative_path(&format!("{}{}", CHALLENGE_PATH, challenge.id)),
            token: challenge.token.clone(),
            status: challenge.status,
            validated: challenge.validated_at.map(|t| t.to_rfc3339()),
            error: challenge.error.clone(),
        }
    }

    pub(crate) fn wire_order(&self, order: &Order) -> WireOrder {
        WireOrder {
            status: order.status,
            expires: order.expires.to_rfc3339(),
            identifiers: order.identifiers.clone(),
            finalize: self.relative_path(&format!("{}{}", ORDER_FINALIZE_PATH, order.id)),
            not_before: order.requested_not_before.clone(),
            not_after: order.requested_not_after.clone(),
            authorizations: order
                .authz_ids
                .iter()
                .map(|id| self.relative_path(&format!("{}{}", AUTHZ_PATH, id)))
                .collect(),
            certificate: order
                .certificate_id
                .as_ref()
                .map(|id| self.relative_path(&format!("{}{}", CERT_PATH, id))),
            error: order.error.clone(),
        }
    }

    pub(crate) async fn order_for_display(
        &self,
        order_id: &str,
    ) -> Result<(WireOrder, String), WfeError> {
        let order = self
            .db
            .get_order_by_id(order_id)
            .await
            .map_err(|err| map_not_found(err, Problem::not_found("Order does not exist")))?;
        Ok((self.wire_order(&order), order.account_id))
    }

    /// Renders an authorization, filtering its challenges by status: a
    /// valid authorization shows only its valid challenge(s), an invalid
    /// one only the failed ones.
    pub(crate) async fn authz_json(
        &self,
        id: &str,
        requesting_account_id: Option<&str>,
    ) -> Result<WireAuthorization, WfeError> {
        let authz = self
            .db
            .get_authorization_by_id(id)
            .await
            .map_err(|err| map_not_found(err, Problem::not_found("Authorization does not exist")))?;
        if let Some(requester) = requesting_account_id {
            if requester != authz.account_id {
                return Err(Problem::unauthorized("You do not own this Authorization").into());
            }
        }
        Ok(self.wire_authz(&authz))
    }

    pub(crate) fn wire_authz(&self, authz: &Authorization) -> WireAuthorization {
        use crate::core::AuthzStatus;
        let challenges = authz
            .challenges
            .iter()
            .filter(|c| match authz.status {
                AuthzStatus::Valid => c.status == crate::core::ChallengeStatus::Valid,
                AuthzStatus::Invalid => c.status == crate::core::ChallengeStatus::Invalid,
                _ => true,
            })
            .map(|c| self.wire_challenge(c))
            .collect();
        WireAuthorization {
            status: authz.status,
            identifier: authz.identifier.clone(),
            challenges,
            expires: authz.expires.to_rfc3339(),
        }
    }

    pub(crate) async fn challenge_json(&self, id: &str) -> Result<WireChallenge, WfeError> {
        let (challenge, _, _) = self
            .db
            .get_challenge_by_id(id)
            .await
            .map_err(|err| map_not_found(err, Problem::not_found("Challenge does not exist")))?;
        Ok(self.wire_challenge(&challenge))
    }

    // ----- challenge start -----

    pub(crate) async fn queue_validate_challenge(
        &self,
        challenge: &Challenge,
        authz: &Authorization,
        account_key: &Jwk,
    ) -> Result<(), WfeError> {
        storage::set_challenge_processing(self.db.as_ref(), &challenge.id).await?;
        self.validation
            .do_validation(VerificationRequest {
                challenge: challenge.clone(),
                authorization: authz.clone(),
                account_jwk: account_key.clone(),
                trace_id: trace::current(),
                retries: 0,
            })
            .await?;
        Ok(())
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    error!("Unhandled panic in handler: {}", detail);
    Problem::server_internal("Something went very wrong internally").into_response()
}

/// Wraps every request: trace-id scoping, the per-request deadline, and
/// the Replay-Nonce / cache-control headers on every response.
async fn acme_middleware(
    State(wfe): State<Arc<WebFrontEnd>>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == HEALTH_PATH {
        return next.run(request).await;
    }

    let trace_id = request
        .headers()
        .get(trace::TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(trace::generate);

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    debug!("Request {} {} [{}]", method, path, trace_id);

    let nonce = wfe.noncer.next().await;

    let result = trace::scope(
        trace_id.clone(),
        tokio::time::timeout(REQUEST_DEADLINE, next.run(request)),
    )
    .await;
    let mut response = match result {
        Ok(response) => response,
        Err(_) => {
            warn!("Request {} {} exceeded its deadline [{}]", method, path, trace_id);
            let mut problem = Problem::server_internal("Request deadline exceeded");
            problem.trace = trace_id.clone();
            problem.into_response()
        }
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&nonce) {
        headers.insert("Replay-Nonce", value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=0, no-cache"),
    );
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        headers.insert("X-Trace-Id", value);
    }
    debug!("Request finished with status {}", response.status());
    response
}
