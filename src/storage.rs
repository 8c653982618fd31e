//! The storage authority interface.
//!
//! All durable state lives behind this trait; the engine holds no
//! long-lived copies. The production implementation is the tonic client
//! wrapper in `rpc::storage`; tests substitute an in-memory mock.

use async_trait::async_trait;
use chrono::Utc;

use crate::core::{
    Account, AddAuthz, AddOrderRequest, Authorization, AuthzStatus, Certificate, Challenge,
    ChallengeStatus, Identifier, Order,
};
use crate::errors::Error;
use crate::problem::Problem;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_account_by_id(&self, id: &str) -> Result<Account, Error>;
    async fn add_account(&self, account: &Account) -> Result<(), Error>;
    async fn update_account(&self, account: &Account) -> Result<(), Error>;

    async fn get_order_by_id(&self, id: &str) -> Result<Order, Error>;
    async fn add_order(&self, order: AddOrderRequest) -> Result<String, Error>;
    async fn update_order(&self, order: &Order) -> Result<(), Error>;

    async fn get_authorization_by_id(&self, id: &str) -> Result<Authorization, Error>;
    async fn add_authorization(&self, authz: AddAuthz) -> Result<String, Error>;
    /// Finds an active (pending or valid) authorization owned by the
    /// account for the identifier.
    async fn get_auth_from_ident(
        &self,
        identifier: &Identifier,
        account: &Account,
    ) -> Result<Authorization, Error>;

    /// Returns the challenge plus its owning account and authorization ids.
    async fn get_challenge_by_id(&self, id: &str)
        -> Result<(Challenge, String, String), Error>;
    async fn update_challenge_status(
        &self,
        id: &str,
        status: ChallengeStatus,
    ) -> Result<(), Error>;
    /// Updates an authorization's status, optionally writing back the
    /// challenge that drove the transition.
    async fn update_authorization(
        &self,
        challenge: Option<&Challenge>,
        authz_id: &str,
        status: AuthzStatus,
    ) -> Result<(), Error>;

    /// Returns the certificate and its chain, leaf first.
    async fn get_certificate_and_chain(
        &self,
        id: &str,
    ) -> Result<(Certificate, Vec<Vec<u8>>), Error>;
    async fn get_certificate_by_serial(
        &self,
        serial: &[u8],
        issuer_name_hash: &[u8],
    ) -> Result<Certificate, Error>;
    async fn revoke_certificate(&self, id: &str, reason: i32) -> Result<(), Error>;
}

/// Marks a challenge and its authorization invalid, attaching the problem
/// that made it so.
pub async fn set_challenge_invalid(
    db: &dyn Storage,
    challenge: &Challenge,
    authz_id: &str,
    problem: Problem,
) -> Result<(), Error> {
    let mut challenge = challenge.clone();
    challenge.status = ChallengeStatus::Invalid;
    challenge.error = Some(problem);
    db.update_authorization(Some(&challenge), authz_id, AuthzStatus::Invalid)
        .await
}

/// Marks a challenge valid (with validated-at now) and its authorization
/// valid.
pub async fn set_challenge_valid(
    db: &dyn Storage,
    challenge: &Challenge,
    authz_id: &str,
) -> Result<(), Error> {
    let mut challenge = challenge.clone();
    challenge.status = ChallengeStatus::Valid;
    challenge.validated_at = Some(Utc::now());
    db.update_authorization(Some(&challenge), authz_id, AuthzStatus::Valid)
        .await
}

pub async fn set_challenge_processing(db: &dyn Storage, challenge_id: &str) -> Result<(), Error> {
    db.update_challenge_status(challenge_id, ChallengeStatus::Processing)
        .await
}
