//! Tonic client wrapper implementing the `Storage` trait against the
//! storage authority.

use async_trait::async_trait;
use tonic::transport::{Channel, ClientTlsConfig};

use crate::certmesh_proto as pb;
use crate::certmesh_proto::storage_authority_client::StorageAuthorityClient;
use crate::core::{
    Account, AddAuthz, AddOrderRequest, Authorization, AuthzStatus, Certificate, Challenge,
    ChallengeStatus, Identifier, Order,
};
use crate::errors::Error;
use crate::storage::Storage;

use super::marshal;
use super::{build_endpoint, handle_status, request_with_ambient_trace};

#[derive(Clone)]
pub struct StorageWrapper {
    client: StorageAuthorityClient<Channel>,
}

impl StorageWrapper {
    pub fn connect(addr: &str, tls: Option<ClientTlsConfig>) -> Result<Self, String> {
        let endpoint = build_endpoint(addr, tls)?;
        info!("Connecting to storage authority at {}", addr);
        let channel = endpoint.connect_lazy();
        Ok(StorageWrapper {
            client: StorageAuthorityClient::new(channel),
        })
    }

    fn client(&self) -> StorageAuthorityClient<Channel> {
        self.client.clone()
    }
}

#[async_trait]
impl Storage for StorageWrapper {
    async fn get_account_by_id(&self, id: &str) -> Result<Account, Error> {
        debug!("GRPC call GetAccount");
        let response = self
            .client()
            .get_account(request_with_ambient_trace(pb::IdRequest { id: id.to_string() }))
            .await
            .map_err(handle_status)?;
        marshal::proto_to_account(response.into_inner())
    }

    async fn add_account(&self, account: &Account) -> Result<(), Error> {
        debug!("GRPC call AddAccount");
        let proto = marshal::account_to_proto(account)?;
        self.client()
            .add_account(request_with_ambient_trace(proto))
            .await
            .map_err(handle_status)?;
        Ok(())
    }

    async fn update_account(&self, account: &Account) -> Result<(), Error> {
        debug!("GRPC call UpdateAccount");
        let proto = marshal::account_to_proto(account)?;
        self.client()
            .update_account(request_with_ambient_trace(proto))
            .await
            .map_err(handle_status)?;
        Ok(())
    }

    async fn get_order_by_id(&self, id: &str) -> Result<Order, Error> {
        debug!("GRPC call GetOrder");
        let response = self
            .client()
            .get_order(request_with_ambient_trace(pb::IdRequest { id: id.to_string() }))
            .await
            .map_err(handle_status)?;
        marshal::proto_to_order(response.into_inner())
    }

    async fn add_order(&self, order: AddOrderRequest) -> Result<String, Error> {
        debug!("GRPC call AddOrder");
        let new_order = pb::NewOrder {
            account_id: order.account_id,
            expires: Some(marshal::datetime_to_ts(order.expires)),
            requested_not_before: order.requested_not_before.unwrap_or_default(),
            requested_not_after: order.requested_not_after.unwrap_or_default(),
            authz_ids: order.authz_ids,
        };
        let response = self
            .client()
            .add_order(request_with_ambient_trace(new_order))
            .await
            .map_err(handle_status)?;
        Ok(response.into_inner().id)
    }

    async fn update_order(&self, order: &Order) -> Result<(), Error> {
        debug!("GRPC call UpdateOrder");
        let proto = marshal::order_to_proto(order);
        self.client()
            .update_order(request_with_ambient_trace(proto))
            .await
            .map_err(handle_status)?;
        Ok(())
    }

    async fn get_authorization_by_id(&self, id: &str) -> Result<Authorization, Error> {
        debug!("GRPC call GetAuthorization");
        let response = self
            .client()
            .get_authorization(request_with_ambient_trace(pb::IdRequest {
                id: id.to_string(),
            }))
            .await
            .map_err(handle_status)?;
        marshal::proto_to_authorization(response.into_inner())
    }

    async fn add_authorization(&self, authz: AddAuthz) -> Result<String, Error> {
        debug!("GRPC call AddAuthorization");
        let new_authz = pb::NewAuthz {
            identifier: Some(marshal::identifier_to_proto(&authz.identifier)),
            expires: Some(marshal::datetime_to_ts(authz.expires)),
            account_id: authz.account_id,
            challenges: authz
                .challenges
                .into_iter()
                .map(|c| pb::NewChallenge {
                    r#type: c.challenge_type,
                    token: c.token,
                })
                .collect(),
        };
        let response = self
            .client()
            .add_authorization(request_with_ambient_trace(new_authz))
            .await
            .map_err(handle_status)?;
        Ok(response.into_inner().id)
    }

    async fn get_auth_from_ident(
        &self,
        identifier: &Identifier,
        account: &Account,
    ) -> Result<Authorization, Error> {
        debug!("GRPC call GetActiveAuthorization");
        let request = pb::AccountAndIdent {
            account_id: account.id.clone(),
            identifier: Some(marshal::identifier_to_proto(identifier)),
        };
        let response = self
            .client()
            .get_active_authorization(request_with_ambient_trace(request))
            .await
            .map_err(handle_status)?;
        marshal::proto_to_authorization(response.into_inner())
    }

    async fn get_challenge_by_id(
        &self,
        id: &str,
    ) -> Result<(Challenge, String, String), Error> {
        debug!("GRPC call GetChallenge");
        let response = self
            .client()
            .get_challenge(request_with_ambient_trace(pb::IdRequest { id: id.to_string() }))
            .await
            .map_err(handle_status)?;
        let enriched = response.into_inner();
        let challenge = enriched
            .challenge
            .ok_or_else(|| Error::Unknown("challenge response is missing its challenge".to_string()))?;
        Ok((
            marshal::proto_to_challenge(challenge)?,
            enriched.account_id,
            enriched.authorization_id,
        ))
    }

    async fn update_challenge_status(
        &self,
        id: &str,
        status: ChallengeStatus,
    ) -> Result<(), Error> {
        debug!("GRPC call UpdateChallengeStatus");
        self.client()
            .update_challenge_status(request_with_ambient_trace(pb::NewStatusForId {
                id: id.to_string(),
                status: status.as_str().to_string(),
            }))
            .await
            .map_err(handle_status)?;
        Ok(())
    }

    async fn update_authorization(
        &self,
        challenge: Option<&Challenge>,
        authz_id: &str,
        status: AuthzStatus,
    ) -> Result<(), Error> {
        debug!("GRPC call UpdateAuthorization");
        let update = pb::UpdateAuthz {
            id: authz_id.to_string(),
            new_status: status.as_str().to_string(),
            updated_challenge: challenge.map(marshal::challenge_to_proto),
        };
        self.client()
            .update_authorization(request_with_ambient_trace(update))
            .await
            .map_err(handle_status)?;
        Ok(())
    }

    async fn get_certificate_and_chain(
        &self,
        id: &str,
    ) -> Result<(Certificate, Vec<Vec<u8>>), Error> {
        debug!("GRPC call GetCertificate");
        let response = self
            .client()
            .get_certificate(request_with_ambient_trace(pb::IdRequest { id: id.to_string() }))
            .await
            .map_err(handle_status)?;
        let chain = response.into_inner();
        let certificate = chain
            .certificate
            .ok_or_else(|| Error::Unknown("certificate response is missing its leaf".to_string()))?;
        Ok((marshal::proto_to_certificate(certificate)?, chain.chain_der))
    }

    async fn get_certificate_by_serial(
        &self,
        serial: &[u8],
        issuer_name_hash: &[u8],
    ) -> Result<Certificate, Error> {
        debug!("GRPC call GetCertificateBySerial");
        let response = self
            .client()
            .get_certificate_by_serial(request_with_ambient_trace(pb::CertBySerial {
                serial: serial.to_vec(),
                issuer_name_hash: issuer_name_hash.to_vec(),
            }))
            .await
            .map_err(handle_status)?;
        marshal::proto_to_certificate(response.into_inner())
    }

    async fn revoke_certificate(&self, id: &str, reason: i32) -> Result<(), Error> {
        debug!("GRPC call RevokeCertificate");
        self.client()
            .revoke_certificate(request_with_ambient_trace(pb::RevokeCert {
                id: id.to_string(),
                reason,
            }))
            .await
            .map_err(handle_status)?;
        Ok(())
    }
}
