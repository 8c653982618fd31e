//! The validation authority RPC surface: the client wrapper used by the
//! WFE and the server-side service that feeds the verification queue.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::{Request, Response, Status};

use crate::certmesh_proto as pb;
use crate::certmesh_proto::validation_client::ValidationClient;
use crate::certmesh_proto::validation_server::Validation;
use crate::core::VerificationRequest;
use crate::errors::Error;
use crate::trace;
use crate::va::ValidationAuthority;

use super::marshal;
use super::{build_endpoint, handle_status, request_with_trace};

/// mobc connection manager handing out validation clients.
pub struct ValidatorManager {
    pub endpoint: tonic::transport::Endpoint,
}

#[mobc::async_trait]
impl mobc::Manager for ValidatorManager {
    type Connection = ValidationClient<Channel>;
    type Error = tonic::transport::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        ValidationClient::connect(self.endpoint.clone()).await
    }

    async fn check(&self, conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
        Ok(conn)
    }
}

/// Out-of-process VA reached over RPC. Clients are pooled; connecting is
/// deferred to first use.
pub struct ValidationWrapper {
    pool: mobc::Pool<ValidatorManager>,
}

impl ValidationWrapper {
    pub fn connect(addr: &str, tls: Option<ClientTlsConfig>) -> Result<Self, String> {
        let endpoint = build_endpoint(addr, tls)?.concurrency_limit(8);
        info!("Connecting to validation authority at {}", addr);
        Ok(ValidationWrapper {
            pool: mobc::Pool::new(ValidatorManager { endpoint }),
        })
    }
}

#[async_trait]
impl ValidationAuthority for ValidationWrapper {
    async fn do_validation(&self, req: VerificationRequest) -> Result<(), Error> {
        let mut client = self.pool.get().await.map_err(|e| Error::unknown(e))?;
        let msg = marshal::validation_to_proto(&req)?;
        debug!("GRPC call DoValidate");
        client
            .do_validate(request_with_trace(msg, &req.trace_id))
            .await
            .map_err(handle_status)?;
        Ok(())
    }
}

/// Server-side implementation of the `Validation` service: translates the
/// wire form and places the request on the verification queue.
pub struct ValidationService {
    channel: mpsc::Sender<VerificationRequest>,
}

impl ValidationService {
    pub fn new(channel: mpsc::Sender<VerificationRequest>) -> Self {
        ValidationService { channel }
    }
}

#[tonic::async_trait]
impl Validation for ValidationService {
    async fn do_validate(
        &self,
        request: Request<pb::ValidationMessage>,
    ) -> Result<Response<pb::Empty>, Status> {
        let trace_id = request
            .metadata()
            .get(trace::TRACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .ok_or_else(|| Status::invalid_argument("Missing Datev-Trace-ID"))?;

        let mut verification_request =
            marshal::proto_to_validation(request.into_inner()).map_err(|err| {
                error!("Error reading validation request: {}", err);
                Status::internal(format!("Error reading validation request: {}", err))
            })?;
        verification_request.trace_id = trace_id;

        info!(
            "Placing verification for challenge {} (authorization {}) in channel",
            verification_request.challenge.id, verification_request.authorization.id
        );
        self.channel
            .send(verification_request)
            .await
            .map_err(|_| Status::unavailable("verification queue closed"))?;

        Ok(Response::new(pb::Empty {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        Authorization, AuthzStatus, Challenge, ChallengeStatus, Identifier,
    };
    use crate::jose::testutil;
    use chrono::Utc;

    fn sample_message() -> pb::ValidationMessage {
        let authz = Authorization {
            id: "authz-1".to_string(),
            status: AuthzStatus::Pending,
            identifier: Identifier::dns("example.test"),
            expires: Utc::now(),
            account_id: "acct-1".to_string(),
            challenges: vec![],
        };
        let challenge = Challenge {
            id: "chal-1".to_string(),
            challenge_type: "http-01".to_string(),
            token: "tok".to_string(),
            status: ChallengeStatus::Processing,
            validated_at: None,
            error: None,
            authz_id: "authz-1".to_string(),
        };
        pb::ValidationMessage {
            challenge: Some(marshal::challenge_to_proto(&challenge)),
            authorization: Some(marshal::authorization_to_proto(&authz)),
            account_jwk: serde_json::to_string(&testutil::public_jwk(&testutil::rsa_key()))
                .unwrap(),
        }
    }

    #[tokio::test]
    async fn do_validate_requires_a_trace_id() {
        let (tx, _rx) = mpsc::channel(1);
        let service = ValidationService::new(tx);
        let status = service
            .do_validate(Request::new(sample_message()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn do_validate_enqueues_with_the_carried_trace() {
        let (tx, mut rx) = mpsc::channel(1);
        let service = ValidationService::new(tx);
        let request = request_with_trace(sample_message(), "trace-77");
        service.do_validate(request).await.unwrap();
        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.trace_id, "trace-77");
        assert_eq!(queued.challenge.id, "chal-1");
        assert_eq!(queued.retries, 0);
    }
}
