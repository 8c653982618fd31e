//! The HTTP-01 challenge probe (RFC 8555 section 8.3).

use std::time::Duration;

use async_trait::async_trait;

use crate::acme;
use crate::core::{VerificationRequest, HTTP01_BASE_URL};
use crate::problem::Problem;

use super::ChallengeProbe;

/// At most this many bytes of the response body are considered.
const MAX_BODY_BYTES: usize = 1000;

fn user_agent() -> String {
    format!(
        "certmesh ({}, {})",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

pub struct Http01Probe {
    client: reqwest::Client,
    port: u16,
}

impl Http01Probe {
    pub fn new() -> Self {
        // Challenge validation is hardcoded to port 80
        Self::with_port(80)
    }

    /// A probe targeting a non-standard port. Test use only.
    pub fn with_port(port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            // One roundtrip, ever: no keep-alive, no HTTP/2 upgrade.
            .pool_max_idle_per_host(0)
            .http1_only()
            .user_agent(user_agent())
            .build()
            .expect("could not build HTTP-01 probe client");
        Http01Probe { client, port }
    }

    async fn fetch_token(&self, identifier: &str, token: &str) -> Result<Vec<u8>, Problem> {
        let url = format!(
            "http://{}:{}/{}{}",
            identifier, self.port, HTTP01_BASE_URL, token
        );
        debug!("Fetching key authorization from {}", url);
        let mut response = self
            .client
            .get(&url)
            .header("accept", "*/*")
            .send()
            .await
            .map_err(|err| {
                info!("Could not fetch {}: {}", url, err);
                Problem::connection(format!("Could not connect to url {}", url))
            })?;

        if response.status() != reqwest::StatusCode::OK {
            // The RFC mandates status 200 on the challenge GET
            return Err(Problem::unauthorized(format!(
                "Non-200 status code from GET {}: {}",
                url,
                response.status().as_u16()
            )));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|err| {
            info!("Could not read body from {}: {}", url, err);
            Problem::connection(format!("Could not read response from url {}", url))
        })? {
            let remaining = MAX_BODY_BYTES - body.len();
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                break;
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

impl Default for Http01Probe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChallengeProbe for Http01Probe {
    async fn probe(&self, req: &VerificationRequest) -> Result<(), Problem> {
        let body = self
            .fetch_token(&req.authorization.identifier.value, &req.challenge.token)
            .await?;
        let expected = acme::key_authorization(&req.challenge.token, &req.account_jwk)
            .map_err(|err| {
                error!("Could not compute expected key authorization: {}", err);
                Problem::server_internal("An internal error occured while verifying")
            })?;
        let body = String::from_utf8_lossy(&body);
        let payload = body.trim_end_matches(['\n', '\r', '\t']);
        if payload != expected {
            warn!("Expected key authorization did not match");
            return Err(Problem::unauthorized(format!(
                "The key authorization file from server did not match this challenge: {:?} != {:?}",
                expected, payload
            )));
        }
        Ok(())
    }
}
