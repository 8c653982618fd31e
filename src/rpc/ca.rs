//! Tonic client wrapper for the issuing CA.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use openssl::x509::X509Req;
use tokio::sync::RwLock;
use tonic::transport::{Channel, ClientTlsConfig};

use crate::certmesh_proto as pb;
use crate::certmesh_proto::certificate_authority_client::CertificateAuthorityClient;
use crate::core::{CaCertificate, Order};
use crate::errors::Error;
use crate::wfe::Ca;

use super::marshal;
use super::{build_endpoint, handle_status, request_with_ambient_trace};

#[derive(Clone)]
pub struct CaWrapper {
    client: CertificateAuthorityClient<Channel>,
    /// Common-name → issuing-cert id, populated once at startup on a
    /// background task. Until then name lookups degrade gracefully.
    cn_to_id: Arc<RwLock<HashMap<String, String>>>,
}

impl CaWrapper {
    pub fn connect(addr: &str, tls: Option<ClientTlsConfig>) -> Result<Self, String> {
        let endpoint = build_endpoint(addr, tls)?;
        info!("Connecting to certificate authority at {}", addr);
        let channel = endpoint.connect_lazy();
        let wrapper = CaWrapper {
            client: CertificateAuthorityClient::new(channel),
            cn_to_id: Arc::new(RwLock::new(HashMap::new())),
        };

        let mut client = wrapper.client.clone();
        let cn_to_id = wrapper.cn_to_id.clone();
        tokio::spawn(async move {
            match client
                .get_ca_certificates(request_with_ambient_trace(pb::Empty {}))
                .await
            {
                Ok(response) => {
                    let mut map = HashMap::new();
                    for cacert in response.into_inner().ca_certs {
                        if cacert.will_issue {
                            map.insert(cacert.common_name, cacert.id);
                        }
                    }
                    info!("Loaded {} issuing CA certificates", map.len());
                    *cn_to_id.write().await = map;
                }
                Err(err) => {
                    warn!("Could not load CA certificate list: {}", err);
                }
            }
        });

        Ok(wrapper)
    }

    pub async fn get_available_certificates(&self) -> Result<Vec<CaCertificate>, Error> {
        let response = self
            .client
            .clone()
            .get_ca_certificates(request_with_ambient_trace(pb::Empty {}))
            .await
            .map_err(handle_status)?;
        Ok(response
            .into_inner()
            .ca_certs
            .into_iter()
            .map(marshal::proto_to_ca_certificate)
            .collect())
    }

    /// Resolves an issuing CA by common name. If the name is unknown and
    /// exactly one issuer is registered, that one is returned; the map may
    /// simply not be populated yet.
    pub async fn issuer_id_for_cn(&self, common_name: &str) -> Result<String, Error> {
        let map = self.cn_to_id.read().await;
        lookup_issuer(&map, common_name)
    }
}

fn lookup_issuer(map: &HashMap<String, String>, common_name: &str) -> Result<String, Error> {
    if let Some(id) = map.get(common_name) {
        return Ok(id.clone());
    }
    match map.len() {
        1 => Ok(map.values().next().cloned().unwrap_or_default()),
        _ => Err(Error::NotFound(format!(
            "CA common name {} not found",
            common_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_common_names_resolve() {
        let mut map = HashMap::new();
        map.insert("Issuing CA 1".to_string(), "ca-1".to_string());
        map.insert("Issuing CA 2".to_string(), "ca-2".to_string());
        assert_eq!(lookup_issuer(&map, "Issuing CA 2").unwrap(), "ca-2");
        assert!(lookup_issuer(&map, "Issuing CA 3").is_err());
    }

    #[test]
    fn single_issuer_answers_for_any_name() {
        let mut map = HashMap::new();
        map.insert("The Only CA".to_string(), "ca-1".to_string());
        assert_eq!(lookup_issuer(&map, "").unwrap(), "ca-1");
        assert_eq!(lookup_issuer(&map, "whatever").unwrap(), "ca-1");
    }

    #[test]
    fn empty_map_degrades_to_not_found() {
        let map = HashMap::new();
        let err = lookup_issuer(&map, "any").unwrap_err();
        assert!(err.is_not_found());
    }
}

#[async_trait]
impl Ca for CaWrapper {
    async fn complete_order(&self, order: &Order, csr: &X509Req) -> Result<(), Error> {
        let csr_der = csr
            .to_der()
            .map_err(|e| Error::Unknown(format!("could not encode CSR: {}", e)))?;
        let request = pb::CompleteOrderRequest {
            order: Some(marshal::order_to_proto(order)),
            csr: csr_der,
        };
        self.client
            .clone()
            .complete_order(request_with_ambient_trace(request))
            .await
            .map_err(handle_status)?;
        Ok(())
    }
}
