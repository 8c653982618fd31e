//! Configuration documents for the two binaries.
//!
//! Both take a single `--config <path>` flag pointing at a JSON document;
//! environment variables prefixed `CERTMESH_` override file values.

use std::collections::HashMap;
use std::io::Write;

use serde::de::DeserializeOwned;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Endpoint {
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NonceConfig {
    /// "memory" (default), "shared-kv" or "none". The none-noncer accepts
    /// every nonce and is for local testing only.
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub kv_address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountCreationConfig {
    #[serde(default)]
    pub require_external: bool,
    #[serde(default)]
    pub validator_name: String,
    #[serde(default)]
    pub validator_config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub chain: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub allowed_peers: Vec<String>,
}

impl TlsConfig {
    pub fn client_tls(&self) -> Result<Option<ClientTlsConfig>, String> {
        if !self.enable {
            return Ok(None);
        }
        let root = std::fs::read(&self.root)
            .map_err(|e| format!("could not read TLS root '{}': {}", self.root, e))?;
        let chain = std::fs::read(&self.chain)
            .map_err(|e| format!("could not read TLS chain '{}': {}", self.chain, e))?;
        let key = std::fs::read(&self.key)
            .map_err(|e| format!("could not read TLS key '{}': {}", self.key, e))?;
        let mut tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(root))
            .identity(Identity::from_pem(chain, key));
        if let Some(peer) = self.allowed_peers.first() {
            tls = tls.domain_name(peer.clone());
        }
        Ok(Some(tls))
    }

    pub fn server_tls(&self) -> Result<Option<ServerTlsConfig>, String> {
        if !self.enable {
            return Ok(None);
        }
        let chain = std::fs::read(&self.chain)
            .map_err(|e| format!("could not read TLS chain '{}': {}", self.chain, e))?;
        let key = std::fs::read(&self.key)
            .map_err(|e| format!("could not read TLS key '{}': {}", self.key, e))?;
        let root = std::fs::read(&self.root)
            .map_err(|e| format!("could not read TLS root '{}': {}", self.root, e))?;
        Ok(Some(
            ServerTlsConfig::new()
                .identity(Identity::from_pem(chain, key))
                .client_ca_root(Certificate::from_pem(root)),
        ))
    }
}

/// Options for the web front-end binary.
#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub json_logging: bool,
    #[serde(default)]
    pub process_tracing: bool,
    pub ca: Endpoint,
    pub storage: Endpoint,
    pub va: Endpoint,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub account_creation: AccountCreationConfig,
    #[serde(default)]
    pub prohibit_get: bool,
    pub base_url: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls_config: TlsConfig,
    #[serde(default)]
    pub wait_for_issuance: bool,
    /// Dev shortcut: orders for `localhost.local` get a pre-validated
    /// authorization. Never enable outside local testing.
    #[serde(default)]
    pub debug_valid_authz: bool,
}

impl WebConfig {
    pub fn verify(&mut self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("base_url cannot be unset".to_string());
        }
        if self.port == 0 {
            self.port = 80;
        }
        Ok(())
    }
}

/// Options for the validation authority binary.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub json_logging: bool,
    #[serde(default)]
    pub process_tracing: bool,
    pub storage: Endpoint,
    #[serde(default)]
    pub port: u16,
    /// Sleep 1-4 s before each probe. Testing aid only.
    #[serde(default)]
    pub sleep: bool,
    #[serde(default)]
    pub tls_config: TlsConfig,
}

impl ValidationConfig {
    pub fn verify(&mut self) {
        if self.port == 0 {
            self.port = 4242;
        }
    }
}

pub fn load<T: DeserializeOwned>(path: &str) -> Result<T, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::new(path, config::FileFormat::Json))
        .add_source(
            config::Environment::with_prefix("CERTMESH")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?
        .try_deserialize()
}

/// Initializes the log sink: human-readable lines by default, one JSON
/// object per line when `json_logging` is set.
pub fn init_logging(json: bool) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    if json {
        env_logger::Builder::new()
            .parse_filters(&filter)
            .format(|buf, record| {
                let line = serde_json::json!({
                    "Timestamp": chrono::Utc::now().to_rfc3339(),
                    "Level": record.level().to_string(),
                    "Target": record.target(),
                    "MessageTemplate": record.args().to_string(),
                });
                writeln!(buf, "{}", line)
            })
            .init();
    } else {
        pretty_env_logger::formatted_builder()
            .parse_filters(&filter)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_config_parses_a_minimal_document() {
        let raw = r#"{
            "base_url": "https://acme.example.test",
            "ca": {"address": "http://[::1]:9000"},
            "storage": {"address": "http://[::1]:9001"},
            "va": {"address": "http://[::1]:9002"},
            "nonce": {"provider": "memory"},
            "wait_for_issuance": true
        }"#;
        let mut cfg: WebConfig = serde_json::from_str(raw).unwrap();
        cfg.verify().unwrap();
        assert_eq!(cfg.port, 80);
        assert!(cfg.wait_for_issuance);
        assert_eq!(cfg.nonce.provider, "memory");
        assert!(!cfg.tls_config.enable);
    }

    #[test]
    fn web_config_requires_a_base_url() {
        let raw = r#"{
            "base_url": "",
            "ca": {"address": "a"},
            "storage": {"address": "b"},
            "va": {"address": "c"}
        }"#;
        let mut cfg: WebConfig = serde_json::from_str(raw).unwrap();
        assert!(cfg.verify().is_err());
    }

    #[test]
    fn validation_config_defaults_the_port() {
        let raw = r#"{"storage": {"address": "http://[::1]:9001"}}"#;
        let mut cfg: ValidationConfig = serde_json::from_str(raw).unwrap();
        cfg.verify();
        assert_eq!(cfg.port, 4242);
        assert!(!cfg.sleep);
    }
}
