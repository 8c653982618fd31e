//! External account binding validation.
//!
//! Hooks into account creation: a configured validator inspects the
//! `externalAccountBinding` object and returns the end-user identity in
//! the external system, which is stored on the account.

use std::collections::HashMap;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use crate::errors::Error;
use crate::problem::Problem;

/// The claims expected from an external account token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub name: String,
}

#[async_trait]
pub trait AccountValidator: Send + Sync {
    /// Validates the binding and returns the external identifier.
    async fn validate(
        &self,
        binding: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<String, Problem>;
}

fn extract_token(
    binding: Option<&HashMap<String, serde_json::Value>>,
) -> Result<String, Problem> {
    binding
        .and_then(|b| b.get("token"))
        .and_then(|t| t.as_str())
        .map(|t| t.to_string())
        .ok_or_else(|| Problem::malformed("externalAccountBinding token not found or not a string"))
}

fn relaxed_validation(alg: Algorithm) -> Validation {
    let mut validation = Validation::new(alg);
    // External tokens carry only the name claim, no expiry.
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation
}

/// Checks a token against a shared symmetric key (HS256).
pub struct SymmetricTokenValidator {
    key: DecodingKey,
}

impl SymmetricTokenValidator {
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        // Reject ridiculously short keys
        if key.len() < 5 {
            return Err(Error::Unknown("key length too short".to_string()));
        }
        Ok(SymmetricTokenValidator {
            key: DecodingKey::from_secret(key),
        })
    }
}

#[async_trait]
impl AccountValidator for SymmetricTokenValidator {
    async fn validate(
        &self,
        binding: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<String, Problem> {
        let token = extract_token(binding)?;
        let data = jsonwebtoken::decode::<Claims>(
            &token,
            &self.key,
            &relaxed_validation(Algorithm::HS256),
        )
        .map_err(|_| {
            Problem::malformed(
                "The Signature on your External Account Binding Token could not be verified",
            )
        })?;
        Ok(data.claims.name)
    }
}

/// Checks a token against an asymmetric public key (RS256, PEM encoded).
pub struct AsymmetricTokenValidator {
    key: DecodingKey,
}

impl AsymmetricTokenValidator {
    pub fn from_pem(pem: &[u8]) -> Result<Self, Error> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| Error::Unknown(format!("could not parse validator key: {}", e)))?;
        Ok(AsymmetricTokenValidator { key })
    }
}

#[async_trait]
impl AccountValidator for AsymmetricTokenValidator {
    async fn validate(
        &self,
        binding: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<String, Problem> {
        let token = extract_token(binding)?;
        let data = jsonwebtoken::decode::<Claims>(
            &token,
            &self.key,
            &relaxed_validation(Algorithm::RS256),
        )
        .map_err(|_| {
            Problem::malformed(
                "The Signature on your External Account Binding Token could not be verified",
            )
        })?;
        Ok(data.claims.name)
    }
}

/// Requires the binding to be absent or empty; anything else is an error.
/// Used when external account validation is not configured.
pub struct NoopAccountValidator;

#[async_trait]
impl AccountValidator for NoopAccountValidator {
    async fn validate(
        &self,
        binding: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<String, Problem> {
        match binding {
            None => Ok(String::new()),
            Some(b) if b.is_empty() => Ok(String::new()),
            Some(_) => Err(Problem::malformed("External account binding should be empty")),
        }
    }
}

pub const SYMMETRIC_TOKEN: &str = "symmetric_token";
pub const ASYMMETRIC_TOKEN: &str = "asymmetric_token";

/// Builds a validator from the configured name. Panics on a broken
/// configuration; this only runs at startup.
pub fn get_validator(
    name: &str,
    validator_config: &HashMap<String, serde_json::Value>,
) -> std::sync::Arc<dyn AccountValidator> {
    match name {
        SYMMETRIC_TOKEN => {
            let key = validator_config
                .get("key")
                .and_then(|k| k.as_str())
                .expect("symmetric validator config needs a 'key' string");
            std::sync::Arc::new(
                SymmetricTokenValidator::new(key.as_bytes())
                    .expect("could not build symmetric validator"),
            )
        }
        ASYMMETRIC_TOKEN => {
            let key_file = validator_config
                .get("key_file")
                .and_then(|k| k.as_str())
                .expect("asymmetric validator config needs a 'key_file' path");
            let pem = std::fs::read(key_file)
                .expect("could not read key_file for asymmetric validator config");
            std::sync::Arc::new(
                AsymmetricTokenValidator::from_pem(&pem)
                    .expect("could not build asymmetric validator"),
            )
        }
        other => panic!("unknown account validator '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn binding_with_token(token: &str) -> HashMap<String, serde_json::Value> {
        let mut m = HashMap::new();
        m.insert("token".to_string(), serde_json::Value::String(token.to_string()));
        m
    }

    #[tokio::test]
    async fn symmetric_validator_accepts_a_good_token() {
        let key = b"a-long-enough-shared-secret";
        let token = encode(
            &Header::default(),
            &Claims { name: "user-77".to_string() },
            &EncodingKey::from_secret(key),
        )
        .unwrap();
        let validator = SymmetricTokenValidator::new(key).unwrap();
        let ident = validator
            .validate(Some(&binding_with_token(&token)))
            .await
            .unwrap();
        assert_eq!(ident, "user-77");
    }

    #[tokio::test]
    async fn symmetric_validator_rejects_a_wrong_key() {
        let token = encode(
            &Header::default(),
            &Claims { name: "user-77".to_string() },
            &EncodingKey::from_secret(b"the-right-key-it-is-not"),
        )
        .unwrap();
        let validator = SymmetricTokenValidator::new(b"some-other-secret").unwrap();
        assert!(validator
            .validate(Some(&binding_with_token(&token)))
            .await
            .is_err());
    }

    #[test]
    fn symmetric_validator_rejects_short_keys() {
        assert!(SymmetricTokenValidator::new(b"tiny").is_err());
    }

    #[tokio::test]
    async fn missing_token_is_an_error() {
        let validator = SymmetricTokenValidator::new(b"a-long-enough-key").unwrap();
        assert!(validator.validate(Some(&HashMap::new())).await.is_err());
        assert!(validator.validate(None).await.is_err());
    }

    #[tokio::test]
    async fn noop_validator_requires_an_empty_binding() {
        let validator = NoopAccountValidator;
        assert_eq!(validator.validate(None).await.unwrap(), "");
        assert_eq!(validator.validate(Some(&HashMap::new())).await.unwrap(), "");
        assert!(validator
            .validate(Some(&binding_with_token("whatever")))
            .await
            .is_err());
    }
}
