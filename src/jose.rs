//! Flattened JWS parsing and verification primitives (RFC 7515/7517).
//!
//! The request-level orchestration (nonce check, url binding, account
//! lookup) lives in the WFE; this module only deals with keys, signatures
//! and encodings.

use base64::prelude::*;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, PKeyRef, Public};
use openssl::rsa::Rsa;
use openssl::sign::Verifier;

/// A public JSON Web Key as it appears in a JWS protected header or an
/// account record. Only RSA and NIST-curve EC keys are representable,
/// which matches the signature algorithm policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

fn b64_field(field: &Option<String>, name: &str) -> Result<Vec<u8>, String> {
    let raw = field
        .as_ref()
        .ok_or_else(|| format!("JWK field '{}' missing", name))?;
    BASE64_URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|_| format!("JWK field '{}' is not base64url", name))
}

fn curve_for_crv(crv: &str) -> Option<(Nid, usize)> {
    match crv {
        "P-256" => Some((Nid::X9_62_PRIME256V1, 32)),
        "P-384" => Some((Nid::SECP384R1, 48)),
        "P-521" => Some((Nid::SECP521R1, 66)),
        _ => None,
    }
}

impl Jwk {
    /// The signature algorithm naturally belonging to this key type.
    pub fn natural_algorithm(&self) -> Result<&'static str, String> {
        match self.kty.as_str() {
            "RSA" => Ok("RS256"),
            "EC" => match self.crv.as_deref() {
                Some("P-256") => Ok("ES256"),
                Some("P-384") => Ok("ES384"),
                Some("P-521") => Ok("ES512"),
                _ => Err("no signature algorithms suitable for given key type".to_string()),
            },
            _ => Err("no signature algorithms suitable for given key type".to_string()),
        }
    }

    pub fn to_public_key(&self) -> Result<PKey<Public>, String> {
        match self.kty.as_str() {
            "RSA" => {
                let n = BigNum::from_slice(&b64_field(&self.n, "n")?)
                    .map_err(|e| format!("bad RSA modulus: {}", e))?;
                let e = BigNum::from_slice(&b64_field(&self.e, "e")?)
                    .map_err(|e| format!("bad RSA exponent: {}", e))?;
                let rsa = Rsa::from_public_components(n, e)
                    .map_err(|e| format!("could not build RSA key: {}", e))?;
                PKey::from_rsa(rsa).map_err(|e| format!("could not build RSA key: {}", e))
            }
            "EC" => {
                let crv = self.crv.as_deref().unwrap_or_default();
                let (nid, _) = curve_for_crv(crv)
                    .ok_or_else(|| format!("unsupported EC curve '{}'", crv))?;
                let group = EcGroup::from_curve_name(nid)
                    .map_err(|e| format!("could not load curve: {}", e))?;
                let x = BigNum::from_slice(&b64_field(&self.x, "x")?)
                    .map_err(|e| format!("bad EC coordinate: {}", e))?;
                let y = BigNum::from_slice(&b64_field(&self.y, "y")?)
                    .map_err(|e| format!("bad EC coordinate: {}", e))?;
                let key = EcKey::from_public_key_affine_coordinates(&group, &x, &y)
                    .map_err(|e| format!("could not build EC key: {}", e))?;
                PKey::from_ec_key(key).map_err(|e| format!("could not build EC key: {}", e))
            }
            other => Err(format!("unsupported key type '{}'", other)),
        }
    }

    pub fn from_public_key(key: &PKeyRef<Public>) -> Result<Jwk, String> {
        match key.id() {
            Id::RSA => {
                let rsa = key.rsa().map_err(|e| e.to_string())?;
                Ok(Jwk {
                    kty: "RSA".to_string(),
                    alg: None,
                    crv: None,
                    x: None,
                    y: None,
                    n: Some(BASE64_URL_SAFE_NO_PAD.encode(rsa.n().to_vec())),
                    e: Some(BASE64_URL_SAFE_NO_PAD.encode(rsa.e().to_vec())),
                    key_use: None,
                    kid: None,
                })
            }
            Id::EC => {
                let ec = key.ec_key().map_err(|e| e.to_string())?;
                let group = ec.group();
                let (crv, coord_len) = match group.curve_name() {
                    Some(Nid::X9_62_PRIME256V1) => ("P-256", 32usize),
                    Some(Nid::SECP384R1) => ("P-384", 48),
                    Some(Nid::SECP521R1) => ("P-521", 66),
                    _ => return Err("unsupported EC curve".to_string()),
                };
                let mut ctx = openssl::bn::BigNumContext::new().map_err(|e| e.to_string())?;
                let mut x = BigNum::new().map_err(|e| e.to_string())?;
                let mut y = BigNum::new().map_err(|e| e.to_string())?;
                ec.public_key()
                    .affine_coordinates_gfp(group, &mut x, &mut y, &mut ctx)
                    .map_err(|e| e.to_string())?;
                Ok(Jwk {
                    kty: "EC".to_string(),
                    alg: None,
                    crv: Some(crv.to_string()),
                    x: Some(BASE64_URL_SAFE_NO_PAD.encode(x.to_vec_padded(coord_len as i32).map_err(|e| e.to_string())?)),
                    y: Some(BASE64_URL_SAFE_NO_PAD.encode(y.to_vec_padded(coord_len as i32).map_err(|e| e.to_string())?)),
                    n: None,
                    e: None,
                    key_use: None,
                    kid: None,
                })
            }
            _ => Err("unsupported key type".to_string()),
        }
    }

    /// RFC 7638 thumbprint: base64url(SHA-256 over the canonical JWK form).
    pub fn thumbprint(&self) -> Result<String, String> {
        let canonical = match self.kty.as_str() {
            "RSA" => format!(
                "{{\"e\":\"{}\",\"kty\":\"RSA\",\"n\":\"{}\"}}",
                self.e.as_deref().ok_or("JWK field 'e' missing")?,
                self.n.as_deref().ok_or("JWK field 'n' missing")?,
            ),
            "EC" => format!(
                "{{\"crv\":\"{}\",\"kty\":\"EC\",\"x\":\"{}\",\"y\":\"{}\"}}",
                self.crv.as_deref().ok_or("JWK field 'crv' missing")?,
                self.x.as_deref().ok_or("JWK field 'x' missing")?,
                self.y.as_deref().ok_or("JWK field 'y' missing")?,
            ),
            other => return Err(format!("unsupported key type '{}'", other)),
        };
        let digest = openssl::hash::hash(MessageDigest::sha256(), canonical.as_bytes())
            .map_err(|e| e.to_string())?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(digest))
    }
}

/// Account id derivation: hex of the SHA-256 digest over the SPKI DER.
/// Makes looking up an account by key trivial, which new-account requires.
pub fn key_to_id(key: &PKeyRef<Public>) -> Result<String, String> {
    let spki = key
        .public_key_to_der()
        .map_err(|e| format!("could not encode public key: {}", e))?;
    let digest = openssl::hash::hash(MessageDigest::sha256(), &spki)
        .map_err(|e| e.to_string())?;
    Ok(hex::encode(digest))
}

#[derive(Debug, Deserialize)]
struct RawFlattenedJws {
    protected: Option<String>,
    payload: Option<String>,
    signature: Option<String>,
    // ACME v2 never uses these two; their mere presence is an error.
    header: Option<serde_json::Value>,
    signatures: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub jwk: Option<Jwk>,
    #[serde(default)]
    pub kid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedJws {
    pub header: ProtectedHeader,
    raw_protected: String,
    raw_payload: String,
    pub signature: Vec<u8>,
}

impl ParsedJws {
    /// The ASCII signing input, `protected || '.' || payload`.
    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.raw_protected, self.raw_payload)
    }

    pub fn payload(&self) -> Result<Vec<u8>, String> {
        BASE64_URL_SAFE_NO_PAD
            .decode(&self.raw_payload)
            .map_err(|_| "JWS payload is not base64url".to_string())
    }
}

pub fn parse_jws(body: &[u8]) -> Result<ParsedJws, String> {
    let raw: RawFlattenedJws =
        serde_json::from_slice(body).map_err(|_| "Parse error reading JWS".to_string())?;

    if raw.header.is_some() {
        return Err(
            "JWS \"header\" field not allowed. All headers must be in \"protected\" field"
                .to_string(),
        );
    }
    if raw.signatures.map(|s| !s.is_empty()).unwrap_or(false) {
        return Err(
            "JWS \"signatures\" field not allowed. Only the \"signature\" field should contain a signature"
                .to_string(),
        );
    }

    let protected = raw.protected.ok_or_else(|| "POST JWS not signed".to_string())?;
    let signature = raw.signature.ok_or_else(|| "POST JWS not signed".to_string())?;
    let payload = raw.payload.unwrap_or_default();

    let header_bytes = BASE64_URL_SAFE_NO_PAD
        .decode(&protected)
        .map_err(|_| "JWS protected header is not base64url".to_string())?;
    let header: ProtectedHeader = serde_json::from_slice(&header_bytes)
        .map_err(|_| "Parse error reading JWS protected header".to_string())?;
    let signature = BASE64_URL_SAFE_NO_PAD
        .decode(&signature)
        .map_err(|_| "JWS signature is not base64url".to_string())?;

    Ok(ParsedJws {
        header,
        raw_protected: protected,
        raw_payload: payload,
        signature,
    })
}

fn ecdsa_component_len(alg: &str) -> Option<usize> {
    match alg {
        "ES256" => Some(32),
        "ES384" => Some(48),
        "ES512" => Some(66),
        _ => None,
    }
}

fn digest_for(alg: &str) -> MessageDigest {
    match alg {
        "ES384" => MessageDigest::sha384(),
        "ES512" => MessageDigest::sha512(),
        _ => MessageDigest::sha256(),
    }
}

/// Verifies a JWS signature over `signing_input`. EC signatures arrive in
/// the JOSE raw `r || s` encoding, not DER.
pub fn verify_signature(
    key: &PKeyRef<Public>,
    alg: &str,
    signing_input: &[u8],
    signature: &[u8],
) -> Result<bool, String> {
    match alg {
        "RS256" => {
            let mut verifier = Verifier::new(MessageDigest::sha256(), key)
                .map_err(|e| format!("could not build verifier: {}", e))?;
            verifier
                .verify_oneshot(signature, signing_input)
                .map_err(|e| format!("verification failed: {}", e))
        }
        "ES256" | "ES384" | "ES512" => {
            let comp = ecdsa_component_len(alg).unwrap();
            if signature.len() != comp * 2 {
                return Ok(false);
            }
            let r = BigNum::from_slice(&signature[..comp])
                .map_err(|e| format!("bad signature component: {}", e))?;
            let s = BigNum::from_slice(&signature[comp..])
                .map_err(|e| format!("bad signature component: {}", e))?;
            let sig = openssl::ecdsa::EcdsaSig::from_private_components(r, s)
                .map_err(|e| format!("could not build signature: {}", e))?;
            let hash = openssl::hash::hash(digest_for(alg), signing_input)
                .map_err(|e| e.to_string())?;
            let ec = key
                .ec_key()
                .map_err(|_| "JWS algorithm does not match key type".to_string())?;
            sig.verify(&hash, &ec)
                .map_err(|e| format!("verification failed: {}", e))
        }
        other => Err(format!("unsupported signature algorithm '{}'", other)),
    }
}

/// Checks that (1) there is a suitable algorithm for the key, (2) the JWS
/// header algorithm matches it, (3) policy allows the algorithm, and (4)
/// the JWK's own `alg` field, if present, agrees.
pub fn check_algorithm(key: &Jwk, header_alg: &str) -> Result<(), String> {
    let algorithm = key.natural_algorithm()?;
    if header_alg != algorithm {
        return Err(format!(
            "signature type '{}' in JWS header is not supported, expected one of RS256, ES256, ES384 or ES512",
            header_alg
        ));
    }
    let allowed = crate::policy::allowed_jws_algorithms();
    if !allowed.contains(&algorithm) {
        return Err(format!(
            "algorithm '{}' is disallowed by policy. Use one of {}",
            algorithm,
            allowed.join(",")
        ));
    }
    if let Some(key_alg) = key.alg.as_deref() {
        if !key_alg.is_empty() && key_alg != algorithm {
            return Err(format!("algorithm '{}' on JWK is unacceptable", key_alg));
        }
    }
    Ok(())
}

#[cfg(test)]
pub mod testutil {
    //! Helpers for building signed JWS bodies in tests.

    use super::*;
    use openssl::pkey::Private;

    pub fn rsa_key() -> PKey<Private> {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        PKey::from_rsa(rsa).unwrap()
    }

    pub fn ec_key() -> PKey<Private> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let ec = EcKey::generate(&group).unwrap();
        PKey::from_ec_key(ec).unwrap()
    }

    pub fn public_jwk(key: &PKey<Private>) -> Jwk {
        let der = key.public_key_to_der().unwrap();
        let public = PKey::public_key_from_der(&der).unwrap();
        Jwk::from_public_key(&public).unwrap()
    }

    pub fn sign(
        key: &PKey<Private>,
        alg: &str,
        protected: serde_json::Value,
        payload: &[u8],
    ) -> String {
        let protected_b64 =
            BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(&protected).unwrap());
        let payload_b64 = BASE64_URL_SAFE_NO_PAD.encode(payload);
        let signing_input = format!("{}.{}", protected_b64, payload_b64);

        let signature = match alg {
            "RS256" => {
                let mut signer =
                    openssl::sign::Signer::new(MessageDigest::sha256(), key).unwrap();
                signer.sign_oneshot_to_vec(signing_input.as_bytes()).unwrap()
            }
            "ES256" | "ES384" | "ES512" => {
                let comp = ecdsa_component_len(alg).unwrap();
                let hash =
                    openssl::hash::hash(digest_for(alg), signing_input.as_bytes()).unwrap();
                let ec = key.ec_key().unwrap();
                let sig = openssl::ecdsa::EcdsaSig::sign(&hash, &ec).unwrap();
                let mut out = sig.r().to_vec_padded(comp as i32).unwrap();
                out.extend(sig.s().to_vec_padded(comp as i32).unwrap());
                out
            }
            _ => panic!("unsupported test algorithm {}", alg),
        };

        serde_json::json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": BASE64_URL_SAFE_NO_PAD.encode(signature),
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn rsa_jws_round_trip_verifies() {
        let key = rsa_key();
        let jwk = public_jwk(&key);
        let body = sign(
            &key,
            "RS256",
            serde_json::json!({"alg": "RS256", "nonce": "n", "url": "https://x/y", "jwk": jwk}),
            b"{}",
        );
        let jws = parse_jws(body.as_bytes()).unwrap();
        let pubkey = jws.header.jwk.as_ref().unwrap().to_public_key().unwrap();
        assert!(verify_signature(
            &pubkey,
            &jws.header.alg,
            jws.signing_input().as_bytes(),
            &jws.signature
        )
        .unwrap());
    }

    #[test]
    fn ec_jws_round_trip_verifies() {
        let key = ec_key();
        let jwk = public_jwk(&key);
        let body = sign(
            &key,
            "ES256",
            serde_json::json!({"alg": "ES256", "nonce": "n", "url": "https://x/y", "jwk": jwk}),
            b"{}",
        );
        let jws = parse_jws(body.as_bytes()).unwrap();
        let pubkey = jws.header.jwk.as_ref().unwrap().to_public_key().unwrap();
        assert!(verify_signature(
            &pubkey,
            "ES256",
            jws.signing_input().as_bytes(),
            &jws.signature
        )
        .unwrap());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = rsa_key();
        let jwk = public_jwk(&key);
        let body = sign(
            &key,
            "RS256",
            serde_json::json!({"alg": "RS256", "jwk": jwk}),
            b"{\"a\": 1}",
        );
        let mut jws = parse_jws(body.as_bytes()).unwrap();
        jws.raw_payload = BASE64_URL_SAFE_NO_PAD.encode(b"{\"a\": 2}");
        let pubkey = jws.header.jwk.as_ref().unwrap().to_public_key().unwrap();
        assert!(!verify_signature(
            &pubkey,
            "RS256",
            jws.signing_input().as_bytes(),
            &jws.signature
        )
        .unwrap());
    }

    #[test]
    fn unprotected_header_field_is_rejected() {
        let err = parse_jws(
            br#"{"protected": "e30", "payload": "e30", "signature": "AA", "header": {"alg": "none"}}"#,
        )
        .unwrap_err();
        assert!(err.contains("\"header\" field not allowed"));
    }

    #[test]
    fn signatures_array_is_rejected() {
        let err = parse_jws(
            br#"{"protected": "e30", "payload": "e30", "signature": "AA", "signatures": [{}]}"#,
        )
        .unwrap_err();
        assert!(err.contains("\"signatures\" field not allowed"));
    }

    #[test]
    fn missing_signature_is_rejected() {
        let err = parse_jws(br#"{"payload": "e30"}"#).unwrap_err();
        assert_eq!(err, "POST JWS not signed");
    }

    #[test]
    fn algorithm_must_match_key_type() {
        let key = rsa_key();
        let jwk = public_jwk(&key);
        assert!(check_algorithm(&jwk, "RS256").is_ok());
        assert!(check_algorithm(&jwk, "ES256").is_err());

        let ec = ec_key();
        let ec_jwk = public_jwk(&ec);
        assert!(check_algorithm(&ec_jwk, "ES256").is_ok());
        assert!(check_algorithm(&ec_jwk, "RS256").is_err());
    }

    #[test]
    fn jwk_alg_field_must_agree() {
        let key = rsa_key();
        let mut jwk = public_jwk(&key);
        jwk.alg = Some("ES256".to_string());
        assert!(check_algorithm(&jwk, "RS256").is_err());
        jwk.alg = Some("RS256".to_string());
        assert!(check_algorithm(&jwk, "RS256").is_ok());
    }

    #[test]
    fn key_id_is_hex_sha256_of_spki() {
        let key = rsa_key();
        let der = key.public_key_to_der().unwrap();
        let public = PKey::public_key_from_der(&der).unwrap();
        let id = key_to_id(&public).unwrap();
        assert_eq!(id.len(), 64);
        // Deterministic for the same key
        assert_eq!(id, key_to_id(&public).unwrap());
    }

    #[test]
    fn jwk_conversion_round_trips() {
        for key in [rsa_key(), ec_key()] {
            let jwk = public_jwk(&key);
            let back = jwk.to_public_key().unwrap();
            let der = key.public_key_to_der().unwrap();
            let original = PKey::public_key_from_der(&der).unwrap();
            assert!(back.public_eq(&original));
        }
    }

    #[test]
    fn thumbprints_are_stable_and_key_specific() {
        let a = public_jwk(&rsa_key());
        let b = public_jwk(&rsa_key());
        assert_eq!(a.thumbprint().unwrap(), a.thumbprint().unwrap());
        assert_ne!(a.thumbprint().unwrap(), b.thumbprint().unwrap());
    }
}
