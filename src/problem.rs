//! ACME problem documents (RFC 8555 section 6.7).

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};

const ERR_NS: &str = "urn:ietf:params:acme:error:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", skip_serializing_if = "String::is_empty", default)]
    pub error_type: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub detail: String,
    #[serde(rename = "status", skip_serializing_if = "is_zero", default)]
    pub http_status: u16,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub subproblems: Vec<Problem>,
    #[serde(default)]
    pub trace: String,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl Problem {
    fn new(error_type: &str, detail: String, http_status: u16) -> Self {
        Problem {
            error_type: format!("{}{}", ERR_NS, error_type),
            detail,
            http_status,
            subproblems: vec![],
            trace: String::new(),
        }
    }

    pub fn server_internal(detail: impl Into<String>) -> Self {
        Self::new("serverInternal", detail.into(), 500)
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new("malformed", detail.into(), 400)
    }

    /// Malformed with a 405 status, used to steer clients off deprecated
    /// plain GETs.
    pub fn malformed_405(detail: impl Into<String>) -> Self {
        Self::new("malformed", detail.into(), 405)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new("malformed", detail.into(), 404)
    }

    pub fn method_not_allowed() -> Self {
        Self::new("malformed", "Method not allowed".to_string(), 405)
    }

    pub fn unsupported_media_type(detail: impl Into<String>) -> Self {
        Self::new("malformed", detail.into(), 415)
    }

    pub fn bad_nonce(detail: impl Into<String>) -> Self {
        Self::new("badNonce", detail.into(), 400)
    }

    pub fn bad_signature_algorithm(detail: impl Into<String>) -> Self {
        Self::new("badSignatureAlgorithm", detail.into(), 400)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new("unauthorized", detail.into(), 403)
    }

    pub fn connection(detail: impl Into<String>) -> Self {
        Self::new("connection", detail.into(), 400)
    }

    pub fn account_does_not_exist(detail: impl Into<String>) -> Self {
        Self::new("accountDoesNotExist", detail.into(), 400)
    }

    pub fn order_not_ready(detail: impl Into<String>) -> Self {
        Self::new("orderNotReady", detail.into(), 403)
    }

    pub fn already_revoked(at: DateTime<Utc>) -> Self {
        Self::new(
            "alreadyRevoked",
            format!("Cert was already revoked on {}", at.to_rfc3339()),
            400,
        )
    }

    pub fn bad_csr(detail: impl Into<String>) -> Self {
        Self::new("badCSR", detail.into(), 400)
    }

    pub fn external_account_required(detail: impl Into<String>) -> Self {
        Self::new("externalAccountRequired", detail.into(), 400)
    }

    pub fn compound(detail: impl Into<String>, subproblems: Vec<Problem>) -> Self {
        let mut p = Self::new("compound", detail.into(), 500);
        p.subproblems = subproblems;
        p
    }
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.subproblems.is_empty() {
            write!(f, "{} :: {}", self.error_type, self.detail)
        } else {
            let subs = self
                .subproblems
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "{} :: [{}]", self.error_type, subs)
        }
    }
}

impl std::error::Error for Problem {}

impl IntoResponse for Problem {
    fn into_response(mut self) -> Response {
        if self.trace.is_empty() {
            self.trace = crate::trace::current();
        }
        let status = StatusCode::from_u16(self.http_status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_vec(&self).unwrap_or_else(|_| {
            b"{\"detail\": \"Problem marshalling error message.\"}".to_vec()
        });
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            body,
        )
            .into_response()
    }
}
