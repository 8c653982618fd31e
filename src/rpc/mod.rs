//! Typed RPC wrappers around the external collaborators.

pub mod ca;
pub mod marshal;
pub mod storage;
pub mod validation;

use std::time::Duration;

use tonic::metadata::MetadataValue;
use tonic::transport::{ClientTlsConfig, Endpoint};
use tonic::Code;

use crate::errors::Error;
use crate::trace;

/// Shared dial options for all collaborator endpoints. Connections are
/// established lazily so a collaborator being down does not block startup.
pub(crate) fn build_endpoint(
    addr: &str,
    tls: Option<ClientTlsConfig>,
) -> Result<Endpoint, String> {
    let mut endpoint = Endpoint::from_shared(addr.to_string())
        .map_err(|e| format!("invalid endpoint address '{}': {}", addr, e))?
        .user_agent("certmesh")
        .map_err(|e| format!("invalid user agent: {}", e))?
        .tcp_keepalive(Some(Duration::from_secs(5)))
        .connect_timeout(Duration::from_secs(5));
    if let Some(tls) = tls {
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| format!("invalid TLS config: {}", e))?;
    }
    Ok(endpoint)
}

/// Maps a gRPC status into the internal error taxonomy.
pub(crate) fn handle_status(status: tonic::Status) -> Error {
    match status.code() {
        Code::DeadlineExceeded => Error::Timeout,
        Code::NotFound => Error::NotFound(status.message().to_string()),
        _ => {
            warn!("RPC error occured: {}", status);
            Error::unknown(status)
        }
    }
}

/// Wraps a message in a request carrying the given trace id as
/// `Datev-Trace-ID` metadata.
pub(crate) fn request_with_trace<T>(msg: T, trace_id: &str) -> tonic::Request<T> {
    let mut request = tonic::Request::new(msg);
    let trace_id = if trace_id.is_empty() {
        trace::generate()
    } else {
        trace_id.to_string()
    };
    if let Ok(value) = MetadataValue::try_from(trace_id.as_str()) {
        request.metadata_mut().insert(trace::TRACE_HEADER, value);
    }
    request
}

/// Like [`request_with_trace`] but with the ambient task-local trace id.
pub(crate) fn request_with_ambient_trace<T>(msg: T) -> tonic::Request<T> {
    request_with_trace(msg, &trace::current())
}
