//! Request trace-id propagation.
//!
//! Every inbound HTTP request and outbound RPC carries a `Datev-Trace-ID`.
//! The id lives in a task-local; detached tasks (VA probes, fan-out
//! subtasks) must re-enter the scope explicitly with the id they captured.

use rand::RngCore;
use std::future::Future;

pub const TRACE_HEADER: &str = "datev-trace-id";

tokio::task_local! {
    static TRACE_ID: String;
}

pub fn generate() -> String {
    let mut data = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut data);
    hex::encode(data)
}

/// Runs `f` with `id` as the ambient trace id.
pub async fn scope<F>(id: String, f: F) -> F::Output
where
    F: Future,
{
    TRACE_ID.scope(id, f).await
}

/// The ambient trace id, or the empty string outside any scope.
pub fn current() -> String {
    TRACE_ID.try_with(|t| t.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scoped_id_is_visible_and_cleared() {
        assert_eq!(current(), "");
        let seen = scope("abc123".to_string(), async { current() }).await;
        assert_eq!(seen, "abc123");
        assert_eq!(current(), "");
    }

    #[test]
    fn generated_ids_are_hex_and_unique() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), 20);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
