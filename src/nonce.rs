//! Anti-replay nonce issuance and single-use validation.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::prelude::*;
use rand::RngCore;
use redis::AsyncCommands;
use tokio::sync::mpsc;

/// The maximum number of outstanding nonces held in memory. Reaching it
/// drops the whole set; clients recover by retrying on `badNonce`.
pub const MAX_USED: usize = 512;
const NONCE_LEN: usize = 16;

#[async_trait]
pub trait NonceService: Send + Sync {
    /// Returns a fresh nonce, registered as issued-but-unused.
    async fn next(&self) -> String;
    /// Atomically consumes the nonce, returning whether it was outstanding.
    async fn valid(&self, nonce: &str) -> bool;
}

fn generate_random_nonce() -> String {
    let mut b = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut b);
    BASE64_URL_SAFE_NO_PAD.encode(b)
}

/// In-memory nonce service. Generation happens on a producer task feeding
/// a small buffer so `next` never computes randomness on the request path.
pub struct MemoryNoncer {
    next_nonce: tokio::sync::Mutex<mpsc::Receiver<String>>,
    nonces: Mutex<HashSet<String>>,
}

impl MemoryNoncer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(20);
        tokio::spawn(async move {
            loop {
                if tx.send(generate_random_nonce()).await.is_err() {
                    return;
                }
            }
        });
        MemoryNoncer {
            next_nonce: tokio::sync::Mutex::new(rx),
            nonces: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for MemoryNoncer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NonceService for MemoryNoncer {
    async fn next(&self) -> String {
        {
            let mut nonces = self.nonces.lock().unwrap();
            if nonces.len() > MAX_USED {
                nonces.clear();
            }
        }
        let nonce = match self.next_nonce.lock().await.recv().await {
            Some(n) => n,
            // Producer gone; fall back to inline generation.
            None => generate_random_nonce(),
        };
        self.nonces.lock().unwrap().insert(nonce.clone());
        nonce
    }

    async fn valid(&self, nonce: &str) -> bool {
        self.nonces.lock().unwrap().remove(nonce)
    }
}

/// Shared-store nonce service on a key/value cache, for multi-instance
/// deployments. Nonces live under a 1 hour TTL; validation is a
/// delete-if-exists. Store outages surface as `badNonce`, never as 5xx.
pub struct KvNoncer {
    conn: redis::aio::MultiplexedConnection,
}

impl KvNoncer {
    pub async fn connect(addr: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(format!("redis://{}", addr))?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(KvNoncer { conn })
    }
}

#[async_trait]
impl NonceService for KvNoncer {
    async fn next(&self) -> String {
        let nonce = generate_random_nonce();
        let mut conn = self.conn.clone();
        let stamp = chrono::Utc::now().to_rfc3339();
        if let Err(err) = conn.set_ex::<_, _, ()>(&nonce, stamp, 3600).await {
            warn!("Could not register nonce in shared store: {}", err);
        }
        nonce
    }

    async fn valid(&self, nonce: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.del::<_, usize>(nonce).await {
            Ok(n) => n > 0,
            Err(err) => {
                warn!("Could not check nonce in shared store: {}", err);
                false
            }
        }
    }
}

/// Accepts any nonce. Local testing only; must be an explicit configured
/// choice and never a default.
pub struct NoneNoncer;

#[async_trait]
impl NonceService for NoneNoncer {
    async fn next(&self) -> String {
        "not-a-nonce".to_string()
    }

    async fn valid(&self, _nonce: &str) -> bool {
        true
    }
}
