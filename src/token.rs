//! Challenge token generation.

use base64::prelude::*;
use rand::RngCore;
use tokio::sync::mpsc;

const TOKEN_BYTES: usize = 128;

fn random_string(byte_length: usize) -> String {
    let mut b = vec![0u8; byte_length];
    rand::thread_rng().fill_bytes(&mut b);
    BASE64_URL_SAFE_NO_PAD.encode(b)
}

fn new_token() -> String {
    random_string(TOKEN_BYTES)
}

/// Produces high-entropy random tokens for challenges and the directory's
/// random-string field. Tokens are pre-generated on a producer task
/// feeding a small buffer.
pub struct Tokenizer {
    tokens: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl Tokenizer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(async move {
            loop {
                if tx.send(new_token()).await.is_err() {
                    return;
                }
            }
        });
        Tokenizer {
            tokens: tokio::sync::Mutex::new(rx),
        }
    }

    pub async fn next(&self) -> String {
        match self.tokens.lock().await.recv().await {
            Some(t) => t,
            None => new_token(),
        }
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}
