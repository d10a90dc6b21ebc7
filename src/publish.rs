//! Encrypt-and-publish side channel for completed proofs.
//!
//! Publishing is strictly best effort: the history append has already
//! happened by the time this module runs, and nothing here may roll it
//! back. Every failure is logged and swallowed.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::EncryptionKey;
use crate::error::Error;
use crate::probe;
use crate::store::HistoryRecord;

const NONCE_LEN: usize = 12;

/// Symmetric AES-256-GCM cipher for proof payloads.
///
/// Output format is base64(nonce || ciphertext) with a fresh random nonce
/// per encryption.
#[derive(Clone)]
pub struct ProofCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for ProofCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofCipher").finish()
    }
}

impl ProofCipher {
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(key.as_bytes().into());
        Self { cipher }
    }

    /// Encrypts a plaintext payload into a base64 blob.
    pub fn encrypt(&self, plaintext: &[u8]) -> crate::Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Publish {
                reason: format!("encryption failed: {e}"),
            })?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypts a blob produced by [`Self::encrypt`].
    pub fn decrypt(&self, blob: &str) -> crate::Result<Vec<u8>> {
        let bytes = BASE64.decode(blob).map_err(|e| Error::Publish {
            reason: format!("invalid base64 payload: {e}"),
        })?;
        if bytes.len() < NONCE_LEN {
            return Err(Error::Publish {
                reason: "payload shorter than nonce".to_owned(),
            });
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Publish {
                reason: format!("decryption failed: {e}"),
            })
    }
}

/// Delivers ciphertext blobs to an external sink.
#[async_trait::async_trait]
pub trait ProofPublisher: Send + Sync {
    /// Publish one ciphertext blob, returning a sink-assigned reference.
    async fn publish(&self, ciphertext: String) -> crate::Result<String>;
}

/// A [`ProofPublisher`] that POSTs blobs to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpPublisher {
    pub fn new(endpoint: url::Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait::async_trait]
impl ProofPublisher for HttpPublisher {
    async fn publish(&self, ciphertext: String) -> crate::Result<String> {
        #[derive(serde::Serialize)]
        struct PublishRequest {
            payload: String,
        }
        #[derive(serde::Deserialize)]
        struct PublishResponse {
            #[serde(default)]
            reference: String,
        }
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&PublishRequest {
                payload: ciphertext,
            })
            .send()
            .await?
            .json::<PublishResponse>()
            .await?;
        Ok(response.reference)
    }
}

/// Encrypts a history record and pushes it to the publish sink.
///
/// All failures are logged against the publish probe and swallowed; the
/// caller's state is already final.
pub async fn publish_record(
    cipher: &ProofCipher,
    publisher: &dyn ProofPublisher,
    record: &HistoryRecord,
) {
    let payload = match serde_json::to_vec(record) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(
                target: probe::TARGET,
                kind = %probe::Kind::Publish,
                id = %record.id,
                error = %e,
                "failed to serialize record for publishing"
            );
            return;
        }
    };
    let ciphertext = match cipher.encrypt(&payload) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(
                target: probe::TARGET,
                kind = %probe::Kind::Publish,
                id = %record.id,
                error = %e,
                "failed to encrypt record for publishing"
            );
            return;
        }
    };
    match publisher.publish(ciphertext).await {
        Ok(reference) => {
            tracing::debug!(
                target: probe::TARGET,
                kind = %probe::Kind::Publish,
                id = %record.id,
                %reference,
                "published encrypted proof"
            );
        }
        Err(e) => {
            tracing::warn!(
                target: probe::TARGET,
                kind = %probe::Kind::Publish,
                id = %record.id,
                error = %e,
                "failed to publish encrypted proof"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ProofCipher {
        let key: EncryptionKey =
            "22".repeat(32).parse().expect("valid key");
        ProofCipher::new(&key)
    }

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let cipher = cipher();
        let blob = cipher.encrypt(b"proof payload").unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), b"proof payload");
    }

    #[test]
    fn nonces_are_fresh_per_encryption() {
        let cipher = cipher();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_blob_fails_to_decrypt() {
        let cipher = cipher();
        let blob = cipher.encrypt(b"proof payload").unwrap();
        let mut bytes = BASE64.decode(&blob).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = BASE64.encode(bytes);
        assert!(cipher.decrypt(&tampered).is_err());
    }
}
