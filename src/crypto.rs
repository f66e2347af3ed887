//! Authenticated encryption for the sensitive part of a notification.
//!
//! Envelope layout: `base64(nonce || AES-256-GCM ciphertext+tag)`. The message
//! id and dedup key are bound as associated data, so a payload moved onto
//! another message, or a message whose dedup key was rewritten, fails
//! verification.
//!
//! Dedup keys are HMAC-SHA256 digests under a subkey derived from the payload
//! key. Without the key a broker reader cannot confirm guessed content.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use serde::{Serialize, de::DeserializeOwned};
use sha2::Sha256;

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const DEDUP_KEY_LABEL: &[u8] = b"notification-dedup-key-v1";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Aes256Gcm,
    dedup_mac: HmacSha256,
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher").finish_non_exhaustive()
    }
}

impl PayloadCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKey("rejected by cipher".to_string()))?;

        let mut derive = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        derive.update(DEDUP_KEY_LABEL);
        let subkey = derive.finalize().into_bytes();

        let dedup_mac = <HmacSha256 as Mac>::new_from_slice(&subkey)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        Ok(Self { cipher, dedup_mac })
    }

    /// Keyed digest of `material`, hex encoded.
    pub fn dedup_digest(&self, material: &[u8]) -> String {
        let mut mac = self.dedup_mac.clone();
        mac.update(material);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Checks the tag without decoding the plaintext.
    pub fn verify(&self, envelope: &str, associated_data: &[u8]) -> Result<(), CryptoError> {
        self.open(envelope, associated_data).map(|_| ())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not valid base64: {}", e)))?;

        Self::new(&key)
    }

    /// Fresh random key, base64 encoded.
    pub fn generate_key() -> String {
        STANDARD.encode(Aes256Gcm::generate_key(OsRng))
    }

    pub fn seal(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(envelope))
    }

    /// Fails closed: bad encoding, truncation and a tag mismatch all report
    /// [`CryptoError::DecryptionFailed`].
    pub fn open(&self, envelope: &str, associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let raw = STANDARD
            .decode(envelope)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::DecryptionFailed);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    pub fn seal_json<T: Serialize>(
        &self,
        value: &T,
        associated_data: &[u8],
    ) -> Result<String, CryptoError> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| CryptoError::MalformedPayload(e.to_string()))?;
        self.seal(&plaintext, associated_data)
    }

    pub fn open_json<T: DeserializeOwned>(
        &self,
        envelope: &str,
        associated_data: &[u8],
    ) -> Result<T, CryptoError> {
        let plaintext = self.open(envelope, associated_data)?;
        serde_json::from_slice(&plaintext).map_err(|e| CryptoError::MalformedPayload(e.to_string()))
    }
}
