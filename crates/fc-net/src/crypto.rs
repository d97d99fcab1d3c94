//! Login signature verification, per-user delivery group keys, and at-rest message/credential
//! protection (§9 open questions 1 and 2).
//!
//! `verify_login_signature` is keyed off an explicit `alg` field on the login payload rather
//! than a single hardcoded scheme, so a future algorithm can be added without breaking
//! clients still sending the current one; an unrecognized `alg` is a protocol error, never a
//! silent fallback to a weaker check.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("signature is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("signing key has invalid length")]
    InvalidKeyLength,
    #[error("encryption failure")]
    Encrypt,
    #[error("decryption failure: ciphertext invalid or tampered")]
    Decrypt,
}

/// Verifies a login payload's signature against the configured HMAC key. `alg` must be
/// `"hmac-sha256"`; any other value is rejected rather than defaulting to a weaker check.
pub fn verify_login_signature(alg: &str, payload: &[u8], signature_hex: &str, key: &[u8]) -> Result<bool, CryptoError> {
    if alg != "hmac-sha256" {
        return Err(CryptoError::UnsupportedAlgorithm(alg.to_string()));
    }
    let expected_sig = hex::decode(signature_hex)?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(payload);
    let computed = mac.finalize().into_bytes();
    Ok(bool::from(computed.as_slice().ct_eq(&expected_sig)))
}

/// Derives the 16-byte per-user delivery-ordering group key as
/// `sha256(user_id || server_salt)[..16]` (§9 open question 1).
pub fn derive_group_key(user_id: u64, server_salt: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(user_id.to_be_bytes());
    hasher.update(server_salt.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// AES-256-GCM at-rest protection for message content / credential material that the
/// Database and L2 cache layers persist. Each call generates a fresh random nonce, which is
/// prepended to the returned ciphertext so `decrypt` is self-contained.
pub struct MessageCipher {
    cipher: Aes256Gcm,
}

const NONCE_LEN: usize = 12;

impl MessageCipher {
    pub fn new(key_bytes: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Self { cipher: Aes256Gcm::new(key) }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut ciphertext = self.cipher.encrypt(nonce, plaintext).map_err(|_| CryptoError::Encrypt)?;
        let mut out = nonce_bytes.to_vec();
        out.append(&mut ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher.decrypt(nonce, ciphertext).map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_matching_hmac_signature() {
        let key = b"a-sufficiently-long-signing-key";
        let payload = b"user=1;ts=123";
        let mut mac = HmacSha256::new_from_slice(key).unwrap();
        mac.update(payload);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_login_signature("hmac-sha256", payload, &sig, key).unwrap());
    }

    #[test]
    fn rejects_tampered_payload() {
        let key = b"a-sufficiently-long-signing-key";
        let mut mac = HmacSha256::new_from_slice(key).unwrap();
        mac.update(b"original");
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(!verify_login_signature("hmac-sha256", b"tampered", &sig, key).unwrap());
    }

    #[test]
    fn unknown_algorithm_is_a_protocol_error() {
        assert!(matches!(
            verify_login_signature("hmac-sha1", b"x", "00", b"key"),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn group_key_is_stable_for_same_inputs() {
        let a = derive_group_key(42, "salt");
        let b = derive_group_key(42, "salt");
        assert_eq!(a, b);
        assert_ne!(a, derive_group_key(43, "salt"));
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = MessageCipher::new(&[7u8; 32]);
        let blob = cipher.encrypt(b"hello").unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), b"hello");
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let cipher = MessageCipher::new(&[7u8; 32]);
        let mut blob = cipher.encrypt(b"hello").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(cipher.decrypt(&blob).is_err());
    }
}
