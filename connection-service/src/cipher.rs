//! Stored password encryption.
//!
//! Passwords of instances and redis records are persisted encrypted. The
//! resolver only ever sees [`PasswordCipher`]; the service binary uses
//! [`AesGcmCipher`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Cipher failure. Carries no key or plaintext material.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid key")]
    InvalidKey,
    #[error("malformed ciphertext")]
    Malformed,
    #[error("authentication failed")]
    Authentication,
    #[error("random generator failure")]
    Random,
}

/// Encrypts and decrypts stored passwords.
pub trait PasswordCipher: Send + Sync {
    fn encrypt(&self, plain: &str) -> Result<String, CipherError>;

    fn decrypt(&self, encrypted: &str) -> Result<String, CipherError>;
}

/// AES-256-GCM keyed by the SHA-256 of a configured secret.
///
/// Output is base64 of `nonce || ciphertext || tag`. An empty password stays
/// empty in both directions.
pub struct AesGcmCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmCipher {
    pub fn new(secret: &str) -> Result<Self, CipherError> {
        let hashed = digest(&SHA256, secret.as_bytes());
        let unbound =
            UnboundKey::new(&AES_256_GCM, hashed.as_ref()).map_err(|_| CipherError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl PasswordCipher for AesGcmCipher {
    fn encrypt(&self, plain: &str) -> Result<String, CipherError> {
        if plain.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CipherError::Random)?;

        let mut in_out = plain.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CipherError::Authentication)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(STANDARD.encode(out))
    }

    fn decrypt(&self, encrypted: &str) -> Result<String, CipherError> {
        if encrypted.is_empty() {
            return Ok(String::new());
        }

        let bytes = STANDARD
            .decode(encrypted.trim())
            .map_err(|_| CipherError::Malformed)?;
        if bytes.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CipherError::Malformed);
        }

        let (nonce, sealed) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| CipherError::Malformed)?;
        let mut in_out = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CipherError::Authentication)?;

        String::from_utf8(plain.to_vec()).map_err(|_| CipherError::Malformed)
    }
}
