// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secret encryption for credentials at rest.
//!
//! Uses AES-256-GCM with a 12-byte random IV and a 16-byte authentication
//! tag. The wire form stored in the database is the hex triple
//! `iv:tag:ciphertext`; anything else in a secret field is rejected by the
//! persistence layer before it can reach disk.

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use thiserror::Error;

use crate::model::DeploymentSecrets;

/// Size of the AES-256 key in bytes.
const KEY_SIZE: usize = 32;

/// Size of the GCM IV in bytes.
const IV_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
const TAG_SIZE: usize = 16;

/// Errors from secret encryption and decryption.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// The encryption key is not 64 hex characters.
    #[error("Encryption key must be 64 hex characters (32 bytes)")]
    InvalidKey,

    /// The stored value is not an `iv:tag:ciphertext` hex triple.
    #[error("Malformed encrypted value")]
    Malformed,

    /// Authentication tag verification failed.
    ///
    /// The ciphertext or tag was modified after encryption, or a different
    /// key was used. Surfaced to callers as `TAMPERED_DATA`.
    #[error("Encrypted data failed authentication")]
    Tampered,

    /// Encryption itself failed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
}

/// Returns true if `value` looks like an encrypted triple: exactly three
/// non-empty hex tokens separated by `:`.
pub fn is_encrypted(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// AES-256-GCM cipher for deployment secrets.
///
/// Holds the fleet-wide master key. The `Debug` impl never prints key
/// material.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_SIZE],
}

impl SecretCipher {
    /// Create a cipher from a 64-hex-character key string.
    pub fn from_hex_key(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key).map_err(|_| CryptoError::InvalidKey)?;
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { key })
    }

    /// Create a cipher from raw key bytes.
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Encrypt a plaintext string into the `iv:tag:ciphertext` hex triple.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // aes-gcm appends the tag to the ciphertext; split it back out for
        // the wire form.
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypt an `iv:tag:ciphertext` hex triple back into plaintext.
    pub fn decrypt(&self, wire: &str) -> Result<String, CryptoError> {
        let parts: Vec<&str> = wire.split(':').collect();
        if parts.len() != 3 {
            return Err(CryptoError::Malformed);
        }

        let iv = hex::decode(parts[0]).map_err(|_| CryptoError::Malformed)?;
        let tag = hex::decode(parts[1]).map_err(|_| CryptoError::Malformed)?;
        let ciphertext = hex::decode(parts[2]).map_err(|_| CryptoError::Malformed)?;
        if iv.len() != IV_SIZE || tag.len() != TAG_SIZE {
            return Err(CryptoError::Malformed);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(&iv);

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(nonce, sealed.as_ref())
            .map_err(|_| CryptoError::Tampered)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Tampered)
    }

    /// Encrypt every present field of a plaintext secrets document.
    ///
    /// Fields already in triple form are passed through untouched so that a
    /// partially-updated document never gets double-encrypted.
    pub fn encrypt_secrets(&self, secrets: &DeploymentSecrets) -> Result<DeploymentSecrets, CryptoError> {
        let seal = |v: &Option<String>| -> Result<Option<String>, CryptoError> {
            match v {
                Some(s) if is_encrypted(s) => Ok(Some(s.clone())),
                Some(s) => Ok(Some(self.encrypt(s)?)),
                None => Ok(None),
            }
        };

        Ok(DeploymentSecrets {
            openai_api_key: seal(&secrets.openai_api_key)?,
            anthropic_api_key: seal(&secrets.anthropic_api_key)?,
            google_api_key: seal(&secrets.google_api_key)?,
            telegram_bot_token: seal(&secrets.telegram_bot_token)?,
            web_ui_token: if is_encrypted(&secrets.web_ui_token) {
                secrets.web_ui_token.clone()
            } else {
                self.encrypt(&secrets.web_ui_token)?
            },
        })
    }

    /// Decrypt every present field of an encrypted secrets document.
    pub fn decrypt_secrets(&self, secrets: &DeploymentSecrets) -> Result<DeploymentSecrets, CryptoError> {
        let open = |v: &Option<String>| -> Result<Option<String>, CryptoError> {
            match v {
                Some(s) => Ok(Some(self.decrypt(s)?)),
                None => Ok(None),
            }
        };

        Ok(DeploymentSecrets {
            openai_api_key: open(&secrets.openai_api_key)?,
            anthropic_api_key: open(&secrets.anthropic_api_key)?,
            google_api_key: open(&secrets.google_api_key)?,
            telegram_bot_token: open(&secrets.telegram_bot_token)?,
            web_ui_token: self.decrypt(&secrets.web_ui_token)?,
        })
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> SecretCipher {
        SecretCipher::from_hex_key(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn test_key_parsing() {
        assert!(SecretCipher::from_hex_key(&"00".repeat(32)).is_ok());
        assert!(matches!(
            SecretCipher::from_hex_key("deadbeef"),
            Err(CryptoError::InvalidKey)
        ));
        assert!(matches!(
            SecretCipher::from_hex_key(&"zz".repeat(32)),
            Err(CryptoError::InvalidKey)
        ));
    }

    #[test]
    fn test_roundtrip() {
        let cipher = test_cipher();
        for plaintext in ["sk-ant-abc123", "пароль", "a".repeat(4096).as_str()] {
            let wire = cipher.encrypt(plaintext).unwrap();
            assert!(is_encrypted(&wire), "wire form should be a triple: {wire}");
            assert_eq!(cipher.decrypt(&wire).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let cipher = test_cipher();
        let wire = cipher.encrypt("").unwrap();
        assert_eq!(cipher.decrypt(&wire).unwrap(), "");
    }

    #[test]
    fn test_distinct_ivs() {
        let cipher = test_cipher();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_single_digit_flip_fails() {
        let cipher = test_cipher();
        let wire = cipher.encrypt("super secret").unwrap();

        // Flip each hex digit in turn; every variant must fail to decrypt.
        for (i, c) in wire.char_indices() {
            if c == ':' {
                continue;
            }
            let flipped = if c == '0' { 'f' } else { '0' };
            if flipped == c {
                continue;
            }
            let mut tampered = wire.clone();
            tampered.replace_range(i..i + 1, &flipped.to_string());
            assert!(
                cipher.decrypt(&tampered).is_err(),
                "flipping index {i} should break decryption"
            );
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let wire = test_cipher().encrypt("secret").unwrap();
        let other = SecretCipher::from_hex_key(&"cd".repeat(32)).unwrap();
        assert!(matches!(other.decrypt(&wire), Err(CryptoError::Tampered)));
    }

    #[test]
    fn test_is_encrypted() {
        assert!(is_encrypted("00aa:bb11:cc22"));
        assert!(!is_encrypted("plaintext"));
        assert!(!is_encrypted("aa:bb"));
        assert!(!is_encrypted("aa:bb:cc:dd"));
        assert!(!is_encrypted("aa::cc"));
        assert!(!is_encrypted("xx:yy:zz"));
    }

    #[test]
    fn test_encrypt_secrets_skips_already_sealed() {
        let cipher = test_cipher();
        let sealed_token = cipher.encrypt("tok").unwrap();
        let secrets = DeploymentSecrets {
            google_api_key: Some("AIza-plaintext".into()),
            web_ui_token: sealed_token.clone(),
            ..Default::default()
        };

        let sealed = cipher.encrypt_secrets(&secrets).unwrap();
        assert_eq!(sealed.web_ui_token, sealed_token);
        assert!(is_encrypted(sealed.google_api_key.as_deref().unwrap()));
        assert_eq!(
            cipher.decrypt(sealed.google_api_key.as_deref().unwrap()).unwrap(),
            "AIza-plaintext"
        );
    }

    #[test]
    fn test_malformed_wire() {
        let cipher = test_cipher();
        assert!(matches!(cipher.decrypt("nope"), Err(CryptoError::Malformed)));
        assert!(matches!(cipher.decrypt("aa:bb:cc:dd"), Err(CryptoError::Malformed)));
        // Valid hex but wrong iv length.
        assert!(matches!(cipher.decrypt("aa:bb:cc"), Err(CryptoError::Malformed)));
    }
}
