//! HD key derivation and private-key-at-rest encryption (spec §4.1, §5 Key
//! policy). Grounded on the mnemonic-to-signing-key pattern the multichain
//! signer uses for Terra, generalized here to the BSC/secp256k1 derivation
//! path the gateway actually needs.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use alloy::signers::local::{coins_bip39::English, MnemonicBuilder, PrivateKeySigner};
use rand::RngCore;

use crate::errors::{GatewayError, Result};

/// Holds the deployment mnemonic and the AES key used to encrypt derived
/// private keys at rest. Never implements `Debug`/`Display`/`Clone` — every
/// consumer must go through `derive` or `decrypt`, and the derived
/// `PrivateKeySigner` it returns is expected to be dropped as soon as the
/// caller is done signing.
pub struct SecretRegistry {
    mnemonic: String,
    path_template: String,
    encryption_key: [u8; 32],
}

impl SecretRegistry {
    pub fn new(mnemonic: String, path_template: String, encryption_key: [u8; 32]) -> Self {
        Self { mnemonic, path_template, encryption_key }
    }

    /// Derives the BSC signer for a merchant's HD index, following
    /// `path_template` with `{index}` substituted (spec §4.1: "a BIP-44-style
    /// path derived from a single deployment mnemonic").
    pub fn derive(&self, index: i64) -> Result<PrivateKeySigner> {
        if index < 0 {
            return Err(GatewayError::Internal(format!("negative HD index {index}")));
        }
        let path = self.path_template.replace("{index}", &index.to_string());
        MnemonicBuilder::<English>::default()
            .phrase(self.mnemonic.as_str())
            .derivation_path(&path)
            .map_err(|e| GatewayError::Internal(format!("invalid derivation path {path}: {e}")))?
            .build()
            .map_err(|e| GatewayError::Internal(format!("key derivation failed: {e}")))
    }

    pub fn derivation_path(&self, index: i64) -> String {
        self.path_template.replace("{index}", &index.to_string())
    }

    /// Encrypts a derived private key for storage alongside the address row.
    /// Format: `nonce (12 bytes) || ciphertext`, hex-encoded.
    pub fn encrypt_private_key(&self, signer: &PrivateKeySigner) -> Result<String> {
        let key_bytes = signer.to_bytes();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.encryption_key));

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, key_bytes.as_slice())
            .map_err(|e| GatewayError::Internal(format!("private key encryption failed: {e}")))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    /// Decrypts a stored private key back into a signer. Used by the
    /// settlement/payout executors when they need to sign a sweep from an
    /// individual deposit address rather than the hot wallet.
    pub fn decrypt_private_key(&self, encrypted: &str) -> Result<PrivateKeySigner> {
        let raw = hex::decode(encrypted)
            .map_err(|e| GatewayError::Internal(format!("malformed encrypted key: {e}")))?;
        if raw.len() < 12 {
            return Err(GatewayError::Internal("encrypted key too short".into()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.encryption_key));
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| GatewayError::Internal(format!("private key decryption failed: {e}")))?;

        PrivateKeySigner::from_slice(&plaintext)
            .map_err(|e| GatewayError::Internal(format!("decrypted key is invalid: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str =
        "test test test test test test test test test test test junk";

    fn registry() -> SecretRegistry {
        SecretRegistry::new(
            TEST_MNEMONIC.to_string(),
            "m/44'/60'/0'/0/{index}".to_string(),
            [7u8; 32],
        )
    }

    #[test]
    fn derivation_is_deterministic_per_index() {
        let reg = registry();
        let a = reg.derive(0).unwrap();
        let b = reg.derive(0).unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn distinct_indexes_yield_distinct_addresses() {
        let reg = registry();
        let a = reg.derive(0).unwrap();
        let b = reg.derive(1).unwrap();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let reg = registry();
        let signer = reg.derive(3).unwrap();
        let encrypted = reg.encrypt_private_key(&signer).unwrap();
        let decrypted = reg.decrypt_private_key(&encrypted).unwrap();
        assert_eq!(signer.address(), decrypted.address());
    }

    #[test]
    fn encryption_is_nondeterministic_due_to_random_nonce() {
        let reg = registry();
        let signer = reg.derive(0).unwrap();
        let a = reg.encrypt_private_key(&signer).unwrap();
        let b = reg.encrypt_private_key(&signer).unwrap();
        assert_ne!(a, b);
    }
}
