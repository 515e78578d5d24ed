//! Validator tickets
//!
//! A validator attests to a challenge response by signing
//!
//! ```text
//! sha256("<challenge_id>:<blobber_id>:<validator_id>:<validator_key>:<result>:<timestamp>")
//! ```
//!
//! with its Ed25519 key. Field order and separator are fixed by the validators
//! already deployed.

use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::digest;
use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationTicket {
    pub challenge_id: String,
    pub blobber_id: String,
    pub validator_id: String,
    /// Hex Ed25519 public key
    pub validator_key: String,
    #[serde(rename = "success")]
    pub result: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_code: String,
    /// Unix seconds
    pub timestamp: i64,
    /// Hex Ed25519 signature over the ticket digest
    pub signature: String,
}

impl ValidationTicket {
    /// Colon-joined signed fields
    pub fn hash_data(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.challenge_id,
            self.blobber_id,
            self.validator_id,
            self.validator_key,
            self.result,
            self.timestamp
        )
    }

    /// Digest the signature covers
    pub fn digest(&self) -> [u8; 32] {
        digest::hash_bytes(self.hash_data())
    }

    /// Verify the signature against the ticket's own validator key
    ///
    /// `Ok(false)` means well-formed but not signed by that key over these
    /// fields. A key or signature that cannot be decoded is an error.
    pub fn verify_sign(&self) -> Result<bool, StorageError> {
        let key_bytes: [u8; 32] = hex::decode(&self.validator_key)
            .map_err(|e| StorageError::Signature(format!("Validator key is not hex: {}", e)))?
            .try_into()
            .map_err(|_| StorageError::Signature("Validator key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| StorageError::Signature(format!("Invalid validator key: {}", e)))?;

        let sig_bytes: [u8; 64] = hex::decode(&self.signature)
            .map_err(|e| StorageError::Signature(format!("Signature is not hex: {}", e)))?
            .try_into()
            .map_err(|_| StorageError::Signature("Signature must be 64 bytes".into()))?;
        let signature = Ed25519Signature::from_bytes(&sig_bytes);

        Ok(key.verify_strict(&self.digest(), &signature).is_ok())
    }

    /// Fill in the validator key and sign the ticket
    pub fn sign(&mut self, signing_key: &SigningKey) {
        self.validator_key = hex::encode(signing_key.verifying_key().to_bytes());
        let signature = signing_key.sign(&self.digest());
        self.signature = hex::encode(signature.to_bytes());
    }
}
