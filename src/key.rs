//! Key descriptors handed to a crypto session by the licensing layer.
//!
//! Field bytes are copies of fields found in the signed license message; the
//! session locates them again in the message when building engine ranges.

use crate::oemcrypto::CipherMode;

/// One key from a license.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CryptoKey {
    /// Key identifier.
    pub key_id: Vec<u8>,
    /// Wrapped key bytes.
    pub key_data: Vec<u8>,
    /// IV used to unwrap `key_data`.
    pub key_data_iv: Vec<u8>,
    /// Encrypted key control block; empty when the license carries none.
    pub key_control: Vec<u8>,
    pub key_control_iv: Vec<u8>,
    /// Entitlement key this key is unlocked by (entitled keys only).
    pub entitlement_key_id: Vec<u8>,
    pub cipher_mode: CipherMode,
}

impl CryptoKey {
    /// Create a content key descriptor.
    pub fn new(key_id: Vec<u8>, key_data: Vec<u8>, key_data_iv: Vec<u8>) -> Self {
        Self {
            key_id,
            key_data,
            key_data_iv,
            ..Self::default()
        }
    }

    /// Attach key control data.
    #[must_use]
    pub fn with_key_control(mut self, key_control: Vec<u8>, key_control_iv: Vec<u8>) -> Self {
        self.key_control = key_control;
        self.key_control_iv = key_control_iv;
        self
    }

    #[must_use]
    pub fn with_cipher_mode(mut self, cipher_mode: CipherMode) -> Self {
        self.cipher_mode = cipher_mode;
        self
    }

    /// Mark this key as entitled by `entitlement_key_id`.
    #[must_use]
    pub fn with_entitlement_key_id(mut self, entitlement_key_id: Vec<u8>) -> Self {
        self.entitlement_key_id = entitlement_key_id;
        self
    }

    /// Whether the license carried key control data for this key.
    #[must_use]
    pub fn has_key_control(&self) -> bool {
        !self.key_control.is_empty()
    }
}
