//! Process configuration for the crypto session layer.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::oemcrypto::BufferType;

/// Settings read once per [`CryptoContext`](crate::context::CryptoContext).
///
/// Loaded from YAML:
///
/// ```yaml
/// sandbox_id: "app-sandbox"
/// oem_crypto_use_secure_buffers: false
/// oem_crypto_use_fifo: false
/// oem_crypto_use_userspace_buffers: true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Properties {
    /// Sandbox identifier passed to the engine before global initialization.
    pub sandbox_id: Option<String>,
    /// Decrypt into protected memory.
    pub oem_crypto_use_secure_buffers: bool,
    /// Decrypt straight to the decoder.
    pub oem_crypto_use_fifo: bool,
    /// Decrypt into caller-owned memory.
    pub oem_crypto_use_userspace_buffers: bool,
    /// Keep the OEM certificate after the first fetch.
    pub provisioning_token_cache: bool,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            sandbox_id: None,
            oem_crypto_use_secure_buffers: false,
            oem_crypto_use_fifo: false,
            oem_crypto_use_userspace_buffers: true,
            provisioning_token_cache: true,
        }
    }
}

impl Properties {
    /// Parse properties from a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }

    /// Read properties from a YAML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfiguration(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    /// Destination buffer type for secure decrypts: secure, then FIFO, then
    /// userspace. `None` when nothing is enabled.
    #[must_use]
    pub fn destination_buffer_type(&self) -> Option<BufferType> {
        if self.oem_crypto_use_secure_buffers {
            Some(BufferType::Secure)
        } else if self.oem_crypto_use_fifo {
            Some(BufferType::Direct)
        } else if self.oem_crypto_use_userspace_buffers {
            Some(BufferType::Clear)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_defaults() {
        let props = Properties::from_yaml_str("sandbox_id: sbx\noem_crypto_use_fifo: true\n")
            .expect("valid yaml");
        assert_eq!(props.sandbox_id.as_deref(), Some("sbx"));
        assert!(props.oem_crypto_use_userspace_buffers);
        assert_eq!(props.destination_buffer_type(), Some(BufferType::Direct));
    }

    #[test]
    fn buffer_type_precedence() {
        let mut props = Properties {
            oem_crypto_use_secure_buffers: true,
            oem_crypto_use_fifo: true,
            ..Properties::default()
        };
        assert_eq!(props.destination_buffer_type(), Some(BufferType::Secure));

        props.oem_crypto_use_secure_buffers = false;
        props.oem_crypto_use_fifo = false;
        props.oem_crypto_use_userspace_buffers = false;
        assert_eq!(props.destination_buffer_type(), None);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(matches!(
            Properties::from_yaml_str("oem_crypto_use_fifo: [1"),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
