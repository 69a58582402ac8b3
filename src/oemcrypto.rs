//! OEMCrypto engine boundary.
//!
//! The engine is the vendor-supplied (or software) implementation that owns
//! key material and performs the actual cryptography. This module defines the
//! entry points the session layer consumes, the engine result codes, and the
//! descriptor types passed across the boundary.
//!
//! Buffer-returning entry points follow the native contract: the caller
//! offers a buffer and its length; when the buffer is too small the engine
//! writes the required size into the length and fails with
//! [`OemCryptoError::ShortBuffer`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine result codes other than success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum OemCryptoError {
    #[error("OEMCrypto_ERROR_INIT_FAILED")]
    InitFailed = 1,
    #[error("OEMCrypto_ERROR_TERMINATE_FAILED")]
    TerminateFailed = 2,
    #[error("OEMCrypto_ERROR_OPEN_FAILURE")]
    OpenFailure = 3,
    #[error("OEMCrypto_ERROR_CLOSE_FAILURE")]
    CloseFailure = 4,
    #[error("OEMCrypto_ERROR_SHORT_BUFFER")]
    ShortBuffer = 7,
    #[error("OEMCrypto_ERROR_NO_DEVICE_KEY")]
    NoDeviceKey = 8,
    #[error("OEMCrypto_ERROR_KEYBOX_INVALID")]
    KeyboxInvalid = 10,
    #[error("OEMCrypto_ERROR_DECRYPT_FAILED")]
    DecryptFailed = 13,
    #[error("OEMCrypto_ERROR_BAD_MAGIC")]
    BadMagic = 16,
    #[error("OEMCrypto_ERROR_OPEN_SESSION_FAILED")]
    OpenSessionFailed = 22,
    #[error("OEMCrypto_ERROR_CLOSE_SESSION_FAILED")]
    CloseSessionFailed = 23,
    #[error("OEMCrypto_ERROR_INVALID_SESSION")]
    InvalidSession = 24,
    #[error("OEMCrypto_ERROR_NOT_IMPLEMENTED")]
    NotImplemented = 25,
    #[error("OEMCrypto_ERROR_NO_CONTENT_KEY")]
    NoContentKey = 26,
    #[error("OEMCrypto_ERROR_CONTROL_INVALID")]
    ControlInvalid = 27,
    #[error("OEMCrypto_ERROR_UNKNOWN_FAILURE")]
    UnknownFailure = 28,
    #[error("OEMCrypto_ERROR_INVALID_CONTEXT")]
    InvalidContext = 29,
    #[error("OEMCrypto_ERROR_SIGNATURE_FAILURE")]
    SignatureFailure = 30,
    #[error("OEMCrypto_ERROR_TOO_MANY_SESSIONS")]
    TooManySessions = 31,
    #[error("OEMCrypto_ERROR_INVALID_NONCE")]
    InvalidNonce = 32,
    #[error("OEMCrypto_ERROR_TOO_MANY_KEYS")]
    TooManyKeys = 33,
    #[error("OEMCrypto_ERROR_DEVICE_NOT_RSA_PROVISIONED")]
    DeviceNotRsaProvisioned = 34,
    #[error("OEMCrypto_ERROR_INVALID_RSA_KEY")]
    InvalidRsaKey = 35,
    #[error("OEMCrypto_ERROR_KEY_EXPIRED")]
    KeyExpired = 36,
    #[error("OEMCrypto_ERROR_INSUFFICIENT_RESOURCES")]
    InsufficientResources = 37,
    #[error("OEMCrypto_ERROR_INSUFFICIENT_HDCP")]
    InsufficientHdcp = 38,
    #[error("OEMCrypto_ERROR_BUFFER_TOO_LARGE")]
    BufferTooLarge = 39,
    #[error("OEMCrypto_WARNING_GENERATION_SKEW")]
    WarningGenerationSkew = 40,
    #[error("OEMCrypto_ERROR_GENERATION_SKEW")]
    GenerationSkew = 41,
    #[error("OEMCrypto_ERROR_ANALOG_OUTPUT")]
    AnalogOutput = 43,
    #[error("OEMCrypto_ERROR_USAGE_TABLE_UNRECOVERABLE")]
    UsageTableUnrecoverable = 50,
    #[error("OEMCrypto_KEY_NOT_LOADED")]
    KeyNotLoaded = 51,
    #[error("OEMCrypto_KEY_NOT_ENTITLED")]
    KeyNotEntitled = 52,
    #[error("OEMCrypto_ERROR_BAD_HASH")]
    BadHash = 53,
    #[error("OEMCrypto_ERROR_OUTPUT_TOO_LARGE")]
    OutputTooLarge = 54,
    #[error("OEMCrypto_ERROR_SESSION_LOST_STATE")]
    SessionLostState = 55,
    #[error("OEMCrypto_ERROR_SYSTEM_INVALIDATED")]
    SystemInvalidated = 56,
}

impl OemCryptoError {
    /// Numeric engine code.
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Result of an engine call.
pub type OecResult<T> = std::result::Result<T, OemCryptoError>;

/// Engine API version that introduced per-entry usage tables.
pub const API_VERSION_BIG_USAGE_TABLES: u32 = 13;
/// Engine API version that allows switching cipher mode within a session.
pub const API_VERSION_CIPHER_MODE_SWITCH: u32 = 14;

/// Size of the keybox key-data token.
pub const KEYBOX_KEY_DATA_SIZE: usize = 72;
/// Size of a MAC key as carried in a license.
pub const MAC_KEY_SIZE: usize = 32;
/// Size of a key IV.
pub const KEY_IV_SIZE: usize = 16;
/// Size of a content key.
pub const CONTENT_KEY_SIZE: usize = 16;
/// AES block size.
pub const AES_BLOCK_SIZE: usize = 16;
/// Buffer size offered for the OEM certificate on the first attempt.
pub const CERTIFICATE_DATA_SIZE: usize = 4 * 1024;
/// Initial guess for a serialized usage table header.
pub const ESTIMATED_USAGE_TABLE_HEADER_SIZE: usize = 40;
/// Size of an RSA-2048 signature.
pub const RSA_SIGNATURE_LENGTH: usize = 256;
/// HMAC-SHA256 signature size.
pub const HMAC_SHA256_SIGNATURE_SIZE: usize = 32;
/// Largest encrypt or skip block count in a pattern.
pub const MAX_PATTERN_BLOCKS: usize = 15;

/// Engine-side session handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OecSessionId(pub u32);

/// Security level requested by the caller when talking to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// Whatever the device provides natively.
    #[default]
    Default,
    /// Force the software (L3) engine.
    Level3,
}

/// Security level reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CdmSecurityLevel {
    Uninitialized,
    L1,
    L2,
    L3,
    Unknown,
}

/// How the device was provisioned at the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningMethod {
    ProvisioningError,
    DrmCertificate,
    Keybox,
    OemCertificate,
}

/// Cipher mode used for content decryption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherMode {
    /// AES-CTR (`cenc`, `cens`).
    #[default]
    Ctr,
    /// AES-CBC (`cbc1`, `cbcs`).
    Cbc,
}

/// License flavour passed to `load_keys`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LicenseType {
    #[default]
    Content,
    Entitlement,
}

/// Algorithms accepted by the generic crypto entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericAlgorithm {
    AesCbc128NoPadding,
    HmacSha256,
}

/// RSA padding scheme for `generate_rsa_signature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaPaddingScheme {
    RsassaPss,
    Pkcs1Block1,
}

/// HDCP capability levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HdcpCapability {
    #[default]
    None,
    V1,
    V2,
    V2_1,
    V2_2,
    NoDigitalOutput,
}

/// Byte range inside a message buffer.
///
/// A zero `length` means "field not present".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Substring {
    pub offset: usize,
    pub length: usize,
}

impl Substring {
    /// Whether the range refers to a present field.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.length != 0
    }

    /// Resolve the range against `message`, or `None` if out of bounds.
    #[must_use]
    pub fn slice<'a>(&self, message: &'a [u8]) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(self.length)?;
        message.get(self.offset..end)
    }
}

/// One key in a `load_keys` call, as ranges into the license message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyObject {
    pub key_id: Substring,
    pub key_data_iv: Substring,
    pub key_data: Substring,
    pub key_control_iv: Substring,
    pub key_control: Substring,
    /// Mode the key decrypts with; engines before cipher-mode switching
    /// take it from here rather than from `select_key`.
    pub cipher_mode: CipherMode,
}

/// Key control updates from a license renewal. An absent `key_id` applies a
/// clear key control block to every loaded key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyRefreshObject {
    pub key_id: Substring,
    pub key_control_iv: Substring,
    pub key_control: Substring,
}

/// One entitled content key, as ranges into a combined message buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntitledContentKeyObject {
    pub entitlement_key_id: Substring,
    pub content_key_id: Substring,
    pub content_key_data_iv: Substring,
    pub content_key_data: Substring,
}

/// Opaque handle to protected output memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecureHandle(pub u64);

/// Destination of a decrypt or copy.
///
/// The engine may mutate the descriptor, so callers build a fresh one per
/// call.
#[derive(Debug)]
pub enum DestBufferDesc<'a> {
    /// Caller-owned memory. Output starts at the beginning of `buffer`.
    Clear { buffer: &'a mut [u8] },
    /// Protected memory addressed by handle.
    Secure {
        handle: SecureHandle,
        offset: usize,
        max_length: usize,
    },
    /// Straight to the decoder.
    Direct { is_video: bool },
}

/// Output buffer kinds the session layer can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferType {
    Clear,
    Secure,
    Direct,
}

/// `cens`/`cbcs` pattern: `encrypt` blocks encrypted, then `skip` blocks clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternDesc {
    pub encrypt: usize,
    pub skip: usize,
}

impl PatternDesc {
    /// Whether both counts fit the four-bit fields of a CENC pattern.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.encrypt <= MAX_PATTERN_BLOCKS && self.skip <= MAX_PATTERN_BLOCKS
    }

    /// Length of one pattern repetition in bytes; zero when unpatterned.
    #[must_use]
    pub fn length_in_bytes(&self) -> usize {
        (self.encrypt + self.skip) * AES_BLOCK_SIZE
    }
}

/// Subsample position flags for decrypt and copy calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubsampleFlags(u8);

impl SubsampleFlags {
    pub const NONE: Self = Self(0);
    pub const FIRST: Self = Self(1);
    pub const LAST: Self = Self(2);
    pub const FIRST_AND_LAST: Self = Self(3);

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// One engine-level decrypt request.
#[derive(Debug, Clone, Copy)]
pub struct CencSample<'a> {
    pub input: &'a [u8],
    pub is_encrypted: bool,
    pub iv: [u8; 16],
    pub block_offset: usize,
    pub subsample_flags: SubsampleFlags,
}

/// Status of a usage entry as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageEntryStatus {
    Unused,
    Active,
    Inactive,
}

/// The engine entry points consumed by the session layer.
///
/// Implementations must be safe to share across threads: the session layer
/// serializes mutating calls per session and global mutations process-wide,
/// but read-only queries may arrive concurrently.
///
/// Optional entry points default to [`OemCryptoError::NotImplemented`].
pub trait OemCrypto: Send + Sync {
    /// Global engine initialization.
    fn initialize(&self) -> OecResult<()>;

    /// Global engine teardown.
    fn terminate(&self) -> OecResult<()>;

    /// Set the sandbox identifier before initialization.
    fn set_sandbox(&self, _sandbox_id: &[u8]) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn open_session(&self, level: SecurityLevel) -> OecResult<OecSessionId>;

    fn close_session(&self, session: OecSessionId) -> OecResult<()>;

    fn provisioning_method(&self, level: SecurityLevel) -> ProvisioningMethod;

    /// Keybox key data (the pre-provisioning token).
    fn get_key_data(&self, out: &mut [u8], out_length: &mut usize, level: SecurityLevel) -> OecResult<()>;

    /// OEM certificate chain (PKCS#7), for OEM-certificate devices.
    fn get_oem_public_certificate(
        &self,
        _session: OecSessionId,
        _out: &mut [u8],
        _out_length: &mut usize,
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn get_device_id(&self, out: &mut [u8], out_length: &mut usize, level: SecurityLevel) -> OecResult<()>;

    fn get_random(&self, out: &mut [u8]) -> OecResult<()>;

    fn generate_nonce(&self, session: OecSessionId) -> OecResult<u32>;

    fn api_version(&self, level: SecurityLevel) -> u32;

    /// Security level string (`"L1"`, `"L2"`, `"L3"`), if the engine reports one.
    fn security_level(&self, level: SecurityLevel) -> Option<String>;

    fn supports_usage_table(&self, level: SecurityLevel) -> bool;

    /// Current and maximum HDCP capability.
    fn get_hdcp_capability(&self, _level: SecurityLevel) -> OecResult<(HdcpCapability, HdcpCapability)> {
        Err(OemCryptoError::NotImplemented)
    }

    fn get_number_of_open_sessions(&self, level: SecurityLevel) -> OecResult<usize>;

    fn get_max_number_of_sessions(&self, level: SecurityLevel) -> OecResult<usize>;

    fn get_current_srm_version(&self) -> OecResult<u16> {
        Err(OemCryptoError::NotImplemented)
    }

    fn is_srm_update_supported(&self) -> bool {
        false
    }

    fn load_srm(&self, _srm: &[u8]) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn resource_rating_tier(&self, _level: SecurityLevel) -> u32 {
        0
    }

    fn build_information(&self, _level: SecurityLevel) -> Option<String> {
        None
    }

    fn generate_derived_keys(
        &self,
        session: OecSessionId,
        mac_key_context: &[u8],
        enc_key_context: &[u8],
    ) -> OecResult<()>;

    fn derive_keys_from_session_key(
        &self,
        _session: OecSessionId,
        _enc_session_key: &[u8],
        _mac_key_context: &[u8],
        _enc_key_context: &[u8],
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    /// HMAC-SHA256 over `message` with the derived client MAC key.
    fn generate_signature(
        &self,
        session: OecSessionId,
        message: &[u8],
        signature: &mut [u8],
        signature_length: &mut usize,
    ) -> OecResult<()>;

    fn generate_rsa_signature(
        &self,
        _session: OecSessionId,
        _message: &[u8],
        _signature: &mut [u8],
        _signature_length: &mut usize,
        _padding: RsaPaddingScheme,
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn load_device_rsa_key(&self, _session: OecSessionId, _wrapped_rsa_key: &[u8]) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    #[allow(clippy::too_many_arguments)]
    fn load_keys(
        &self,
        session: OecSessionId,
        message: &[u8],
        signature: &[u8],
        enc_mac_keys_iv: Substring,
        enc_mac_keys: Substring,
        keys: &[KeyObject],
        pst: Substring,
        srm_requirement: Substring,
        license_type: LicenseType,
    ) -> OecResult<()>;

    fn load_entitled_content_keys(
        &self,
        _session: OecSessionId,
        _message: &[u8],
        _keys: &[EntitledContentKeyObject],
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    /// Apply a signed license renewal to the loaded keys.
    fn refresh_keys(
        &self,
        _session: OecSessionId,
        _message: &[u8],
        _signature: &[u8],
        _keys: &[KeyRefreshObject],
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    /// Re-encrypt a provisioned device RSA key under the device key
    /// (keybox devices). `message` is signed with the derived server MAC key.
    #[allow(clippy::too_many_arguments)]
    fn rewrap_device_rsa_key(
        &self,
        _session: OecSessionId,
        _message: &[u8],
        _signature: &[u8],
        _nonce: Substring,
        _enc_rsa_key: Substring,
        _enc_rsa_key_iv: Substring,
        _wrapped_rsa_key: &mut [u8],
        _wrapped_rsa_key_length: &mut usize,
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    /// Re-encrypt a provisioned device RSA key (OEM certificate devices).
    /// The key is encrypted under `encrypted_message_key`, itself wrapped
    /// with the OEM certificate's public key.
    #[allow(clippy::too_many_arguments)]
    fn rewrap_device_rsa_key_30(
        &self,
        _session: OecSessionId,
        _nonce: &[u8],
        _encrypted_message_key: &[u8],
        _enc_rsa_key: &[u8],
        _enc_rsa_key_iv: &[u8],
        _wrapped_rsa_key: &mut [u8],
        _wrapped_rsa_key_length: &mut usize,
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn select_key(&self, session: OecSessionId, key_id: &[u8], cipher_mode: CipherMode) -> OecResult<()>;

    fn decrypt_cenc(
        &self,
        session: OecSessionId,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDesc,
    ) -> OecResult<()>;

    fn copy_buffer(
        &self,
        session: OecSessionId,
        input: &[u8],
        dest: &mut DestBufferDesc<'_>,
        subsample_flags: SubsampleFlags,
    ) -> OecResult<()>;

    fn generic_encrypt(
        &self,
        _session: OecSessionId,
        _input: &[u8],
        _iv: &[u8],
        _algorithm: GenericAlgorithm,
        _out: &mut [u8],
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn generic_decrypt(
        &self,
        _session: OecSessionId,
        _input: &[u8],
        _iv: &[u8],
        _algorithm: GenericAlgorithm,
        _out: &mut [u8],
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn generic_sign(
        &self,
        _session: OecSessionId,
        _input: &[u8],
        _algorithm: GenericAlgorithm,
        _signature: &mut [u8],
        _signature_length: &mut usize,
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn generic_verify(
        &self,
        _session: OecSessionId,
        _input: &[u8],
        _algorithm: GenericAlgorithm,
        _signature: &[u8],
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    /// Whole-table usage update (engines before the big-usage-table API).
    fn update_usage_table(&self) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn deactivate_usage_entry(&self, _session: OecSessionId, _pst: &[u8]) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn report_usage(
        &self,
        _session: OecSessionId,
        _pst: &[u8],
        _out: &mut [u8],
        _out_length: &mut usize,
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    /// Delete the entry for the `pst` range of a signed release message.
    fn delete_usage_entry(
        &self,
        _session: OecSessionId,
        _pst: Substring,
        _message: &[u8],
        _signature: &[u8],
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn force_delete_usage_entry(&self, _pst: &[u8]) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn delete_old_usage_table(&self) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn create_usage_table_header(
        &self,
        _level: SecurityLevel,
        _out: &mut [u8],
        _out_length: &mut usize,
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn load_usage_table_header(&self, _level: SecurityLevel, _header: &[u8]) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn create_new_usage_entry(&self, _session: OecSessionId) -> OecResult<u32> {
        Err(OemCryptoError::NotImplemented)
    }

    fn load_usage_entry(&self, _session: OecSessionId, _index: u32, _entry: &[u8]) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    /// Returns the updated header and entry through the two buffers.
    fn update_usage_entry(
        &self,
        _session: OecSessionId,
        _header: &mut [u8],
        _header_length: &mut usize,
        _entry: &mut [u8],
        _entry_length: &mut usize,
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn shrink_usage_table_header(
        &self,
        _level: SecurityLevel,
        _new_entry_count: u32,
        _out: &mut [u8],
        _out_length: &mut usize,
    ) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn move_entry(&self, _session: OecSessionId, _new_index: u32) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn copy_old_usage_entry(&self, _session: OecSessionId, _pst: &[u8]) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }
}

/// Run a size-negotiating engine call, retrying exactly once on short buffer.
///
/// `call` receives the buffer and its in/out length. A second short-buffer
/// response is returned as is.
pub(crate) fn read_sized<F>(initial_size: usize, mut call: F) -> OecResult<Vec<u8>>
where
    F: FnMut(&mut [u8], &mut usize) -> OecResult<()>,
{
    let mut length = initial_size;
    let mut buffer = vec![0u8; length];
    let mut result = call(&mut buffer, &mut length);
    if result == Err(OemCryptoError::ShortBuffer) {
        buffer.resize(length, 0);
        result = call(&mut buffer, &mut length);
    }
    result.map(|()| {
        buffer.truncate(length);
        buffer
    })
}
