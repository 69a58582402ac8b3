//! In-process software engine.
//!
//! [`SoftwareEngine`] implements [`OemCrypto`] entirely in memory: keybox-style
//! key derivation with AES-CMAC, license verification with HMAC-SHA256, key
//! unwrapping with AES-CBC and CENC decryption in CTR and CBC modes, with
//! and without patterns. Device RSA keys sign requests with RSASSA-PSS and
//! unwrap session keys with RSA-OAEP. It backs the CLI and the integration
//! tests, and can be told to fail specific entry points to exercise error
//! paths.
//!
//! [`LicenseBuilder`], [`RenewalBuilder`] and [`ProvisioningResponse`]
//! produce server messages this engine accepts.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes256};
use cmac::Cmac;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::codec;
use crate::error::{Error, Result};
use crate::key::CryptoKey;
use crate::key_session::LicenseKeys;
use crate::oemcrypto::{
    CencSample, CipherMode, DestBufferDesc, EntitledContentKeyObject, GenericAlgorithm, HdcpCapability, KeyObject,
    KeyRefreshObject, LicenseType, OecResult, OecSessionId, OemCrypto, OemCryptoError, PatternDesc,
    ProvisioningMethod, RsaPaddingScheme, SecureHandle, SecurityLevel, Substring, SubsampleFlags, UsageEntryStatus,
    AES_BLOCK_SIZE, API_VERSION_CIPHER_MODE_SWITCH, CONTENT_KEY_SIZE, HMAC_SHA256_SIGNATURE_SIZE,
    KEYBOX_KEY_DATA_SIZE, KEY_IV_SIZE, MAC_KEY_SIZE,
};

type HmacSha256 = Hmac<Sha256>;
type CmacAes128 = Cmac<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const USAGE_HEADER_MAGIC: &[u8; 4] = b"UTHD";
const USAGE_ENTRY_MAGIC: &[u8; 4] = b"UENT";
const KEY_CONTROL_MAGIC: &[u8; 4] = b"kctl";
const WRAPPED_RSA_KEY_MAGIC: &[u8; 4] = b"WRSA";
const ENTITLEMENT_KEY_SIZE: usize = 32;
/// Outstanding nonces remembered per session.
const MAX_NONCES: usize = 16;

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        hex::decode(value.trim()).map_err(serde::de::Error::custom)
    }
}

/// Configuration of a [`SoftwareEngine`], loadable from YAML.
///
/// Byte fields are hex strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareEngineConfig {
    pub api_version: u32,
    /// Reported security level string.
    pub security_level: String,
    pub provisioning_method: ProvisioningMethod,
    /// Used to build the keybox token when `keybox_token` is empty.
    pub system_id: u32,
    #[serde(with = "hex_bytes")]
    pub keybox_token: Vec<u8>,
    /// PKCS#7 OEM certificate chain, for OEM-certificate devices.
    #[serde(with = "hex_bytes")]
    pub oem_certificate: Vec<u8>,
    /// Empty means the engine does not implement device ids.
    #[serde(with = "hex_bytes")]
    pub device_id: Vec<u8>,
    /// AES-128 device key used for key derivation.
    #[serde(with = "hex_bytes")]
    pub device_key: Vec<u8>,
    /// PKCS#8 PEM private key matching the OEM certificate.
    pub oem_private_key: Option<String>,
    /// Largest decrypt or copy input accepted in one call.
    pub max_buffer_size: Option<usize>,
    pub supports_usage_table: bool,
    pub max_sessions: usize,
    pub max_keys: usize,
    pub max_usage_entries: usize,
    pub srm_version: Option<u16>,
    pub hdcp_current: HdcpCapability,
    pub hdcp_max: HdcpCapability,
    pub resource_rating_tier: u32,
    pub build_information: Option<String>,
}

impl Default for SoftwareEngineConfig {
    fn default() -> Self {
        Self {
            api_version: 16,
            security_level: "L3".to_string(),
            provisioning_method: ProvisioningMethod::Keybox,
            system_id: 4445,
            keybox_token: Vec::new(),
            oem_certificate: Vec::new(),
            device_id: b"wvcrypto-software-device".to_vec(),
            device_key: vec![0x42; CONTENT_KEY_SIZE],
            oem_private_key: None,
            max_buffer_size: None,
            supports_usage_table: true,
            max_sessions: 16,
            max_keys: 64,
            max_usage_entries: 200,
            srm_version: None,
            hdcp_current: HdcpCapability::V2_2,
            hdcp_max: HdcpCapability::V2_2,
            resource_rating_tier: 1,
            build_information: Some(format!("wvcrypto software engine {}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

impl SoftwareEngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfiguration(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    /// Keybox key data: version, system id, then a 16-byte device unique id.
    #[must_use]
    pub fn keybox_key_data(&self) -> Vec<u8> {
        if !self.keybox_token.is_empty() {
            return self.keybox_token.clone();
        }
        let mut token = vec![0u8; KEYBOX_KEY_DATA_SIZE];
        token[..4].copy_from_slice(&2u32.to_be_bytes());
        token[4..8].copy_from_slice(&self.system_id.to_be_bytes());
        token[8..24].copy_from_slice(&sha2_prefix(&self.device_key));
        token
    }
}

fn sha2_prefix(seed: &[u8]) -> [u8; 16] {
    use sha2::Digest;
    let digest = Sha256::digest(seed);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Session keys derived from the device key for one request message.
#[derive(Debug, Clone)]
pub struct DerivedKeys {
    pub enc_key: [u8; CONTENT_KEY_SIZE],
    pub mac_key_server: [u8; MAC_KEY_SIZE],
    pub mac_key_client: [u8; MAC_KEY_SIZE],
}

impl DerivedKeys {
    /// Derive with AES-CMAC over the contexts, counters 1 (enc), 1-2
    /// (server MAC) and 3-4 (client MAC).
    pub fn derive(device_key: &[u8], mac_context: &[u8], enc_context: &[u8]) -> OecResult<Self> {
        fn derive(key: &[u8], context: &[u8], counter: u8) -> OecResult<[u8; 16]> {
            let mut mac = CmacAes128::new_from_slice(key).map_err(|_| OemCryptoError::NoDeviceKey)?;
            mac.update(&[counter]);
            mac.update(context);
            let mut out = [0u8; 16];
            out.copy_from_slice(&mac.finalize().into_bytes());
            Ok(out)
        }

        let mut keys = Self {
            enc_key: derive(device_key, enc_context, 1)?,
            mac_key_server: [0; MAC_KEY_SIZE],
            mac_key_client: [0; MAC_KEY_SIZE],
        };
        keys.mac_key_server[..16].copy_from_slice(&derive(device_key, mac_context, 1)?);
        keys.mac_key_server[16..].copy_from_slice(&derive(device_key, mac_context, 2)?);
        keys.mac_key_client[..16].copy_from_slice(&derive(device_key, mac_context, 3)?);
        keys.mac_key_client[16..].copy_from_slice(&derive(device_key, mac_context, 4)?);
        Ok(keys)
    }

    /// Keys for a license request message.
    pub fn for_request(device_key: &[u8], request: &[u8]) -> OecResult<Self> {
        let (mac_context, enc_context) = codec::derive_contexts(request);
        Self::derive(device_key, &mac_context, &enc_context)
    }
}

#[derive(Debug, Clone)]
struct EntitlementSlot {
    key: Vec<u8>,
    /// Resident content key id and key.
    content: Option<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct EngineSession {
    derived: Option<DerivedKeys>,
    rsa_key: Option<RsaPrivateKey>,
    nonces: VecDeque<u32>,
    license_type: Option<LicenseType>,
    content_keys: HashMap<Vec<u8>, Vec<u8>>,
    key_modes: HashMap<Vec<u8>, CipherMode>,
    entitlement_keys: HashMap<Vec<u8>, EntitlementSlot>,
    selected_key: Option<(Vec<u8>, CipherMode)>,
    usage_entry: Option<u32>,
}

impl EngineSession {
    /// A key loaded by `load_keys`, content or entitlement.
    fn license_key(&self, key_id: &[u8]) -> Option<&Vec<u8>> {
        match self.license_type {
            Some(LicenseType::Entitlement) => self.entitlement_keys.get(key_id).map(|slot| &slot.key),
            _ => self.content_keys.get(key_id),
        }
    }

    fn check_nonce(&self, nonce: u32) -> OecResult<()> {
        if self.nonces.contains(&nonce) {
            Ok(())
        } else {
            Err(OemCryptoError::InvalidNonce)
        }
    }

    fn consume_nonce(&mut self, nonce: u32) {
        self.nonces.retain(|&outstanding| outstanding != nonce);
    }

    fn find_key(&self, key_id: &[u8]) -> Option<&Vec<u8>> {
        match self.license_type {
            Some(LicenseType::Entitlement) => self
                .entitlement_keys
                .values()
                .find_map(|slot| slot.content.as_ref().filter(|(id, _)| id == key_id).map(|(_, key)| key)),
            _ => self.content_keys.get(key_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UsageRecord {
    pst: Vec<u8>,
    status: UsageEntryStatus,
}

#[derive(Debug, Default)]
struct EngineState {
    initialized: bool,
    sandbox_id: Option<Vec<u8>>,
    next_session_id: u32,
    sessions: HashMap<OecSessionId, EngineSession>,
    next_secure_handle: u64,
    secure_buffers: HashMap<SecureHandle, Vec<u8>>,
    usage_table_loaded: bool,
    usage_generation: u64,
    usage_entries: Vec<Option<UsageRecord>>,
    legacy_usage: HashMap<Vec<u8>, UsageEntryStatus>,
    srm_version: Option<u16>,
}

impl EngineState {
    fn session(&mut self, session: OecSessionId) -> OecResult<&mut EngineSession> {
        self.sessions.get_mut(&session).ok_or(OemCryptoError::InvalidSession)
    }

    fn selected_key(&mut self, session: OecSessionId) -> OecResult<Vec<u8>> {
        self.session(session)?
            .selected_key
            .as_ref()
            .map(|(key, _)| key.clone())
            .ok_or(OemCryptoError::NoContentKey)
    }

    fn usage_header_bytes(&self, generation: u64, entry_count: usize) -> Vec<u8> {
        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(USAGE_HEADER_MAGIC);
        header.extend_from_slice(&generation.to_be_bytes());
        header.extend_from_slice(&(entry_count as u32).to_be_bytes());
        header
    }
}

/// Software [`OemCrypto`] implementation.
pub struct SoftwareEngine {
    config: SoftwareEngineConfig,
    api_version: AtomicU32,
    supports_usage_table: AtomicBool,
    state: Mutex<EngineState>,
    calls: Mutex<HashMap<&'static str, usize>>,
    faults: Mutex<HashMap<&'static str, VecDeque<OemCryptoError>>>,
}

impl std::fmt::Debug for SoftwareEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareEngine")
            .field("security_level", &self.config.security_level)
            .field("api_version", &self.api_version.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new(SoftwareEngineConfig::default())
    }
}

impl SoftwareEngine {
    pub fn new(config: SoftwareEngineConfig) -> Self {
        let state = EngineState {
            srm_version: config.srm_version,
            next_session_id: 1,
            next_secure_handle: 1,
            ..EngineState::default()
        };
        Self {
            api_version: AtomicU32::new(config.api_version),
            supports_usage_table: AtomicBool::new(config.supports_usage_table),
            config,
            state: Mutex::new(state),
            calls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Build an engine, rejecting configurations it cannot run with.
    pub fn from_config(config: SoftwareEngineConfig) -> Result<Self> {
        if config.device_key.len() != CONTENT_KEY_SIZE {
            return Err(Error::InvalidConfiguration(format!(
                "device_key must be {} bytes, got {}",
                CONTENT_KEY_SIZE,
                config.device_key.len()
            )));
        }
        if config.max_sessions == 0 {
            return Err(Error::InvalidConfiguration("max_sessions must be positive".to_string()));
        }
        Ok(Self::new(config))
    }

    #[must_use]
    pub fn config(&self) -> &SoftwareEngineConfig {
        &self.config
    }

    /// Change the reported API version.
    pub fn set_api_version(&self, version: u32) {
        self.api_version.store(version, Ordering::SeqCst);
    }

    /// Change the reported usage table support.
    pub fn set_supports_usage_table(&self, supported: bool) {
        self.supports_usage_table.store(supported, Ordering::SeqCst);
    }

    /// Make the next call to `entry_point` fail with `code`.
    ///
    /// Faults queue up per entry point and are consumed in order.
    pub fn inject_failure(&self, entry_point: &'static str, code: OemCryptoError) {
        self.faults.lock().entry(entry_point).or_default().push_back(code);
    }

    /// Number of calls made to `entry_point` so far.
    #[must_use]
    pub fn call_count(&self, entry_point: &str) -> usize {
        self.calls.lock().get(entry_point).copied().unwrap_or(0)
    }

    /// Allocate protected output memory of `length` bytes.
    pub fn allocate_secure_buffer(&self, length: usize) -> SecureHandle {
        let mut state = self.state.lock();
        let handle = SecureHandle(state.next_secure_handle);
        state.next_secure_handle += 1;
        state.secure_buffers.insert(handle, vec![0u8; length]);
        handle
    }

    /// Contents of protected memory, for inspection.
    #[must_use]
    pub fn secure_buffer(&self, handle: SecureHandle) -> Option<Vec<u8>> {
        self.state.lock().secure_buffers.get(&handle).cloned()
    }

    /// Cipher mode `key_id` was loaded with in `session`.
    #[must_use]
    pub fn key_cipher_mode(&self, session: OecSessionId, key_id: &[u8]) -> Option<CipherMode> {
        self.state
            .lock()
            .sessions
            .get(&session)
            .and_then(|s| s.key_modes.get(key_id).copied())
    }

    /// Whether `session` holds a device RSA key.
    #[must_use]
    pub fn has_rsa_key(&self, session: OecSessionId) -> bool {
        self.state
            .lock()
            .sessions
            .get(&session)
            .is_some_and(|s| s.rsa_key.is_some())
    }

    /// Whether `pst` has an entry in the pre-v13 usage table.
    #[must_use]
    pub fn has_usage_record(&self, pst: &[u8]) -> bool {
        self.state.lock().legacy_usage.contains_key(pst)
    }

    /// Whether `key_id` is resident in the engine for `session`.
    #[must_use]
    pub fn has_key(&self, session: OecSessionId, key_id: &[u8]) -> bool {
        self.state
            .lock()
            .sessions
            .get(&session)
            .is_some_and(|s| s.find_key(key_id).is_some())
    }

    fn enter(&self, entry_point: &'static str) -> OecResult<()> {
        *self.calls.lock().entry(entry_point).or_default() += 1;
        match self.faults.lock().get_mut(entry_point).and_then(VecDeque::pop_front) {
            Some(code) => {
                debug!("SoftwareEngine: injected {} for {}", code, entry_point);
                Err(code)
            }
            None => Ok(()),
        }
    }

    fn check_buffer_size(&self, length: usize) -> OecResult<()> {
        match self.config.max_buffer_size {
            Some(max) if length > max => Err(OemCryptoError::BufferTooLarge),
            _ => Ok(()),
        }
    }

    fn oem_private_key(&self) -> OecResult<RsaPrivateKey> {
        if self.config.provisioning_method != ProvisioningMethod::OemCertificate {
            return Err(OemCryptoError::NotImplemented);
        }
        let pem = self
            .config
            .oem_private_key
            .as_deref()
            .ok_or(OemCryptoError::DeviceNotRsaProvisioned)?;
        RsaPrivateKey::from_pkcs8_pem(pem).map_err(|_| OemCryptoError::InvalidRsaKey)
    }
}

fn verify_hmac(key: &[u8], message: &[u8], signature: &[u8]) -> OecResult<()> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| OemCryptoError::InvalidContext)?;
    mac.update(message);
    mac.verify_slice(signature).map_err(|_| OemCryptoError::SignatureFailure)
}

fn sign_hmac(key: &[u8], message: &[u8]) -> OecResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| OemCryptoError::InvalidContext)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn parse_nonce(bytes: &[u8]) -> OecResult<u32> {
    <[u8; 4]>::try_from(bytes)
        .map(u32::from_le_bytes)
        .map_err(|_| OemCryptoError::InvalidNonce)
}

fn random_iv() -> [u8; KEY_IV_SIZE] {
    let mut iv = [0u8; KEY_IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

fn write_sized(data: &[u8], out: &mut [u8], out_length: &mut usize) -> OecResult<()> {
    *out_length = data.len();
    let Some(target) = out.get_mut(..data.len()) else {
        return Err(OemCryptoError::ShortBuffer);
    };
    target.copy_from_slice(data);
    Ok(())
}

fn range<'a>(message: &'a [u8], substring: Substring) -> OecResult<&'a [u8]> {
    substring.slice(message).ok_or(OemCryptoError::InvalidContext)
}

fn cbc_decrypt_no_padding(key: &[u8], iv: &[u8], data: &[u8]) -> OecResult<Vec<u8>> {
    let mut buffer = data.to_vec();
    match key.len() {
        16 => {
            let decryptor = Aes128CbcDec::new_from_slices(key, iv).map_err(|_| OemCryptoError::InvalidContext)?;
            decryptor
                .decrypt_padded_mut::<NoPadding>(&mut buffer)
                .map_err(|_| OemCryptoError::InvalidContext)?;
        }
        32 => {
            let decryptor = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| OemCryptoError::InvalidContext)?;
            decryptor
                .decrypt_padded_mut::<NoPadding>(&mut buffer)
                .map_err(|_| OemCryptoError::InvalidContext)?;
        }
        _ => return Err(OemCryptoError::InvalidContext),
    }
    Ok(buffer)
}

fn cbc_encrypt_padded(key: &[u8], iv: &[u8], data: &[u8]) -> OecResult<Vec<u8>> {
    let encryptor = Aes128CbcEnc::new_from_slices(key, iv).map_err(|_| OemCryptoError::InvalidContext)?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(data))
}

fn cbc_decrypt_padded(key: &[u8], iv: &[u8], data: &[u8]) -> OecResult<Vec<u8>> {
    let decryptor = Aes128CbcDec::new_from_slices(key, iv).map_err(|_| OemCryptoError::InvalidContext)?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| OemCryptoError::InvalidContext)
}

/// Device RSA key at rest: magic, IV, then the PKCS#8 key under the device
/// key in AES-128-CBC with PKCS#7 padding.
fn wrap_pkcs8(device_key: &[u8], pkcs8: &[u8]) -> OecResult<Vec<u8>> {
    let iv = random_iv();
    let encrypted = cbc_encrypt_padded(device_key, &iv, pkcs8)?;
    let mut wrapped = Vec::with_capacity(WRAPPED_RSA_KEY_MAGIC.len() + KEY_IV_SIZE + encrypted.len());
    wrapped.extend_from_slice(WRAPPED_RSA_KEY_MAGIC);
    wrapped.extend_from_slice(&iv);
    wrapped.extend_from_slice(&encrypted);
    Ok(wrapped)
}

fn unwrap_rsa_key(device_key: &[u8], wrapped: &[u8]) -> OecResult<RsaPrivateKey> {
    let header = WRAPPED_RSA_KEY_MAGIC.len();
    if wrapped.get(..header) != Some(WRAPPED_RSA_KEY_MAGIC.as_slice()) {
        return Err(OemCryptoError::InvalidRsaKey);
    }
    let iv = wrapped.get(header..header + KEY_IV_SIZE).ok_or(OemCryptoError::InvalidRsaKey)?;
    let encrypted = wrapped.get(header + KEY_IV_SIZE..).unwrap_or_default();
    let pkcs8 = cbc_decrypt_padded(device_key, iv, encrypted).map_err(|_| OemCryptoError::InvalidRsaKey)?;
    RsaPrivateKey::from_pkcs8_der(&pkcs8).map_err(|_| OemCryptoError::InvalidRsaKey)
}

/// Re-encrypt a provisioned PKCS#8 key under the device key, or report the
/// size needed when `out` is too small.
fn rewrap_pkcs8(device_key: &[u8], pkcs8: &[u8], out: &mut [u8], out_length: &mut usize) -> OecResult<()> {
    RsaPrivateKey::from_pkcs8_der(pkcs8).map_err(|_| OemCryptoError::InvalidRsaKey)?;
    let wrapped = wrap_pkcs8(device_key, pkcs8)?;
    write_sized(&wrapped, out, out_length)
}

/// Wrap `private_key` under `device_key` in the form
/// `CryptoSession::load_certificate_private_key` takes.
pub fn wrap_rsa_key(device_key: &[u8], private_key: &RsaPrivateKey) -> Result<Vec<u8>> {
    let pkcs8 = private_key.to_pkcs8_der()?;
    wrap_pkcs8(device_key, pkcs8.as_bytes())
        .map_err(|code| Error::InvalidConfiguration(format!("cannot wrap RSA key: {}", code)))
}

fn cbc_encrypt_no_padding(key: &[u8], iv: &[u8], data: &[u8]) -> OecResult<Vec<u8>> {
    let mut buffer = data.to_vec();
    let length = buffer.len();
    match key.len() {
        16 => {
            let encryptor = Aes128CbcEnc::new_from_slices(key, iv).map_err(|_| OemCryptoError::InvalidContext)?;
            encryptor
                .encrypt_padded_mut::<NoPadding>(&mut buffer, length)
                .map_err(|_| OemCryptoError::InvalidContext)?;
        }
        32 => {
            let encryptor = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| OemCryptoError::InvalidContext)?;
            encryptor
                .encrypt_padded_mut::<NoPadding>(&mut buffer, length)
                .map_err(|_| OemCryptoError::InvalidContext)?;
        }
        _ => return Err(OemCryptoError::InvalidContext),
    }
    Ok(buffer)
}

/// Apply CENC AES-CTR (`cenc`, or `cens` with a pattern) to `input`.
///
/// Only the low 64 bits of the IV count. Patterned samples advance the
/// counter on encrypted blocks only and leave a trailing partial block clear.
/// The transform is its own inverse.
pub fn cenc_ctr(key: &[u8], iv: &[u8; KEY_IV_SIZE], block_offset: usize, input: &[u8], pattern: &PatternDesc) -> OecResult<Vec<u8>> {
    let cipher = <Aes128 as aes::cipher::KeyInit>::new_from_slice(key).map_err(|_| OemCryptoError::DecryptFailed)?;
    let mut counter = *iv;
    let mut output = input.to_vec();

    let keystream = |counter: &[u8; KEY_IV_SIZE]| {
        let mut block = GenericArray::clone_from_slice(counter);
        cipher.encrypt_block(&mut block);
        block
    };

    if pattern.skip == 0 || pattern.encrypt == 0 {
        let mut block = keystream(&counter);
        let mut position = block_offset % AES_BLOCK_SIZE;
        for byte in &mut output {
            if position == AES_BLOCK_SIZE {
                codec::increment_iv(&mut counter, 1);
                block = keystream(&counter);
                position = 0;
            }
            *byte ^= block[position];
            position += 1;
        }
        return Ok(output);
    }

    let period = pattern.encrypt + pattern.skip;
    for (index, chunk) in output.chunks_mut(AES_BLOCK_SIZE).enumerate() {
        if index % period >= pattern.encrypt || chunk.len() < AES_BLOCK_SIZE {
            continue;
        }
        let block = keystream(&counter);
        for (byte, key_byte) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= key_byte;
        }
        codec::increment_iv(&mut counter, 1);
    }
    Ok(output)
}

/// Decrypt CENC AES-CBC (`cbc1`, or `cbcs` with a pattern).
///
/// Chaining runs over the encrypted blocks only; skipped blocks and a
/// trailing partial block are clear.
pub fn cenc_cbc_decrypt(key: &[u8], iv: &[u8; KEY_IV_SIZE], input: &[u8], pattern: &PatternDesc) -> OecResult<Vec<u8>> {
    let cipher = <Aes128 as aes::cipher::KeyInit>::new_from_slice(key).map_err(|_| OemCryptoError::DecryptFailed)?;
    let mut chain = *iv;
    let mut output = input.to_vec();
    let (encrypt, period) = if pattern.skip == 0 || pattern.encrypt == 0 {
        (1, 1)
    } else {
        (pattern.encrypt, pattern.encrypt + pattern.skip)
    };

    for (index, chunk) in output.chunks_mut(AES_BLOCK_SIZE).enumerate() {
        if index % period >= encrypt || chunk.len() < AES_BLOCK_SIZE {
            continue;
        }
        let mut next_chain = [0u8; KEY_IV_SIZE];
        next_chain.copy_from_slice(chunk);
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for ((out, plain), prev) in chunk.iter_mut().zip(block.iter()).zip(chain.iter()) {
            *out = plain ^ prev;
        }
        chain = next_chain;
    }
    Ok(output)
}

/// Encrypt with CENC AES-CBC; the inverse of [`cenc_cbc_decrypt`].
pub fn cenc_cbc_encrypt(key: &[u8], iv: &[u8; KEY_IV_SIZE], input: &[u8], pattern: &PatternDesc) -> OecResult<Vec<u8>> {
    let cipher = <Aes128 as aes::cipher::KeyInit>::new_from_slice(key).map_err(|_| OemCryptoError::DecryptFailed)?;
    let mut chain = *iv;
    let mut output = input.to_vec();
    let (encrypt, period) = if pattern.skip == 0 || pattern.encrypt == 0 {
        (1, 1)
    } else {
        (pattern.encrypt, pattern.encrypt + pattern.skip)
    };

    for (index, chunk) in output.chunks_mut(AES_BLOCK_SIZE).enumerate() {
        if index % period >= encrypt || chunk.len() < AES_BLOCK_SIZE {
            continue;
        }
        for (byte, prev) in chunk.iter_mut().zip(chain.iter()) {
            *byte ^= prev;
        }
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.encrypt_block(&mut block);
        chunk.copy_from_slice(&block);
        chain.copy_from_slice(chunk);
    }
    Ok(output)
}

fn write_output(state: &mut EngineState, dest: &mut DestBufferDesc<'_>, data: &[u8]) -> OecResult<()> {
    match dest {
        DestBufferDesc::Clear { buffer } => {
            let target = buffer.get_mut(..data.len()).ok_or(OemCryptoError::OutputTooLarge)?;
            target.copy_from_slice(data);
        }
        DestBufferDesc::Secure {
            handle,
            offset,
            max_length,
        } => {
            let end = offset.checked_add(data.len()).ok_or(OemCryptoError::OutputTooLarge)?;
            if end > *max_length {
                return Err(OemCryptoError::OutputTooLarge);
            }
            let buffer = state
                .secure_buffers
                .get_mut(&*handle)
                .ok_or(OemCryptoError::InvalidContext)?;
            let target = buffer.get_mut(*offset..end).ok_or(OemCryptoError::OutputTooLarge)?;
            target.copy_from_slice(data);
        }
        DestBufferDesc::Direct { .. } => trace!("SoftwareEngine: {} bytes to decoder", data.len()),
    }
    Ok(())
}

fn parse_usage_header(header: &[u8]) -> OecResult<(u64, u32)> {
    if header.get(..4) != Some(USAGE_HEADER_MAGIC.as_slice()) {
        return Err(OemCryptoError::BadMagic);
    }
    let generation = header.get(4..12).ok_or(OemCryptoError::InvalidContext)?;
    let count = header.get(12..16).ok_or(OemCryptoError::InvalidContext)?;
    let mut generation_bytes = [0u8; 8];
    generation_bytes.copy_from_slice(generation);
    let mut count_bytes = [0u8; 4];
    count_bytes.copy_from_slice(count);
    Ok((u64::from_be_bytes(generation_bytes), u32::from_be_bytes(count_bytes)))
}

fn usage_entry_bytes(index: u32, generation: u64, record: &UsageRecord) -> Vec<u8> {
    let mut entry = Vec::with_capacity(17 + record.pst.len());
    entry.extend_from_slice(USAGE_ENTRY_MAGIC);
    entry.extend_from_slice(&index.to_be_bytes());
    entry.extend_from_slice(&generation.to_be_bytes());
    entry.push(match record.status {
        UsageEntryStatus::Unused => 0,
        UsageEntryStatus::Active => 1,
        UsageEntryStatus::Inactive => 2,
    });
    entry.extend_from_slice(&record.pst);
    entry
}

fn parse_usage_entry(entry: &[u8]) -> OecResult<(u32, UsageRecord)> {
    if entry.get(..4) != Some(USAGE_ENTRY_MAGIC.as_slice()) {
        return Err(OemCryptoError::BadMagic);
    }
    let index = entry.get(4..8).ok_or(OemCryptoError::InvalidContext)?;
    let mut index_bytes = [0u8; 4];
    index_bytes.copy_from_slice(index);
    let status = match entry.get(16) {
        Some(0) => UsageEntryStatus::Unused,
        Some(1) => UsageEntryStatus::Active,
        Some(2) => UsageEntryStatus::Inactive,
        _ => return Err(OemCryptoError::InvalidContext),
    };
    Ok((
        u32::from_be_bytes(index_bytes),
        UsageRecord {
            pst: entry.get(17..).unwrap_or_default().to_vec(),
            status,
        },
    ))
}

impl OemCrypto for SoftwareEngine {
    fn initialize(&self) -> OecResult<()> {
        self.enter("initialize")?;
        self.state.lock().initialized = true;
        Ok(())
    }

    fn terminate(&self) -> OecResult<()> {
        self.enter("terminate")?;
        let mut state = self.state.lock();
        state.sessions.clear();
        state.usage_table_loaded = false;
        state.initialized = false;
        Ok(())
    }

    fn set_sandbox(&self, sandbox_id: &[u8]) -> OecResult<()> {
        self.enter("set_sandbox")?;
        self.state.lock().sandbox_id = Some(sandbox_id.to_vec());
        Ok(())
    }

    fn open_session(&self, _level: SecurityLevel) -> OecResult<OecSessionId> {
        self.enter("open_session")?;
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(OemCryptoError::OpenSessionFailed);
        }
        if state.sessions.len() >= self.config.max_sessions {
            return Err(OemCryptoError::TooManySessions);
        }
        let id = OecSessionId(state.next_session_id);
        state.next_session_id += 1;
        state.sessions.insert(id, EngineSession::default());
        Ok(id)
    }

    fn close_session(&self, session: OecSessionId) -> OecResult<()> {
        self.enter("close_session")?;
        self.state
            .lock()
            .sessions
            .remove(&session)
            .map(|_| ())
            .ok_or(OemCryptoError::InvalidSession)
    }

    fn provisioning_method(&self, _level: SecurityLevel) -> ProvisioningMethod {
        let _ = self.enter("provisioning_method");
        self.config.provisioning_method
    }

    fn get_key_data(&self, out: &mut [u8], out_length: &mut usize, _level: SecurityLevel) -> OecResult<()> {
        self.enter("get_key_data")?;
        if self.config.provisioning_method != ProvisioningMethod::Keybox {
            return Err(OemCryptoError::NotImplemented);
        }
        write_sized(&self.config.keybox_key_data(), out, out_length)
    }

    fn get_oem_public_certificate(&self, session: OecSessionId, out: &mut [u8], out_length: &mut usize) -> OecResult<()> {
        self.enter("get_oem_public_certificate")?;
        if self.config.provisioning_method != ProvisioningMethod::OemCertificate {
            return Err(OemCryptoError::NotImplemented);
        }
        if !self.state.lock().sessions.contains_key(&session) {
            return Err(OemCryptoError::InvalidSession);
        }
        write_sized(&self.config.oem_certificate, out, out_length)
    }

    fn get_device_id(&self, out: &mut [u8], out_length: &mut usize, _level: SecurityLevel) -> OecResult<()> {
        self.enter("get_device_id")?;
        if self.config.device_id.is_empty() {
            return Err(OemCryptoError::NotImplemented);
        }
        write_sized(&self.config.device_id, out, out_length)
    }

    fn get_random(&self, out: &mut [u8]) -> OecResult<()> {
        self.enter("get_random")?;
        rand::thread_rng().fill_bytes(out);
        Ok(())
    }

    fn generate_nonce(&self, session: OecSessionId) -> OecResult<u32> {
        self.enter("generate_nonce")?;
        let mut state = self.state.lock();
        let engine_session = state.session(session)?;
        let nonce = rand::thread_rng().gen();
        if engine_session.nonces.len() == MAX_NONCES {
            engine_session.nonces.pop_front();
        }
        engine_session.nonces.push_back(nonce);
        Ok(nonce)
    }

    fn api_version(&self, _level: SecurityLevel) -> u32 {
        let _ = self.enter("api_version");
        self.api_version.load(Ordering::SeqCst)
    }

    fn security_level(&self, _level: SecurityLevel) -> Option<String> {
        let _ = self.enter("security_level");
        Some(self.config.security_level.clone())
    }

    fn supports_usage_table(&self, _level: SecurityLevel) -> bool {
        let _ = self.enter("supports_usage_table");
        self.supports_usage_table.load(Ordering::SeqCst)
    }

    fn get_hdcp_capability(&self, _level: SecurityLevel) -> OecResult<(HdcpCapability, HdcpCapability)> {
        self.enter("get_hdcp_capability")?;
        Ok((self.config.hdcp_current, self.config.hdcp_max))
    }

    fn get_number_of_open_sessions(&self, _level: SecurityLevel) -> OecResult<usize> {
        self.enter("get_number_of_open_sessions")?;
        Ok(self.state.lock().sessions.len())
    }

    fn get_max_number_of_sessions(&self, _level: SecurityLevel) -> OecResult<usize> {
        self.enter("get_max_number_of_sessions")?;
        Ok(self.config.max_sessions)
    }

    fn get_current_srm_version(&self) -> OecResult<u16> {
        self.enter("get_current_srm_version")?;
        self.state.lock().srm_version.ok_or(OemCryptoError::NotImplemented)
    }

    fn is_srm_update_supported(&self) -> bool {
        let _ = self.enter("is_srm_update_supported");
        self.config.srm_version.is_some()
    }

    fn load_srm(&self, srm: &[u8]) -> OecResult<()> {
        self.enter("load_srm")?;
        let mut state = self.state.lock();
        let Some(current) = state.srm_version else {
            return Err(OemCryptoError::NotImplemented);
        };
        let version = srm.get(..2).ok_or(OemCryptoError::InvalidContext)?;
        let version = u16::from_be_bytes([version[0], version[1]]);
        if version < current {
            return Err(OemCryptoError::InvalidContext);
        }
        state.srm_version = Some(version);
        Ok(())
    }

    fn resource_rating_tier(&self, _level: SecurityLevel) -> u32 {
        self.config.resource_rating_tier
    }

    fn build_information(&self, _level: SecurityLevel) -> Option<String> {
        self.config.build_information.clone()
    }

    fn generate_derived_keys(&self, session: OecSessionId, mac_key_context: &[u8], enc_key_context: &[u8]) -> OecResult<()> {
        self.enter("generate_derived_keys")?;
        let derived = DerivedKeys::derive(&self.config.device_key, mac_key_context, enc_key_context)?;
        self.state.lock().session(session)?.derived = Some(derived);
        Ok(())
    }

    fn derive_keys_from_session_key(
        &self,
        session: OecSessionId,
        enc_session_key: &[u8],
        mac_key_context: &[u8],
        enc_key_context: &[u8],
    ) -> OecResult<()> {
        self.enter("derive_keys_from_session_key")?;
        let mut state = self.state.lock();
        let engine_session = state.session(session)?;
        let rsa_key = engine_session.rsa_key.as_ref().ok_or(OemCryptoError::InvalidRsaKey)?;
        let session_key = rsa_key
            .decrypt(Oaep::new::<Sha1>(), enc_session_key)
            .map_err(|_| OemCryptoError::InvalidContext)?;
        engine_session.derived = Some(DerivedKeys::derive(&session_key, mac_key_context, enc_key_context)?);
        Ok(())
    }

    fn generate_signature(
        &self,
        session: OecSessionId,
        message: &[u8],
        signature: &mut [u8],
        signature_length: &mut usize,
    ) -> OecResult<()> {
        self.enter("generate_signature")?;
        let mut state = self.state.lock();
        let derived = state.session(session)?.derived.as_ref().ok_or(OemCryptoError::InvalidContext)?;
        let mut mac = HmacSha256::new_from_slice(&derived.mac_key_client).map_err(|_| OemCryptoError::InvalidContext)?;
        mac.update(message);
        write_sized(&mac.finalize().into_bytes(), signature, signature_length)
    }

    fn generate_rsa_signature(
        &self,
        session: OecSessionId,
        message: &[u8],
        signature: &mut [u8],
        signature_length: &mut usize,
        padding: RsaPaddingScheme,
    ) -> OecResult<()> {
        self.enter("generate_rsa_signature")?;
        let loaded = self.state.lock().session(session)?.rsa_key.clone();
        let rsa_key = match loaded {
            Some(rsa_key) => rsa_key,
            // Unprovisioned OEM certificate devices sign with the OEM key.
            None if self.config.provisioning_method == ProvisioningMethod::OemCertificate => self.oem_private_key()?,
            None => return Err(OemCryptoError::InvalidRsaKey),
        };
        if signature.len() < rsa_key.size() {
            *signature_length = rsa_key.size();
            return Err(OemCryptoError::ShortBuffer);
        }
        let signed = match padding {
            RsaPaddingScheme::RsassaPss => {
                rsa_key.sign_with_rng(&mut rand::thread_rng(), Pss::new::<Sha1>(), &Sha1::digest(message))
            }
            RsaPaddingScheme::Pkcs1Block1 => rsa_key.sign(Pkcs1v15Sign::new_unprefixed(), message),
        }
        .map_err(|_| OemCryptoError::InvalidRsaKey)?;
        write_sized(&signed, signature, signature_length)
    }

    fn load_device_rsa_key(&self, session: OecSessionId, wrapped_rsa_key: &[u8]) -> OecResult<()> {
        self.enter("load_device_rsa_key")?;
        let rsa_key = unwrap_rsa_key(&self.config.device_key, wrapped_rsa_key)?;
        self.state.lock().session(session)?.rsa_key = Some(rsa_key);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn rewrap_device_rsa_key(
        &self,
        session: OecSessionId,
        message: &[u8],
        signature: &[u8],
        nonce: Substring,
        enc_rsa_key: Substring,
        enc_rsa_key_iv: Substring,
        wrapped_rsa_key: &mut [u8],
        wrapped_rsa_key_length: &mut usize,
    ) -> OecResult<()> {
        self.enter("rewrap_device_rsa_key")?;
        if self.config.provisioning_method != ProvisioningMethod::Keybox {
            return Err(OemCryptoError::NotImplemented);
        }
        let mut state = self.state.lock();
        let engine_session = state.session(session)?;
        let derived = engine_session.derived.as_ref().ok_or(OemCryptoError::InvalidContext)?;
        verify_hmac(&derived.mac_key_server, message, signature)?;
        let nonce = parse_nonce(range(message, nonce)?)?;
        engine_session.check_nonce(nonce)?;

        let iv = range(message, enc_rsa_key_iv)?;
        let pkcs8 = cbc_decrypt_padded(&derived.enc_key, iv, range(message, enc_rsa_key)?)
            .map_err(|_| OemCryptoError::InvalidRsaKey)?;
        rewrap_pkcs8(&self.config.device_key, &pkcs8, wrapped_rsa_key, wrapped_rsa_key_length)?;
        engine_session.consume_nonce(nonce);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn rewrap_device_rsa_key_30(
        &self,
        session: OecSessionId,
        nonce: &[u8],
        encrypted_message_key: &[u8],
        enc_rsa_key: &[u8],
        enc_rsa_key_iv: &[u8],
        wrapped_rsa_key: &mut [u8],
        wrapped_rsa_key_length: &mut usize,
    ) -> OecResult<()> {
        self.enter("rewrap_device_rsa_key_30")?;
        let oem_key = self.oem_private_key()?;
        let mut state = self.state.lock();
        let engine_session = state.session(session)?;
        let nonce = parse_nonce(nonce)?;
        engine_session.check_nonce(nonce)?;

        let message_key = oem_key
            .decrypt(Oaep::new::<Sha1>(), encrypted_message_key)
            .map_err(|_| OemCryptoError::InvalidContext)?;
        let pkcs8 =
            cbc_decrypt_padded(&message_key, enc_rsa_key_iv, enc_rsa_key).map_err(|_| OemCryptoError::InvalidRsaKey)?;
        rewrap_pkcs8(&self.config.device_key, &pkcs8, wrapped_rsa_key, wrapped_rsa_key_length)?;
        engine_session.consume_nonce(nonce);
        Ok(())
    }

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
    ) -> OecResult<()> {
        self.enter("load_keys")?;
        let mut state = self.state.lock();
        let legacy_usage = self.supports_usage_table.load(Ordering::SeqCst);
        let max_keys = self.config.max_keys;
        let engine_session = state.session(session)?;
        let derived = engine_session.derived.clone().ok_or(OemCryptoError::InvalidContext)?;

        verify_hmac(&derived.mac_key_server, message, signature)?;

        if keys.len() > max_keys {
            return Err(OemCryptoError::TooManyKeys);
        }
        if srm_requirement.is_present() {
            range(message, srm_requirement)?;
        }

        let new_mac_keys = if enc_mac_keys.is_present() {
            let iv = range(message, enc_mac_keys_iv)?;
            let wrapped = range(message, enc_mac_keys)?;
            if wrapped.len() != 2 * MAC_KEY_SIZE {
                return Err(OemCryptoError::InvalidContext);
            }
            Some(cbc_decrypt_no_padding(&derived.enc_key, iv, wrapped)?)
        } else {
            None
        };

        let mut unwrapped = Vec::with_capacity(keys.len());
        for key in keys {
            let key_id = range(message, key.key_id)?;
            let key_data_iv = range(message, key.key_data_iv)?;
            let key_data = range(message, key.key_data)?;
            let expected = match license_type {
                LicenseType::Content => CONTENT_KEY_SIZE,
                LicenseType::Entitlement => ENTITLEMENT_KEY_SIZE,
            };
            if key_data.len() != expected {
                return Err(OemCryptoError::InvalidContext);
            }
            let clear_key = cbc_decrypt_no_padding(&derived.enc_key, key_data_iv, key_data)?;

            if key.key_control.is_present() {
                let control_iv = range(message, key.key_control_iv)?;
                let control = range(message, key.key_control)?;
                let control = cbc_decrypt_no_padding(&clear_key[..CONTENT_KEY_SIZE], control_iv, control)
                    .map_err(|_| OemCryptoError::ControlInvalid)?;
                if !control.starts_with(KEY_CONTROL_MAGIC) {
                    return Err(OemCryptoError::ControlInvalid);
                }
            }
            unwrapped.push((key_id.to_vec(), clear_key, key.cipher_mode));
        }

        if let Some(mac_keys) = new_mac_keys {
            if let Some(derived) = engine_session.derived.as_mut() {
                derived.mac_key_server.copy_from_slice(&mac_keys[..MAC_KEY_SIZE]);
                derived.mac_key_client.copy_from_slice(&mac_keys[MAC_KEY_SIZE..]);
            }
        }
        engine_session.license_type = Some(license_type);
        engine_session.selected_key = None;
        for (key_id, key, cipher_mode) in unwrapped {
            match license_type {
                LicenseType::Content => {
                    engine_session.key_modes.insert(key_id.clone(), cipher_mode);
                    engine_session.content_keys.insert(key_id, key);
                }
                LicenseType::Entitlement => {
                    engine_session
                        .entitlement_keys
                        .insert(key_id, EntitlementSlot { key, content: None });
                }
            }
        }

        if pst.is_present() {
            let pst = range(message, pst)?.to_vec();
            let entry = engine_session.usage_entry;
            if let Some(record) = entry.and_then(|index| state.usage_entries.get_mut(index as usize)) {
                *record = Some(UsageRecord {
                    pst: pst.clone(),
                    status: UsageEntryStatus::Active,
                });
            }
            if legacy_usage {
                state.legacy_usage.insert(pst, UsageEntryStatus::Active);
            }
        }
        Ok(())
    }

    fn refresh_keys(
        &self,
        session: OecSessionId,
        message: &[u8],
        signature: &[u8],
        keys: &[KeyRefreshObject],
    ) -> OecResult<()> {
        self.enter("refresh_keys")?;
        let mut state = self.state.lock();
        let engine_session = state.session(session)?;
        let derived = engine_session.derived.as_ref().ok_or(OemCryptoError::InvalidContext)?;
        verify_hmac(&derived.mac_key_server, message, signature)?;

        for key in keys {
            if !key.key_control.is_present() {
                continue;
            }
            let control = range(message, key.key_control)?;
            let control = if key.key_id.is_present() {
                let license_key = engine_session
                    .license_key(range(message, key.key_id)?)
                    .ok_or(OemCryptoError::NoContentKey)?;
                let control_key = license_key.get(..CONTENT_KEY_SIZE).ok_or(OemCryptoError::ControlInvalid)?;
                let iv = range(message, key.key_control_iv)?;
                cbc_decrypt_no_padding(control_key, iv, control).map_err(|_| OemCryptoError::ControlInvalid)?
            } else {
                control.to_vec()
            };
            if !control.starts_with(KEY_CONTROL_MAGIC) {
                return Err(OemCryptoError::ControlInvalid);
            }
        }
        Ok(())
    }

    fn load_entitled_content_keys(
        &self,
        session: OecSessionId,
        message: &[u8],
        keys: &[EntitledContentKeyObject],
    ) -> OecResult<()> {
        self.enter("load_entitled_content_keys")?;
        let mut state = self.state.lock();
        let engine_session = state.session(session)?;
        if engine_session.license_type != Some(LicenseType::Entitlement) {
            return Err(OemCryptoError::InvalidContext);
        }
        for key in keys {
            let entitlement_key_id = range(message, key.entitlement_key_id)?;
            let content_key_id = range(message, key.content_key_id)?;
            let iv = range(message, key.content_key_data_iv)?;
            let wrapped = range(message, key.content_key_data)?;
            let slot = engine_session
                .entitlement_keys
                .get_mut(entitlement_key_id)
                .ok_or(OemCryptoError::KeyNotEntitled)?;
            let content_key = cbc_decrypt_no_padding(&slot.key, iv, wrapped)?;
            slot.content = Some((content_key_id.to_vec(), content_key));
        }
        engine_session.selected_key = None;
        Ok(())
    }

    fn select_key(&self, session: OecSessionId, key_id: &[u8], cipher_mode: CipherMode) -> OecResult<()> {
        self.enter("select_key")?;
        let switches_mode = self.api_version.load(Ordering::SeqCst) >= API_VERSION_CIPHER_MODE_SWITCH;
        let mut state = self.state.lock();
        let engine_session = state.session(session)?;
        let key = engine_session.find_key(key_id).cloned().ok_or(OemCryptoError::NoContentKey)?;
        // Older engines decrypt in the mode the key was loaded with.
        let cipher_mode = match engine_session.key_modes.get(key_id) {
            Some(&loaded) if !switches_mode => loaded,
            _ => cipher_mode,
        };
        engine_session.selected_key = Some((key, cipher_mode));
        Ok(())
    }

    fn decrypt_cenc(
        &self,
        session: OecSessionId,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDesc,
    ) -> OecResult<()> {
        self.enter("decrypt_cenc")?;
        if !pattern.is_valid() {
            return Err(OemCryptoError::InvalidContext);
        }
        self.check_buffer_size(sample.input.len())?;
        let mut state = self.state.lock();
        let engine_session = state.session(session)?;

        let output = if sample.is_encrypted {
            let (key, mode) = engine_session.selected_key.as_ref().ok_or(OemCryptoError::NoContentKey)?;
            match mode {
                CipherMode::Ctr => cenc_ctr(key, &sample.iv, sample.block_offset, sample.input, pattern)?,
                CipherMode::Cbc => cenc_cbc_decrypt(key, &sample.iv, sample.input, pattern)?,
            }
        } else {
            sample.input.to_vec()
        };
        write_output(&mut state, dest, &output)
    }

    fn copy_buffer(
        &self,
        session: OecSessionId,
        input: &[u8],
        dest: &mut DestBufferDesc<'_>,
        _subsample_flags: SubsampleFlags,
    ) -> OecResult<()> {
        self.enter("copy_buffer")?;
        self.check_buffer_size(input.len())?;
        let mut state = self.state.lock();
        state.session(session)?;
        write_output(&mut state, dest, input)
    }

    fn generic_encrypt(
        &self,
        session: OecSessionId,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> OecResult<()> {
        self.enter("generic_encrypt")?;
        if algorithm != GenericAlgorithm::AesCbc128NoPadding || input.len() % AES_BLOCK_SIZE != 0 {
            return Err(OemCryptoError::InvalidContext);
        }
        let mut state = self.state.lock();
        let key = state.selected_key(session)?;
        let encrypted = cbc_encrypt_no_padding(&key, iv, input)?;
        out.get_mut(..encrypted.len())
            .ok_or(OemCryptoError::ShortBuffer)?
            .copy_from_slice(&encrypted);
        Ok(())
    }

    fn generic_decrypt(
        &self,
        session: OecSessionId,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> OecResult<()> {
        self.enter("generic_decrypt")?;
        if algorithm != GenericAlgorithm::AesCbc128NoPadding || input.len() % AES_BLOCK_SIZE != 0 {
            return Err(OemCryptoError::InvalidContext);
        }
        let mut state = self.state.lock();
        let key = state.selected_key(session)?;
        let decrypted = cbc_decrypt_no_padding(&key, iv, input)?;
        out.get_mut(..decrypted.len())
            .ok_or(OemCryptoError::ShortBuffer)?
            .copy_from_slice(&decrypted);
        Ok(())
    }

    fn generic_sign(
        &self,
        session: OecSessionId,
        input: &[u8],
        algorithm: GenericAlgorithm,
        signature: &mut [u8],
        signature_length: &mut usize,
    ) -> OecResult<()> {
        self.enter("generic_sign")?;
        if algorithm != GenericAlgorithm::HmacSha256 {
            return Err(OemCryptoError::InvalidContext);
        }
        if signature.len() < HMAC_SHA256_SIGNATURE_SIZE {
            *signature_length = HMAC_SHA256_SIGNATURE_SIZE;
            return Err(OemCryptoError::ShortBuffer);
        }
        let mut state = self.state.lock();
        let key = state.selected_key(session)?;
        let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| OemCryptoError::InvalidContext)?;
        mac.update(input);
        write_sized(&mac.finalize().into_bytes(), signature, signature_length)
    }

    fn generic_verify(
        &self,
        session: OecSessionId,
        input: &[u8],
        algorithm: GenericAlgorithm,
        signature: &[u8],
    ) -> OecResult<()> {
        self.enter("generic_verify")?;
        if algorithm != GenericAlgorithm::HmacSha256 {
            return Err(OemCryptoError::InvalidContext);
        }
        let mut state = self.state.lock();
        let key = state.selected_key(session)?;
        let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| OemCryptoError::InvalidContext)?;
        mac.update(input);
        mac.verify_slice(signature).map_err(|_| OemCryptoError::SignatureFailure)
    }

    fn update_usage_table(&self) -> OecResult<()> {
        self.enter("update_usage_table")?;
        if !self.supports_usage_table.load(Ordering::SeqCst) {
            return Err(OemCryptoError::NotImplemented);
        }
        Ok(())
    }

    fn deactivate_usage_entry(&self, session: OecSessionId, pst: &[u8]) -> OecResult<()> {
        self.enter("deactivate_usage_entry")?;
        let mut state = self.state.lock();
        state.session(session)?;
        let status = state.legacy_usage.get_mut(pst).ok_or(OemCryptoError::InvalidContext)?;
        if *status == UsageEntryStatus::Inactive {
            return Err(OemCryptoError::InvalidContext);
        }
        *status = UsageEntryStatus::Inactive;
        for record in state.usage_entries.iter_mut().flatten() {
            if record.pst == pst {
                record.status = UsageEntryStatus::Inactive;
            }
        }
        Ok(())
    }

    fn report_usage(&self, session: OecSessionId, pst: &[u8], out: &mut [u8], out_length: &mut usize) -> OecResult<()> {
        self.enter("report_usage")?;
        let mut state = self.state.lock();
        let derived = state.session(session)?.derived.clone();
        let status = *state.legacy_usage.get(pst).ok_or(OemCryptoError::InvalidContext)?;
        let record = UsageRecord {
            pst: pst.to_vec(),
            status,
        };
        let mut report = usage_entry_bytes(0, state.usage_generation, &record);
        if let Some(derived) = derived {
            let mut mac =
                HmacSha256::new_from_slice(&derived.mac_key_client).map_err(|_| OemCryptoError::InvalidContext)?;
            mac.update(&report);
            report.extend_from_slice(&mac.finalize().into_bytes());
        }
        write_sized(&report, out, out_length)
    }

    fn delete_usage_entry(&self, session: OecSessionId, pst: Substring, message: &[u8], signature: &[u8]) -> OecResult<()> {
        self.enter("delete_usage_entry")?;
        let mut state = self.state.lock();
        let derived = state.session(session)?.derived.as_ref().ok_or(OemCryptoError::InvalidContext)?;
        verify_hmac(&derived.mac_key_server, message, signature)?;
        let pst = range(message, pst)?;
        state
            .legacy_usage
            .remove(pst)
            .map(|_| ())
            .ok_or(OemCryptoError::InvalidContext)
    }

    fn force_delete_usage_entry(&self, pst: &[u8]) -> OecResult<()> {
        self.enter("force_delete_usage_entry")?;
        self.state
            .lock()
            .legacy_usage
            .remove(pst)
            .map(|_| ())
            .ok_or(OemCryptoError::InvalidContext)
    }

    fn delete_old_usage_table(&self) -> OecResult<()> {
        self.enter("delete_old_usage_table")?;
        self.state.lock().legacy_usage.clear();
        Ok(())
    }

    fn create_usage_table_header(&self, _level: SecurityLevel, out: &mut [u8], out_length: &mut usize) -> OecResult<()> {
        self.enter("create_usage_table_header")?;
        let mut state = self.state.lock();
        let generation = state.usage_generation + 1;
        let header = state.usage_header_bytes(generation, 0);
        write_sized(&header, out, out_length)?;
        state.usage_generation = generation;
        state.usage_entries.clear();
        state.usage_table_loaded = true;
        Ok(())
    }

    fn load_usage_table_header(&self, _level: SecurityLevel, header: &[u8]) -> OecResult<()> {
        self.enter("load_usage_table_header")?;
        let (generation, count) = parse_usage_header(header)?;
        let mut state = self.state.lock();
        let skew = state.usage_table_loaded && generation != state.usage_generation;
        if skew && generation.abs_diff(state.usage_generation) > 1 {
            return Err(OemCryptoError::GenerationSkew);
        }
        state.usage_generation = generation;
        state.usage_entries.resize(count as usize, None);
        state.usage_table_loaded = true;
        if skew {
            Err(OemCryptoError::WarningGenerationSkew)
        } else {
            Ok(())
        }
    }

    fn create_new_usage_entry(&self, session: OecSessionId) -> OecResult<u32> {
        self.enter("create_new_usage_entry")?;
        let mut state = self.state.lock();
        if !state.usage_table_loaded {
            return Err(OemCryptoError::InvalidContext);
        }
        if state.usage_entries.len() >= self.config.max_usage_entries {
            return Err(OemCryptoError::InsufficientResources);
        }
        let index = state.usage_entries.len() as u32;
        state.session(session)?.usage_entry = Some(index);
        state.usage_entries.push(Some(UsageRecord {
            pst: Vec::new(),
            status: UsageEntryStatus::Unused,
        }));
        Ok(index)
    }

    fn load_usage_entry(&self, session: OecSessionId, index: u32, entry: &[u8]) -> OecResult<()> {
        self.enter("load_usage_entry")?;
        let (stored_index, record) = parse_usage_entry(entry)?;
        let mut state = self.state.lock();
        if stored_index != index || index as usize >= state.usage_entries.len() {
            return Err(OemCryptoError::InvalidContext);
        }
        state.session(session)?.usage_entry = Some(index);
        state.usage_entries[index as usize] = Some(record);
        Ok(())
    }

    fn update_usage_entry(
        &self,
        session: OecSessionId,
        header: &mut [u8],
        header_length: &mut usize,
        entry: &mut [u8],
        entry_length: &mut usize,
    ) -> OecResult<()> {
        self.enter("update_usage_entry")?;
        let mut state = self.state.lock();
        let index = state.session(session)?.usage_entry.ok_or(OemCryptoError::InvalidContext)?;
        let record = state
            .usage_entries
            .get(index as usize)
            .cloned()
            .flatten()
            .ok_or(OemCryptoError::InvalidContext)?;

        let generation = state.usage_generation + 1;
        let new_header = state.usage_header_bytes(generation, state.usage_entries.len());
        let new_entry = usage_entry_bytes(index, generation, &record);
        *header_length = new_header.len();
        *entry_length = new_entry.len();
        if header.len() < new_header.len() || entry.len() < new_entry.len() {
            return Err(OemCryptoError::ShortBuffer);
        }
        header[..new_header.len()].copy_from_slice(&new_header);
        entry[..new_entry.len()].copy_from_slice(&new_entry);
        state.usage_generation = generation;
        Ok(())
    }

    fn shrink_usage_table_header(
        &self,
        _level: SecurityLevel,
        new_entry_count: u32,
        out: &mut [u8],
        out_length: &mut usize,
    ) -> OecResult<()> {
        self.enter("shrink_usage_table_header")?;
        let mut state = self.state.lock();
        if new_entry_count as usize > state.usage_entries.len() {
            return Err(OemCryptoError::InvalidContext);
        }
        let generation = state.usage_generation + 1;
        let header = state.usage_header_bytes(generation, new_entry_count as usize);
        write_sized(&header, out, out_length)?;
        state.usage_entries.truncate(new_entry_count as usize);
        state.usage_generation = generation;
        Ok(())
    }

    fn move_entry(&self, session: OecSessionId, new_index: u32) -> OecResult<()> {
        self.enter("move_entry")?;
        let mut state = self.state.lock();
        let index = state.session(session)?.usage_entry.ok_or(OemCryptoError::InvalidContext)?;
        let new_slot = new_index as usize;
        if new_slot >= state.usage_entries.len() {
            return Err(OemCryptoError::InvalidContext);
        }
        let record = state.usage_entries.get_mut(index as usize).and_then(Option::take);
        state.usage_entries[new_slot] = record;
        state.session(session)?.usage_entry = Some(new_index);
        Ok(())
    }
}

/// A license signed for a specific request, ready for `load_keys`.
#[derive(Debug, Clone, Default)]
pub struct SignedLicense {
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
    pub mac_key_iv: Vec<u8>,
    pub mac_key: Vec<u8>,
    pub keys: Vec<CryptoKey>,
    pub provider_session_token: Vec<u8>,
}

impl SignedLicense {
    /// Borrow the license in the form `CryptoSession::load_keys` takes.
    #[must_use]
    pub fn license_keys(&self) -> LicenseKeys<'_> {
        LicenseKeys {
            message: &self.message,
            signature: &self.signature,
            mac_key_iv: &self.mac_key_iv,
            mac_key: &self.mac_key,
            keys: &self.keys,
            provider_session_token: &self.provider_session_token,
            srm_requirement: &[],
        }
    }
}

/// Builds licenses the [`SoftwareEngine`] accepts for a given request.
///
/// ```
/// use wvcrypto::oemcrypto::CipherMode;
/// use wvcrypto::software::LicenseBuilder;
///
/// let license = LicenseBuilder::new(&[0x42; 16], b"request")
///     .expect("valid device key")
///     .content_key(b"kid-1", [7; 16], CipherMode::Ctr)
///     .build();
/// assert_eq!(license.keys.len(), 1);
/// ```
pub struct LicenseBuilder {
    keys: DerivedKeys,
    body: Vec<u8>,
    license: SignedLicense,
}

impl LicenseBuilder {
    /// Start a license answering `request` from a device with `device_key`.
    pub fn new(device_key: &[u8], request: &[u8]) -> Result<Self> {
        let keys = DerivedKeys::for_request(device_key, request)
            .map_err(|code| Error::InvalidConfiguration(format!("cannot derive license keys: {}", code)))?;
        Ok(Self {
            keys,
            body: b"wvcrypto-license".to_vec(),
            license: SignedLicense::default(),
        })
    }

    /// Keys the license is wrapped and signed with.
    #[must_use]
    pub fn derived_keys(&self) -> &DerivedKeys {
        &self.keys
    }

    fn wrap(&self, key: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut iv = [0u8; KEY_IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        // Key sizes are multiples of the block size and the key is 16 bytes.
        let wrapped = cbc_encrypt_no_padding(&self.keys.enc_key, &iv, key).unwrap_or_default();
        (iv.to_vec(), wrapped)
    }

    fn key_control(key: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let iv = random_iv();
        let mut block = [0u8; AES_BLOCK_SIZE];
        block[..4].copy_from_slice(KEY_CONTROL_MAGIC);
        let control_key = key.get(..CONTENT_KEY_SIZE).unwrap_or(key);
        let control = cbc_encrypt_no_padding(control_key, &iv, &block).unwrap_or_default();
        (control, iv.to_vec())
    }

    fn push_key(&mut self, key_id: &[u8], key: &[u8], cipher_mode: CipherMode, with_control: bool) {
        let (iv, wrapped) = self.wrap(key);
        let mut crypto_key = CryptoKey::new(key_id.to_vec(), wrapped, iv).with_cipher_mode(cipher_mode);
        if with_control {
            let (control, control_iv) = Self::key_control(key);
            crypto_key = crypto_key.with_key_control(control, control_iv);
        }
        for field in [
            &crypto_key.key_id,
            &crypto_key.key_data_iv,
            &crypto_key.key_data,
            &crypto_key.key_control_iv,
            &crypto_key.key_control,
        ] {
            self.body.extend_from_slice(field);
        }
        self.license.keys.push(crypto_key);
    }

    /// Add a 16-byte content key with a key control block.
    #[must_use]
    pub fn content_key(mut self, key_id: &[u8], key: [u8; CONTENT_KEY_SIZE], cipher_mode: CipherMode) -> Self {
        self.push_key(key_id, &key, cipher_mode, true);
        self
    }

    /// Add a content key without key control data.
    #[must_use]
    pub fn content_key_without_control(mut self, key_id: &[u8], key: [u8; CONTENT_KEY_SIZE]) -> Self {
        self.push_key(key_id, &key, CipherMode::Ctr, false);
        self
    }

    /// Add a 32-byte entitlement key.
    #[must_use]
    pub fn entitlement_key(mut self, key_id: &[u8], key: [u8; ENTITLEMENT_KEY_SIZE]) -> Self {
        self.push_key(key_id, &key, CipherMode::Ctr, true);
        self
    }

    /// Rotate the session MAC keys to `server` and `client`.
    #[must_use]
    pub fn mac_keys(mut self, server: [u8; MAC_KEY_SIZE], client: [u8; MAC_KEY_SIZE]) -> Self {
        let mut keys = Vec::with_capacity(2 * MAC_KEY_SIZE);
        keys.extend_from_slice(&server);
        keys.extend_from_slice(&client);
        let (iv, wrapped) = self.wrap(&keys);
        self.body.extend_from_slice(&iv);
        self.body.extend_from_slice(&wrapped);
        self.license.mac_key_iv = iv;
        self.license.mac_key = wrapped;
        self
    }

    #[must_use]
    pub fn provider_session_token(mut self, pst: &[u8]) -> Self {
        self.body.extend_from_slice(pst);
        self.license.provider_session_token = pst.to_vec();
        self
    }

    /// Sign the license with the server MAC key.
    #[must_use]
    pub fn build(mut self) -> SignedLicense {
        let signature = HmacSha256::new_from_slice(&self.keys.mac_key_server)
            .map(|mut mac| {
                mac.update(&self.body);
                mac.finalize().into_bytes().to_vec()
            })
            .unwrap_or_default();
        self.license.message = self.body;
        self.license.signature = signature;
        self.license
    }
}

/// Wrap a content key under a 32-byte entitlement key, as a licensing
/// server does for entitled keys.
#[must_use]
pub fn entitled_content_key(
    entitlement_key_id: &[u8],
    entitlement_key: &[u8; ENTITLEMENT_KEY_SIZE],
    content_key_id: &[u8],
    content_key: &[u8; CONTENT_KEY_SIZE],
    cipher_mode: CipherMode,
) -> CryptoKey {
    let mut iv = [0u8; KEY_IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let wrapped = cbc_encrypt_no_padding(entitlement_key, &iv, content_key).unwrap_or_default();
    CryptoKey::new(content_key_id.to_vec(), wrapped, iv.to_vec())
        .with_entitlement_key_id(entitlement_key_id.to_vec())
        .with_cipher_mode(cipher_mode)
}

/// A signed license renewal, ready for `CryptoSession::refresh_keys`.
#[derive(Debug, Clone, Default)]
pub struct SignedRenewal {
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
    pub keys: Vec<CryptoKey>,
}

/// Builds license renewals the [`SoftwareEngine`] accepts.
pub struct RenewalBuilder {
    mac_key_server: [u8; MAC_KEY_SIZE],
    body: Vec<u8>,
    keys: Vec<CryptoKey>,
}

impl RenewalBuilder {
    /// Start a renewal signed with the session's current server MAC key.
    #[must_use]
    pub fn new(mac_key_server: [u8; MAC_KEY_SIZE]) -> Self {
        Self {
            mac_key_server,
            body: b"wvcrypto-renewal".to_vec(),
            keys: Vec::new(),
        }
    }

    /// Renew `key_id` with a key control block encrypted under `key`.
    #[must_use]
    pub fn key(mut self, key_id: &[u8], key: &[u8]) -> Self {
        let (control, control_iv) = LicenseBuilder::key_control(key);
        self.body.extend_from_slice(key_id);
        self.body.extend_from_slice(&control_iv);
        self.body.extend_from_slice(&control);
        self.keys.push(CryptoKey::new(key_id.to_vec(), Vec::new(), Vec::new()).with_key_control(control, control_iv));
        self
    }

    /// Renew every loaded key with one clear key control block.
    #[must_use]
    pub fn all_keys(mut self) -> Self {
        let mut block = [0u8; AES_BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut block);
        block[..4].copy_from_slice(KEY_CONTROL_MAGIC);
        self.body.extend_from_slice(&block);
        self.keys.push(CryptoKey::default().with_key_control(block.to_vec(), Vec::new()));
        self
    }

    #[must_use]
    pub fn build(self) -> SignedRenewal {
        SignedRenewal {
            signature: sign_hmac(&self.mac_key_server, &self.body).unwrap_or_default(),
            message: self.body,
            keys: self.keys,
        }
    }
}

/// A provisioning response carrying a new device RSA key, in the form
/// `CryptoSession::rewrap_certificate` takes.
#[derive(Debug, Clone, Default)]
pub struct ProvisioningResponse {
    pub message: Vec<u8>,
    /// Empty for OEM certificate devices.
    pub signature: Vec<u8>,
    pub nonce: Vec<u8>,
    pub enc_rsa_key: Vec<u8>,
    pub enc_rsa_key_iv: Vec<u8>,
    /// AES key `enc_rsa_key` is encrypted under, RSA-OAEP encrypted to the
    /// OEM certificate. Empty for keybox devices.
    pub wrapping_key: Vec<u8>,
}

impl ProvisioningResponse {
    /// Answer `request` from a keybox device holding `device_key`.
    pub fn for_keybox(device_key: &[u8], request: &[u8], nonce: u32, private_key: &RsaPrivateKey) -> Result<Self> {
        let keys = DerivedKeys::for_request(device_key, request)
            .map_err(|code| Error::InvalidConfiguration(format!("cannot derive provisioning keys: {}", code)))?;
        let mut response = Self::encrypt(&keys.enc_key, nonce, private_key)?;
        response.message = [
            response.nonce.as_slice(),
            &response.enc_rsa_key_iv,
            &response.enc_rsa_key,
        ]
        .concat();
        response.signature = sign_hmac(&keys.mac_key_server, &response.message)
            .map_err(|code| Error::InvalidConfiguration(format!("cannot sign provisioning response: {}", code)))?;
        Ok(response)
    }

    /// Answer a device whose OEM certificate holds `oem_public_key`.
    pub fn for_oem_certificate(oem_public_key: &RsaPublicKey, nonce: u32, private_key: &RsaPrivateKey) -> Result<Self> {
        let mut message_key = [0u8; CONTENT_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut message_key);
        let mut response = Self::encrypt(&message_key, nonce, private_key)?;
        response.wrapping_key = oem_public_key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), &message_key)?;
        response.message = [
            response.nonce.as_slice(),
            &response.enc_rsa_key_iv,
            &response.enc_rsa_key,
            &response.wrapping_key,
        ]
        .concat();
        Ok(response)
    }

    fn encrypt(key: &[u8], nonce: u32, private_key: &RsaPrivateKey) -> Result<Self> {
        let pkcs8 = private_key.to_pkcs8_der()?;
        let iv = random_iv();
        let enc_rsa_key = cbc_encrypt_padded(key, &iv, pkcs8.as_bytes())
            .map_err(|code| Error::InvalidConfiguration(format!("cannot encrypt RSA key: {}", code)))?;
        Ok(Self {
            nonce: nonce.to_le_bytes().to_vec(),
            enc_rsa_key,
            enc_rsa_key_iv: iv.to_vec(),
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_RSA_KEY: &str = include_str!("../tests/data/device_rsa_key.pem");

    #[test]
    fn derived_keys_follow_request() {
        let first = DerivedKeys::for_request(&[1; 16], b"request-a").expect("derive");
        let second = DerivedKeys::for_request(&[1; 16], b"request-b").expect("derive");
        assert_ne!(first.enc_key, second.enc_key);
        assert_ne!(first.mac_key_server, first.mac_key_client);
        assert!(DerivedKeys::for_request(&[1; 5], b"request-a").is_err());
    }

    #[test]
    fn cbcs_leaves_skipped_blocks_clear() {
        let key = [3u8; 16];
        let iv = [9u8; 16];
        let pattern = PatternDesc { encrypt: 1, skip: 9 };
        let plaintext: Vec<u8> = (0..(160 * 3 + 7)).map(|i| i as u8).collect();

        let ciphertext = cenc_cbc_encrypt(&key, &iv, &plaintext, &pattern).expect("encrypt");
        assert_ne!(ciphertext[..16], plaintext[..16]);
        assert_eq!(ciphertext[16..160], plaintext[16..160]);
        assert_eq!(ciphertext[480..], plaintext[480..]);
        assert_eq!(cenc_cbc_decrypt(&key, &iv, &ciphertext, &pattern).expect("decrypt"), plaintext);
    }

    #[test]
    fn ctr_honours_block_offset() {
        let key = [5u8; 16];
        let iv = [0u8; 16];
        let plaintext = [0xabu8; 48];
        let full = cenc_ctr(&key, &iv, 0, &plaintext, &PatternDesc::default()).expect("ctr");
        let tail = cenc_ctr(&key, &iv, 4, &plaintext[4..], &PatternDesc::default()).expect("ctr");
        assert_eq!(&full[4..], tail.as_slice());
    }

    #[test]
    fn config_from_yaml() {
        let config = SoftwareEngineConfig::from_yaml_str(
            "api_version: 12\nsecurity_level: L1\ndevice_key: 000102030405060708090a0b0c0d0e0f\nmax_buffer_size: 1024\n",
        )
        .expect("valid config");
        assert_eq!(config.api_version, 12);
        assert_eq!(config.device_key, (0u8..16).collect::<Vec<_>>());
        assert_eq!(config.max_buffer_size, Some(1024));
        assert_eq!(config.max_sessions, 16);

        let token = config.keybox_key_data();
        assert_eq!(token.len(), KEYBOX_KEY_DATA_SIZE);
        assert_eq!(&token[4..8], &4445u32.to_be_bytes());

        let short_key = SoftwareEngineConfig {
            device_key: vec![1, 2, 3],
            ..SoftwareEngineConfig::default()
        };
        assert!(matches!(SoftwareEngine::from_config(short_key), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn injected_faults_are_consumed_in_order() {
        let engine = SoftwareEngine::default();
        engine.inject_failure("get_random", OemCryptoError::UnknownFailure);
        let mut buf = [0u8; 4];
        assert_eq!(engine.get_random(&mut buf), Err(OemCryptoError::UnknownFailure));
        assert_eq!(engine.get_random(&mut buf), Ok(()));
        assert_eq!(engine.call_count("get_random"), 2);
    }

    #[test]
    fn usage_blobs_check_magic() {
        assert_eq!(parse_usage_header(b"XXXX0000000000000"), Err(OemCryptoError::BadMagic));
        let record = UsageRecord {
            pst: b"pst".to_vec(),
            status: UsageEntryStatus::Active,
        };
        let entry = usage_entry_bytes(3, 9, &record);
        let (index, parsed) = parse_usage_entry(&entry).expect("entry");
        assert_eq!(index, 3);
        assert_eq!(parsed.pst, b"pst");
        assert_eq!(parse_usage_entry(b"UTHD"), Err(OemCryptoError::BadMagic));
    }

    fn device_rsa_key() -> RsaPrivateKey {
        RsaPrivateKey::from_pkcs8_pem(DEVICE_RSA_KEY).expect("test key")
    }

    fn open(engine: &SoftwareEngine) -> OecSessionId {
        engine.initialize().expect("initialize");
        engine.open_session(SecurityLevel::Default).expect("open")
    }

    #[test]
    fn wrapped_rsa_key_is_bound_to_device_key() {
        let engine = SoftwareEngine::default();
        let session = open(&engine);
        let wrapped = wrap_rsa_key(&engine.config().device_key, &device_rsa_key()).expect("wrap");
        assert_eq!(&wrapped[..4], WRAPPED_RSA_KEY_MAGIC);

        let other = wrap_rsa_key(&[0x17; 16], &device_rsa_key()).expect("wrap");
        assert_eq!(engine.load_device_rsa_key(session, &other), Err(OemCryptoError::InvalidRsaKey));
        assert_eq!(engine.load_device_rsa_key(session, b"WRSA"), Err(OemCryptoError::InvalidRsaKey));
        assert!(!engine.has_rsa_key(session));

        engine.load_device_rsa_key(session, &wrapped).expect("load");
        assert!(engine.has_rsa_key(session));
    }

    #[test]
    fn rsa_signature_reports_key_size() {
        let engine = SoftwareEngine::default();
        let session = open(&engine);
        let mut signature = [0u8; 16];
        let mut length = signature.len();
        assert_eq!(
            engine.generate_rsa_signature(session, b"m", &mut signature, &mut length, RsaPaddingScheme::RsassaPss),
            Err(OemCryptoError::InvalidRsaKey)
        );

        let wrapped = wrap_rsa_key(&engine.config().device_key, &device_rsa_key()).expect("wrap");
        engine.load_device_rsa_key(session, &wrapped).expect("load");
        assert_eq!(
            engine.generate_rsa_signature(session, b"m", &mut signature, &mut length, RsaPaddingScheme::Pkcs1Block1),
            Err(OemCryptoError::ShortBuffer)
        );
        assert_eq!(length, 256);

        let mut signature = vec![0u8; length];
        engine
            .generate_rsa_signature(session, b"m", &mut signature, &mut length, RsaPaddingScheme::Pkcs1Block1)
            .expect("sign");
        device_rsa_key()
            .to_public_key()
            .verify(Pkcs1v15Sign::new_unprefixed(), b"m", &signature)
            .expect("pkcs1 signature");
    }

    #[test]
    fn nonces_are_remembered_per_session() {
        let engine = SoftwareEngine::default();
        let session = open(&engine);
        let first = engine.generate_nonce(session).expect("nonce");
        for _ in 0..MAX_NONCES - 1 {
            engine.generate_nonce(session).expect("nonce");
        }
        let state = engine.state.lock();
        let engine_session = state.sessions.get(&session).expect("session");
        assert_eq!(engine_session.check_nonce(first), Ok(()));
        drop(state);

        engine.generate_nonce(session).expect("nonce");
        let state = engine.state.lock();
        let engine_session = state.sessions.get(&session).expect("session");
        assert_eq!(engine_session.check_nonce(first), Err(OemCryptoError::InvalidNonce));
        assert_eq!(engine_session.nonces.len(), MAX_NONCES);
    }

    #[test]
    fn padded_cbc_only_opens_under_its_key() {
        let key = [4u8; 16];
        let iv = [5u8; 16];
        let encrypted = cbc_encrypt_padded(&key, &iv, b"pkcs8 bytes").expect("encrypt");
        assert_eq!(encrypted.len(), 16);
        assert_eq!(cbc_decrypt_padded(&key, &iv, &encrypted).expect("decrypt"), b"pkcs8 bytes");
        assert_ne!(
            cbc_decrypt_padded(&[6u8; 16], &iv, &encrypted).ok().as_deref(),
            Some(b"pkcs8 bytes".as_slice())
        );
    }
}
