//! The crypto session: one open engine session and the key session that
//! drives it.
//!
//! A [`CryptoSession`] registers with its [`CryptoContext`] on construction
//! (initializing the engine for the first session) and unregisters on drop
//! (terminating the engine after the last one). Between [`CryptoSession::open`]
//! and [`CryptoSession::close`] it owns an engine session handle.
//!
//! Locking follows three levels: the context's static-field lock for
//! initialization, the context's engine lock (shared for queries and
//! per-session work, exclusive for global engine mutations), and this
//! session's own mutex around anything that changes its engine-side state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::codec::{self, MessageRange};
use crate::context::CryptoContext;
use crate::error::{CallSite, Error, Result};
use crate::key::CryptoKey;
use crate::key_session::{ContentKeySession, EntitlementKeySession, KeySession, KeySessionType, LicenseKeys};
use crate::mapper;
use crate::oemcrypto::{
    self, BufferType, CdmSecurityLevel, CencSample, CipherMode, DestBufferDesc, GenericAlgorithm, HdcpCapability,
    KeyRefreshObject, LicenseType, OecResult, OecSessionId, OemCrypto, OemCryptoError, PatternDesc,
    ProvisioningMethod, RsaPaddingScheme, SecureHandle, SecurityLevel, SubsampleFlags, AES_BLOCK_SIZE,
    API_VERSION_CIPHER_MODE_SWITCH, CERTIFICATE_DATA_SIZE, ESTIMATED_USAGE_TABLE_HEADER_SIZE,
    HMAC_SHA256_SIGNATURE_SIZE, KEYBOX_KEY_DATA_SIZE, KEY_IV_SIZE, MAC_KEY_SIZE, MAX_PATTERN_BLOCKS,
    RSA_SIGNATURE_LENGTH,
};
use crate::system_id;
use crate::usage_table::{UsageSupportType, UsageTableHeader};

/// Largest buffer handed to the engine in one call once it has rejected a
/// buffer as too large.
pub const MAXIMUM_CHUNK_SIZE: usize = 100 * 1024;

/// Initial buffer size for device ids.
const DEVICE_ID_SIZE: usize = 32;

/// Pre-provisioning root of trust.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientTokenType {
    #[default]
    Keybox,
    OemCert,
    DrmCert,
}

/// Caller-provided output for a decrypt.
#[derive(Debug)]
pub enum OutputBuffer<'a> {
    /// Caller-owned memory.
    Clear(&'a mut [u8]),
    /// Protected memory of `length` bytes.
    Secure { handle: SecureHandle, length: usize },
}

/// One decrypt call.
#[derive(Debug)]
pub struct DecryptionParams<'a> {
    pub is_encrypted: bool,
    /// Output must go to protected memory or the decoder.
    pub is_secure: bool,
    pub cipher_mode: CipherMode,
    pub key_id: &'a [u8],
    /// Ciphertext (or clear data when `is_encrypted` is false).
    pub encrypt_buffer: &'a [u8],
    pub iv: [u8; KEY_IV_SIZE],
    /// Byte offset into the first AES-CTR block.
    pub block_offset: usize,
    pub decrypt_buffer: OutputBuffer<'a>,
    /// Where output starts inside `decrypt_buffer`.
    pub decrypt_buffer_offset: usize,
    pub subsample_flags: SubsampleFlags,
    pub is_video: bool,
    pub pattern: PatternDesc,
}

impl<'a> DecryptionParams<'a> {
    /// Parameters for a complete, single-subsample decrypt into `output`.
    pub fn new(key_id: &'a [u8], encrypt_buffer: &'a [u8], iv: [u8; KEY_IV_SIZE], output: &'a mut [u8]) -> Self {
        Self {
            is_encrypted: true,
            is_secure: false,
            cipher_mode: CipherMode::Ctr,
            key_id,
            encrypt_buffer,
            iv,
            block_offset: 0,
            decrypt_buffer: OutputBuffer::Clear(output),
            decrypt_buffer_offset: 0,
            subsample_flags: SubsampleFlags::FIRST_AND_LAST,
            is_video: true,
            pattern: PatternDesc::default(),
        }
    }
}

struct SessionState {
    key_session: Option<Box<dyn KeySession>>,
    /// Cipher mode negotiated by the last `load_keys`.
    cipher_mode: CipherMode,
}

/// A DRM crypto session bound to one engine session.
pub struct CryptoSession {
    context: Arc<CryptoContext>,
    open: bool,
    requested_security_level: SecurityLevel,
    oec_session_id: OecSessionId,
    system_id: Option<u32>,
    api_version: u32,
    pre_provision_token_type: ClientTokenType,
    request_id: String,
    usage_table_header: Option<Arc<UsageTableHeader>>,
    oem_token: Mutex<Option<Vec<u8>>>,
    update_usage_table_after_close_session: AtomicBool,
    usage_support_type: OnceLock<UsageSupportType>,
    destination_buffer_type: OnceLock<BufferType>,
    session: Mutex<SessionState>,
}

impl CryptoSession {
    /// Create a session, initializing the engine if this is the first one.
    pub fn new(context: Arc<CryptoContext>) -> Self {
        context.register_session();
        Self {
            context,
            open: false,
            requested_security_level: SecurityLevel::Default,
            oec_session_id: OecSessionId::default(),
            system_id: None,
            api_version: 0,
            pre_provision_token_type: ClientTokenType::default(),
            request_id: String::new(),
            usage_table_header: None,
            oem_token: Mutex::new(None),
            update_usage_table_after_close_session: AtomicBool::new(false),
            usage_support_type: OnceLock::new(),
            destination_buffer_type: OnceLock::new(),
            session: Mutex::new(SessionState {
                key_session: None,
                cipher_mode: CipherMode::Ctr,
            }),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<CryptoContext> {
        &self.context
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.context.is_initialized()
    }

    #[must_use]
    pub fn oec_session_id(&self) -> OecSessionId {
        self.oec_session_id
    }

    /// Hex request id generated at open.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// System id read at open; still available after close.
    #[must_use]
    pub fn system_id(&self) -> Option<u32> {
        self.system_id
    }

    #[must_use]
    pub fn requested_security_level(&self) -> SecurityLevel {
        self.requested_security_level
    }

    #[must_use]
    pub fn pre_provision_token_type(&self) -> ClientTokenType {
        self.pre_provision_token_type
    }

    /// Shared usage table header, for sessions with per-entry usage support.
    #[must_use]
    pub fn usage_table_header(&self) -> Option<&Arc<UsageTableHeader>> {
        self.usage_table_header.as_ref()
    }

    /// Variant of the active key session.
    #[must_use]
    pub fn key_session_type(&self) -> Option<KeySessionType> {
        self.session.lock().key_session.as_ref().map(|ks| ks.session_type())
    }

    /// Cipher mode reported by the last successful `load_keys`.
    #[must_use]
    pub fn cipher_mode(&self) -> CipherMode {
        self.session.lock().cipher_mode
    }

    fn engine(&self) -> &Arc<dyn OemCrypto> {
        self.context.engine()
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open && self.session.lock().key_session.is_some() {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    fn with_oec_session_lock<R>(&self, tag: &str, f: impl FnOnce(&dyn OemCrypto, &mut SessionState) -> R) -> R {
        self.context.with_engine_read_lock(tag, |engine| {
            trace!("session lock - {}", tag);
            let mut state = self.session.lock();
            f(engine, &mut state)
        })
    }

    fn with_key_session<R>(&self, tag: &str, f: impl FnOnce(&mut Box<dyn KeySession>) -> OecResult<R>) -> OecResult<R> {
        self.with_oec_session_lock(tag, |_, state| match state.key_session.as_mut() {
            Some(key_session) => f(key_session),
            None => Err(OemCryptoError::InvalidSession),
        })
    }

    /// Open an engine session at `requested_security_level`.
    ///
    /// Already open sessions return immediately. If reading the system id
    /// fails, the engine session stays open and the caller must still close.
    pub fn open(&mut self, requested_security_level: SecurityLevel) -> Result<()> {
        debug!("CryptoSession::open: level {:?}", requested_security_level);
        if self.open {
            return Ok(());
        }
        if !self.is_initialized() {
            return Err(Error::Unknown(CallSite::Open));
        }

        self.requested_security_level = requested_security_level;
        self.pre_provision_token_type = self.get_provisioning_method(requested_security_level)?;

        let opened = self.context.with_engine_write_lock("OEMCrypto_OpenSession", |engine| {
            engine.open_session(requested_security_level)
        });
        let oec_session_id = match opened {
            Ok(id) => id,
            Err(code) => {
                error!(
                    "OEMCrypto_OpenSession failed: initialized={} sessions={}",
                    self.is_initialized(),
                    self.context.session_count()
                );
                return Err(mapper::map_error(code, CallSite::Open));
            }
        };
        self.oec_session_id = oec_session_id;
        debug!("CryptoSession::open: id {}", oec_session_id.0);
        self.open = true;

        match self.read_system_id() {
            Ok(id) => self.system_id = id,
            Err(err) => {
                error!("CryptoSession::open: failed to read system id: {}", err);
                return Err(Error::LoadSystemId(Box::new(err)));
            }
        }

        let request_id_base = match self.get_random(8) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("CryptoSession::open: no random request id base: {}", err);
                vec![0u8; 8]
            }
        };
        let request_id_index = self.context.next_request_index();
        self.request_id = format!("{}{}", hex::encode(request_id_base), hex::encode(request_id_index.to_be_bytes()));

        self.api_version = self.get_api_version().map_err(|err| {
            error!("CryptoSession::open: failed to get API version: {}", err);
            Error::UsageSupportGetApiFailed
        })?;

        match self.get_usage_support_type() {
            Ok(UsageSupportType::Entry) => {
                let level = self.get_security_level();
                if matches!(level, CdmSecurityLevel::L1 | CdmSecurityLevel::L3) {
                    let store = Arc::clone(self.context.usage_table_store());
                    let this = &*self;
                    let header = self.context.usage_table_header_or_init(level, || {
                        match UsageTableHeader::init(level, this, store) {
                            Ok(header) => Some(Arc::new(header)),
                            Err(err) => {
                                error!("CryptoSession::open: usage table header init failed: {}", err);
                                None
                            }
                        }
                    });
                    self.usage_table_header = header;
                }
            }
            Ok(_) => {}
            Err(err) => error!("CryptoSession::open: failed to get usage support type: {}", err),
        }

        let engine = Arc::clone(self.engine());
        self.with_oec_session_lock("Open() reset key session", |_, state| {
            state.key_session = Some(Box::new(ContentKeySession::new(engine, oec_session_id)));
        });
        Ok(())
    }

    /// Close the engine session.
    ///
    /// A deferred usage table update is run afterwards for engines with
    /// whole-table usage support.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        debug!("CryptoSession::close: id {}", self.oec_session_id.0);

        let oec_session_id = self.oec_session_id;
        let result = self.context.with_engine_write_lock("OEMCrypto_CloseSession", |engine| {
            engine.close_session(oec_session_id)
        });
        if let Err(code) = result {
            return Err(mapper::map_error(code, CallSite::Close));
        }

        self.open = false;
        self.session.lock().key_session = None;

        let update_usage_table = self.update_usage_table_after_close_session.swap(false, Ordering::SeqCst);
        if update_usage_table && self.usage_support_type.get() == Some(&UsageSupportType::Table) {
            if let Err(err) = self.update_usage_information() {
                warn!("CryptoSession::close: deferred usage update failed: {}", err);
            }
        }
        Ok(())
    }

    fn get_provisioning_method(&self, level: SecurityLevel) -> Result<ClientTokenType> {
        let method = self
            .context
            .with_engine_read_lock("OEMCrypto_GetProvisioningMethod", |engine| engine.provisioning_method(level));
        match method {
            ProvisioningMethod::Keybox => Ok(ClientTokenType::Keybox),
            ProvisioningMethod::OemCertificate => Ok(ClientTokenType::OemCert),
            ProvisioningMethod::DrmCertificate => Ok(ClientTokenType::DrmCert),
            ProvisioningMethod::ProvisioningError => {
                error!("OEMCrypto_GetProvisioningMethod reported a provisioning error");
                Err(Error::GetProvisioningMethod)
            }
        }
    }

    /// Read the system id from the pre-provisioning token.
    ///
    /// Devices provisioned with a DRM certificate carry no system id here.
    pub fn read_system_id(&self) -> Result<Option<u32>> {
        match self.pre_provision_token_type {
            ClientTokenType::Keybox => {
                let token = self.get_token_from_keybox()?;
                system_id::system_id_from_keybox_token(&token).map(Some)
            }
            ClientTokenType::OemCert => {
                let token = self.get_token_from_oem_cert()?;
                system_id::system_id_from_oem_cert(&token).map(Some)
            }
            ClientTokenType::DrmCert => Ok(None),
        }
    }

    /// Pre-provisioning token: keybox key data or the OEM certificate.
    pub fn get_provisioning_token(&self) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        match self.pre_provision_token_type {
            ClientTokenType::Keybox => self.get_token_from_keybox(),
            ClientTokenType::OemCert => self.get_token_from_oem_cert(),
            ClientTokenType::DrmCert => {
                error!("get_provisioning_token: unsupported token type {:?}", self.pre_provision_token_type);
                Err(Error::UnknownClientTokenType)
            }
        }
    }

    fn get_token_from_keybox(&self) -> Result<Vec<u8>> {
        let level = self.requested_security_level;
        let mut token = vec![0u8; KEYBOX_KEY_DATA_SIZE];
        let mut length = token.len();
        let result = self.context.with_engine_read_lock("OEMCrypto_GetKeyData", |engine| {
            engine.get_key_data(&mut token, &mut length, level)
        });
        mapper::map_oemcrypto_result(result, CallSite::GetTokenFromKeybox)?;
        token.truncate(length);
        Ok(token)
    }

    fn get_token_from_oem_cert(&self) -> Result<Vec<u8>> {
        let mut cached = self.oem_token.lock();
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let oec_session_id = self.oec_session_id;
        let token = self
            .context
            .with_engine_read_lock("OEMCrypto_GetOEMPublicCertificate", |engine| {
                oemcrypto::read_sized(CERTIFICATE_DATA_SIZE, |buf, len| {
                    engine.get_oem_public_certificate(oec_session_id, buf, len)
                })
            })
            .map_err(|code| mapper::map_error(code, CallSite::GetTokenFromOemCert))?;
        if self.context.properties().provisioning_token_cache {
            *cached = Some(token.clone());
        }
        Ok(token)
    }

    /// Device id as reported by the engine, or the OEM certificate for
    /// OEM-certificate devices whose engine has no device id.
    pub fn get_internal_device_unique_id(&self) -> Result<Vec<u8>> {
        self.internal_device_unique_id().map(|(id, _)| id)
    }

    fn internal_device_unique_id(&self) -> Result<(Vec<u8>, bool)> {
        self.ensure_initialized()?;
        let level = self.requested_security_level;
        let result = self.context.with_engine_read_lock("OEMCrypto_GetDeviceID", |engine| {
            oemcrypto::read_sized(DEVICE_ID_SIZE, |buf, len| engine.get_device_id(buf, len, level))
        });
        match result {
            Err(OemCryptoError::NotImplemented) if self.pre_provision_token_type == ClientTokenType::OemCert => {
                Ok((self.get_token_from_oem_cert()?, true))
            }
            result => result
                .map(|id| (id, false))
                .map_err(|code| mapper::map_error(code, CallSite::GetDeviceId)),
        }
    }

    /// Device id exposed to applications; OEM certificates are hashed.
    pub fn get_external_device_unique_id(&self) -> Result<Vec<u8>> {
        let (id, from_oem_cert) = self.internal_device_unique_id()?;
        if from_oem_cert {
            Ok(Sha256::digest(&id).to_vec())
        } else {
            Ok(id)
        }
    }

    /// Provisioning id: keybox bytes 8..24, or the inverted external device
    /// id for OEM-certificate devices.
    pub fn get_provisioning_id(&self) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        match self.pre_provision_token_type {
            ClientTokenType::OemCert => {
                let id = self.get_external_device_unique_id()?;
                Ok(id.into_iter().map(|byte| !byte).collect())
            }
            ClientTokenType::Keybox => {
                let token = self.get_token_from_keybox()?;
                match token.get(8..24) {
                    Some(id) => Ok(id.to_vec()),
                    None => {
                        error!("get_provisioning_id: keybox token too small: {}", token.len());
                        Err(Error::KeyboxTokenTooShort(token.len()))
                    }
                }
            }
            ClientTokenType::DrmCert => Err(Error::UnknownClientTokenType),
        }
    }

    /// Security level reported by the engine for the requested level.
    #[must_use]
    pub fn get_security_level(&self) -> CdmSecurityLevel {
        if !self.is_initialized() {
            return CdmSecurityLevel::Uninitialized;
        }
        let level = self.requested_security_level;
        let reported = self
            .context
            .with_engine_read_lock("OEMCrypto_SecurityLevel", |engine| engine.security_level(level));
        match reported.as_deref() {
            Some(level) if level.starts_with("L1") => CdmSecurityLevel::L1,
            Some(level) if level.starts_with("L2") => CdmSecurityLevel::L2,
            Some(level) if level.starts_with("L3") => CdmSecurityLevel::L3,
            _ => CdmSecurityLevel::Unknown,
        }
    }

    pub fn get_api_version(&self) -> Result<u32> {
        self.ensure_initialized()?;
        let level = self.requested_security_level;
        Ok(self
            .context
            .with_engine_read_lock("OEMCrypto_APIVersion", |engine| engine.api_version(level)))
    }

    /// Usage model of the engine, resolved once per session.
    pub fn get_usage_support_type(&self) -> Result<UsageSupportType> {
        if let Some(support) = self.usage_support_type.get() {
            return Ok(*support);
        }
        if !self.open || !self.is_initialized() {
            warn!("get_usage_support_type: session not open");
            return Err(Error::UsageInformationSupportFailed);
        }

        let level = self.requested_security_level;
        let has_support = self
            .context
            .with_engine_read_lock("OEMCrypto_SupportsUsageTable", |engine| engine.supports_usage_table(level));
        let support = UsageSupportType::for_api_version(has_support, self.api_version);
        Ok(*self.usage_support_type.get_or_init(|| support))
    }

    pub fn get_hdcp_capabilities(&self) -> Result<(HdcpCapability, HdcpCapability)> {
        self.ensure_initialized()?;
        let level = self.requested_security_level;
        let result = self
            .context
            .with_engine_read_lock("OEMCrypto_GetHDCPCapability", |engine| engine.get_hdcp_capability(level));
        result.map_err(|code| mapper::map_error(code, CallSite::GetHdcpCapabilities))
    }

    pub fn get_number_of_open_sessions(&self) -> Result<usize> {
        self.ensure_initialized()?;
        let level = self.requested_security_level;
        self.context
            .with_engine_read_lock("OEMCrypto_GetNumberOfOpenSessions", |engine| {
                engine.get_number_of_open_sessions(level)
            })
            .map_err(|code| mapper::map_error(code, CallSite::GetNumberOfOpenSessions))
    }

    pub fn get_max_number_of_sessions(&self) -> Result<usize> {
        self.ensure_initialized()?;
        let level = self.requested_security_level;
        self.context
            .with_engine_read_lock("OEMCrypto_GetMaxNumberOfSessions", |engine| {
                engine.get_max_number_of_sessions(level)
            })
            .map_err(|code| mapper::map_error(code, CallSite::GetMaxNumberOfSessions))
    }

    pub fn get_srm_version(&self) -> Result<u16> {
        self.ensure_initialized()?;
        self.context
            .with_engine_read_lock("OEMCrypto_GetCurrentSRMVersion", |engine| engine.get_current_srm_version())
            .map_err(|code| mapper::map_error(code, CallSite::GetSrmVersion))
    }

    #[must_use]
    pub fn is_srm_update_supported(&self) -> bool {
        self.is_initialized()
            && self
                .context
                .with_engine_read_lock("OEMCrypto_IsSRMUpdateSupported", |engine| engine.is_srm_update_supported())
    }

    /// Install a new SRM revocation list.
    pub fn load_srm(&self, srm: &[u8]) -> Result<()> {
        self.ensure_initialized()?;
        if srm.is_empty() {
            error!("load_srm: empty SRM list");
            return Err(Error::InvalidSrmList);
        }
        let result = self
            .context
            .with_engine_write_lock("OEMCrypto_LoadSRM", |engine| engine.load_srm(srm));
        mapper::map_oemcrypto_result(result, CallSite::LoadSrm)
    }

    #[must_use]
    pub fn get_resource_rating_tier(&self) -> u32 {
        let level = self.requested_security_level;
        self.context
            .with_engine_read_lock("OEMCrypto_ResourceRatingTier", |engine| engine.resource_rating_tier(level))
    }

    #[must_use]
    pub fn get_build_information(&self) -> Option<String> {
        let level = self.requested_security_level;
        self.context
            .with_engine_read_lock("OEMCrypto_BuildInformation", |engine| engine.build_information(level))
    }

    /// `len` random bytes from the engine.
    pub fn get_random(&self, len: usize) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        let mut out = vec![0u8; len];
        let result = self
            .context
            .with_engine_read_lock("OEMCrypto_GetRandom", |engine| engine.get_random(&mut out));
        mapper::map_oemcrypto_result(result, CallSite::GetRandom)?;
        Ok(out)
    }

    pub fn generate_nonce(&self) -> Result<u32> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        self.context
            .with_engine_write_lock("OEMCrypto_GenerateNonce", |engine| engine.generate_nonce(oec_session_id))
            .map_err(|code| mapper::map_error(code, CallSite::GenerateNonce))
    }

    /// Derive session keys from the device key for `message`.
    pub fn generate_derived_keys(&self, message: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let result = self.with_key_session("GenerateDerivedKeys", |ks| ks.generate_derived_keys(message));
        mapper::map_oemcrypto_result(result, CallSite::GenerateDerivedKeys)
    }

    /// Derive session keys from an encrypted session key for `message`.
    pub fn generate_derived_keys_with_session_key(&self, message: &[u8], session_key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let result = self.with_key_session("GenerateDerivedKeysWithSessionKey", |ks| {
            ks.generate_derived_keys_with_session_key(message, session_key)
        });
        mapper::map_oemcrypto_result(result, CallSite::GenerateDerivedKeys)
    }

    /// HMAC-SHA256 signature over `message` with the derived client key.
    pub fn generate_signature(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        self.with_oec_session_lock("GenerateSignature", |engine, _| {
            oemcrypto::read_sized(HMAC_SHA256_SIGNATURE_SIZE, |buf, len| {
                engine.generate_signature(oec_session_id, message, buf, len)
            })
        })
        .map_err(|code| mapper::map_error(code, CallSite::GenerateSignature))
    }

    /// RSA-PSS signature over `message` with the device certificate key.
    pub fn generate_rsa_signature(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        self.with_oec_session_lock("GenerateRsaSignature", |engine, _| {
            oemcrypto::read_sized(RSA_SIGNATURE_LENGTH, |buf, len| {
                engine.generate_rsa_signature(oec_session_id, message, buf, len, RsaPaddingScheme::RsassaPss)
            })
        })
        .map_err(|code| mapper::map_error(code, CallSite::GenerateRsaSignature))
    }

    /// Sign a license or provisioning request.
    ///
    /// Provisioning requests from keybox devices are signed with keys freshly
    /// derived from the request. Everything else is signed with an RSA key.
    pub fn prepare_request(&self, message: &[u8], is_provisioning: bool) -> Result<Vec<u8>> {
        if is_provisioning && self.pre_provision_token_type == ClientTokenType::Keybox {
            self.generate_derived_keys(message)?;
            self.generate_signature(message)
        } else {
            self.generate_rsa_signature(message)
        }
    }

    /// Sign a renewal request with the keys from the current license.
    pub fn prepare_renewal_request(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.generate_signature(message)
    }

    /// Load a wrapped device RSA key for this session.
    pub fn load_certificate_private_key(&self, wrapped_key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        let result = self.with_oec_session_lock("LoadDeviceRSAKey", |engine, _| {
            engine.load_device_rsa_key(oec_session_id, wrapped_key)
        });
        mapper::map_oemcrypto_result(result, CallSite::LoadCertificatePrivateKey)
    }

    /// Re-encrypt the device RSA key from a provisioning response for
    /// storage. Returns the wrapped key [`Self::load_certificate_private_key`]
    /// accepts.
    ///
    /// Keybox devices expect `private_key` encrypted with the keys derived
    /// for the provisioning request, and `signed_message` signed with them.
    /// OEM certificate devices expect it encrypted under `wrapping_key`,
    /// which is itself encrypted to the OEM certificate.
    pub fn rewrap_certificate(
        &self,
        signed_message: &[u8],
        signature: &[u8],
        nonce: &[u8],
        private_key: &[u8],
        iv: &[u8],
        wrapping_key: &[u8],
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        match self.pre_provision_token_type {
            ClientTokenType::Keybox => self.rewrap_device_rsa_key(signed_message, signature, nonce, private_key, iv),
            ClientTokenType::OemCert => {
                self.rewrap_device_rsa_key_30(signed_message, nonce, private_key, iv, wrapping_key)
            }
            token_type => {
                error!("rewrap_certificate: bad pre-provisioning type {:?}", token_type);
                Err(Error::UnknownClientTokenType)
            }
        }
    }

    fn rewrap_device_rsa_key(
        &self,
        message: &[u8],
        signature: &[u8],
        nonce: &[u8],
        enc_rsa_key: &[u8],
        enc_rsa_key_iv: &[u8],
    ) -> Result<Vec<u8>> {
        let absent = enc_rsa_key.len() < MAC_KEY_SIZE || enc_rsa_key_iv.len() < KEY_IV_SIZE;
        let nonce = MessageRange::locate(message, nonce, absent).raw();
        let enc_rsa_key = MessageRange::locate(message, enc_rsa_key, absent).raw();
        let enc_rsa_key_iv = MessageRange::locate(message, enc_rsa_key_iv, absent).raw();

        let oec_session_id = self.oec_session_id;
        debug!("RewrapDeviceRSAKey: id={}", oec_session_id.0);
        self.with_oec_session_lock("RewrapDeviceRSAKey", |engine, _| {
            oemcrypto::read_sized(0, |buf, len| {
                engine.rewrap_device_rsa_key(
                    oec_session_id,
                    message,
                    signature,
                    nonce,
                    enc_rsa_key,
                    enc_rsa_key_iv,
                    buf,
                    len,
                )
            })
        })
        .map_err(|code| mapper::map_error(code, CallSite::RewrapDeviceRsaKey))
    }

    fn rewrap_device_rsa_key_30(
        &self,
        message: &[u8],
        nonce: &[u8],
        enc_rsa_key: &[u8],
        enc_rsa_key_iv: &[u8],
        wrapping_key: &[u8],
    ) -> Result<Vec<u8>> {
        let absent = enc_rsa_key.len() < MAC_KEY_SIZE || enc_rsa_key_iv.len() < KEY_IV_SIZE;
        let nonce = MessageRange::locate(message, nonce, absent).bytes();
        let enc_rsa_key = MessageRange::locate(message, enc_rsa_key, absent).bytes();
        let enc_rsa_key_iv = MessageRange::locate(message, enc_rsa_key_iv, absent).bytes();
        let wrapping_key = MessageRange::locate(message, wrapping_key, absent).bytes();

        let oec_session_id = self.oec_session_id;
        debug!("RewrapDeviceRSAKey30: id={}", oec_session_id.0);
        self.with_oec_session_lock("RewrapDeviceRSAKey30", |engine, _| {
            oemcrypto::read_sized(0, |buf, len| {
                engine.rewrap_device_rsa_key_30(
                    oec_session_id,
                    nonce,
                    wrapping_key,
                    enc_rsa_key,
                    enc_rsa_key_iv,
                    buf,
                    len,
                )
            })
        })
        .map_err(|code| mapper::map_error(code, CallSite::RewrapDeviceRsaKey30))
    }

    /// Load the keys of a signed license.
    ///
    /// Entitlement licenses replace the active key session with an
    /// [`EntitlementKeySession`] on the same engine session.
    pub fn load_keys(&self, license: &LicenseKeys<'_>, key_type: LicenseType) -> Result<()> {
        self.ensure_open()?;
        let engine = Arc::clone(self.engine());
        let oec_session_id = self.oec_session_id;

        let result = self.with_oec_session_lock("LoadKeys", |_, state| {
            let needs_swap = state
                .key_session
                .as_ref()
                .is_some_and(|ks| ks.session_type() != KeySessionType::Entitlement);
            if key_type == LicenseType::Entitlement && needs_swap {
                debug!("LoadKeys: switching to entitlement key session");
                state.key_session = Some(Box::new(EntitlementKeySession::new(engine, oec_session_id)));
            }
            let Some(key_session) = state.key_session.as_mut() else {
                return Err(OemCryptoError::InvalidSession);
            };
            let cipher_mode = key_session.load_keys(license)?;
            if let Some(cipher_mode) = cipher_mode {
                state.cipher_mode = cipher_mode;
            }
            Ok(())
        });

        let has_pst = !license.provider_session_token.is_empty();
        let result = match result {
            Ok(()) => {
                if has_pst {
                    self.update_usage_table_after_close_session.store(true, Ordering::SeqCst);
                }
                Ok(())
            }
            Err(code) => Err(mapper::load_keys_error(code)),
        };

        if has_pst {
            self.update_legacy_usage_table("LoadKeys");
        }
        result
    }

    /// Apply a signed license renewal to the keys of the current license.
    ///
    /// A key without an id carries a clear key control block for every key.
    pub fn refresh_keys(&self, message: &[u8], signature: &[u8], keys: &[CryptoKey]) -> Result<()> {
        self.ensure_open()?;
        let key_objects: Vec<KeyRefreshObject> = keys
            .iter()
            .map(|key| {
                let has_key_control = key.has_key_control();
                KeyRefreshObject {
                    key_id: MessageRange::locate(message, &key.key_id, false).raw(),
                    key_control_iv: MessageRange::locate(message, &key.key_control_iv, !has_key_control).raw(),
                    key_control: MessageRange::locate(message, &key.key_control, !has_key_control).raw(),
                }
            })
            .collect();

        let oec_session_id = self.oec_session_id;
        debug!("RefreshKeys: id={} keys={}", oec_session_id.0, key_objects.len());
        let result = self.with_oec_session_lock("RefreshKeys", |engine, _| {
            engine.refresh_keys(oec_session_id, message, signature, &key_objects)
        });
        mapper::map_oemcrypto_result(result, CallSite::RefreshKeys)
    }

    /// Hand entitled content keys to the active key session.
    pub fn load_entitled_content_keys(&self, keys: &[CryptoKey]) -> Result<()> {
        self.ensure_open()?;
        self.with_key_session("LoadEntitledContentKeys", |ks| ks.load_entitled_content_keys(keys))
            .map_err(mapper::load_entitled_content_keys_error)
    }

    pub fn select_key(&self, key_id: &[u8], cipher_mode: CipherMode) -> Result<()> {
        self.ensure_open()?;
        self.with_key_session("SelectKey", |ks| ks.select_key(key_id, cipher_mode))
            .map_err(mapper::select_key_error)
    }

    fn destination_buffer_type(&self) -> Result<BufferType> {
        if let Some(buffer_type) = self.destination_buffer_type.get() {
            return Ok(*buffer_type);
        }
        match self.context.properties().destination_buffer_type() {
            Some(buffer_type) => Ok(*self.destination_buffer_type.get_or_init(|| buffer_type)),
            None => {
                error!("decrypt: no destination buffer type configured");
                Err(Error::Unknown(CallSite::Decrypt))
            }
        }
    }

    /// Decrypt (or copy) one subsample into the caller's buffer.
    ///
    /// Buffers the engine rejects as too large are split into chunks aligned
    /// to whole pattern repetitions, with the IV carried across chunks.
    pub fn decrypt(&self, params: &mut DecryptionParams<'_>) -> Result<()> {
        self.ensure_open()?;
        let site = CallSite::Decrypt;

        if !params.pattern.is_valid() {
            error!(
                "decrypt: pattern {}:{} exceeds {} blocks",
                params.pattern.encrypt, params.pattern.skip, MAX_PATTERN_BLOCKS
            );
            return Err(Error::InvalidParameters(site));
        }

        let configured = self.destination_buffer_type()?;
        let buffer_type = if params.is_secure { configured } else { BufferType::Clear };
        if params.is_secure && buffer_type == BufferType::Clear {
            return Err(Error::SecureBufferRequired);
        }

        let input = params.encrypt_buffer;
        let offset = params.decrypt_buffer_offset;
        let is_video = params.is_video;
        let mut dest = match (buffer_type, &mut params.decrypt_buffer) {
            (BufferType::Clear, OutputBuffer::Clear(buffer)) => {
                let fits = offset
                    .checked_add(input.len())
                    .is_some_and(|end| end <= buffer.len());
                if !fits {
                    error!(
                        "decrypt: {} bytes at offset {} exceed output buffer of {}",
                        input.len(),
                        offset,
                        buffer.len()
                    );
                    return Err(Error::InvalidParameters(site));
                }
                DestBufferDesc::Clear {
                    buffer: &mut buffer[offset..],
                }
            }
            (BufferType::Secure, OutputBuffer::Secure { handle, length }) => DestBufferDesc::Secure {
                handle: *handle,
                offset,
                max_length: *length,
            },
            (BufferType::Direct, _) => DestBufferDesc::Direct { is_video },
            _ => {
                error!("decrypt: output buffer does not match destination type {:?}", buffer_type);
                return Err(Error::InvalidParameters(site));
            }
        };

        let oec_session_id = self.oec_session_id;
        let mut result: OecResult<()> = Err(OemCryptoError::NotImplemented);
        if !params.is_encrypted && params.subsample_flags == SubsampleFlags::FIRST_AND_LAST {
            result = self.with_oec_session_lock("Decrypt() calling CopyBuffer", |engine, _| {
                engine.copy_buffer(oec_session_id, input, &mut dest, params.subsample_flags)
            });
            if result == Err(OemCryptoError::BufferTooLarge) && input.len() > MAXIMUM_CHUNK_SIZE {
                result = self.copy_buffer_in_chunks(input, &mut dest);
            }
        }

        if self.api_version < API_VERSION_CIPHER_MODE_SWITCH
            && params.is_encrypted
            && params.cipher_mode != self.cipher_mode()
        {
            return Err(Error::IncorrectCryptoMode);
        }

        if params.is_encrypted || result == Err(OemCryptoError::NotImplemented) {
            if params.is_encrypted {
                self.select_key(params.key_id, params.cipher_mode)?;
            }

            let sample = CencSample {
                input,
                is_encrypted: params.is_encrypted,
                iv: params.iv,
                block_offset: params.block_offset,
                subsample_flags: params.subsample_flags,
            };
            let pattern = params.pattern;
            result = self.with_key_session("Decrypt() calling key_session.decrypt()", |ks| {
                ks.decrypt(&sample, &mut dest, &pattern)
            });

            if result == Err(OemCryptoError::BufferTooLarge) {
                let pattern_length = pattern.length_in_bytes();
                let chunk_size = if pattern_length > 0 {
                    MAXIMUM_CHUNK_SIZE - MAXIMUM_CHUNK_SIZE % pattern_length
                } else {
                    MAXIMUM_CHUNK_SIZE
                };
                if input.len() > chunk_size {
                    result = self.decrypt_in_chunks(&sample, params.cipher_mode, &mut dest, &pattern, chunk_size);
                }
            }
        }

        result.map_err(|code| mapper::decrypt_error(code, site))
    }

    fn copy_buffer_in_chunks(&self, input: &[u8], dest: &mut DestBufferDesc<'_>) -> OecResult<()> {
        let oec_session_id = self.oec_session_id;
        let mut flags = SubsampleFlags::FIRST;
        for (index, chunk) in input.chunks(MAXIMUM_CHUNK_SIZE).enumerate() {
            let additional_offset = index * MAXIMUM_CHUNK_SIZE;
            if additional_offset + chunk.len() == input.len() {
                flags = flags.with(SubsampleFlags::LAST);
            }
            let mut chunk_dest = chunk_destination(dest, additional_offset);
            self.with_oec_session_lock("CopyBufferInChunks", |engine, _| {
                engine.copy_buffer(oec_session_id, chunk, &mut chunk_dest, flags)
            })?;
            flags = SubsampleFlags::NONE;
        }
        Ok(())
    }

    fn decrypt_in_chunks(
        &self,
        sample: &CencSample<'_>,
        cipher_mode: CipherMode,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDesc,
        max_chunk_size: usize,
    ) -> OecResult<()> {
        let input = sample.input;
        let pattern_length = pattern.length_in_bytes();
        let mut iv = sample.iv;
        let mut flags = if sample.subsample_flags.contains(SubsampleFlags::FIRST) {
            SubsampleFlags::FIRST
        } else {
            SubsampleFlags::NONE
        };

        let mut additional_offset = 0;
        while additional_offset < input.len() {
            let chunk_size = max_chunk_size.min(input.len() - additional_offset);
            let chunk_end = additional_offset + chunk_size;
            if chunk_end == input.len() && sample.subsample_flags.contains(SubsampleFlags::LAST) {
                flags = flags.with(SubsampleFlags::LAST);
            }

            // Chunks are whole pattern repetitions, so block offset and
            // pattern carry over unchanged.
            let chunk = CencSample {
                input: &input[additional_offset..chunk_end],
                is_encrypted: sample.is_encrypted,
                iv,
                block_offset: sample.block_offset,
                subsample_flags: flags,
            };
            let mut chunk_dest = chunk_destination(dest, additional_offset);
            self.with_key_session("DecryptInChunks", |ks| ks.decrypt(&chunk, &mut chunk_dest, pattern))?;

            if chunk_end < input.len() {
                match cipher_mode {
                    CipherMode::Ctr => {
                        let encrypted_blocks = if pattern_length == 0 {
                            chunk_size / AES_BLOCK_SIZE
                        } else {
                            chunk_size / pattern_length * pattern.encrypt
                        };
                        codec::increment_iv(&mut iv, encrypted_blocks as u64);
                    }
                    CipherMode::Cbc => {
                        let block_end = if pattern_length == 0 {
                            chunk_end
                        } else {
                            chunk_end.saturating_sub(AES_BLOCK_SIZE * pattern.skip)
                        };
                        let last_block = block_end
                            .checked_sub(AES_BLOCK_SIZE)
                            .and_then(|start| input.get(start..block_end))
                            .ok_or(OemCryptoError::DecryptFailed)?;
                        iv.copy_from_slice(last_block);
                    }
                }
            }

            flags = SubsampleFlags::NONE;
            additional_offset = chunk_end;
        }
        Ok(())
    }

    fn select_generic_key(&self, key_id: &[u8]) -> Result<()> {
        self.select_key(key_id, CipherMode::Cbc)
    }

    /// AES-CBC-128 encrypt `input` with a generic crypto key.
    pub fn generic_encrypt(&self, input: &[u8], key_id: &[u8], iv: &[u8], algorithm: GenericAlgorithm) -> Result<Vec<u8>> {
        let site = CallSite::GenericEncrypt;
        self.ensure_open()?;
        if algorithm != GenericAlgorithm::AesCbc128NoPadding || iv.len() != KEY_IV_SIZE {
            return Err(Error::InvalidParameters(site));
        }
        self.select_generic_key(key_id)?;

        let oec_session_id = self.oec_session_id;
        let mut out = vec![0u8; input.len()];
        self.with_oec_session_lock("Generic_Encrypt", |engine, _| {
            engine.generic_encrypt(oec_session_id, input, iv, algorithm, &mut out)
        })
        .map_err(|code| mapper::generic_error(code, site))?;
        Ok(out)
    }

    /// AES-CBC-128 decrypt `input` with a generic crypto key.
    pub fn generic_decrypt(&self, input: &[u8], key_id: &[u8], iv: &[u8], algorithm: GenericAlgorithm) -> Result<Vec<u8>> {
        let site = CallSite::GenericDecrypt;
        self.ensure_open()?;
        if algorithm != GenericAlgorithm::AesCbc128NoPadding || iv.len() != KEY_IV_SIZE {
            return Err(Error::InvalidParameters(site));
        }
        self.select_generic_key(key_id)?;

        let oec_session_id = self.oec_session_id;
        let mut out = vec![0u8; input.len()];
        self.with_oec_session_lock("Generic_Decrypt", |engine, _| {
            engine.generic_decrypt(oec_session_id, input, iv, algorithm, &mut out)
        })
        .map_err(|code| mapper::generic_error(code, site))?;
        Ok(out)
    }

    /// HMAC-SHA256 sign `message` with a generic signing key.
    pub fn generic_sign(&self, message: &[u8], key_id: &[u8], algorithm: GenericAlgorithm) -> Result<Vec<u8>> {
        let site = CallSite::GenericSign;
        self.ensure_open()?;
        if algorithm != GenericAlgorithm::HmacSha256 {
            return Err(Error::InvalidParameters(site));
        }
        self.select_generic_key(key_id)?;

        let oec_session_id = self.oec_session_id;
        self.with_oec_session_lock("Generic_Sign", |engine, _| {
            oemcrypto::read_sized(HMAC_SHA256_SIGNATURE_SIZE, |buf, len| {
                engine.generic_sign(oec_session_id, message, algorithm, buf, len)
            })
        })
        .map_err(|code| mapper::generic_error(code, site))
    }

    /// Verify an HMAC-SHA256 `signature` over `message`.
    pub fn generic_verify(
        &self,
        message: &[u8],
        key_id: &[u8],
        algorithm: GenericAlgorithm,
        signature: &[u8],
    ) -> Result<()> {
        let site = CallSite::GenericVerify;
        self.ensure_open()?;
        if algorithm != GenericAlgorithm::HmacSha256 {
            return Err(Error::InvalidParameters(site));
        }
        self.select_generic_key(key_id)?;

        let oec_session_id = self.oec_session_id;
        self.with_oec_session_lock("Generic_Verify", |engine, _| {
            engine.generic_verify(oec_session_id, message, algorithm, signature)
        })
        .map_err(|code| mapper::generic_error(code, site))
    }

    /// Update the whole usage table (engines without per-entry support).
    pub fn update_usage_information(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::Unknown(CallSite::UpdateUsageInformation));
        }
        if self.usage_table_header.is_some() {
            trace!("update_usage_information: not used with per-entry usage tables");
            return Ok(());
        }
        let result = self
            .context
            .with_engine_write_lock("OEMCrypto_UpdateUsageTable", |engine| engine.update_usage_table());
        mapper::map_oemcrypto_result(result, CallSite::UpdateUsageInformation)
    }

    /// Mark the usage entry for `pst` inactive.
    pub fn deactivate_usage_information(&self, provider_session_token: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        let result = self.context.with_engine_write_lock("OEMCrypto_DeactivateUsageEntry", |engine| {
            engine.deactivate_usage_entry(oec_session_id, provider_session_token)
        });
        match result {
            Err(OemCryptoError::InvalidContext) => {
                error!("deactivate_usage_information: entry already inactive");
                Err(Error::KeyCanceled)
            }
            result => result.map_err(|code| mapper::usage_error(code, CallSite::DeactivateUsageInformation)),
        }
    }

    /// Signed usage report for `pst`.
    pub fn generate_usage_report(&self, provider_session_token: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        self.context
            .with_engine_write_lock("OEMCrypto_ReportUsage", |engine| {
                oemcrypto::read_sized(0, |buf, len| engine.report_usage(oec_session_id, provider_session_token, buf, len))
            })
            .map_err(|code| mapper::usage_error(code, CallSite::GenerateUsageReport))
    }

    /// Delete the usage entry named by a signed release message.
    ///
    /// Only the legacy usage table deletes this way; with per-entry usage
    /// tables this does nothing.
    pub fn release_usage_information(
        &self,
        message: &[u8],
        signature: &[u8],
        provider_session_token: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        let site = CallSite::ReleaseUsageInformation;
        if self.usage_table_header.is_some() {
            warn!("release_usage_information: not used with per-entry usage tables");
            return Ok(());
        }

        let pst = MessageRange::locate(message, provider_session_token, false).raw();
        let oec_session_id = self.oec_session_id;
        let result = self.context.with_engine_write_lock("OEMCrypto_DeleteUsageEntry", |engine| {
            engine.delete_usage_entry(oec_session_id, pst, message, signature)
        });
        if let Err(code) = result {
            oec_failure!(error, site, code);
            return Err(Error::Unknown(site));
        }
        self.update_legacy_usage_table("release_usage_information");
        Ok(())
    }

    /// Delete the usage entry for `pst` without a signed release.
    pub fn delete_usage_information(&self, provider_session_token: &[u8]) -> Result<()> {
        self.ensure_initialized()?;
        let site = CallSite::DeleteUsageInformation;
        let result = self.context.with_engine_write_lock("OEMCrypto_ForceDeleteUsageEntry", |engine| {
            engine.force_delete_usage_entry(provider_session_token)
        });
        let result = result.map_err(|code| {
            oec_failure!(error, site, code);
            Error::Unknown(site)
        });
        self.update_legacy_usage_table("delete_usage_information");
        result
    }

    /// Delete the usage entries for several PSTs under one engine lock.
    ///
    /// Every PST is attempted; the call fails if any deletion did.
    pub fn delete_multiple_usage_information<T: AsRef<[u8]>>(&self, provider_session_tokens: &[T]) -> Result<()> {
        self.ensure_initialized()?;
        let site = CallSite::DeleteMultipleUsageInformation;
        let failures = self.context.with_engine_write_lock("OEMCrypto_ForceDeleteUsageEntry", |engine| {
            let mut failures = 0;
            for pst in provider_session_tokens {
                let pst: &[u8] = pst.as_ref();
                if let Err(code) = engine.force_delete_usage_entry(pst) {
                    warn!("delete_multiple_usage_information: {} for pst {}", code, hex::encode(pst));
                    failures += 1;
                }
            }
            failures
        });
        self.update_legacy_usage_table("delete_multiple_usage_information");
        if failures > 0 {
            error!(
                "delete_multiple_usage_information: {} of {} deletions failed",
                failures,
                provider_session_tokens.len()
            );
            return Err(Error::Unknown(site));
        }
        Ok(())
    }

    /// Write back the legacy usage table after a change to it.
    fn update_legacy_usage_table(&self, tag: &str) {
        if self.usage_support_type.get() != Some(&UsageSupportType::Table) {
            return;
        }
        if let Err(err) = self.update_usage_information() {
            warn!("{}: usage update failed: {}", tag, err);
        }
    }

    /// Drop the legacy usage table.
    pub fn delete_all_usage_reports(&self) -> Result<()> {
        self.ensure_initialized()?;
        let result = self
            .context
            .with_engine_write_lock("OEMCrypto_DeleteOldUsageTable", |engine| engine.delete_old_usage_table());
        result.map_err(|code| mapper::usage_error(code, CallSite::DeleteAllUsageReports))
    }

    pub fn create_usage_table_header(&self) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        let level = self.requested_security_level;
        self.context
            .with_engine_write_lock("OEMCrypto_CreateUsageTableHeader", |engine| {
                oemcrypto::read_sized(ESTIMATED_USAGE_TABLE_HEADER_SIZE, |buf, len| {
                    engine.create_usage_table_header(level, buf, len)
                })
            })
            .map_err(|code| mapper::usage_error(code, CallSite::CreateUsageTableHeader))
    }

    /// Load a saved usage table header. A generation-skew warning is success.
    pub fn load_usage_table_header(&self, header: &[u8]) -> Result<()> {
        self.ensure_initialized()?;
        let level = self.requested_security_level;
        let result = self.context.with_engine_write_lock("OEMCrypto_LoadUsageTableHeader", |engine| {
            engine.load_usage_table_header(level, header)
        });
        match result {
            Err(OemCryptoError::WarningGenerationSkew) => {
                warn!("load_usage_table_header: generation skew warning");
                Ok(())
            }
            result => result.map_err(|code| mapper::usage_error(code, CallSite::LoadUsageTableHeader)),
        }
    }

    /// Create a usage entry for this session; returns its number.
    pub fn create_usage_entry(&self) -> Result<u32> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        self.context
            .with_engine_write_lock("OEMCrypto_CreateNewUsageEntry", |engine| {
                engine.create_new_usage_entry(oec_session_id)
            })
            .map_err(|code| mapper::usage_error(code, CallSite::CreateUsageEntry))
    }

    pub fn load_usage_entry(&self, usage_entry_number: u32, usage_entry: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        let result = self.context.with_engine_write_lock("OEMCrypto_LoadUsageEntry", |engine| {
            engine.load_usage_entry(oec_session_id, usage_entry_number, usage_entry)
        });
        match result {
            Err(OemCryptoError::WarningGenerationSkew) => {
                warn!("load_usage_entry: generation skew warning");
                Ok(())
            }
            result => result.map_err(|code| mapper::usage_error(code, CallSite::LoadUsageEntry)),
        }
    }

    /// Returns the updated `(header, entry)`.
    pub fn update_usage_entry(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        self.context
            .with_engine_write_lock("OEMCrypto_UpdateUsageEntry", |engine| {
                let mut header = Vec::new();
                let mut entry = Vec::new();
                let mut header_length = 0;
                let mut entry_length = 0;
                let mut result =
                    engine.update_usage_entry(oec_session_id, &mut header, &mut header_length, &mut entry, &mut entry_length);
                if result == Err(OemCryptoError::ShortBuffer) {
                    header.resize(header_length, 0);
                    entry.resize(entry_length, 0);
                    result = engine.update_usage_entry(
                        oec_session_id,
                        &mut header,
                        &mut header_length,
                        &mut entry,
                        &mut entry_length,
                    );
                }
                result.map(|()| {
                    header.truncate(header_length);
                    entry.truncate(entry_length);
                    (header, entry)
                })
            })
            .map_err(|code| mapper::usage_error(code, CallSite::UpdateUsageEntry))
    }

    /// Shrink the usage table to `new_entry_count`; returns the new header.
    pub fn shrink_usage_table_header(&self, new_entry_count: u32) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        let level = self.requested_security_level;
        self.context
            .with_engine_write_lock("OEMCrypto_ShrinkUsageTableHeader", |engine| {
                oemcrypto::read_sized(ESTIMATED_USAGE_TABLE_HEADER_SIZE, |buf, len| {
                    engine.shrink_usage_table_header(level, new_entry_count, buf, len)
                })
            })
            .map_err(|code| mapper::usage_error(code, CallSite::ShrinkUsageTableHeader))
    }

    pub fn move_usage_entry(&self, new_entry_number: u32) -> Result<()> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        let result = self
            .context
            .with_engine_write_lock("OEMCrypto_MoveEntry", |engine| engine.move_entry(oec_session_id, new_entry_number));
        result.map_err(|code| mapper::usage_error(code, CallSite::MoveUsageEntry))
    }

    /// Copy an entry from the legacy usage table into this session's entry.
    pub fn copy_old_usage_entry(&self, provider_session_token: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let oec_session_id = self.oec_session_id;
        let result = self.context.with_engine_write_lock("OEMCrypto_CopyOldUsageEntry", |engine| {
            engine.copy_old_usage_entry(oec_session_id, provider_session_token)
        });
        result.map_err(|code| mapper::usage_error(code, CallSite::CopyOldUsageEntry))
    }
}

impl Drop for CryptoSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("CryptoSession: close on drop failed: {}", err);
        }
        self.context.unregister_session();
    }
}

/// Fresh destination descriptor `additional_offset` bytes into `dest`.
fn chunk_destination<'b>(dest: &'b mut DestBufferDesc<'_>, additional_offset: usize) -> DestBufferDesc<'b> {
    match dest {
        DestBufferDesc::Clear { buffer } => DestBufferDesc::Clear {
            buffer: buffer.get_mut(additional_offset..).unwrap_or_default(),
        },
        DestBufferDesc::Secure {
            handle,
            offset,
            max_length,
        } => DestBufferDesc::Secure {
            handle: *handle,
            offset: *offset + additional_offset,
            max_length: *max_length,
        },
        DestBufferDesc::Direct { is_video } => DestBufferDesc::Direct { is_video: *is_video },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_destination_advances_clear_and_secure() {
        let mut buffer = [0u8; 32];
        let mut clear = DestBufferDesc::Clear { buffer: &mut buffer };
        match chunk_destination(&mut clear, 20) {
            DestBufferDesc::Clear { buffer } => assert_eq!(buffer.len(), 12),
            other => panic!("unexpected descriptor {:?}", other),
        }

        let mut secure = DestBufferDesc::Secure {
            handle: SecureHandle(7),
            offset: 4,
            max_length: 64,
        };
        match chunk_destination(&mut secure, 16) {
            DestBufferDesc::Secure {
                handle,
                offset,
                max_length,
            } => {
                assert_eq!(handle, SecureHandle(7));
                assert_eq!(offset, 20);
                assert_eq!(max_length, 64);
            }
            other => panic!("unexpected descriptor {:?}", other),
        }
    }

    #[test]
    fn chunk_size_aligns_to_pattern() {
        let pattern = PatternDesc { encrypt: 1, skip: 9 };
        let pattern_length = pattern.length_in_bytes();
        let chunk_size = MAXIMUM_CHUNK_SIZE - MAXIMUM_CHUNK_SIZE % pattern_length;
        assert_eq!(chunk_size % pattern_length, 0);
        assert!(chunk_size <= MAXIMUM_CHUNK_SIZE);

        let odd = PatternDesc { encrypt: 3, skip: 4 }.length_in_bytes();
        assert_eq!((MAXIMUM_CHUNK_SIZE - MAXIMUM_CHUNK_SIZE % odd) % odd, 0);
    }
}
