//! Key loading, selection and decryption strategies.
//!
//! A [`CryptoSession`](crate::crypto_session::CryptoSession) owns exactly one
//! [`KeySession`] at a time. Plain licenses use [`ContentKeySession`];
//! entitlement licenses use [`EntitlementKeySession`], which reaches content
//! keys through an entitlement key and loads them into the engine lazily.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{self, MessageRange};
use crate::key::CryptoKey;
use crate::oemcrypto::{
    CencSample, CipherMode, DestBufferDesc, KeyObject, LicenseType, OecResult, OecSessionId, OemCrypto,
    OemCryptoError, PatternDesc, KEY_IV_SIZE, MAC_KEY_SIZE,
};

/// Which key session variant is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySessionType {
    Default,
    Entitlement,
}

/// Signed license fields passed to `load_keys`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LicenseKeys<'a> {
    /// The signed license message all other fields are located in.
    pub message: &'a [u8],
    pub signature: &'a [u8],
    pub mac_key_iv: &'a [u8],
    /// Encrypted server and client MAC keys.
    pub mac_key: &'a [u8],
    pub keys: &'a [CryptoKey],
    /// Provider session token.
    pub provider_session_token: &'a [u8],
    pub srm_requirement: &'a [u8],
}

/// Key operations bound to one engine session.
pub trait KeySession: Send {
    fn session_type(&self) -> KeySessionType;

    /// Engine session this key session issues calls for.
    fn oec_session_id(&self) -> OecSessionId;

    /// Derive session keys from the device key and a request message.
    fn generate_derived_keys(&mut self, message: &[u8]) -> OecResult<()>;

    /// Derive session keys from an externally supplied session key.
    fn generate_derived_keys_with_session_key(&mut self, message: &[u8], session_key: &[u8]) -> OecResult<()>;

    /// Load the keys of a license.
    ///
    /// Returns the cipher mode of the last key, which is only meaningful
    /// when all keys share one mode.
    fn load_keys(&mut self, license: &LicenseKeys<'_>) -> OecResult<Option<CipherMode>>;

    fn load_entitled_content_keys(&mut self, keys: &[CryptoKey]) -> OecResult<()>;

    fn select_key(&mut self, key_id: &[u8], cipher_mode: CipherMode) -> OecResult<()>;

    /// Single engine decrypt call; the caller handles chunking.
    fn decrypt(
        &mut self,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDesc,
    ) -> OecResult<()>;
}

/// Key session for licenses carrying content keys directly.
pub struct ContentKeySession {
    engine: Arc<dyn OemCrypto>,
    oec_session_id: OecSessionId,
    cached_key_id: Vec<u8>,
    cipher_mode: CipherMode,
}

impl ContentKeySession {
    pub fn new(engine: Arc<dyn OemCrypto>, oec_session_id: OecSessionId) -> Self {
        Self {
            engine,
            oec_session_id,
            cached_key_id: Vec::new(),
            cipher_mode: CipherMode::Ctr,
        }
    }

    /// Key id of the last successful selection, empty if none.
    #[must_use]
    pub fn cached_key_id(&self) -> &[u8] {
        &self.cached_key_id
    }

    fn load_keys_as_license_type(
        &mut self,
        license: &LicenseKeys<'_>,
        license_type: LicenseType,
    ) -> OecResult<Option<CipherMode>> {
        let message = license.message;
        self.cached_key_id.clear();

        let valid_mac_keys = license.mac_key.len() >= MAC_KEY_SIZE && license.mac_key_iv.len() >= KEY_IV_SIZE;
        if !valid_mac_keys {
            trace!("LoadKeys: enc_mac_key not set");
        }
        let enc_mac_keys = MessageRange::locate(message, license.mac_key, !valid_mac_keys);
        let enc_mac_keys_iv = MessageRange::locate(message, license.mac_key_iv, !valid_mac_keys);

        let mut cipher_mode = None;
        let mut key_objects = Vec::with_capacity(license.keys.len());
        for (index, key) in license.keys.iter().enumerate() {
            let has_key_control = key.has_key_control();
            if !has_key_control {
                warn!("LoadKeys: key {} has no key control block", index);
            }
            key_objects.push(KeyObject {
                key_id: MessageRange::locate(message, &key.key_id, false).raw(),
                key_data_iv: MessageRange::locate(message, &key.key_data_iv, false).raw(),
                key_data: MessageRange::locate(message, &key.key_data, false).raw(),
                key_control_iv: MessageRange::locate(message, &key.key_control_iv, !has_key_control).raw(),
                key_control: MessageRange::locate(message, &key.key_control, !has_key_control).raw(),
                cipher_mode: key.cipher_mode,
            });
            cipher_mode = Some(key.cipher_mode);
        }

        let pst = MessageRange::locate(message, license.provider_session_token, false);
        let srm_requirement = MessageRange::locate(message, license.srm_requirement, false);

        debug!("LoadKeys: id={} keys={}", self.oec_session_id.0, key_objects.len());
        self.engine.load_keys(
            self.oec_session_id,
            message,
            license.signature,
            enc_mac_keys_iv.raw(),
            enc_mac_keys.raw(),
            &key_objects,
            pst.raw(),
            srm_requirement.raw(),
            license_type,
        )?;
        Ok(cipher_mode)
    }
}

impl KeySession for ContentKeySession {
    fn session_type(&self) -> KeySessionType {
        KeySessionType::Default
    }

    fn oec_session_id(&self) -> OecSessionId {
        self.oec_session_id
    }

    fn generate_derived_keys(&mut self, message: &[u8]) -> OecResult<()> {
        let (mac_context, enc_context) = codec::derive_contexts(message);
        self.engine
            .generate_derived_keys(self.oec_session_id, &mac_context, &enc_context)
    }

    fn generate_derived_keys_with_session_key(&mut self, message: &[u8], session_key: &[u8]) -> OecResult<()> {
        let (mac_context, enc_context) = codec::derive_contexts(message);
        self.engine
            .derive_keys_from_session_key(self.oec_session_id, session_key, &mac_context, &enc_context)
    }

    fn load_keys(&mut self, license: &LicenseKeys<'_>) -> OecResult<Option<CipherMode>> {
        self.load_keys_as_license_type(license, LicenseType::Content)
    }

    fn load_entitled_content_keys(&mut self, _keys: &[CryptoKey]) -> OecResult<()> {
        Err(OemCryptoError::NotImplemented)
    }

    fn select_key(&mut self, key_id: &[u8], cipher_mode: CipherMode) -> OecResult<()> {
        // Repeated selection of the same key is skipped. An empty id never
        // matches the cache.
        if !self.cached_key_id.is_empty() && self.cached_key_id == key_id && self.cipher_mode == cipher_mode {
            return Ok(());
        }

        self.cached_key_id = key_id.to_vec();
        self.cipher_mode = cipher_mode;
        let result = self.engine.select_key(self.oec_session_id, key_id, cipher_mode);
        if result.is_err() {
            self.cached_key_id.clear();
        }
        result
    }

    fn decrypt(
        &mut self,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDesc,
    ) -> OecResult<()> {
        self.engine.decrypt_cenc(self.oec_session_id, sample, dest, pattern)
    }
}

/// Key session for entitlement licenses.
///
/// The engine holds at most one content key per entitlement key, so entitled
/// keys are stored here and swapped into the engine on selection.
pub struct EntitlementKeySession {
    base: ContentKeySession,
    /// Entitled content keys by content key id.
    entitled_keys: HashMap<Vec<u8>, CryptoKey>,
    /// Content key currently resident in the engine, by entitlement key id.
    current_loaded_content_keys: HashMap<Vec<u8>, CryptoKey>,
}

impl EntitlementKeySession {
    pub fn new(engine: Arc<dyn OemCrypto>, oec_session_id: OecSessionId) -> Self {
        Self {
            base: ContentKeySession::new(engine, oec_session_id),
            entitled_keys: HashMap::new(),
            current_loaded_content_keys: HashMap::new(),
        }
    }

    /// Number of entitled keys known to this session.
    #[must_use]
    pub fn entitled_key_count(&self) -> usize {
        self.entitled_keys.len()
    }

    /// Content key id resident in the engine for an entitlement key.
    #[must_use]
    pub fn loaded_content_key(&self, entitlement_key_id: &[u8]) -> Option<&[u8]> {
        self.current_loaded_content_keys
            .get(entitlement_key_id)
            .map(|key| key.key_id.as_slice())
    }

    fn load_entitled_key(&mut self, key: &CryptoKey) -> OecResult<()> {
        let (message, object) =
            codec::entitled_key_message(&key.entitlement_key_id, &key.key_id, &key.key_data_iv, &key.key_data);
        self.base
            .engine
            .load_entitled_content_keys(self.base.oec_session_id, &message, &[object])
    }
}

impl KeySession for EntitlementKeySession {
    fn session_type(&self) -> KeySessionType {
        KeySessionType::Entitlement
    }

    fn oec_session_id(&self) -> OecSessionId {
        self.base.oec_session_id
    }

    fn generate_derived_keys(&mut self, message: &[u8]) -> OecResult<()> {
        self.base.generate_derived_keys(message)
    }

    fn generate_derived_keys_with_session_key(&mut self, message: &[u8], session_key: &[u8]) -> OecResult<()> {
        self.base.generate_derived_keys_with_session_key(message, session_key)
    }

    fn load_keys(&mut self, license: &LicenseKeys<'_>) -> OecResult<Option<CipherMode>> {
        self.base.load_keys_as_license_type(license, LicenseType::Entitlement)
    }

    fn load_entitled_content_keys(&mut self, keys: &[CryptoKey]) -> OecResult<()> {
        for key in keys {
            self.entitled_keys.insert(key.key_id.clone(), key.clone());
        }
        Ok(())
    }

    fn select_key(&mut self, key_id: &[u8], cipher_mode: CipherMode) -> OecResult<()> {
        let Some(key) = self.entitled_keys.get(key_id).cloned() else {
            error!("SelectKey: key id {} is not an entitled key", hex::encode(key_id));
            return Err(OemCryptoError::NoContentKey);
        };

        if self.loaded_content_key(&key.entitlement_key_id) != Some(key_id) {
            self.load_entitled_key(&key)?;
            self.current_loaded_content_keys
                .insert(key.entitlement_key_id.clone(), key);
        }

        self.base.select_key(key_id, cipher_mode)
    }

    fn decrypt(
        &mut self,
        sample: &CencSample<'_>,
        dest: &mut DestBufferDesc<'_>,
        pattern: &PatternDesc,
    ) -> OecResult<()> {
        self.base.decrypt(sample, dest, pattern)
    }
}
