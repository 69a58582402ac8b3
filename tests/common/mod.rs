#![allow(dead_code)]

use std::sync::Arc;

use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use wvcrypto::key::CryptoKey;
use wvcrypto::oemcrypto::{CipherMode, LicenseType, ProvisioningMethod, SecurityLevel};
use wvcrypto::software::{self, LicenseBuilder, SignedLicense, SoftwareEngine, SoftwareEngineConfig};
use wvcrypto::{CryptoContext, CryptoSession, Properties};

pub const CONTENT_KEY_ID: &[u8] = b"content-key-0001";
pub const CONTENT_KEY: [u8; 16] = [0x11; 16];
pub const ENTITLEMENT_KEY_ID: &[u8] = b"entitlement-0001";
pub const ENTITLEMENT_KEY: [u8; 32] = [0x22; 32];

pub struct Fixture {
    pub engine: Arc<SoftwareEngine>,
    pub context: Arc<CryptoContext>,
}

impl Fixture {
    pub fn new(config: SoftwareEngineConfig) -> Self {
        Self::with_properties(config, Properties::default())
    }

    pub fn with_properties(config: SoftwareEngineConfig, properties: Properties) -> Self {
        let engine = Arc::new(SoftwareEngine::new(config));
        let context = CryptoContext::new(engine.clone(), properties);
        Self { engine, context }
    }

    pub fn session(&self) -> CryptoSession {
        CryptoSession::new(Arc::clone(&self.context))
    }

    pub fn open_session(&self) -> CryptoSession {
        let mut session = self.session();
        session.open(SecurityLevel::Default).expect("open session");
        session
    }

    /// Derive keys for a fresh request on `session` and start a license
    /// answering it.
    pub fn license_for(&self, session: &CryptoSession) -> LicenseBuilder {
        let request = format!("license-request-{}", session.request_id()).into_bytes();
        session.generate_derived_keys(&request).expect("derive keys");
        LicenseBuilder::new(&self.engine.config().device_key, &request).expect("license builder")
    }

    /// Load a content license holding `CONTENT_KEY` in `cipher_mode`.
    pub fn load_content_license(&self, session: &CryptoSession, cipher_mode: CipherMode) -> SignedLicense {
        let license = self
            .license_for(session)
            .content_key(CONTENT_KEY_ID, CONTENT_KEY, cipher_mode)
            .build();
        session
            .load_keys(&license.license_keys(), LicenseType::Content)
            .expect("load content license");
        license
    }

    /// Load an entitlement license holding `ENTITLEMENT_KEY`.
    pub fn load_entitlement_license(&self, session: &CryptoSession) -> SignedLicense {
        let license = self
            .license_for(session)
            .entitlement_key(ENTITLEMENT_KEY_ID, ENTITLEMENT_KEY)
            .build();
        session
            .load_keys(&license.license_keys(), LicenseType::Entitlement)
            .expect("load entitlement license");
        license
    }
}

/// Content key `content_key` entitled by the fixture entitlement key.
pub fn entitled_key(content_key_id: &[u8], content_key: &[u8; 16]) -> CryptoKey {
    software::entitled_content_key(
        ENTITLEMENT_KEY_ID,
        &ENTITLEMENT_KEY,
        content_key_id,
        content_key,
        CipherMode::Ctr,
    )
}

/// RSA key a provisioning server hands to the device.
pub fn device_rsa_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(include_str!("../data/device_rsa_key.pem")).expect("device RSA key")
}

/// Key pair of the OEM certificate in [`OEM_CERT_CHAIN`].
pub fn oem_rsa_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(include_str!("../data/oem_rsa_key.pem")).expect("OEM RSA key")
}

/// PKCS#7 chain of a device certificate and an OEM intermediate carrying
/// system id 4445.
pub const OEM_CERT_CHAIN: &[u8] = include_bytes!("../data/oem_cert_chain.p7b");

/// Engine configuration of an OEM certificate device.
pub fn oem_cert_config() -> SoftwareEngineConfig {
    SoftwareEngineConfig {
        provisioning_method: ProvisioningMethod::OemCertificate,
        oem_certificate: OEM_CERT_CHAIN.to_vec(),
        oem_private_key: Some(include_str!("../data/oem_rsa_key.pem").to_string()),
        ..SoftwareEngineConfig::default()
    }
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 251) as u8).collect()
}
