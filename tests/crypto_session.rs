mod common;

use common::{payload, Fixture, CONTENT_KEY, CONTENT_KEY_ID};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use test_log::test;
use wvcrypto::crypto_session::ClientTokenType;
use rsa::{Oaep, Pss};
use sha1::Sha1;
use wvcrypto::oemcrypto::{
    CdmSecurityLevel, CipherMode, GenericAlgorithm, HdcpCapability, LicenseType, PatternDesc, ProvisioningMethod,
    SecurityLevel,
};
use wvcrypto::software::{self, LicenseBuilder, RenewalBuilder, SoftwareEngineConfig};
use wvcrypto::usage_table::UsageSupportType;
use wvcrypto::{CallSite, DecryptionParams, Error, OemCryptoError, Properties};

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac key");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

#[test]
fn engine_lifetime_follows_sessions() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let first = fixture.session();
    let second = fixture.session();
    assert!(first.is_initialized());
    assert_eq!(fixture.engine.call_count("initialize"), 1);
    assert_eq!(fixture.context.session_count(), 2);

    drop(first);
    assert_eq!(fixture.engine.call_count("terminate"), 0);
    drop(second);
    assert_eq!(fixture.engine.call_count("terminate"), 1);
    assert!(!fixture.context.is_initialized());

    let third = fixture.session();
    assert!(third.is_initialized());
    assert_eq!(fixture.engine.call_count("initialize"), 2);
}

#[test]
fn sandbox_is_set_before_initialize() {
    let properties = Properties {
        sandbox_id: Some("sandbox-7".to_string()),
        ..Properties::default()
    };
    let fixture = Fixture::with_properties(SoftwareEngineConfig::default(), properties);
    let _session = fixture.session();
    assert_eq!(fixture.engine.call_count("set_sandbox"), 1);
    assert_eq!(fixture.engine.call_count("initialize"), 1);
}

#[test]
fn failed_initialize_blocks_open_until_retried() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    fixture.engine.inject_failure("initialize", OemCryptoError::InitFailed);

    let mut session = fixture.session();
    assert!(!session.is_initialized());
    assert_eq!(session.open(SecurityLevel::Default), Err(Error::Unknown(CallSite::Open)));
    assert_eq!(session.get_random(4), Err(Error::NotInitialized));
    drop(session);

    let session = fixture.open_session();
    assert!(session.is_open());
}

#[test]
fn open_and_close_are_idempotent() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let mut session = fixture.open_session();
    let oec_session_id = session.oec_session_id();
    session.open(SecurityLevel::Default).expect("reopen");
    assert_eq!(session.oec_session_id(), oec_session_id);
    assert_eq!(fixture.engine.call_count("open_session"), 1);

    session.close().expect("close");
    session.close().expect("close again");
    assert!(!session.is_open());
    assert_eq!(fixture.engine.call_count("close_session"), 1);
    assert_eq!(session.generate_nonce(), Err(Error::NotOpen));
}

#[test]
fn drop_closes_engine_session() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let keep = fixture.open_session();
    let session = fixture.open_session();
    assert_eq!(keep.get_number_of_open_sessions(), Ok(2));

    drop(session);
    assert_eq!(fixture.engine.call_count("close_session"), 1);
    assert_eq!(keep.get_number_of_open_sessions(), Ok(1));
}

#[test]
fn request_ids_are_unique_hex() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let first = fixture.open_session();
    let second = fixture.open_session();

    assert_eq!(first.request_id().len(), 32);
    assert!(first.request_id().chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(first.request_id(), second.request_id());
    assert!(first.request_id().ends_with("0000000000000000"));
    assert!(second.request_id().ends_with("0000000000000001"));
}

#[test]
fn keybox_device_reports_ids() {
    let config = SoftwareEngineConfig::default();
    let token = config.keybox_key_data();
    let fixture = Fixture::new(config);
    let session = fixture.open_session();

    assert_eq!(session.pre_provision_token_type(), ClientTokenType::Keybox);
    assert_eq!(session.system_id(), Some(4445));
    assert_eq!(session.get_provisioning_token(), Ok(token.clone()));
    assert_eq!(session.get_provisioning_id(), Ok(token[8..24].to_vec()));
    assert_eq!(
        session.get_external_device_unique_id(),
        Ok(b"wvcrypto-software-device".to_vec())
    );
    assert_eq!(session.get_security_level(), CdmSecurityLevel::L3);
    assert_eq!(session.get_api_version(), Ok(16));
}

#[test]
fn short_keybox_token_fails_open_but_leaves_session_open() {
    let fixture = Fixture::new(SoftwareEngineConfig {
        keybox_token: vec![0u8; 7],
        ..SoftwareEngineConfig::default()
    });
    let mut session = fixture.session();

    assert_eq!(
        session.open(SecurityLevel::Default),
        Err(Error::LoadSystemId(Box::new(Error::KeyboxTokenTooShort(7))))
    );
    assert!(session.is_open());
    assert_eq!(fixture.engine.call_count("open_session"), 1);

    session.close().expect("close");
    assert_eq!(fixture.engine.call_count("close_session"), 1);
}

#[test]
fn oem_cert_device_falls_back_to_certificate_ids() {
    let certificate = b"not a pkcs7 certificate".to_vec();
    let fixture = Fixture::new(SoftwareEngineConfig {
        provisioning_method: ProvisioningMethod::OemCertificate,
        oem_certificate: certificate.clone(),
        device_id: Vec::new(),
        ..SoftwareEngineConfig::default()
    });
    let mut session = fixture.session();

    assert_eq!(
        session.open(SecurityLevel::Default),
        Err(Error::LoadSystemId(Box::new(Error::ExtractSystemIdFromOemCert)))
    );
    assert_eq!(session.pre_provision_token_type(), ClientTokenType::OemCert);

    let hashed = Sha256::digest(&certificate).to_vec();
    assert_eq!(session.get_internal_device_unique_id(), Ok(certificate.clone()));
    assert_eq!(session.get_external_device_unique_id(), Ok(hashed.clone()));
    let inverted: Vec<u8> = hashed.iter().map(|byte| !byte).collect();
    assert_eq!(session.get_provisioning_id(), Ok(inverted));
    assert_eq!(session.get_provisioning_token(), Ok(certificate));
    // Cached after the first fetch.
    assert_eq!(fixture.engine.call_count("get_oem_public_certificate"), 1);
}

#[test]
fn drm_cert_device_has_no_pre_provisioning_token() {
    let fixture = Fixture::new(SoftwareEngineConfig {
        provisioning_method: ProvisioningMethod::DrmCertificate,
        ..SoftwareEngineConfig::default()
    });
    let session = fixture.open_session();

    assert_eq!(session.system_id(), None);
    assert_eq!(session.get_provisioning_token(), Err(Error::UnknownClientTokenType));
    assert_eq!(session.get_provisioning_id(), Err(Error::UnknownClientTokenType));
}

#[test]
fn provisioning_error_fails_open() {
    let fixture = Fixture::new(SoftwareEngineConfig {
        provisioning_method: ProvisioningMethod::ProvisioningError,
        ..SoftwareEngineConfig::default()
    });
    let mut session = fixture.session();
    assert_eq!(session.open(SecurityLevel::Default), Err(Error::GetProvisioningMethod));
    assert!(!session.is_open());
    assert_eq!(fixture.engine.call_count("open_session"), 0);
}

#[test]
fn session_limit_is_resource_exhaustion() {
    let fixture = Fixture::new(SoftwareEngineConfig {
        max_sessions: 1,
        ..SoftwareEngineConfig::default()
    });
    let _first = fixture.open_session();
    let mut second = fixture.session();

    let err = second.open(SecurityLevel::Default).expect_err("second open");
    assert_eq!(err, Error::InsufficientCryptoResources(CallSite::Open));
    assert!(err.is_resource_exhaustion());
}

#[test]
fn lost_state_maps_the_same_everywhere() {
    for code in [OemCryptoError::SessionLostState, OemCryptoError::SystemInvalidated] {
        let expected = if code == OemCryptoError::SessionLostState {
            Error::SessionLostState
        } else {
            Error::SystemInvalidated
        };
        let fixture = Fixture::new(SoftwareEngineConfig::default());
        let session = fixture.open_session();

        let license = fixture
            .license_for(&session)
            .content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr)
            .build();
        fixture.engine.inject_failure("load_keys", code);
        assert_eq!(
            session.load_keys(&license.license_keys(), LicenseType::Content),
            Err(expected.clone())
        );
        session
            .load_keys(&license.license_keys(), LicenseType::Content)
            .expect("load keys");

        fixture.engine.inject_failure("select_key", code);
        assert_eq!(session.select_key(CONTENT_KEY_ID, CipherMode::Ctr), Err(expected.clone()));
        session.select_key(CONTENT_KEY_ID, CipherMode::Ctr).expect("select");

        let ciphertext = payload(64);
        let mut output = vec![0u8; ciphertext.len()];
        let mut params = DecryptionParams::new(CONTENT_KEY_ID, &ciphertext, [0u8; 16], &mut output);
        fixture.engine.inject_failure("decrypt_cenc", code);
        assert_eq!(session.decrypt(&mut params), Err(expected.clone()));

        fixture.engine.inject_failure("generic_encrypt", code);
        assert_eq!(
            session.generic_encrypt(&[0u8; 32], CONTENT_KEY_ID, &[0u8; 16], GenericAlgorithm::AesCbc128NoPadding),
            Err(expected.clone())
        );

        fixture.engine.inject_failure("generate_derived_keys", code);
        assert_eq!(session.generate_derived_keys(b"request"), Err(expected.clone()));
        assert!(expected.requires_reprovisioning());
    }
}

#[test]
fn usage_support_type_is_resolved_once() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    assert_eq!(session.get_usage_support_type(), Ok(UsageSupportType::Entry));
    let queries = fixture.engine.call_count("supports_usage_table");

    fixture.engine.set_supports_usage_table(false);
    assert_eq!(session.get_usage_support_type(), Ok(UsageSupportType::Entry));
    assert_eq!(fixture.engine.call_count("supports_usage_table"), queries);

    // A new session asks again.
    let other = fixture.open_session();
    assert_eq!(other.get_usage_support_type(), Ok(UsageSupportType::NonSecure));
}

#[test]
fn usage_support_needs_an_open_session() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.session();
    assert_eq!(session.get_usage_support_type(), Err(Error::UsageInformationSupportFailed));
}

#[test]
fn keybox_provisioning_request_uses_derived_client_key() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    let request = b"signed provisioning request".to_vec();

    let signature = session.prepare_request(&request, true).expect("prepare request");
    let builder = LicenseBuilder::new(&fixture.engine.config().device_key, &request).expect("license builder");
    assert_eq!(signature, hmac_sha256(&builder.derived_keys().mac_key_client, &request));
    assert_eq!(fixture.engine.call_count("generate_rsa_signature"), 0);
}

#[test]
fn license_request_is_signed_with_device_rsa_key() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    assert_eq!(
        session.prepare_request(b"license request", false),
        Err(Error::Failed {
            site: CallSite::GenerateRsaSignature,
            code: OemCryptoError::InvalidRsaKey
        })
    );

    let wrapped = software::wrap_rsa_key(&fixture.engine.config().device_key, &common::device_rsa_key())
        .expect("wrap device key");
    session.load_certificate_private_key(&wrapped).expect("load device key");
    let request = b"license request".to_vec();
    let signature = session.prepare_request(&request, false).expect("prepare request");
    common::device_rsa_key()
        .to_public_key()
        .verify(Pss::new::<Sha1>(), &Sha1::digest(&request), &signature)
        .expect("PSS signature");
    assert_eq!(fixture.engine.call_count("generate_derived_keys"), 0);
    assert_eq!(fixture.engine.call_count("generate_signature"), 0);
}

#[test]
fn license_keys_derive_from_rsa_wrapped_session_key() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    let wrapped = software::wrap_rsa_key(&fixture.engine.config().device_key, &common::device_rsa_key())
        .expect("wrap device key");
    session.load_certificate_private_key(&wrapped).expect("load device key");

    let request = b"license request with session key".to_vec();
    session.prepare_request(&request, false).expect("prepare request");
    let session_key = [0x3c; 16];
    let enc_session_key = common::device_rsa_key()
        .to_public_key()
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), &session_key)
        .expect("encrypt session key");
    session
        .generate_derived_keys_with_session_key(&request, &enc_session_key)
        .expect("derive from session key");

    let license = LicenseBuilder::new(&session_key, &request)
        .expect("license builder")
        .content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr)
        .build();
    session
        .load_keys(&license.license_keys(), LicenseType::Content)
        .expect("load keys");

    let plaintext = payload(1024);
    let ciphertext =
        software::cenc_ctr(&CONTENT_KEY, &[0u8; 16], 0, &plaintext, &PatternDesc::default()).expect("encrypt");
    let mut output = vec![0u8; ciphertext.len()];
    let mut params = DecryptionParams::new(CONTENT_KEY_ID, &ciphertext, [0u8; 16], &mut output);
    session.decrypt(&mut params).expect("decrypt");
    assert_eq!(output, plaintext);
}

#[test]
fn refresh_keys_checks_signature_and_controls() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    let builder = fixture.license_for(&session);
    let server_key = builder.derived_keys().mac_key_server;
    let license = builder.content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr).build();
    session
        .load_keys(&license.license_keys(), LicenseType::Content)
        .expect("load keys");

    let renewal = RenewalBuilder::new(server_key).key(CONTENT_KEY_ID, &CONTENT_KEY).build();
    session
        .refresh_keys(&renewal.message, &renewal.signature, &renewal.keys)
        .expect("refresh one key");
    let renewal = RenewalBuilder::new(server_key).all_keys().build();
    session
        .refresh_keys(&renewal.message, &renewal.signature, &renewal.keys)
        .expect("refresh all keys");
    assert_eq!(fixture.engine.call_count("refresh_keys"), 2);

    let refresh_error = |code: OemCryptoError| -> wvcrypto::Result<()> {
        Err(Error::Failed {
            site: CallSite::RefreshKeys,
            code,
        })
    };
    let mut tampered = RenewalBuilder::new(server_key).key(CONTENT_KEY_ID, &CONTENT_KEY).build();
    tampered.signature[0] ^= 0x80;
    assert_eq!(
        session.refresh_keys(&tampered.message, &tampered.signature, &tampered.keys),
        refresh_error(OemCryptoError::SignatureFailure)
    );

    let unknown = RenewalBuilder::new(server_key).key(b"unknown-key-0001", &CONTENT_KEY).build();
    assert_eq!(
        session.refresh_keys(&unknown.message, &unknown.signature, &unknown.keys),
        refresh_error(OemCryptoError::NoContentKey)
    );

    // A control block encrypted under the wrong key does not decrypt to "kctl".
    let wrong_key = RenewalBuilder::new(server_key).key(CONTENT_KEY_ID, &[0x99; 16]).build();
    assert_eq!(
        session.refresh_keys(&wrong_key.message, &wrong_key.signature, &wrong_key.keys),
        refresh_error(OemCryptoError::ControlInvalid)
    );
}

#[test]
fn refresh_keys_follows_mac_key_rotation() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    let builder = fixture.license_for(&session);
    let original_server_key = builder.derived_keys().mac_key_server;
    let license = builder
        .content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr)
        .mac_keys([0x01; 32], [0x02; 32])
        .build();
    session
        .load_keys(&license.license_keys(), LicenseType::Content)
        .expect("load keys");

    let stale = RenewalBuilder::new(original_server_key).all_keys().build();
    assert_eq!(
        session.refresh_keys(&stale.message, &stale.signature, &stale.keys),
        Err(Error::Failed {
            site: CallSite::RefreshKeys,
            code: OemCryptoError::SignatureFailure
        })
    );
    let rotated = RenewalBuilder::new([0x01; 32]).all_keys().build();
    session
        .refresh_keys(&rotated.message, &rotated.signature, &rotated.keys)
        .expect("refresh with rotated key");
}

#[test]
fn renewal_signature_follows_mac_key_rotation() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());

    let session = fixture.open_session();
    let builder = fixture.license_for(&session);
    let client_key = builder.derived_keys().mac_key_client;
    let license = builder.content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr).build();
    session
        .load_keys(&license.license_keys(), LicenseType::Content)
        .expect("load keys");
    let renewal = session.prepare_renewal_request(b"renewal").expect("renewal");
    assert_eq!(renewal, hmac_sha256(&client_key, b"renewal"));

    let rotated = fixture.open_session();
    let license = fixture
        .license_for(&rotated)
        .content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr)
        .mac_keys([0x01; 32], [0x02; 32])
        .build();
    rotated
        .load_keys(&license.license_keys(), LicenseType::Content)
        .expect("load keys with mac keys");
    let renewal = rotated.prepare_renewal_request(b"renewal").expect("renewal");
    assert_eq!(renewal, hmac_sha256(&[0x02; 32], b"renewal"));
}

#[test]
fn tampered_license_fails_signature_check() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    let mut license = fixture
        .license_for(&session)
        .content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr)
        .build();
    license.signature[0] ^= 0x80;

    assert_eq!(
        session.load_keys(&license.license_keys(), LicenseType::Content),
        Err(Error::Failed {
            site: CallSite::LoadKeys,
            code: OemCryptoError::SignatureFailure,
        })
    );
    assert!(!fixture.engine.has_key(session.oec_session_id(), CONTENT_KEY_ID));
}

#[test]
fn too_many_keys_is_resource_exhaustion() {
    let fixture = Fixture::new(SoftwareEngineConfig {
        max_keys: 1,
        ..SoftwareEngineConfig::default()
    });
    let session = fixture.open_session();
    let license = fixture
        .license_for(&session)
        .content_key(b"key-1", CONTENT_KEY, CipherMode::Ctr)
        .content_key(b"key-2", CONTENT_KEY, CipherMode::Ctr)
        .build();
    assert_eq!(
        session.load_keys(&license.license_keys(), LicenseType::Content),
        Err(Error::InsufficientCryptoResources(CallSite::LoadKeys))
    );
}

#[test]
fn generic_crypto_round_trip() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    fixture.load_content_license(&session, CipherMode::Ctr);

    let iv = [0x24u8; 16];
    let plaintext = payload(64);
    let encrypted = session
        .generic_encrypt(&plaintext, CONTENT_KEY_ID, &iv, GenericAlgorithm::AesCbc128NoPadding)
        .expect("encrypt");
    assert_ne!(encrypted, plaintext);
    let decrypted = session
        .generic_decrypt(&encrypted, CONTENT_KEY_ID, &iv, GenericAlgorithm::AesCbc128NoPadding)
        .expect("decrypt");
    assert_eq!(decrypted, plaintext);

    let signature = session
        .generic_sign(b"message", CONTENT_KEY_ID, GenericAlgorithm::HmacSha256)
        .expect("sign");
    assert_eq!(signature, hmac_sha256(&CONTENT_KEY, b"message"));
    session
        .generic_verify(b"message", CONTENT_KEY_ID, GenericAlgorithm::HmacSha256, &signature)
        .expect("verify");
    assert_eq!(
        session.generic_verify(b"other message", CONTENT_KEY_ID, GenericAlgorithm::HmacSha256, &signature),
        Err(Error::Failed {
            site: CallSite::GenericVerify,
            code: OemCryptoError::SignatureFailure,
        })
    );
}

#[test]
fn generic_crypto_validates_before_engine_call() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    fixture.load_content_license(&session, CipherMode::Ctr);

    assert_eq!(
        session.generic_encrypt(&[0u8; 16], CONTENT_KEY_ID, &[0u8; 16], GenericAlgorithm::HmacSha256),
        Err(Error::InvalidParameters(CallSite::GenericEncrypt))
    );
    assert_eq!(
        session.generic_decrypt(&[0u8; 16], CONTENT_KEY_ID, &[0u8; 8], GenericAlgorithm::AesCbc128NoPadding),
        Err(Error::InvalidParameters(CallSite::GenericDecrypt))
    );
    assert_eq!(
        session.generic_sign(b"message", CONTENT_KEY_ID, GenericAlgorithm::AesCbc128NoPadding),
        Err(Error::InvalidParameters(CallSite::GenericSign))
    );
    assert_eq!(fixture.engine.call_count("generic_encrypt"), 0);
    assert_eq!(fixture.engine.call_count("generic_decrypt"), 0);
    assert_eq!(fixture.engine.call_count("generic_sign"), 0);

    assert_eq!(
        session.generic_sign(b"message", b"unknown-key", GenericAlgorithm::HmacSha256),
        Err(Error::NoContentKey(CallSite::SelectKey))
    );
}

#[test]
fn device_queries() {
    let fixture = Fixture::new(SoftwareEngineConfig {
        security_level: "L1".to_string(),
        srm_version: Some(3),
        resource_rating_tier: 2,
        ..SoftwareEngineConfig::default()
    });
    let session = fixture.open_session();

    assert_eq!(session.get_security_level(), CdmSecurityLevel::L1);
    assert_eq!(session.get_hdcp_capabilities(), Ok((HdcpCapability::V2_2, HdcpCapability::V2_2)));
    assert_eq!(session.get_max_number_of_sessions(), Ok(16));
    assert_eq!(session.get_resource_rating_tier(), 2);
    assert!(session.get_build_information().is_some());
    assert!(session.generate_nonce().is_ok());
    assert_eq!(session.get_random(24).map(|bytes| bytes.len()), Ok(24));

    assert!(session.is_srm_update_supported());
    assert_eq!(session.get_srm_version(), Ok(3));
    assert_eq!(session.load_srm(&[]), Err(Error::InvalidSrmList));
    session.load_srm(&[0, 5, 0xff]).expect("load srm");
    assert_eq!(session.get_srm_version(), Ok(5));
    assert_eq!(
        session.load_srm(&[0, 1]),
        Err(Error::Failed {
            site: CallSite::LoadSrm,
            code: OemCryptoError::InvalidContext,
        })
    );
}

#[test]
fn srm_unsupported_engine() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    assert!(!session.is_srm_update_supported());
    assert_eq!(session.get_srm_version(), Err(Error::NotImplemented));
}

#[test]
fn table_usage_engine_updates_after_pst_license_and_close() {
    let fixture = Fixture::new(SoftwareEngineConfig {
        api_version: 12,
        ..SoftwareEngineConfig::default()
    });
    let mut session = fixture.open_session();
    assert_eq!(session.get_usage_support_type(), Ok(UsageSupportType::Table));
    assert!(session.usage_table_header().is_none());

    let license = fixture
        .license_for(&session)
        .content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr)
        .provider_session_token(b"pst-table")
        .build();
    session
        .load_keys(&license.license_keys(), LicenseType::Content)
        .expect("load keys");
    assert_eq!(fixture.engine.call_count("update_usage_table"), 1);

    session.close().expect("close");
    assert_eq!(fixture.engine.call_count("update_usage_table"), 2);
}

#[test]
fn usage_information_lifecycle() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    let license = fixture
        .license_for(&session)
        .content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr)
        .provider_session_token(b"pst-1")
        .build();
    session
        .load_keys(&license.license_keys(), LicenseType::Content)
        .expect("load keys");
    // Per-entry engines never take whole-table updates.
    assert_eq!(fixture.engine.call_count("update_usage_table"), 0);

    session.deactivate_usage_information(b"pst-1").expect("deactivate");
    assert_eq!(session.deactivate_usage_information(b"pst-1"), Err(Error::KeyCanceled));

    let report = session.generate_usage_report(b"pst-1").expect("usage report");
    assert!(report.len() > 32);

    session.delete_usage_information(b"pst-1").expect("delete");
    assert!(session.generate_usage_report(b"pst-1").is_err());
    assert_eq!(
        session.delete_usage_information(b"pst-1"),
        Err(Error::Unknown(CallSite::DeleteUsageInformation))
    );
    session.delete_all_usage_reports().expect("delete all");
}

#[test]
fn release_is_skipped_with_usage_entries() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    assert!(session.usage_table_header().is_some());

    session
        .release_usage_information(b"release message", b"signature", b"pst-1")
        .expect("release");
    assert_eq!(fixture.engine.call_count("delete_usage_entry"), 0);
}

#[test]
fn signed_release_deletes_legacy_usage_record() {
    let fixture = Fixture::new(SoftwareEngineConfig {
        api_version: 12,
        ..SoftwareEngineConfig::default()
    });
    let session = fixture.open_session();
    let builder = fixture.license_for(&session);
    let server_key = builder.derived_keys().mac_key_server;
    let license = builder
        .content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr)
        .provider_session_token(b"pst-release")
        .build();
    session
        .load_keys(&license.license_keys(), LicenseType::Content)
        .expect("load keys");
    assert!(fixture.engine.has_usage_record(b"pst-release"));
    let updates = fixture.engine.call_count("update_usage_table");

    let message = b"release pst-release".to_vec();
    let mut signature = hmac_sha256(&server_key, &message);
    signature[0] ^= 1;
    assert_eq!(
        session.release_usage_information(&message, &signature, b"pst-release"),
        Err(Error::Unknown(CallSite::ReleaseUsageInformation))
    );
    assert!(fixture.engine.has_usage_record(b"pst-release"));

    let signature = hmac_sha256(&server_key, &message);
    session
        .release_usage_information(&message, &signature, b"pst-release")
        .expect("release");
    assert!(!fixture.engine.has_usage_record(b"pst-release"));
    assert_eq!(fixture.engine.call_count("delete_usage_entry"), 2);
    assert_eq!(fixture.engine.call_count("update_usage_table"), updates + 1);
}

#[test]
fn delete_multiple_attempts_every_token() {
    let fixture = Fixture::new(SoftwareEngineConfig {
        api_version: 12,
        ..SoftwareEngineConfig::default()
    });
    let session = fixture.open_session();
    for pst in [b"pst-a".as_slice(), b"pst-b"] {
        let license = fixture
            .license_for(&session)
            .content_key(CONTENT_KEY_ID, CONTENT_KEY, CipherMode::Ctr)
            .provider_session_token(pst)
            .build();
        session
            .load_keys(&license.license_keys(), LicenseType::Content)
            .expect("load keys");
    }
    let updates = fixture.engine.call_count("update_usage_table");

    assert_eq!(
        session.delete_multiple_usage_information(&[b"pst-a".as_slice(), b"pst-missing", b"pst-b"]),
        Err(Error::Unknown(CallSite::DeleteMultipleUsageInformation))
    );
    assert_eq!(fixture.engine.call_count("force_delete_usage_entry"), 3);
    assert!(!fixture.engine.has_usage_record(b"pst-a"));
    assert!(!fixture.engine.has_usage_record(b"pst-b"));
    assert_eq!(fixture.engine.call_count("update_usage_table"), updates + 1);

    let none: [&[u8]; 0] = [];
    session.delete_multiple_usage_information(&none).expect("nothing to delete");
}
