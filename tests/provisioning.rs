mod common;

use common::{device_rsa_key, oem_cert_config, oem_rsa_key, Fixture};
use rsa::Pss;
use sha1::{Digest, Sha1};
use test_log::test;
use wvcrypto::crypto_session::ClientTokenType;
use wvcrypto::oemcrypto::ProvisioningMethod;
use wvcrypto::software::{ProvisioningResponse, SoftwareEngineConfig};
use wvcrypto::{CallSite, CryptoSession, Error, OemCryptoError};

fn rewrap(session: &CryptoSession, response: &ProvisioningResponse) -> wvcrypto::Result<Vec<u8>> {
    session.rewrap_certificate(
        &response.message,
        &response.signature,
        &response.nonce,
        &response.enc_rsa_key,
        &response.enc_rsa_key_iv,
        &response.wrapping_key,
    )
}

/// Load `wrapped` in a new session and check it signs with the device key.
fn assert_signs_with_device_key(fixture: &Fixture, wrapped: &[u8]) {
    let session = fixture.open_session();
    session.load_certificate_private_key(wrapped).expect("load rewrapped key");
    let request = b"license request".to_vec();
    let signature = session.prepare_request(&request, false).expect("sign license request");
    device_rsa_key()
        .to_public_key()
        .verify(Pss::new::<Sha1>(), &Sha1::digest(&request), &signature)
        .expect("PSS signature");
}

#[test]
fn keybox_device_rewraps_provisioned_key() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    let request = b"provisioning request".to_vec();
    session.prepare_request(&request, true).expect("sign provisioning request");
    let nonce = session.generate_nonce().expect("nonce");

    let response = ProvisioningResponse::for_keybox(&fixture.engine.config().device_key, &request, nonce, &device_rsa_key())
        .expect("provisioning response");
    let wrapped = rewrap(&session, &response).expect("rewrap");
    // Size query, then the rewrap itself.
    assert_eq!(fixture.engine.call_count("rewrap_device_rsa_key"), 2);
    assert_eq!(fixture.engine.call_count("rewrap_device_rsa_key_30"), 0);

    // The nonce is spent.
    assert_eq!(
        rewrap(&session, &response),
        Err(Error::Failed {
            site: CallSite::RewrapDeviceRsaKey,
            code: OemCryptoError::InvalidNonce
        })
    );

    assert_signs_with_device_key(&fixture, &wrapped);
}

#[test]
fn keybox_rewrap_rejects_bad_signature_and_unknown_nonce() {
    let fixture = Fixture::new(SoftwareEngineConfig::default());
    let session = fixture.open_session();
    let request = b"provisioning request".to_vec();
    session.prepare_request(&request, true).expect("sign provisioning request");
    let nonce = session.generate_nonce().expect("nonce");
    let device_key = fixture.engine.config().device_key.clone();

    let stranger = ProvisioningResponse::for_keybox(&device_key, &request, nonce.wrapping_add(1), &device_rsa_key())
        .expect("provisioning response");
    assert_eq!(
        rewrap(&session, &stranger),
        Err(Error::Failed {
            site: CallSite::RewrapDeviceRsaKey,
            code: OemCryptoError::InvalidNonce
        })
    );

    let mut tampered =
        ProvisioningResponse::for_keybox(&device_key, &request, nonce, &device_rsa_key()).expect("provisioning response");
    tampered.signature[0] ^= 0x01;
    assert_eq!(
        rewrap(&session, &tampered),
        Err(Error::Failed {
            site: CallSite::RewrapDeviceRsaKey,
            code: OemCryptoError::SignatureFailure
        })
    );

    // Failed attempts leave the nonce usable.
    tampered.signature[0] ^= 0x01;
    rewrap(&session, &tampered).expect("rewrap");
}

#[test]
fn oem_cert_device_rewraps_provisioned_key() {
    let fixture = Fixture::new(oem_cert_config());
    let session = fixture.open_session();
    assert_eq!(session.pre_provision_token_type(), ClientTokenType::OemCert);
    assert_eq!(session.system_id(), Some(4445));

    // Before provisioning, requests are signed with the OEM certificate key.
    let request = b"provisioning request".to_vec();
    let signature = session.prepare_request(&request, true).expect("sign provisioning request");
    oem_rsa_key()
        .to_public_key()
        .verify(Pss::new::<Sha1>(), &Sha1::digest(&request), &signature)
        .expect("PSS signature");
    assert_eq!(fixture.engine.call_count("generate_derived_keys"), 0);

    let nonce = session.generate_nonce().expect("nonce");
    let response = ProvisioningResponse::for_oem_certificate(&oem_rsa_key().to_public_key(), nonce, &device_rsa_key())
        .expect("provisioning response");
    let wrapped = rewrap(&session, &response).expect("rewrap");
    assert_eq!(fixture.engine.call_count("rewrap_device_rsa_key_30"), 2);
    assert_eq!(fixture.engine.call_count("rewrap_device_rsa_key"), 0);

    assert_signs_with_device_key(&fixture, &wrapped);
}

#[test]
fn drm_cert_device_cannot_rewrap() {
    let fixture = Fixture::new(SoftwareEngineConfig {
        provisioning_method: ProvisioningMethod::DrmCertificate,
        ..SoftwareEngineConfig::default()
    });
    let session = fixture.open_session();
    assert_eq!(session.pre_provision_token_type(), ClientTokenType::DrmCert);

    let response = ProvisioningResponse {
        message: vec![0xab; 64],
        ..ProvisioningResponse::default()
    };
    assert_eq!(rewrap(&session, &response), Err(Error::UnknownClientTokenType));
    assert_eq!(fixture.engine.call_count("rewrap_device_rsa_key"), 0);
    assert_eq!(fixture.engine.call_count("rewrap_device_rsa_key_30"), 0);
}
