use std::sync::Arc;

use wvcrypto::oemcrypto::{CipherMode, LicenseType, PatternDesc, SecurityLevel};
use wvcrypto::software::{self, LicenseBuilder, SoftwareEngine, SoftwareEngineConfig};
use wvcrypto::{CryptoContext, CryptoSession, DecryptionParams, Properties};

fn main() -> anyhow::Result<()> {
    let config = SoftwareEngineConfig::default();
    let device_key = config.device_key.clone();
    let engine = Arc::new(SoftwareEngine::from_config(config)?);
    let context = CryptoContext::new(engine, Properties::default());

    let mut session = CryptoSession::new(context);
    session.open(SecurityLevel::Default)?;
    println!("request_id: {}", session.request_id());

    let request = format!("demo-request-{}", session.request_id()).into_bytes();
    session.generate_derived_keys(&request)?;

    let entitlement_key = [0x5au8; 32];
    let license = LicenseBuilder::new(&device_key, &request)?
        .entitlement_key(b"entitlement", entitlement_key)
        .build();
    session.load_keys(&license.license_keys(), LicenseType::Entitlement)?;
    println!("key_session: {:?}", session.key_session_type());

    let content_key = [0xa5u8; 16];
    let entitled = software::entitled_content_key(b"entitlement", &entitlement_key, b"content", &content_key, CipherMode::Ctr);
    session.load_entitled_content_keys(&[entitled])?;

    let iv = [0u8; 16];
    let plaintext = b"entitled content, decrypted through the session layer".to_vec();
    let ciphertext = software::cenc_ctr(&content_key, &iv, 0, &plaintext, &PatternDesc::default())?;

    let mut output = vec![0u8; ciphertext.len()];
    let mut params = DecryptionParams::new(b"content", &ciphertext, iv, &mut output);
    session.decrypt(&mut params)?;
    println!("decrypted: {}", String::from_utf8_lossy(&output));

    session.close()?;
    Ok(())
}
