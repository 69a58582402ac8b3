//! System id extraction from pre-provisioning tokens.

use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use x509_cert::ext::Extension;

use crate::error::{Error, Result};

/// X.509 extension carrying the Widevine system id.
pub const WIDEVINE_SYSTEM_ID_EXTENSION_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.11129.4.1.1");

/// Position of the device's intermediate certificate in the OEM chain.
const OEM_CERT_INDEX: usize = 1;

/// Read the system id from a keybox token: a big-endian `u32` at offset 4.
pub fn system_id_from_keybox_token(token: &[u8]) -> Result<u32> {
    let Some(field) = token.get(4..8) else {
        error!("keybox token too small: {}", token.len());
        return Err(Error::KeyboxTokenTooShort(token.len()));
    };
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(field);
    Ok(u32::from_be_bytes(bytes))
}

/// Read the system id extension from a PKCS#7 OEM certificate chain.
pub fn system_id_from_oem_cert(oem_cert: &[u8]) -> Result<u32> {
    extract_system_id(oem_cert).ok_or_else(|| {
        error!("could not extract system id from OEM certificate ({} bytes)", oem_cert.len());
        Error::ExtractSystemIdFromOemCert
    })
}

fn extract_system_id(oem_cert: &[u8]) -> Option<u32> {
    let content_info = ContentInfo::from_der(oem_cert).ok()?;
    let signed_data = SignedData::from_der(&content_info.content.to_der().ok()?).ok()?;
    let certificates = signed_data.certificates?;
    let certificate = match certificates.0.iter().nth(OEM_CERT_INDEX)? {
        CertificateChoices::Certificate(certificate) => certificate,
        _ => return None,
    };
    let extension = certificate
        .tbs_certificate
        .extensions
        .as_ref()?
        .iter()
        .find(|extension: &&Extension| extension.extn_id == WIDEVINE_SYSTEM_ID_EXTENSION_OID)?;
    u32::from_der(extension.extn_value.as_bytes()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keybox_system_id_is_big_endian_at_offset_four() {
        let token = [0, 0, 0, 2, 0x00, 0x00, 0x1f, 0x40, 0xff];
        assert_eq!(system_id_from_keybox_token(&token), Ok(8000));
    }

    #[test]
    fn short_keybox_token_is_rejected() {
        assert_eq!(
            system_id_from_keybox_token(&[0, 0, 0, 2, 0, 0, 0]),
            Err(Error::KeyboxTokenTooShort(7))
        );
        assert_eq!(system_id_from_keybox_token(&[]), Err(Error::KeyboxTokenTooShort(0)));
    }

    #[test]
    fn malformed_oem_cert_is_rejected() {
        assert_eq!(
            system_id_from_oem_cert(b"not a certificate chain"),
            Err(Error::ExtractSystemIdFromOemCert)
        );
        assert_eq!(system_id_from_oem_cert(&[]), Err(Error::ExtractSystemIdFromOemCert));
    }
}
