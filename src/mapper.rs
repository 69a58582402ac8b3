//! Mapping from engine result codes to CDM errors.
//!
//! A few codes map the same way everywhere ([`map_oemcrypto_result`]); the
//! rest depend on the operation that produced them. Every failure is logged
//! with its call site before it is mapped.

use crate::error::{CallSite, Error, Result};
use crate::oemcrypto::{OecResult, OemCryptoError};

/// Map an engine result using only the call-site-invariant rules.
///
/// Codes without a universal mapping become [`Error::Failed`] for `site`.
pub fn map_oemcrypto_result(result: OecResult<()>, site: CallSite) -> Result<()> {
    result.map_err(|code| map_error(code, site))
}

/// Map a single engine failure using the call-site-invariant rules.
pub fn map_error(code: OemCryptoError, site: CallSite) -> Error {
    oec_failure!(error, site, code);
    universal(code, site)
}

fn universal(code: OemCryptoError, site: CallSite) -> Error {
    match code {
        OemCryptoError::NotImplemented => Error::NotImplemented,
        OemCryptoError::TooManySessions => Error::InsufficientCryptoResources(site),
        OemCryptoError::SessionLostState => Error::SessionLostState,
        OemCryptoError::SystemInvalidated => Error::SystemInvalidated,
        code => Error::Failed { site, code },
    }
}

pub(crate) fn load_keys_error(code: OemCryptoError) -> Error {
    let site = CallSite::LoadKeys;
    oec_failure!(error, site, code);
    match code {
        OemCryptoError::TooManyKeys => Error::InsufficientCryptoResources(site),
        OemCryptoError::UsageTableUnrecoverable => Error::NeedProvisioning,
        code => universal(code, site),
    }
}

pub(crate) fn load_entitled_content_keys_error(code: OemCryptoError) -> Error {
    let site = CallSite::LoadEntitledContentKeys;
    oec_failure!(error, site, code);
    match code {
        OemCryptoError::InsufficientResources => Error::InsufficientCryptoResources(site),
        OemCryptoError::InvalidContext => Error::NotAnEntitlementSession,
        OemCryptoError::KeyNotEntitled => Error::NoMatchingEntitlementKey,
        code => universal(code, site),
    }
}

pub(crate) fn select_key_error(code: OemCryptoError) -> Error {
    let site = CallSite::SelectKey;
    oec_failure!(error, site, code);
    match code {
        OemCryptoError::KeyExpired => Error::NeedKey,
        OemCryptoError::InsufficientHdcp => Error::InsufficientOutputProtection,
        OemCryptoError::AnalogOutput => Error::AnalogOutput,
        OemCryptoError::InvalidSession => Error::SessionNotFound(site),
        OemCryptoError::NoDeviceKey => Error::NoDeviceKey(site),
        OemCryptoError::NoContentKey | OemCryptoError::KeyNotLoaded => Error::NoContentKey(site),
        OemCryptoError::InsufficientResources => Error::InsufficientCryptoResources(site),
        code => universal(code, site),
    }
}

pub(crate) fn decrypt_error(code: OemCryptoError, site: CallSite) -> Error {
    oec_failure!(error, site, code);
    match code {
        OemCryptoError::InsufficientResources => Error::InsufficientCryptoResources(site),
        OemCryptoError::KeyExpired => Error::NeedKey,
        OemCryptoError::InvalidSession => Error::SessionNotFound(site),
        OemCryptoError::DecryptFailed | OemCryptoError::UnknownFailure => Error::DecryptError,
        OemCryptoError::InsufficientHdcp => Error::InsufficientOutputProtection,
        OemCryptoError::AnalogOutput => Error::AnalogOutput,
        OemCryptoError::OutputTooLarge => Error::OutputTooLarge,
        code => universal(code, site),
    }
}

/// Generic encrypt/decrypt/sign/verify share one table, keyed by call site.
pub(crate) fn generic_error(code: OemCryptoError, site: CallSite) -> Error {
    oec_failure!(error, site, code);
    match code {
        OemCryptoError::KeyExpired => Error::NeedKey,
        OemCryptoError::NoContentKey | OemCryptoError::KeyNotLoaded => Error::KeyNotFound(site),
        OemCryptoError::OutputTooLarge => Error::OutputTooLarge,
        OemCryptoError::InsufficientResources => Error::InsufficientCryptoResources(site),
        code => universal(code, site),
    }
}

pub(crate) fn usage_error(code: OemCryptoError, site: CallSite) -> Error {
    oec_failure!(error, site, code);
    match code {
        OemCryptoError::InsufficientResources => Error::InsufficientCryptoResources(site),
        OemCryptoError::GenerationSkew => Error::GenerationSkew(site),
        OemCryptoError::SignatureFailure => Error::SignatureFailure(site),
        OemCryptoError::BadMagic => Error::BadMagic(site),
        OemCryptoError::UsageTableUnrecoverable => Error::NeedProvisioning,
        code => universal(code, site),
    }
}
