//! CDM response taxonomy for wvcrypto.
//!
//! Engine result codes are mapped onto these kinds by [`crate::mapper`].
//! Where the same kind can be produced by several operations, the variant
//! carries a [`CallSite`] so failures stay distinguishable in logs and tests.

use std::fmt;

use thiserror::Error;

use crate::oemcrypto::OemCryptoError;

/// Operation that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSite {
    Open,
    Close,
    GetProvisioningMethod,
    GetTokenFromKeybox,
    GetTokenFromOemCert,
    GetDeviceId,
    GetSystemId,
    GetRandom,
    GenerateNonce,
    GenerateDerivedKeys,
    GenerateSignature,
    GenerateRsaSignature,
    LoadKeys,
    LoadEntitledContentKeys,
    LoadCertificatePrivateKey,
    RefreshKeys,
    RewrapDeviceRsaKey,
    RewrapDeviceRsaKey30,
    SelectKey,
    Decrypt,
    CopyBuffer,
    GenericEncrypt,
    GenericDecrypt,
    GenericSign,
    GenericVerify,
    LoadSrm,
    GetHdcpCapabilities,
    GetNumberOfOpenSessions,
    GetMaxNumberOfSessions,
    GetSrmVersion,
    UpdateUsageInformation,
    DeactivateUsageInformation,
    GenerateUsageReport,
    ReleaseUsageInformation,
    DeleteUsageInformation,
    DeleteMultipleUsageInformation,
    DeleteAllUsageReports,
    CreateUsageTableHeader,
    LoadUsageTableHeader,
    CreateUsageEntry,
    LoadUsageEntry,
    UpdateUsageEntry,
    ShrinkUsageTableHeader,
    MoveUsageEntry,
    CopyOldUsageEntry,
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Main error type for CDM crypto session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Input validation failed before the engine was called.
    #[error("{0}: invalid parameters")]
    InvalidParameters(CallSite),

    /// The engine was never successfully initialized.
    #[error("crypto session not initialized")]
    NotInitialized,

    /// The session is not open.
    #[error("crypto session not open")]
    NotOpen,

    #[error("engine entry point not implemented")]
    NotImplemented,

    /// Too many sessions or keys; retry after releasing resources.
    #[error("{0}: insufficient crypto resources")]
    InsufficientCryptoResources(CallSite),

    /// The engine lost the state of this session.
    #[error("engine session lost state")]
    SessionLostState,

    /// The engine lost durable state or detected tampering.
    #[error("engine system invalidated")]
    SystemInvalidated,

    /// Usage table is unrecoverable; the device must be provisioned again.
    #[error("device needs provisioning")]
    NeedProvisioning,

    #[error("engine reported a provisioning error")]
    GetProvisioningMethod,

    #[error("keybox token too short ({0} bytes)")]
    KeyboxTokenTooShort(usize),

    #[error("could not extract system id from OEM certificate")]
    ExtractSystemIdFromOemCert,

    #[error("unsupported client token type")]
    UnknownClientTokenType,

    #[error("failed to load system id: {0}")]
    LoadSystemId(Box<Error>),

    #[error("could not query engine API version for usage support")]
    UsageSupportGetApiFailed,

    #[error("usage information support failed")]
    UsageInformationSupportFailed,

    /// A key is required (expired or not yet usable).
    #[error("need key")]
    NeedKey,

    #[error("{0}: key not found")]
    KeyNotFound(CallSite),

    #[error("{0}: no content key")]
    NoContentKey(CallSite),

    #[error("session does not hold entitlement keys")]
    NotAnEntitlementSession,

    #[error("no matching entitlement key")]
    NoMatchingEntitlementKey,

    #[error("insufficient output protection")]
    InsufficientOutputProtection,

    #[error("analog output not allowed")]
    AnalogOutput,

    #[error("{0}: invalid engine session")]
    SessionNotFound(CallSite),

    #[error("{0}: no device key")]
    NoDeviceKey(CallSite),

    #[error("output too large")]
    OutputTooLarge,

    #[error("secure buffer required")]
    SecureBufferRequired,

    /// The engine cannot switch cipher mode within a session.
    #[error("incorrect crypto mode")]
    IncorrectCryptoMode,

    #[error("decrypt error")]
    DecryptError,

    #[error("{0}: signature failure")]
    SignatureFailure(CallSite),

    #[error("{0}: generation skew")]
    GenerationSkew(CallSite),

    #[error("{0}: bad magic")]
    BadMagic(CallSite),

    #[error("invalid SRM list")]
    InvalidSrmList,

    /// The usage entry was already deactivated.
    #[error("key canceled")]
    KeyCanceled,

    #[error("usage entry {0} is not in the usage table")]
    InvalidUsageEntry(u32),

    #[error("usage table store failure: {0}")]
    UsageTableStore(String),

    /// Unmapped engine failure at the given call site.
    #[error("{site} failed: {code}")]
    Failed { site: CallSite, code: OemCryptoError },

    /// Failure with no engine code attached.
    #[error("{0}: unknown error")]
    Unknown(CallSite),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("RSA key error: {0}")]
    RsaKey(String),
}

impl From<rsa::Error> for Error {
    fn from(err: rsa::Error) -> Self {
        Error::RsaKey(err.to_string())
    }
}

impl From<rsa::pkcs8::Error> for Error {
    fn from(err: rsa::pkcs8::Error) -> Self {
        Error::RsaKey(err.to_string())
    }
}

impl Error {
    /// The engine lost state; a plain retry on this session will not help.
    #[must_use]
    pub fn requires_reprovisioning(&self) -> bool {
        matches!(
            self,
            Error::SessionLostState | Error::SystemInvalidated | Error::NeedProvisioning
        )
    }

    /// Retryable after other sessions or keys are released.
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Error::InsufficientCryptoResources(_))
    }
}

/// Result type alias for wvcrypto operations.
pub type Result<T> = std::result::Result<T, Error>;
