//! wvcrypto - Widevine CDM crypto session layer.
//!
//! This crate provides:
//! - The OEMCrypto engine boundary as a trait, with result codes and buffer
//!   descriptors.
//! - Crypto sessions: engine initialization refcounting, session lifecycle,
//!   key loading, key selection, chunked decryption and generic crypto.
//! - Content and entitlement key sessions.
//! - Engine result code mapping per call site.
//! - Shared usage table headers for per-entry usage support.
//! - A software engine for tests and tooling.
//!
//! Feature flags:
//! - `cli`: enable the CLI binary.
//! - `chrono`: use chrono for date handling in CLI.
//! - `tracing`: enable tracing macros.
//! - `log`: forward tracing events to the `log` crate.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Key derivation contexts and message-range encoding.
pub mod codec;
/// Process-scoped engine state shared by sessions.
pub mod context;
/// Crypto session lifecycle and operations.
pub mod crypto_session;
/// Common error types and Result alias.
pub mod error;
/// Key descriptors from licenses.
pub mod key;
/// Content and entitlement key sessions.
pub mod key_session;
/// Engine result code mapping.
pub mod mapper;
/// Engine boundary.
pub mod oemcrypto;
/// Process configuration.
pub mod properties;
/// In-process software engine.
pub mod software;
/// System id extraction from pre-provisioning tokens.
pub mod system_id;
/// Usage table header bookkeeping.
pub mod usage_table;

pub use context::CryptoContext;
pub use crypto_session::{CryptoSession, DecryptionParams, OutputBuffer};
pub use error::{CallSite, Error, Result};
pub use oemcrypto::{OemCrypto, OemCryptoError};
pub use properties::Properties;
