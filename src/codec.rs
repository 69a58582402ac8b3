//! Key derivation contexts and message-range encoding.
//!
//! The engine receives license fields as (offset, length) ranges into the
//! signed license message rather than as copies. [`MessageRange`] ties such
//! a range to the buffer it was validated against.

use crate::oemcrypto::{EntitledContentKeyObject, Substring, AES_BLOCK_SIZE, CONTENT_KEY_SIZE, MAC_KEY_SIZE};

/// Label prefix of the MAC key derivation context.
pub const AUTHENTICATION_LABEL: &[u8] = b"AUTHENTICATION";
/// Label prefix of the encryption key derivation context.
pub const ENCRYPTION_LABEL: &[u8] = b"ENCRYPTION";

/// Build `(mac_context, enc_context)` for a license request message.
///
/// The MAC context requests two MAC keys (server and client), so its length
/// suffix is twice the MAC key size in bits.
#[must_use]
pub fn derive_contexts(message: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (
        context(AUTHENTICATION_LABEL, message, (MAC_KEY_SIZE * 8 * 2) as u32),
        context(ENCRYPTION_LABEL, message, (CONTENT_KEY_SIZE * 8) as u32),
    )
}

fn context(label: &[u8], message: &[u8], key_bits: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(label.len() + 1 + message.len() + 4);
    out.extend_from_slice(label);
    out.push(0);
    out.extend_from_slice(message);
    out.extend_from_slice(&key_bits.to_be_bytes());
    out
}

/// A validated range inside a borrowed message.
#[derive(Debug, Clone, Copy)]
pub struct MessageRange<'a> {
    message: &'a [u8],
    range: Substring,
}

impl<'a> MessageRange<'a> {
    /// Validate `range` against `message`.
    #[must_use]
    pub fn new(message: &'a [u8], range: Substring) -> Option<Self> {
        range.slice(message)?;
        Some(Self { message, range })
    }

    /// Range of the first occurrence of `field` in `message`.
    ///
    /// Empty fields, empty messages and `set_zero` all produce the "not
    /// present" range. A field that does not occur is logged and also
    /// reported as not present.
    #[must_use]
    pub fn locate(message: &'a [u8], field: &[u8], set_zero: bool) -> Self {
        let absent = Self {
            message,
            range: Substring::default(),
        };
        if set_zero || field.is_empty() || message.is_empty() {
            return absent;
        }
        match find(message, field) {
            Some(offset) => Self {
                message,
                range: Substring {
                    offset,
                    length: field.len(),
                },
            },
            None => {
                warn!("field ({} bytes) not found in message ({} bytes)", field.len(), message.len());
                absent
            }
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        // Validated at construction; the default range is always in bounds.
        self.range.slice(self.message).unwrap_or_default()
    }

    /// The raw range handed to the engine.
    #[must_use]
    pub fn raw(&self) -> Substring {
        self.range
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Concatenate the fields of one entitled content key into a fresh message
/// and describe them with ranges into it.
#[must_use]
pub fn entitled_key_message(
    entitlement_key_id: &[u8],
    content_key_id: &[u8],
    content_key_data_iv: &[u8],
    content_key_data: &[u8],
) -> (Vec<u8>, EntitledContentKeyObject) {
    let mut message = Vec::with_capacity(
        entitlement_key_id.len() + content_key_id.len() + content_key_data_iv.len() + content_key_data.len(),
    );
    let mut push = |field: &[u8]| {
        let range = Substring {
            offset: message.len(),
            length: field.len(),
        };
        message.extend_from_slice(field);
        range
    };
    let object = EntitledContentKeyObject {
        entitlement_key_id: push(entitlement_key_id),
        content_key_id: push(content_key_id),
        content_key_data_iv: push(content_key_data_iv),
        content_key_data: push(content_key_data),
    };
    (message, object)
}

/// Add `blocks` to the trailing 64-bit big-endian counter of an AES-CTR IV.
pub fn increment_iv(iv: &mut [u8; AES_BLOCK_SIZE], blocks: u64) {
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&iv[8..]);
    let next = u64::from_be_bytes(counter).wrapping_add(blocks);
    iv[8..].copy_from_slice(&next.to_be_bytes());
}
