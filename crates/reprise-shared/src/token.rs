//! Callback payloads for the delete-confirmation prompt.
//!
//! The payload carries the keyword and the id of the request message as a
//! structured value, so a keyword containing underscores, digits or any
//! other separator-looking character decodes back exactly. Long keywords
//! travel as a prefix plus a digest so every token fits in
//! [`CALLBACK_DATA_MAX`] bytes.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::constants::CALLBACK_DATA_MAX;
use crate::error::TokenError;
use crate::types::MessageId;

/// Keywords up to this many bytes are carried verbatim.
const EXACT_MAX_BYTES: usize = 32;
/// Bytes of a long keyword kept in readable form.
const PREFIX_MAX_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeleteAction {
    Confirm,
    Cancel,
}

/// Identifies the keyword a prompt is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeywordRef {
    Exact(String),
    Hashed { prefix: String, digest: [u8; 8] },
}

impl KeywordRef {
    pub fn for_keyword(keyword: &str) -> Self {
        if keyword.len() <= EXACT_MAX_BYTES {
            return Self::Exact(keyword.to_string());
        }
        let mut cut = PREFIX_MAX_BYTES;
        while !keyword.is_char_boundary(cut) {
            cut -= 1;
        }
        Self::Hashed {
            prefix: keyword[..cut].to_string(),
            digest: digest(keyword),
        }
    }

    pub fn matches(&self, keyword: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == keyword,
            Self::Hashed { prefix, digest: d } => {
                keyword.len() > EXACT_MAX_BYTES
                    && keyword.starts_with(prefix.as_str())
                    && digest(keyword) == *d
            }
        }
    }

    /// The keyword, when carried verbatim.
    pub fn exact(&self) -> Option<&str> {
        match self {
            Self::Exact(exact) => Some(exact),
            Self::Hashed { .. } => None,
        }
    }
}

impl std::fmt::Display for KeywordRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(exact),
            Self::Hashed { prefix, .. } => write!(f, "{prefix}…"),
        }
    }
}

fn digest(keyword: &str) -> [u8; 8] {
    let hash = blake3::hash(keyword.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash.as_bytes()[..8]);
    out
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteToken {
    pub action: DeleteAction,
    pub keyword: KeywordRef,
    pub request_message_id: MessageId,
}

impl DeleteToken {
    pub fn new(action: DeleteAction, keyword: &str, request_message_id: MessageId) -> Self {
        Self {
            action,
            keyword: KeywordRef::for_keyword(keyword),
            request_message_id,
        }
    }

    /// Encode the token as a base64url string of at most
    /// [`CALLBACK_DATA_MAX`] bytes.
    pub fn encode(&self) -> String {
        // Serializing a struct of plain fields into a Vec cannot fail.
        let bytes = codec().serialize(self).unwrap_or_default();
        let code = base64_url_encode(&bytes);
        debug_assert!(code.len() <= CALLBACK_DATA_MAX);
        code
    }

    /// Decode a base64url string back into a token.
    pub fn decode(code: &str) -> Result<Self, TokenError> {
        let bytes = base64_url_decode(code)?;
        codec()
            .deserialize(&bytes)
            .map_err(|_| TokenError::InvalidFormat)
    }
}

/// Varint lengths and integers; trailing bytes are rejected.
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(data)
}

fn base64_url_decode(s: &str) -> Result<Vec<u8>, TokenError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD
        .decode(s.trim())
        .map_err(|_| TokenError::Base64Decode)
}
