use thiserror::Error;

use crate::constants::{KEYWORD_MAX_LEN, KEYWORD_MIN_LEN};

/// Input rejected before any state is touched. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Keyword must be at least {KEYWORD_MIN_LEN} characters")]
    KeywordTooShort,

    #[error("Keyword must be at most {KEYWORD_MAX_LEN} characters")]
    KeywordTooLong,

    #[error("A filter needs text or at least one media attachment")]
    EmptyContent,

    #[error("File extension {0:?} is not allowed")]
    DisallowedExtension(String),

    #[error("Filter references unknown media {0}")]
    UnknownMedia(uuid::Uuid),
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Invalid token format")]
    InvalidFormat,

    #[error("Base64 decode error")]
    Base64Decode,
}
