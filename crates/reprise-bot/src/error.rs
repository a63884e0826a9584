use thiserror::Error;

use reprise_shared::{TokenError, ValidationError};
use reprise_store::StoreError;

use crate::admins::AdminError;
use crate::fetcher::DownloadError;
use crate::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error("Invalid button: {0}")]
    Token(#[from] TokenError),

    #[error("{0}")]
    Usage(String),

    #[error("Media download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

impl BotError {
    /// The request itself was bad, as opposed to an internal failure.
    pub fn is_user_error(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Admin(_) | Self::Token(_) | Self::Usage(_) => true,
            Self::Download(e) => e.is_validation(),
            Self::Store(StoreError::Validation(_)) => true,
            Self::Store(_) | Self::Gateway(_) => false,
        }
    }

    /// Text shown to the requester.
    pub fn user_message(&self) -> String {
        if self.is_user_error() {
            match self {
                Self::Store(StoreError::Validation(e)) => format!("❌ {e}"),
                other => format!("❌ {other}"),
            }
        } else {
            "⚠️ Something went wrong on our side. Please try again later.".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_and_internal_errors_are_distinguished() {
        let invalid: BotError = ValidationError::KeywordTooShort.into();
        assert!(invalid.is_user_error());
        assert_eq!(invalid.user_message(), "❌ Keyword must be at least 2 characters");

        let too_big: BotError = DownloadError::TooLarge { size: 30, max: 20 }.into();
        assert!(too_big.is_user_error());

        let flaky: BotError = DownloadError::Timeout.into();
        assert!(!flaky.is_user_error());

        let disk: BotError = StoreError::Restore("disk full".into()).into();
        assert!(!disk.is_user_error());
        assert!(!disk.user_message().contains("disk full"));
    }
}
