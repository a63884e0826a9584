//! Filter and media descriptor models.
//!
//! A [`Filter`] is the replayable bundle stored under a keyword. Its media
//! list holds only identifiers; the descriptors they point at live in the
//! store's media table so the garbage collector can reason about
//! reachability.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{KEYWORD_MAX_LEN, KEYWORD_MIN_LEN};
use crate::error::ValidationError;
use crate::types::{PrincipalId, TextEntity};

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    /// Formatted text, possibly empty when media is present.
    #[serde(default)]
    pub text: String,
    /// Format spans over `text`.
    #[serde(default)]
    pub entities: Vec<TextEntity>,
    /// Ordered media references.
    #[serde(default)]
    pub media: Vec<Uuid>,
    /// Principal that last wrote this filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<PrincipalId>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Filter {
    /// Build a filter, enforcing that it carries text or media.
    pub fn new(
        text: String,
        entities: Vec<TextEntity>,
        media: Vec<Uuid>,
        created_by: Option<PrincipalId>,
    ) -> Result<Self, ValidationError> {
        let filter = Self {
            text,
            entities,
            media,
            created_by,
            updated_at: Utc::now(),
        };
        filter.validate()?;
        Ok(filter)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.text.is_empty() && self.media.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        Ok(())
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }
}

/// Check keyword length bounds (characters, not bytes).
pub fn validate_keyword(keyword: &str) -> Result<(), ValidationError> {
    let len = keyword.chars().count();
    if len < KEYWORD_MIN_LEN {
        return Err(ValidationError::KeywordTooShort);
    }
    if len > KEYWORD_MAX_LEN {
        return Err(ValidationError::KeywordTooLong);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Media kind with the attributes meaningful to each kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MediaKind {
    Photo {
        width: Option<u32>,
        height: Option<u32>,
    },
    Video {
        duration: Option<u32>,
        width: Option<u32>,
        height: Option<u32>,
    },
    Animation {
        duration: Option<u32>,
        width: Option<u32>,
        height: Option<u32>,
    },
    Voice {
        duration: Option<u32>,
    },
    Audio {
        duration: Option<u32>,
        title: Option<String>,
    },
    Document,
}

impl MediaKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Photo { .. } => "photo",
            Self::Video { .. } => "video",
            Self::Animation { .. } => "animation",
            Self::Voice { .. } => "voice",
            Self::Audio { .. } => "audio",
            Self::Document => "document",
        }
    }

    pub fn duration(&self) -> Option<u32> {
        match self {
            Self::Video { duration, .. }
            | Self::Animation { duration, .. }
            | Self::Voice { duration }
            | Self::Audio { duration, .. } => *duration,
            Self::Photo { .. } | Self::Document => None,
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            Self::Photo { width, height }
            | Self::Video { width, height, .. }
            | Self::Animation { width, height, .. } => width.zip(*height),
            Self::Voice { .. } | Self::Audio { .. } | Self::Document => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata and local location of one downloaded attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaDescriptor {
    /// Minted at download time; also the stem of `file_name`.
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: MediaKind,
    /// Remote reference the file was fetched from.
    pub source: String,
    pub local_path: PathBuf,
    /// Stored name, `<id><extension>`.
    pub file_name: String,
    /// Name shown to recipients.
    pub original_name: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub created_at: DateTime<Utc>,
}
