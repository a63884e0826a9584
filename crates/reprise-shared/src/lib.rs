//! # reprise-shared
//!
//! Domain types shared by the store and the bot: filters, media
//! descriptors, identifiers, validation errors and the confirmation token
//! codec.

pub mod constants;
pub mod error;
pub mod filter;
pub mod token;
pub mod types;

pub use error::{TokenError, ValidationError};
pub use filter::{validate_keyword, Filter, MediaDescriptor, MediaKind};
pub use token::{DeleteAction, DeleteToken, KeywordRef};
pub use types::{ChatId, ChatKind, MessageId, PrincipalId, TextEntity};
