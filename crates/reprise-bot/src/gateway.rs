//! Messaging gateway contract.
//!
//! The bot core never talks to a chat platform directly. Inbound updates
//! arrive as [`InboundEvent`]s and every outbound action goes through a
//! [`MessagingGateway`]. [`JsonLinesGateway`] is a development transport
//! that reads events from stdin and writes calls to stdout, one JSON
//! object per line.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

use reprise_shared::{ChatId, ChatKind, MediaKind, MessageId, PrincipalId, TextEntity};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(IncomingMessage),
    Callback(CallbackQuery),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingMessage {
    pub principal: PrincipalId,
    pub chat: ChatId,
    pub chat_kind: ChatKind,
    pub message_id: MessageId,
    #[serde(default)]
    pub text: String,
    /// The message this one replies to.
    #[serde(default)]
    pub reply_to: Option<ReplyPayload>,
}

/// Content of a replied-to message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplyPayload {
    /// Text or caption.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub entities: Vec<TextEntity>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    #[serde(flatten)]
    pub kind: MediaKind,
    /// Platform file reference, resolved through [`MessagingGateway::file_url`].
    pub source: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A button press on a message the bot sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackQuery {
    pub principal: PrincipalId,
    pub chat: ChatId,
    pub chat_kind: ChatKind,
    /// The bot message carrying the button.
    pub message_id: MessageId,
    pub data: String,
}

impl InboundEvent {
    pub fn principal(&self) -> PrincipalId {
        match self {
            Self::Message(m) => m.principal,
            Self::Callback(c) => c.principal,
        }
    }

    pub fn chat(&self) -> ChatId {
        match self {
            Self::Message(m) => m.chat,
            Self::Callback(c) => c.chat,
        }
    }
}

/// Parse one line of inbound JSON. Blank and malformed lines yield `None`.
pub fn parse_event_line(line: &str) -> Option<InboundEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed inbound event");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    /// Returned verbatim in [`CallbackQuery::data`].
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Text plus formatting and an optional row of buttons.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Outgoing {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<TextEntity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
}

impl Outgoing {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_entities(mut self, entities: Vec<TextEntity>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_buttons(mut self, buttons: Vec<Button>) -> Self {
        self.buttons = buttons;
        self
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Message {0} not found")]
    MessageNotFound(MessageId),

    #[error("Cannot resolve file reference {0}")]
    UnknownFile(String),

    #[error("Gateway IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Gateway encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Gateway error: {0}")]
    Other(String),
}

/// Outbound side of a chat platform.
pub trait MessagingGateway: Send + Sync + 'static {
    fn send_text(
        &self,
        chat: ChatId,
        message: Outgoing,
    ) -> impl Future<Output = Result<MessageId, GatewayError>> + Send;

    /// Send a file of `kind` with `caption`.
    fn send_media(
        &self,
        chat: ChatId,
        kind: &MediaKind,
        local_path: &Path,
        caption: Outgoing,
    ) -> impl Future<Output = Result<MessageId, GatewayError>> + Send;

    fn edit_message_text(
        &self,
        chat: ChatId,
        message: MessageId,
        content: Outgoing,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    fn delete_message(
        &self,
        chat: ChatId,
        message: MessageId,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Turn an attachment's platform reference into a download URL.
    fn file_url(&self, source: &str) -> impl Future<Output = Result<String, GatewayError>> + Send;
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum OutboundCall<'a> {
    SendText {
        chat: ChatId,
        message_id: MessageId,
        #[serde(flatten)]
        message: &'a Outgoing,
    },
    SendMedia {
        chat: ChatId,
        message_id: MessageId,
        media: &'a MediaKind,
        path: &'a Path,
        #[serde(flatten)]
        caption: &'a Outgoing,
    },
    EditMessageText {
        chat: ChatId,
        message_id: MessageId,
        #[serde(flatten)]
        content: &'a Outgoing,
    },
    DeleteMessage {
        chat: ChatId,
        message_id: MessageId,
    },
}

/// Writes each outbound call as one JSON line. Message ids are assigned
/// locally, counting up from `first_id`. File references are taken to be
/// URLs already.
pub struct JsonLinesGateway<W> {
    out: Mutex<W>,
    next_id: AtomicI64,
}

impl<W: AsyncWrite + Unpin + Send + 'static> JsonLinesGateway<W> {
    pub fn new(out: W, first_id: i64) -> Self {
        Self {
            out: Mutex::new(out),
            next_id: AtomicI64::new(first_id),
        }
    }

    fn mint_id(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn emit(&self, call: &OutboundCall<'_>) -> Result<(), GatewayError> {
        let mut line = serde_json::to_vec(call)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> MessagingGateway for JsonLinesGateway<W> {
    async fn send_text(&self, chat: ChatId, message: Outgoing) -> Result<MessageId, GatewayError> {
        let message_id = self.mint_id();
        self.emit(&OutboundCall::SendText {
            chat,
            message_id,
            message: &message,
        })
        .await?;
        Ok(message_id)
    }

    async fn send_media(
        &self,
        chat: ChatId,
        kind: &MediaKind,
        local_path: &Path,
        caption: Outgoing,
    ) -> Result<MessageId, GatewayError> {
        let message_id = self.mint_id();
        self.emit(&OutboundCall::SendMedia {
            chat,
            message_id,
            media: kind,
            path: local_path,
            caption: &caption,
        })
        .await?;
        Ok(message_id)
    }

    async fn edit_message_text(
        &self,
        chat: ChatId,
        message: MessageId,
        content: Outgoing,
    ) -> Result<(), GatewayError> {
        self.emit(&OutboundCall::EditMessageText {
            chat,
            message_id: message,
            content: &content,
        })
        .await
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<(), GatewayError> {
        self.emit(&OutboundCall::DeleteMessage {
            chat,
            message_id: message,
        })
        .await
    }

    async fn file_url(&self, source: &str) -> Result<String, GatewayError> {
        if source.starts_with("http://") || source.starts_with("https://") {
            Ok(source.to_string())
        } else {
            Err(GatewayError::UnknownFile(source.to_string()))
        }
    }
}
