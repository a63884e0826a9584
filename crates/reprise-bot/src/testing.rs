//! In-memory gateway that records every outbound call.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use reprise_shared::{ChatId, MediaKind, MessageId};

use crate::gateway::{Button, GatewayError, MessagingGateway, Outgoing};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Text {
        chat: ChatId,
        id: MessageId,
        message: Outgoing,
    },
    Media {
        chat: ChatId,
        id: MessageId,
        kind: MediaKind,
        path: PathBuf,
        caption: Outgoing,
    },
    Edit {
        chat: ChatId,
        id: MessageId,
        content: Outgoing,
    },
    Delete {
        chat: ChatId,
        id: MessageId,
    },
}

pub struct RecordingGateway {
    calls: Mutex<Vec<Call>>,
    next_id: AtomicI64,
    failing_media: Mutex<Vec<PathBuf>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
            failing_media: Mutex::new(Vec::new()),
        }
    }

    /// Make every later `send_media` of `path` fail.
    pub fn fail_media(&self, path: &Path) {
        self.failing_media.lock().unwrap().push(path.to_path_buf());
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn mint(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Texts of sent messages, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Text { message, .. } => Some(message.text),
                _ => None,
            })
            .collect()
    }

    pub fn last_text(&self) -> String {
        self.sent_texts().pop().unwrap_or_default()
    }

    pub fn last_buttons(&self) -> Vec<Button> {
        self.calls()
            .into_iter()
            .rev()
            .find_map(|call| match call {
                Call::Text { message, .. } if !message.buttons.is_empty() => Some(message.buttons),
                Call::Edit { content, .. } if !content.buttons.is_empty() => Some(content.buttons),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn edits(&self) -> Vec<(MessageId, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Edit { id, content, .. } => Some((id, content.text)),
                _ => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Delete { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn media_sent(&self) -> Vec<(MediaKind, PathBuf, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Media {
                    kind,
                    path,
                    caption,
                    ..
                } => Some((kind, path, caption.text)),
                _ => None,
            })
            .collect()
    }
}

impl MessagingGateway for RecordingGateway {
    async fn send_text(&self, chat: ChatId, message: Outgoing) -> Result<MessageId, GatewayError> {
        let id = self.mint();
        self.record(Call::Text { chat, id, message });
        Ok(id)
    }

    async fn send_media(
        &self,
        chat: ChatId,
        kind: &MediaKind,
        local_path: &Path,
        caption: Outgoing,
    ) -> Result<MessageId, GatewayError> {
        if self.failing_media.lock().unwrap().iter().any(|p| p == local_path) {
            return Err(GatewayError::Other(format!("upload of {} refused", local_path.display())));
        }
        let id = self.mint();
        self.record(Call::Media {
            chat,
            id,
            kind: kind.clone(),
            path: local_path.to_path_buf(),
            caption,
        });
        Ok(id)
    }

    async fn edit_message_text(
        &self,
        chat: ChatId,
        message: MessageId,
        content: Outgoing,
    ) -> Result<(), GatewayError> {
        self.record(Call::Edit {
            chat,
            id: message,
            content,
        });
        Ok(())
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<(), GatewayError> {
        self.record(Call::Delete { chat, id: message });
        Ok(())
    }

    async fn file_url(&self, source: &str) -> Result<String, GatewayError> {
        Ok(source.to_string())
    }
}
