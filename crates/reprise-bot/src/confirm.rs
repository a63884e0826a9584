//! Two-step confirmation for deleting a filter.
//!
//! A delete request produces a prompt whose confirm and cancel buttons each
//! carry a [`DeleteToken`], so resolving needs no stored state. The only
//! bookkeeping is the auto-expire timer per open prompt: when it fires the
//! prompt and the original request are deleted and the filter is left
//! alone. A press on a prompt without a live timer is treated as expired.
//! Timers are children of the shutdown token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use reprise_shared::{ChatId, DeleteAction, DeleteToken, MessageId};
use reprise_store::media::remove_file_best_effort;
use reprise_store::FilterStore;

use crate::error::BotError;
use crate::gateway::{Button, MessagingGateway, Outgoing};

type Timers = Mutex<HashMap<(ChatId, MessageId), CancellationToken>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposal {
    Prompted { prompt: MessageId },
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Deleted {
        media_removed: usize,
        files_deleted: usize,
    },
    AlreadyGone,
    Cancelled,
    /// The prompt outlived its timer; nothing was deleted.
    Expired,
}

pub struct ConfirmationFlow<G> {
    store: Arc<FilterStore>,
    gateway: Arc<G>,
    timeout: Duration,
    shutdown: CancellationToken,
    timers: Arc<Timers>,
    tracker: TaskTracker,
}

impl<G> Clone for ConfirmationFlow<G> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            gateway: self.gateway.clone(),
            timeout: self.timeout,
            shutdown: self.shutdown.clone(),
            timers: self.timers.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

fn lock(timers: &Timers) -> MutexGuard<'_, HashMap<(ChatId, MessageId), CancellationToken>> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<G: MessagingGateway> ConfirmationFlow<G> {
    pub fn new(
        store: Arc<FilterStore>,
        gateway: Arc<G>,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            gateway,
            timeout,
            shutdown,
            timers: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Ask for confirmation before deleting `keyword`.
    pub async fn propose(
        &self,
        chat: ChatId,
        keyword: &str,
        request: MessageId,
    ) -> Result<Proposal, BotError> {
        if self.store.get(keyword).await.is_none() {
            self.gateway
                .send_text(chat, Outgoing::text(format!("❌ Filter \"{keyword}\" does not exist.")))
                .await?;
            return Ok(Proposal::NotFound);
        }

        let confirm = DeleteToken::new(DeleteAction::Confirm, keyword, request);
        let cancel = DeleteToken::new(DeleteAction::Cancel, keyword, request);
        let prompt = Outgoing::text(format!(
            "⚠️ Delete filter \"{keyword}\"?\n\nThis cannot be undone."
        ))
        .with_buttons(vec![
            Button::new("✅ Delete", confirm.encode()),
            Button::new("❌ Cancel", cancel.encode()),
        ]);
        let prompt = self.gateway.send_text(chat, prompt).await?;

        self.schedule_expiry(chat, prompt, request);
        debug!(keyword, prompt = %prompt, "Delete confirmation requested");
        Ok(Proposal::Prompted { prompt })
    }

    fn schedule_expiry(&self, chat: ChatId, prompt: MessageId, request: MessageId) {
        let token = self.shutdown.child_token();
        lock(&self.timers).insert((chat, prompt), token.clone());

        let gateway = self.gateway.clone();
        let timers = self.timers.clone();
        let timeout = self.timeout;
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let still_open = lock(&timers).remove(&(chat, prompt)).is_some();
                    if !still_open {
                        return;
                    }
                    for message in [prompt, request] {
                        if let Err(e) = gateway.delete_message(chat, message).await {
                            debug!(message = %message, error = %e, "Could not delete expired message");
                        }
                    }
                    debug!(prompt = %prompt, "Delete confirmation expired");
                }
            }
        });
    }

    /// Act on a button press from `prompt`.
    pub async fn resolve(
        &self,
        chat: ChatId,
        prompt: MessageId,
        token: DeleteToken,
    ) -> Result<Resolution, BotError> {
        let timer = lock(&self.timers).remove(&(chat, prompt));
        let Some(timer) = timer else {
            debug!(prompt = %prompt, keyword = %token.keyword, "Press on expired confirmation");
            self.edit(chat, prompt, "⌛ This confirmation has expired.".to_string())
                .await;
            return Ok(Resolution::Expired);
        };
        timer.cancel();

        let keyword = match token.keyword.exact() {
            Some(exact) => exact.to_string(),
            None => self
                .store
                .read(|doc| {
                    doc.filters
                        .keywords()
                        .find(|keyword| token.keyword.matches(keyword))
                        .cloned()
                })
                .await
                .unwrap_or_else(|| token.keyword.to_string()),
        };
        let keyword = keyword.as_str();
        let resolution = match token.action {
            DeleteAction::Confirm => match self.store.take_filter(keyword).await? {
                None => {
                    self.edit(chat, prompt, format!("❌ Filter \"{keyword}\" is already gone."))
                        .await;
                    return Ok(Resolution::AlreadyGone);
                }
                Some((_, released)) => {
                    let mut files_deleted = 0;
                    for descriptor in &released {
                        if remove_file_best_effort(&descriptor.local_path).await {
                            files_deleted += 1;
                        }
                    }
                    info!(keyword, media = released.len(), "Filter deleted");
                    self.edit(chat, prompt, format!("✅ Filter \"{keyword}\" deleted."))
                        .await;
                    Resolution::Deleted {
                        media_removed: released.len(),
                        files_deleted,
                    }
                }
            },
            DeleteAction::Cancel => {
                self.edit(chat, prompt, format!("❌ Deleting \"{keyword}\" was cancelled."))
                    .await;
                Resolution::Cancelled
            }
        };

        if let Err(e) = self
            .gateway
            .delete_message(chat, token.request_message_id)
            .await
        {
            debug!(message = %token.request_message_id, error = %e, "Could not delete request message");
        }
        Ok(resolution)
    }

    async fn edit(&self, chat: ChatId, prompt: MessageId, text: String) {
        if let Err(e) = self
            .gateway
            .edit_message_text(chat, prompt, Outgoing::text(text))
            .await
        {
            warn!(prompt = %prompt, error = %e, "Could not update confirmation prompt");
        }
    }

    /// Prompts whose timer is still running.
    pub fn pending_count(&self) -> usize {
        lock(&self.timers).len()
    }

    /// Wait for every timer task to finish. Timers only finish early once
    /// the shutdown token is cancelled.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use reprise_shared::{Filter, MediaDescriptor, MediaKind};
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::testing::RecordingGateway;

    const CHAT: ChatId = ChatId(-500);
    const REQUEST: MessageId = MessageId(42);

    struct Fixture {
        dir: TempDir,
        store: Arc<FilterStore>,
        gateway: Arc<RecordingGateway>,
        shutdown: CancellationToken,
        flow: ConfirmationFlow<RecordingGateway>,
    }

    async fn fixture(timeout: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let (store, _) = FilterStore::open(dir.path().join("database.json")).await.unwrap();
        let store = Arc::new(store);
        let gateway = Arc::new(RecordingGateway::new());
        let shutdown = CancellationToken::new();
        let flow = ConfirmationFlow::new(store.clone(), gateway.clone(), timeout, shutdown.clone());
        Fixture {
            dir,
            store,
            gateway,
            shutdown,
            flow,
        }
    }

    fn text_filter(text: &str) -> Filter {
        Filter::new(text.into(), Vec::new(), Vec::new(), None).unwrap()
    }

    fn button_token(gateway: &RecordingGateway, index: usize) -> DeleteToken {
        DeleteToken::decode(&gateway.last_buttons()[index].data).unwrap()
    }

    async fn propose(fx: &Fixture, keyword: &str) -> MessageId {
        match fx.flow.propose(CHAT, keyword, REQUEST).await.unwrap() {
            Proposal::Prompted { prompt } => prompt,
            Proposal::NotFound => panic!("expected a prompt for {keyword}"),
        }
    }

    #[tokio::test]
    async fn test_confirm_deletes_exactly_the_keyword() {
        let fx = fixture(Duration::from_secs(30)).await;
        for keyword in ["foo", "foo_bar", "foo_bar_42", "bar"] {
            fx.store.put(keyword, text_filter(keyword)).await.unwrap();
        }

        let prompt = propose(&fx, "foo_bar").await;
        assert_eq!(fx.flow.pending_count(), 1);

        let token = button_token(&fx.gateway, 0);
        assert_eq!(token.keyword.exact(), Some("foo_bar"));
        assert_eq!(token.request_message_id, REQUEST);

        let resolution = fx.flow.resolve(CHAT, prompt, token).await.unwrap();
        assert!(matches!(resolution, Resolution::Deleted { media_removed: 0, .. }));
        assert_eq!(fx.store.list_keywords().await, vec!["foo", "foo_bar_42", "bar"]);
        assert_eq!(fx.gateway.deleted(), vec![REQUEST]);
        assert_eq!(fx.gateway.edits()[0].0, prompt);
        assert!(fx.gateway.edits()[0].1.contains("deleted"));
        assert_eq!(fx.flow.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_confirm_removes_media_files() {
        let fx = fixture(Duration::from_secs(30)).await;
        let id = Uuid::new_v4();
        let path = fx.dir.path().join(format!("{id}.ogg"));
        std::fs::write(&path, b"voice").unwrap();
        let descriptor = MediaDescriptor {
            id,
            kind: MediaKind::Voice { duration: Some(3) },
            source: "voice-1".into(),
            local_path: path.clone(),
            file_name: format!("{id}.ogg"),
            original_name: "voice.ogg".into(),
            size: 5,
            mime_type: None,
            created_at: Utc::now(),
        };
        let filter = Filter::new(String::new(), Vec::new(), vec![id], None).unwrap();
        fx.store
            .put_with_media("memo", filter, vec![descriptor])
            .await
            .unwrap();

        let prompt = propose(&fx, "memo").await;
        let resolution = fx
            .flow
            .resolve(CHAT, prompt, button_token(&fx.gateway, 0))
            .await
            .unwrap();

        assert_eq!(
            resolution,
            Resolution::Deleted {
                media_removed: 1,
                files_deleted: 1
            }
        );
        assert!(!path.exists());
        assert!(fx.store.list_media().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_keeps_filter() {
        let fx = fixture(Duration::from_secs(30)).await;
        fx.store.put("keep_me", text_filter("x")).await.unwrap();

        let prompt = propose(&fx, "keep_me").await;
        let token = button_token(&fx.gateway, 1);
        assert_eq!(token.action, DeleteAction::Cancel);

        let resolution = fx.flow.resolve(CHAT, prompt, token).await.unwrap();
        assert_eq!(resolution, Resolution::Cancelled);
        assert!(fx.store.get("keep_me").await.is_some());
        assert!(fx.gateway.edits()[0].1.contains("cancelled"));
        assert_eq!(fx.gateway.deleted(), vec![REQUEST]);
    }

    #[tokio::test]
    async fn test_unknown_keyword_is_reported() {
        let fx = fixture(Duration::from_secs(30)).await;
        let outcome = fx.flow.propose(CHAT, "ghost", REQUEST).await.unwrap();
        assert_eq!(outcome, Proposal::NotFound);
        assert!(fx.gateway.last_text().contains("does not exist"));
        assert_eq!(fx.flow.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_confirm_after_concurrent_delete() {
        let fx = fixture(Duration::from_secs(30)).await;
        fx.store.put("racy", text_filter("x")).await.unwrap();
        let prompt = propose(&fx, "racy").await;

        fx.store.delete("racy").await.unwrap();
        let resolution = fx
            .flow
            .resolve(CHAT, prompt, button_token(&fx.gateway, 0))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::AlreadyGone);
        assert!(fx.gateway.edits()[0].1.contains("already gone"));
    }

    #[tokio::test]
    async fn test_timeout_removes_prompt_and_request() {
        let fx = fixture(Duration::from_millis(50)).await;
        fx.store.put("stay", text_filter("x")).await.unwrap();
        let prompt = propose(&fx, "stay").await;

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(fx.gateway.deleted(), vec![prompt, REQUEST]);
        assert!(fx.store.get("stay").await.is_some());
        assert_eq!(fx.flow.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_confirm_resolves_long_keyword() {
        let fx = fixture(Duration::from_secs(30)).await;
        let long = "quarterly_report_reminder_for_the_whole_team";
        let sibling = "quarterly_report_reminder_for_the_whole_crew";
        fx.store.put(long, text_filter("x")).await.unwrap();
        fx.store.put(sibling, text_filter("y")).await.unwrap();

        let prompt = propose(&fx, long).await;
        let token = button_token(&fx.gateway, 0);
        assert!(token.keyword.exact().is_none());

        let resolution = fx.flow.resolve(CHAT, prompt, token).await.unwrap();
        assert!(matches!(resolution, Resolution::Deleted { .. }));
        assert_eq!(fx.store.list_keywords().await, vec![sibling]);
        assert!(fx.gateway.edits()[0].1.contains(long));
    }

    #[tokio::test]
    async fn test_press_after_expiry_deletes_nothing() {
        let fx = fixture(Duration::from_millis(50)).await;
        fx.store.put("late", text_filter("x")).await.unwrap();
        let prompt = propose(&fx, "late").await;
        let token = button_token(&fx.gateway, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let resolution = fx.flow.resolve(CHAT, prompt, token).await.unwrap();

        assert_eq!(resolution, Resolution::Expired);
        assert!(fx.store.get("late").await.is_some());
        assert!(fx.gateway.edits()[0].1.contains("expired"));
        assert_eq!(fx.gateway.deleted(), vec![prompt, REQUEST]);
    }

    #[tokio::test]
    async fn test_resolve_cancels_timer() {
        let fx = fixture(Duration::from_millis(100)).await;
        fx.store.put("quick", text_filter("x")).await.unwrap();
        let prompt = propose(&fx, "quick").await;

        fx.flow
            .resolve(CHAT, prompt, button_token(&fx.gateway, 1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(fx.gateway.deleted(), vec![REQUEST]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_timers() {
        let fx = fixture(Duration::from_millis(100)).await;
        fx.store.put("kw", text_filter("x")).await.unwrap();
        propose(&fx, "kw").await;

        fx.shutdown.cancel();
        fx.flow.wait().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(fx.gateway.deleted().is_empty());
    }
}
