//! Routes inbound events to command handlers.
//!
//! Every message passes the admin gate and then the rate governor before
//! its text is parsed. `/start` is the only command open to everyone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use reprise_shared::constants::FILTERS_PER_PAGE;
use reprise_shared::{
    validate_keyword, ChatId, ChatKind, DeleteToken, Filter, MediaDescriptor, PrincipalId,
    ValidationError,
};
use reprise_store::backup::TAG_MANUAL;
use reprise_store::media::{dir_usage, remove_file_best_effort, validate_descriptor};
use reprise_store::{gc, BackupManager, FilterStore, StoreError};

use crate::admins::AdminRegistry;
use crate::config::BotConfig;
use crate::confirm::ConfirmationFlow;
use crate::error::BotError;
use crate::fetcher::{BlobFetcher, FetchRequest, FetcherConfig};
use crate::gateway::{
    Button, CallbackQuery, InboundEvent, IncomingMessage, MessagingGateway, Outgoing,
};
use crate::rate_limit::{Admission, RateGovernor};

const PAGE_PREFIX: &str = "page:";
const RESTORE_PREFIX: &str = "restore:";
const RESTORE_CANCEL: &str = "cancel";
const RESTORE_CHOICES: usize = 10;

/// Media-carrying `!add` commands allowed per principal per minute.
const ADD_MEDIA_LIMIT: u32 = 10;
const ADD_MEDIA_WINDOW: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Command grammar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    Stats,
    AddFilter(String),
    DeleteFilter(String),
    ListFilters,
    UseFilter(String),
    Backup,
    Restore(Option<String>),
    Cleanup,
    AddAdmin(Option<String>),
    RemoveAdmin(Option<String>),
    ListAdmins,
}

impl Command {
    /// Parse message text. Text that is not a command yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();

        if let Some(rest) = text.strip_prefix('/') {
            let (name, arg) = split_first_word(rest);
            // `/cmd@botname` addresses one bot in a group.
            let name = name.split('@').next().unwrap_or(name);
            let arg = (!arg.is_empty()).then(|| arg.to_string());
            return match name {
                "start" => Some(Self::Start),
                "help" => Some(Self::Help),
                "status" => Some(Self::Status),
                "stats" => Some(Self::Stats),
                "backup" => Some(Self::Backup),
                "restore" => Some(Self::Restore(arg)),
                "cleanup" => Some(Self::Cleanup),
                "addadmin" => Some(Self::AddAdmin(arg)),
                "removeadmin" => Some(Self::RemoveAdmin(arg)),
                "listadmins" => Some(Self::ListAdmins),
                _ => None,
            };
        }

        let rest = text.strip_prefix('!')?;
        if rest.is_empty() {
            return None;
        }
        let (name, arg) = split_first_word(rest);
        match name {
            "add" | "a" => Some(Self::AddFilter(arg.to_string())),
            "del" | "d" => Some(Self::DeleteFilter(arg.to_string())),
            "list" | "l" if arg.is_empty() => Some(Self::ListFilters),
            _ => Some(Self::UseFilter(rest.to_string())),
        }
    }
}

fn split_first_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim()),
        None => (s, ""),
    }
}

// ---------------------------------------------------------------------------
// Bot
// ---------------------------------------------------------------------------

pub struct Bot<G> {
    config: Arc<BotConfig>,
    store: Arc<FilterStore>,
    backups: Arc<BackupManager>,
    admins: AdminRegistry,
    governor: RateGovernor,
    fetcher: BlobFetcher,
    confirmations: ConfirmationFlow<G>,
    gateway: Arc<G>,
    started: Instant,
}

impl<G: MessagingGateway> Bot<G> {
    pub fn new(
        config: BotConfig,
        store: Arc<FilterStore>,
        backups: Arc<BackupManager>,
        gateway: Arc<G>,
        shutdown: CancellationToken,
    ) -> Result<Self, BotError> {
        let fetcher = BlobFetcher::new(FetcherConfig::from_bot_config(&config))?;
        let confirmations = ConfirmationFlow::new(
            store.clone(),
            gateway.clone(),
            config.confirm_timeout,
            shutdown,
        );
        Ok(Self {
            admins: AdminRegistry::new(config.admin_ids.iter().copied()),
            governor: RateGovernor::new(config.rate_limit, config.rate_window),
            config: Arc::new(config),
            store,
            backups,
            fetcher,
            confirmations,
            gateway,
            started: Instant::now(),
        })
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    pub fn confirmations(&self) -> &ConfirmationFlow<G> {
        &self.confirmations
    }

    /// Handle one event. Failures are reported to the chat and logged,
    /// never returned.
    pub async fn handle(&self, event: InboundEvent) {
        let chat = event.chat();
        let principal = event.principal();
        let result = match event {
            InboundEvent::Message(message) => self.on_message(message).await,
            InboundEvent::Callback(callback) => self.on_callback(callback).await,
        };

        if let Err(e) = result {
            if e.is_user_error() {
                debug!(chat = %chat, principal = %principal, error = %e, "Request rejected");
            } else {
                error!(chat = %chat, principal = %principal, error = %e, "Request failed");
            }
            self.say(chat, e.user_message()).await;
        }
    }

    async fn say(&self, chat: ChatId, text: impl Into<String>) {
        if let Err(e) = self.gateway.send_text(chat, Outgoing::text(text)).await {
            warn!(chat = %chat, error = %e, "Failed to send reply");
        }
    }

    async fn reply(&self, chat: ChatId, text: impl Into<String>) -> Result<(), BotError> {
        self.gateway.send_text(chat, Outgoing::text(text)).await?;
        Ok(())
    }

    /// Admins pass. Others are ignored in groups and refused in direct chats.
    async fn authorize(&self, principal: PrincipalId, chat: ChatId, kind: ChatKind) -> bool {
        if self.admins.is_admin(principal).await {
            return true;
        }
        match kind {
            ChatKind::Group => {
                debug!(principal = %principal, "Ignoring non-admin in group");
            }
            ChatKind::Direct => {
                info!(principal = %principal, "Refused non-admin in direct chat");
                self.say(chat, "🚫 This bot is for admins only.").await;
            }
        }
        false
    }

    async fn on_message(&self, message: IncomingMessage) -> Result<(), BotError> {
        let command = Command::parse(&message.text);
        if command == Some(Command::Start) {
            return self.cmd_start(&message).await;
        }
        if !self.authorize(message.principal, message.chat, message.chat_kind).await {
            return Ok(());
        }

        match self.governor.admit(message.principal) {
            Admission::Blocked {
                count,
                retry_after_secs,
            } => {
                // Only the first blocked message of a window gets a reply.
                if count == self.governor.ceiling() + 1 {
                    self.say(
                        message.chat,
                        format!(
                            "🐢 Slow down! You sent {count} messages in a short time.\n\
                             Try again in {retry_after_secs} seconds."
                        ),
                    )
                    .await;
                }
                return Ok(());
            }
            Admission::Allowed { warning: Some(left) } => {
                self.say(
                    message.chat,
                    format!("⚠️ Careful, only {left} more messages are allowed in this window."),
                )
                .await;
            }
            Admission::Allowed { warning: None } => {}
        }

        let Some(command) = command else {
            return Ok(());
        };
        debug!(principal = %message.principal, ?command, "Dispatching command");

        let chat = message.chat;
        match command {
            Command::Start => self.cmd_start(&message).await,
            Command::Help => self.reply(chat, help_text()).await,
            Command::Status => self.cmd_status(chat).await,
            Command::Stats => self.cmd_stats(chat).await,
            Command::AddFilter(keyword) => self.cmd_add(&message, keyword).await,
            Command::DeleteFilter(keyword) => self.cmd_delete(&message, keyword).await,
            Command::ListFilters => self.cmd_list(chat).await,
            Command::UseFilter(keyword) => self.cmd_use(chat, &keyword).await,
            Command::Backup => self.cmd_backup(chat).await,
            Command::Restore(name) => self.cmd_restore(chat, name).await,
            Command::Cleanup => self.cmd_cleanup(chat).await,
            Command::AddAdmin(arg) => self.cmd_add_admin(chat, arg).await,
            Command::RemoveAdmin(arg) => self.cmd_remove_admin(&message, arg).await,
            Command::ListAdmins => self.cmd_list_admins(&message).await,
        }
    }

    async fn on_callback(&self, callback: CallbackQuery) -> Result<(), BotError> {
        if !self.authorize(callback.principal, callback.chat, callback.chat_kind).await {
            return Ok(());
        }
        let chat = callback.chat;

        if let Some(page) = callback.data.strip_prefix(PAGE_PREFIX) {
            let page = page.parse().unwrap_or(1);
            let content = self.filter_page(page).await;
            self.gateway
                .edit_message_text(chat, callback.message_id, content)
                .await?;
            return Ok(());
        }

        if let Some(name) = callback.data.strip_prefix(RESTORE_PREFIX) {
            if name == RESTORE_CANCEL {
                self.gateway
                    .edit_message_text(chat, callback.message_id, Outgoing::text("❌ Restore cancelled."))
                    .await?;
                return Ok(());
            }
            self.gateway
                .edit_message_text(chat, callback.message_id, Outgoing::text("⏳ Restoring..."))
                .await?;
            let outcome = self.restore_named(name).await;
            let text = match &outcome {
                Ok(text) => text.clone(),
                Err(e) => e.user_message(),
            };
            self.gateway
                .edit_message_text(chat, callback.message_id, Outgoing::text(text))
                .await?;
            if let Err(e) = outcome {
                if !e.is_user_error() {
                    error!(backup = name, error = %e, "Restore failed");
                }
            }
            return Ok(());
        }

        let token = DeleteToken::decode(&callback.data)?;
        self.confirmations
            .resolve(chat, callback.message_id, token)
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Filters
    // -----------------------------------------------------------------------

    async fn cmd_add(&self, message: &IncomingMessage, keyword: String) -> Result<(), BotError> {
        validate_keyword(&keyword)?;
        let Some(source) = &message.reply_to else {
            return Err(BotError::Usage(
                "Reply to the message you want to save, then send !add <keyword>.".into(),
            ));
        };
        if source.text.is_empty() && source.attachments.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }

        let has_media = !source.attachments.is_empty();
        if has_media
            && !self.governor.check_custom(
                message.principal,
                "add",
                ADD_MEDIA_LIMIT,
                ADD_MEDIA_WINDOW,
            )
        {
            return Err(BotError::Usage(
                "Too many media filters added recently, wait a minute.".into(),
            ));
        }

        // Downloads run before the store is touched.
        let mut descriptors: Vec<MediaDescriptor> = Vec::new();
        for attachment in &source.attachments {
            let fetched = match self.gateway.file_url(&attachment.source).await {
                Ok(url) => {
                    let request = FetchRequest {
                        url,
                        source: attachment.source.clone(),
                        kind: attachment.kind.clone(),
                        original_name: attachment.file_name.clone(),
                        mime_type: attachment.mime_type.clone(),
                    };
                    self.fetcher.fetch(&request).await.map_err(BotError::from)
                }
                Err(e) => Err(e.into()),
            };
            match fetched {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => {
                    discard_downloads(&descriptors).await;
                    return Err(e);
                }
            }
        }

        let filter = Filter::new(
            source.text.clone(),
            source.entities.clone(),
            descriptors.iter().map(|d| d.id).collect(),
            Some(message.principal),
        )?;
        let media_count = descriptors.len();
        let downloaded = descriptors.clone();

        let previous = match self.store.put_with_media(&keyword, filter, descriptors).await {
            Ok(previous) => previous,
            Err(e) => {
                discard_downloads(&downloaded).await;
                return Err(e.into());
            }
        };

        info!(
            keyword = %keyword,
            principal = %message.principal,
            media = media_count,
            updated = previous.is_some(),
            "Filter saved"
        );
        let mut text = format!(
            "✅ Filter \"{keyword}\" {}.",
            if previous.is_some() { "updated" } else { "created" }
        );
        if media_count > 0 {
            text.push_str(&format!(" Media: {media_count} file(s)"));
        }
        self.reply(message.chat, text).await
    }

    async fn cmd_delete(&self, message: &IncomingMessage, keyword: String) -> Result<(), BotError> {
        if keyword.is_empty() {
            return Err(BotError::Usage("Usage: !del <keyword>".into()));
        }
        self.confirmations
            .propose(message.chat, &keyword, message.message_id)
            .await?;
        Ok(())
    }

    async fn cmd_list(&self, chat: ChatId) -> Result<(), BotError> {
        let content = self.filter_page(1).await;
        self.gateway.send_text(chat, content).await?;
        Ok(())
    }

    async fn filter_page(&self, page: usize) -> Outgoing {
        let entries: Vec<(String, bool)> = self
            .store
            .read(|doc| {
                doc.filters
                    .iter()
                    .map(|(keyword, filter)| (keyword.clone(), filter.has_media()))
                    .collect()
            })
            .await;
        render_filter_page(&entries, page)
    }

    async fn cmd_use(&self, chat: ChatId, keyword: &str) -> Result<(), BotError> {
        let Some((filter, media)) = self.store.get_with_media(keyword).await else {
            return Err(BotError::Usage(format!(
                "Filter \"{keyword}\" does not exist. Send !list to see all filters."
            )));
        };

        if !filter.has_media() {
            let content = Outgoing::text(filter.text).with_entities(filter.entities);
            self.gateway.send_text(chat, content).await?;
            debug!(keyword, "Filter replayed");
            return Ok(());
        }

        let caption = Outgoing::text(filter.text).with_entities(filter.entities);
        let mut skipped = filter.media.len().saturating_sub(media.len());
        let mut delivered = 0;
        for descriptor in &media {
            let validity = validate_descriptor(descriptor).await;
            if !validity.is_valid() {
                warn!(keyword, media = %descriptor.id, ?validity, "Skipping invalid media");
                skipped += 1;
                continue;
            }
            match self
                .gateway
                .send_media(chat, &descriptor.kind, &descriptor.local_path, caption.clone())
                .await
            {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(keyword, media = %descriptor.id, error = %e, "Failed to send media");
                    skipped += 1;
                }
            }
        }

        // The text still goes out when no attachment carried it.
        if delivered == 0 && !caption.text.is_empty() {
            self.gateway.send_text(chat, caption).await?;
        }
        if skipped > 0 {
            self.reply(
                chat,
                format!("⚠️ {skipped} media file(s) of \"{keyword}\" missing or damaged or not sent."),
            )
            .await?;
        }
        debug!(keyword, delivered, skipped, "Filter replayed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    async fn cmd_backup(&self, chat: ChatId) -> Result<(), BotError> {
        let text = match self.backups.snapshot(&self.store, TAG_MANUAL).await? {
            Some(path) => {
                let summary = self.store.summary().await;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                format!("✅ Backup created: {name} ({} filters)", summary.filters)
            }
            None => "⚠️ Nothing to back up yet.".to_string(),
        };
        self.reply(chat, text).await
    }

    async fn cmd_restore(&self, chat: ChatId, name: Option<String>) -> Result<(), BotError> {
        if let Some(name) = name {
            let text = self.restore_named(&name).await?;
            return self.reply(chat, text).await;
        }

        let snapshots = self.backups.list().await?;
        if snapshots.is_empty() {
            return self.reply(chat, "❌ No backups available.").await;
        }

        let mut buttons: Vec<Button> = snapshots
            .iter()
            .take(RESTORE_CHOICES)
            .map(|snapshot| {
                Button::new(
                    format!("{} {}", snapshot.created_at.format("%m-%d %H:%M"), snapshot.tag),
                    format!("{RESTORE_PREFIX}{}", snapshot.name),
                )
            })
            .collect();
        buttons.push(Button::new("❌ Cancel", format!("{RESTORE_PREFIX}{RESTORE_CANCEL}")));

        let menu = Outgoing::text("📦 Choose a backup to restore:").with_buttons(buttons);
        self.gateway.send_text(chat, menu).await?;
        Ok(())
    }

    /// Restore the snapshot called `name` and describe the result.
    async fn restore_named(&self, name: &str) -> Result<String, BotError> {
        let Some(snapshot) = self.backups.find(name).await? else {
            return Err(BotError::Usage(format!("Backup \"{name}\" not found.")));
        };
        match self.backups.restore(&self.store, &snapshot.path).await {
            Ok(()) => {
                let summary = self.store.summary().await;
                info!(backup = name, filters = summary.filters, "Restored from backup");
                Ok(format!("✅ Restored from {name} ({} filters)", summary.filters))
            }
            Err(StoreError::Restore(reason)) => {
                warn!(backup = name, reason = %reason, "Backup rejected");
                Err(BotError::Usage(format!("Restore failed: {reason}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cmd_cleanup(&self, chat: ChatId) -> Result<(), BotError> {
        let report = gc::reconcile(&self.store).await?;
        let swept =
            gc::sweep_aged_files(&self.config.media_dir, self.config.media_retention).await?;
        self.reply(
            chat,
            format!(
                "🧹 Unreferenced media removed: {}, old files deleted: {}",
                report.removed,
                report.files_deleted + swept
            ),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Info
    // -----------------------------------------------------------------------

    async fn cmd_start(&self, message: &IncomingMessage) -> Result<(), BotError> {
        let text = if self.admins.is_admin(message.principal).await {
            "👋 Hi admin! Send /help for commands."
        } else {
            "👋 This bot is for admins only."
        };
        self.reply(message.chat, text).await
    }

    async fn cmd_status(&self, chat: ChatId) -> Result<(), BotError> {
        let uptime = self.started.elapsed().as_secs();
        let summary = self.store.summary().await;
        let text = format!(
            "📊 Up {}h {}m, {} admins, {} filters, {} media, {} pending deletes",
            uptime / 3600,
            (uptime % 3600) / 60,
            self.admins.len().await,
            summary.filters,
            summary.media,
            self.confirmations.pending_count(),
        );
        self.reply(chat, text).await
    }

    async fn cmd_stats(&self, chat: ChatId) -> Result<(), BotError> {
        let rate = self.governor.stats();
        let summary = self.store.summary().await;
        let usage = dir_usage(&self.config.media_dir).await?;
        let backups = self.backups.stats().await?;
        let newest = backups
            .newest
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".to_string());

        let text = format!(
            "📈 Requests {} ({} blocked, {} windows) since {}\n\
             📁 Media files {} ({} KiB), store {} KiB\n\
             📦 Backups {} ({} KiB), newest {newest}",
            rate.total_requests,
            rate.blocked_requests,
            rate.active_windows,
            rate.since.format("%Y-%m-%d %H:%M UTC"),
            usage.file_count,
            usage.total_bytes.div_ceil(1024),
            summary.file_kib,
            backups.count,
            backups.total_bytes.div_ceil(1024),
        );
        self.reply(chat, text).await
    }

    // -----------------------------------------------------------------------
    // Admins
    // -----------------------------------------------------------------------

    async fn cmd_add_admin(&self, chat: ChatId, arg: Option<String>) -> Result<(), BotError> {
        let principal = parse_principal_arg(arg, "/addadmin")?;
        self.admins.add(principal).await?;
        self.reply(chat, format!("✅ {principal} is now an admin (until restart)."))
            .await
    }

    async fn cmd_remove_admin(
        &self,
        message: &IncomingMessage,
        arg: Option<String>,
    ) -> Result<(), BotError> {
        let principal = parse_principal_arg(arg, "/removeadmin")?;
        self.admins.remove(principal, message.principal).await?;
        self.reply(message.chat, format!("✅ {principal} is no longer an admin (until restart)."))
            .await
    }

    async fn cmd_list_admins(&self, message: &IncomingMessage) -> Result<(), BotError> {
        let admins = self.admins.list().await;
        let mut text = format!("👑 Admins ({}):\n", admins.len());
        for (i, admin) in admins.iter().enumerate() {
            text.push_str(&format!("\n{}. {admin}", i + 1));
        }
        text.push_str(&format!("\n\nYour id: {}", message.principal));
        self.reply(message.chat, text).await
    }
}

fn parse_principal_arg(arg: Option<String>, command: &str) -> Result<PrincipalId, BotError> {
    let Some(arg) = arg else {
        return Err(BotError::Usage(format!("Usage: {command} <user id>")));
    };
    PrincipalId::parse(&arg)
        .ok_or_else(|| BotError::Usage(format!("\"{arg}\" is not a numeric user id.")))
}

async fn discard_downloads(descriptors: &[MediaDescriptor]) {
    for descriptor in descriptors {
        remove_file_best_effort(&descriptor.local_path).await;
    }
}

/// One page of the filter listing, 1-based. Out-of-range pages clamp.
fn render_filter_page(entries: &[(String, bool)], page: usize) -> Outgoing {
    if entries.is_empty() {
        return Outgoing::text("📭 No filters yet.");
    }

    let total_pages = entries.len().div_ceil(FILTERS_PER_PAGE);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * FILTERS_PER_PAGE;

    let mut text = format!("📋 Filters ({}):\n", entries.len());
    for (i, (keyword, has_media)) in entries.iter().enumerate().skip(start).take(FILTERS_PER_PAGE) {
        let icon = if *has_media { "📁" } else { "📝" };
        text.push_str(&format!("\n{}. {icon} {keyword}", i + 1));
    }
    if total_pages > 1 {
        text.push_str(&format!("\n\n📄 Page {page}/{total_pages}"));
    }

    let mut buttons = Vec::new();
    if page > 1 {
        buttons.push(Button::new("⬅️ Previous", format!("{PAGE_PREFIX}{}", page - 1)));
    }
    if page < total_pages {
        buttons.push(Button::new("Next ➡️", format!("{PAGE_PREFIX}{}", page + 1)));
    }
    Outgoing::text(text).with_buttons(buttons)
}

fn help_text() -> &'static str {
    "📖 !add <kw> (as reply), !del <kw>, !list, !<kw>\n\
     /backup, /restore [name], /cleanup, /status, /stats\n\
     /addadmin <id>, /removeadmin <id>, /listadmins"
}
