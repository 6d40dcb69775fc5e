//! Keeps a local, ordered copy of the message table in step with the store.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use time::OffsetDateTime;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{
    model::{
        AudioBlob, Identity, Message, MessagePatch, MessageQuery, NewMessage, NewReport, Table,
    },
    notify::Toasts,
    remote::{RemoteStore, VOICE_BUCKET},
    ChatError, ChatResult,
};

pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(1000);
/// Older messages are paged in this many at a time.
pub const PAGE_SIZE: u32 = 20;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MessageSync {
    store: Arc<dyn RemoteStore>,
    toasts: Toasts,
    messages: watch::Sender<Vec<Message>>,
    draft: watch::Sender<String>,

    // refresh tickets: only a response newer than the last applied one lands
    issued: AtomicU64,
    applied: Mutex<u64>,

    // older messages paged in by `load_more`, newest first
    history: watch::Sender<Vec<Message>>,
    cursor: Mutex<Option<OffsetDateTime>>,
    has_more: AtomicBool,
    loading_more: AtomicBool,

    refresh_interval: Mutex<Duration>,
    auto_refresh: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl MessageSync {
    pub fn new(store: Arc<dyn RemoteStore>, toasts: Toasts) -> Arc<Self> {
        Arc::new(Self {
            store,
            toasts,
            messages: watch::channel(Vec::new()).0,
            draft: watch::channel(String::new()).0,
            issued: AtomicU64::new(0),
            applied: Mutex::new(0),
            history: watch::channel(Vec::new()).0,
            cursor: Mutex::new(None),
            has_more: AtomicBool::new(true),
            loading_more: AtomicBool::new(false),
            refresh_interval: Mutex::new(DEFAULT_REFRESH_INTERVAL),
            auto_refresh: Mutex::new(None),
            subscription: Mutex::new(None),
        })
    }

    /// Initial fetch, change subscription, and (optionally) the refresh timer.
    pub async fn start(self: &Arc<Self>, every: Duration, auto_refresh: bool) {
        let _ = self.refresh().await;
        self.subscribe_to_changes();
        *lock(&self.refresh_interval) = every.max(MIN_REFRESH_INTERVAL);
        self.set_auto_refresh(auto_refresh);
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn toasts(&self) -> &Toasts {
        &self.toasts
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    pub fn pinned(&self) -> Vec<Message> {
        self.messages
            .borrow()
            .iter()
            .filter(|m| m.is_pinned)
            .cloned()
            .collect()
    }

    pub fn draft(&self) -> String {
        self.draft.borrow().clone()
    }

    pub fn watch_draft(&self) -> watch::Receiver<String> {
        self.draft.subscribe()
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        self.draft.send_replace(text.into());
    }

    /// Replaces the local list with the store's full ordered list. A failed
    /// fetch leaves the list alone; a response overtaken by a newer one is
    /// dropped. Returns whether this response was applied. Watchers are only
    /// woken when the list actually differs.
    pub async fn refresh(&self) -> ChatResult<bool> {
        let ticket = self.issued.fetch_add(1, Ordering::SeqCst) + 1;

        let messages = match self.store.fetch_messages(&MessageQuery::all()).await {
            Ok(messages) => messages,
            Err(e) => {
                self.toasts.error("Failed to load messages", &e);
                return Err(e);
            }
        };

        let mut applied = lock(&self.applied);
        if ticket <= *applied {
            tracing::debug!("dropping refresh #{ticket}, #{} already applied", *applied);
            return Ok(false);
        }
        *applied = ticket;
        self.messages.send_if_modified(|current| {
            if *current == messages {
                return false;
            }
            *current = messages;
            true
        });
        Ok(true)
    }

    pub fn history(&self) -> Vec<Message> {
        self.history.borrow().clone()
    }

    pub fn watch_history(&self) -> watch::Receiver<Vec<Message>> {
        self.history.subscribe()
    }

    /// False once a page came back short.
    pub fn has_more(&self) -> bool {
        self.has_more.load(Ordering::SeqCst)
    }

    /// Pages in up to [`PAGE_SIZE`] messages older than the oldest one paged in
    /// so far and appends them to [`history`](Self::history). Returns how many
    /// arrived; a call while a page is in flight, or after the last page, is a
    /// no-op.
    pub async fn load_more(&self) -> ChatResult<usize> {
        if !self.has_more() || self.loading_more.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let cursor = *lock(&self.cursor);
        let page = self
            .store
            .fetch_messages(&MessageQuery::page(cursor, PAGE_SIZE))
            .await;
        self.loading_more.store(false, Ordering::SeqCst);
        let page = page.inspect_err(|e| self.toasts.error("Failed to load more messages", e))?;

        self.has_more.store(page.len() == PAGE_SIZE as usize, Ordering::SeqCst);
        if let Some(oldest) = page.last() {
            *lock(&self.cursor) = Some(oldest.created_at);
        }
        let added = page.len();
        tracing::debug!("paged in {added} older messages");
        self.history.send_modify(|history| history.extend(page));
        Ok(added)
    }

    /// Refreshes every `every` until turned off. Replaces any running timer.
    pub fn schedule_auto_refresh(self: &Arc<Self>, every: Duration) {
        let every = every.max(MIN_REFRESH_INTERVAL);
        *lock(&self.refresh_interval) = every;

        let sync = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(sync) = sync.upgrade() else {
                    break;
                };
                let _ = sync.refresh().await;
            }
        });

        if let Some(previous) = lock(&self.auto_refresh).replace(task) {
            previous.abort();
        }
        tracing::debug!("auto-refresh every {every:?}");
    }

    pub fn set_auto_refresh(self: &Arc<Self>, enabled: bool) {
        if enabled {
            if !self.auto_refresh_enabled() {
                let every = *lock(&self.refresh_interval);
                self.schedule_auto_refresh(every);
            }
        } else if let Some(task) = lock(&self.auto_refresh).take() {
            task.abort();
            tracing::debug!("auto-refresh off");
        }
    }

    pub fn auto_refresh_enabled(&self) -> bool {
        lock(&self.auto_refresh)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn refresh_interval(&self) -> Duration {
        *lock(&self.refresh_interval)
    }

    /// Every insert/update/delete on the message table triggers a full refresh.
    pub fn subscribe_to_changes(self: &Arc<Self>) {
        let mut feed = self.store.subscribe(Table::Messages);
        let sync = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                let Some(sync) = sync.upgrade() else {
                    break;
                };
                tracing::debug!(kind = ?event.kind, id = ?event.id, "message table changed");
                let _ = sync.refresh().await;
            }
        });

        if let Some(previous) = lock(&self.subscription).replace(task) {
            previous.abort();
        }
    }

    /// Stops the timer and the subscription.
    pub fn shutdown(&self) {
        for slot in [&self.auto_refresh, &self.subscription] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
    }

    async fn require_user(&self) -> ChatResult<Identity> {
        self.store.current_user().await.ok_or(ChatError::NotSignedIn)
    }

    /// Blank content is ignored. The list itself only changes on the next
    /// refresh. The draft is left alone.
    pub async fn send(&self, content: &str) -> ChatResult<Option<Message>> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }

        let inserted = match self.require_user().await {
            Ok(user) => match NewMessage::text(user.user_id, content) {
                Ok(message) => self.store.insert_message(message).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        inserted
            .map(Some)
            .inspect_err(|e| self.toasts.error("Failed to send message", e))
    }

    /// Sends the draft. It is cleared up front and put back exactly as typed
    /// if the send fails.
    pub async fn send_draft(&self) -> ChatResult<Option<Message>> {
        let draft = self.draft();
        if draft.trim().is_empty() {
            return Ok(None);
        }

        self.draft.send_replace(String::new());
        self.send(&draft).await.inspect_err(|_| {
            self.draft.send_replace(draft.clone());
        })
    }

    /// Uploads the recording and posts a message pointing at it.
    pub async fn send_voice(&self, blob: AudioBlob) -> ChatResult<Message> {
        if blob.is_empty() {
            return Err(ChatError::EmptyRecording);
        }

        match self.upload_voice(blob).await {
            Ok(message) => {
                self.toasts.success("Voice message sent");
                Ok(message)
            }
            Err(e) => {
                self.toasts.error("Failed to send voice message", &e);
                Err(e)
            }
        }
    }

    async fn upload_voice(&self, blob: AudioBlob) -> ChatResult<Message> {
        let user = self.require_user().await?;
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let path = format!("{}/voice-{millis}.{}", user.user_id, blob.extension());

        self.store
            .upload_blob(VOICE_BUCKET, &path, blob.bytes, &blob.content_type)
            .await?;
        let voice_url = self.store.public_url(VOICE_BUCKET, &path);
        tracing::debug!("uploaded voice message to {voice_url}");

        self.store
            .insert_message(NewMessage::voice(user.user_id, voice_url)?)
            .await
    }

    /// The store decides whether the caller may delete; this only forwards.
    pub async fn delete(&self, message_id: &str) -> ChatResult<()> {
        match self.store.delete_message(message_id).await {
            Ok(()) => {
                self.toasts.success("Message deleted");
                Ok(())
            }
            Err(e) => {
                self.toasts.error("Failed to delete message", &e);
                Err(e)
            }
        }
    }

    /// Whether to offer a delete control. Not an authorization check.
    pub async fn can_delete(&self, message: &Message) -> bool {
        self.store
            .current_user()
            .await
            .is_some_and(|user| user.user_id == message.user_id)
    }

    pub async fn edit(&self, message_id: &str, content: &str) -> ChatResult<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.store
            .update_message(message_id, &MessagePatch::edit(content))
            .await
            .inspect_err(|e| self.toasts.error("Failed to edit message", e))
    }

    /// Flips the pin of a message in the local list. Unknown ids do nothing.
    pub async fn toggle_pin(&self, message_id: &str) -> ChatResult<Option<bool>> {
        let current = self
            .messages
            .borrow()
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.is_pinned);
        let Some(current) = current else {
            return Ok(None);
        };

        self.store
            .update_message(message_id, &MessagePatch::pin(!current))
            .await
            .inspect_err(|e| self.toasts.error("Failed to pin message", e))?;
        Ok(Some(!current))
    }

    /// Files a pending report against a message for moderators to review.
    pub async fn report(&self, message_id: &str, reason: &str) -> ChatResult<()> {
        let reported = match self.require_user().await {
            Ok(user) => {
                self.store
                    .report_message(&NewReport::new(message_id, user.user_id, reason.trim()))
                    .await
            }
            Err(e) => Err(e),
        };
        match reported {
            Ok(()) => {
                self.toasts.success("Message reported");
                Ok(())
            }
            Err(e) => {
                self.toasts.error("Failed to report message", &e);
                Err(e)
            }
        }
    }

    pub async fn react(&self, message_id: &str, emoji: &str) -> ChatResult<()> {
        let user = self.require_user().await?;
        self.store
            .add_reaction(message_id, &user.user_id, emoji)
            .await
            .inspect_err(|e| self.toasts.error("Failed to add reaction", e))?;
        self.refresh().await.map(|_| ())
    }
}

impl Drop for MessageSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}
