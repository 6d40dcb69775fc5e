//! Shared setup for the integration tests: a scripted in-memory store whose
//! latency and failures each test controls.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chathub::{
    model::{
        Blob, ChangeEvent, ChangeKind, Credentials, Identity, Message, MessagePatch, MessageQuery,
        NewMessage, NewReport, Profile, ProfilePatch, SignUp, SortOrder, Table,
    },
    remote::{RemoteStore, Subscription},
    ChatError, ChatResult,
};
use time::OffsetDateTime;
use tokio::sync::broadcast;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("chathub=debug")
        .with_test_writer()
        .try_init();
}

pub struct Upload {
    pub bucket: String,
    pub path: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
pub struct ScriptedStore {
    messages: Mutex<Vec<Message>>,
    user: Mutex<Option<Identity>>,
    uploads: Mutex<Vec<Upload>>,
    reports: Mutex<Vec<NewReport>>,
    fetch_delays: Mutex<VecDeque<Duration>>,
    fetches: AtomicUsize,
    inserts: AtomicUsize,
    fail_fetches: AtomicBool,
    fail_inserts: AtomicBool,
    next_id: AtomicUsize,
    changes: Mutex<Option<broadcast::Sender<ChangeEvent>>>,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        let store = Self::default();
        *store.changes.lock().unwrap() = Some(broadcast::channel(16).0);
        Arc::new(store)
    }

    pub fn signed_in(user_id: &str) -> Arc<Self> {
        let store = Self::new();
        store.sign_in_as(user_id);
        store
    }

    pub fn sign_in_as(&self, user_id: &str) {
        *self.user.lock().unwrap() = Some(Identity {
            user_id: user_id.to_owned(),
            email: format!("{user_id}@example.com"),
        });
    }

    /// Adds a row as if another client had written it. No change event is sent.
    pub fn push_message(&self, user_id: &str, content: &str) -> Message {
        let message = self.row(user_id, content.to_owned(), None);
        self.messages.lock().unwrap().push(message.clone());
        message
    }

    pub fn announce(&self, kind: ChangeKind, id: Option<&str>) {
        if let Some(tx) = &*self.changes.lock().unwrap() {
            let _ = tx.send(ChangeEvent {
                table: Table::Messages,
                kind,
                id: id.map(str::to_owned),
            });
        }
    }

    /// The next fetch snapshots the rows when called but only answers after `delay`.
    pub fn delay_next_fetch(&self, delay: Duration) {
        self.fetch_delays.lock().unwrap().push_back(delay);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn row_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn reports(&self) -> Vec<NewReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, String, usize, String)> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .map(|u| (u.bucket.clone(), u.path.clone(), u.bytes.len(), u.content_type.clone()))
            .collect()
    }

    fn row(&self, user_id: &str, content: String, voice_url: Option<String>) -> Message {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Message {
            id: format!("m{n}"),
            content,
            voice_url,
            user_id: user_id.to_owned(),
            created_at: OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(n as i64),
            updated_at: None,
            is_pinned: false,
            is_edited: false,
            reactions: Vec::new(),
            profile: None,
        }
    }
}

#[async_trait]
impl RemoteStore for ScriptedStore {
    async fn fetch_messages(&self, query: &MessageQuery) -> ChatResult<Vec<Message>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut snapshot: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| !query.pinned_only || m.is_pinned)
            .filter(|m| query.before.is_none_or(|before| m.created_at < before))
            .cloned()
            .collect();
        if query.order == SortOrder::Descending {
            snapshot.reverse();
        }
        if let Some(limit) = query.limit {
            snapshot.truncate(limit as usize);
        }
        let delay = self.fetch_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(ChatError::network(anyhow!("connection reset")));
        }
        Ok(snapshot)
    }

    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(ChatError::network(anyhow!("503 Service Unavailable")));
        }
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let row = self.row(&message.user_id, message.content, message.voice_url);
        self.messages.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn update_message(&self, id: &str, patch: &MessagePatch) -> ChatResult<()> {
        let mut messages = self.messages.lock().unwrap();
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| ChatError::NotFound(format!("message {id}")))?;
        if let Some(content) = &patch.content {
            message.content = content.clone();
        }
        if let Some(is_pinned) = patch.is_pinned {
            message.is_pinned = is_pinned;
        }
        if let Some(is_edited) = patch.is_edited {
            message.is_edited = is_edited;
        }
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> ChatResult<()> {
        let user = self.user.lock().unwrap().clone().ok_or(ChatError::NotSignedIn)?;
        let mut messages = self.messages.lock().unwrap();
        match messages.iter().position(|m| m.id == id) {
            Some(at) if messages[at].user_id == user.user_id => {
                messages.remove(at);
                Ok(())
            }
            _ => Err(ChatError::Permission),
        }
    }

    async fn add_reaction(&self, _message_id: &str, _user_id: &str, _emoji: &str) -> ChatResult<()> {
        Ok(())
    }

    async fn report_message(&self, report: &NewReport) -> ChatResult<()> {
        if !self.messages.lock().unwrap().iter().any(|m| m.id == report.message_id) {
            return Err(ChatError::NotFound(format!("message {}", report.message_id)));
        }
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }

    fn subscribe(&self, table: Table) -> Subscription {
        let guard = self.changes.lock().unwrap();
        let rx = match &*guard {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        Subscription::new(table, rx)
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> ChatResult<()> {
        self.uploads.lock().unwrap().push(Upload {
            bucket: bucket.to_owned(),
            path: path.to_owned(),
            bytes,
            content_type: content_type.to_owned(),
        });
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("https://cdn.example.com/{bucket}/{path}")
    }

    async fn download_blob(&self, _bucket: &str, _path: &str) -> ChatResult<Option<Blob>> {
        Ok(None)
    }

    async fn current_user(&self) -> Option<Identity> {
        self.user.lock().unwrap().clone()
    }

    async fn sign_in(&self, credentials: &Credentials) -> ChatResult<Identity> {
        let identity = Identity {
            user_id: credentials.email.split('@').next().unwrap_or_default().to_owned(),
            email: credentials.email.clone(),
        };
        *self.user.lock().unwrap() = Some(identity.clone());
        Ok(identity)
    }

    async fn sign_up(&self, details: &SignUp) -> ChatResult<Identity> {
        self.sign_in(&Credentials {
            email: details.email.clone(),
            password: details.password.clone(),
        })
        .await
    }

    async fn sign_out(&self) -> ChatResult<()> {
        *self.user.lock().unwrap() = None;
        Ok(())
    }

    async fn fetch_profile(&self, _id: &str) -> ChatResult<Option<Profile>> {
        Ok(None)
    }

    async fn update_profile(&self, _id: &str, _patch: &ProfilePatch) -> ChatResult<()> {
        Ok(())
    }

    async fn search_profiles(&self, _term: &str) -> ChatResult<Vec<Profile>> {
        Ok(Vec::new())
    }
}
