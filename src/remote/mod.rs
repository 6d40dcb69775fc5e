//! The hosted backend, seen from the client: rows, objects, identity, change feed.

mod realtime;
mod rest;
mod sqlite;

pub use rest::RestStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    model::{
        Blob, ChangeEvent, ChangeKind, Credentials, Identity, Message, MessagePatch, MessageQuery,
        NewMessage, NewReport, Profile, ProfilePatch, SignUp, Table,
    },
    ChatResult,
};

pub const VOICE_BUCKET: &str = "voice-messages";

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Messages joined with their author's profile fields.
    async fn fetch_messages(&self, query: &MessageQuery) -> ChatResult<Vec<Message>>;
    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message>;
    async fn update_message(&self, id: &str, patch: &MessagePatch) -> ChatResult<()>;
    async fn delete_message(&self, id: &str) -> ChatResult<()>;
    async fn add_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> ChatResult<()>;
    async fn report_message(&self, report: &NewReport) -> ChatResult<()>;

    /// Change notifications for `table`. Dropping the subscription unsubscribes.
    fn subscribe(&self, table: Table) -> Subscription;

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> ChatResult<()>;
    fn public_url(&self, bucket: &str, path: &str) -> String;
    async fn download_blob(&self, bucket: &str, path: &str) -> ChatResult<Option<Blob>>;

    async fn current_user(&self) -> Option<Identity>;
    async fn sign_in(&self, credentials: &Credentials) -> ChatResult<Identity>;
    /// Creates the account and its profile. Signs in when the backend hands
    /// out a session right away.
    async fn sign_up(&self, details: &SignUp) -> ChatResult<Identity>;
    async fn sign_out(&self) -> ChatResult<()>;

    async fn fetch_profile(&self, id: &str) -> ChatResult<Option<Profile>>;
    async fn update_profile(&self, id: &str, patch: &ProfilePatch) -> ChatResult<()>;
    /// Case-insensitive substring match on `full_name`, ordered by name.
    async fn search_profiles(&self, term: &str) -> ChatResult<Vec<Profile>>;
}

/// Receiving end of a store's change feed, narrowed to one table.
pub struct Subscription {
    table: Table,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(table: Table, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { table, rx }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Next event for this table; `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.table == self.table => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!("{} feed lagged by {missed} events", self.table.name());
                    return Some(ChangeEvent {
                        table: self.table,
                        kind: ChangeKind::Resync,
                        id: None,
                    });
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
