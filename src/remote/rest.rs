use std::sync::{Mutex, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::{header, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use tokio::{
    sync::{broadcast, watch, RwLock},
    task::JoinHandle,
};

use crate::{
    model::{
        summarize_reactions, Blob, ChangeEvent, ChangeKind, Credentials, Identity, Message,
        MessagePatch, MessageQuery, NewMessage, NewReport, Profile, ProfilePatch, SignUp,
        SortOrder, Table,
    },
    ChatError, ChatResult,
};

use super::{realtime, RemoteStore, Subscription};

const MESSAGE_SELECT: &str =
    "*,profiles:user_id(full_name,avatar_url,email),message_reactions(emoji,user_id)";

/// Client for a Supabase-style hosted backend: PostgREST rows under
/// `/rest/v1`, objects under `/storage/v1`, password auth under `/auth/v1`.
///
/// Own writes are echoed on the change feed straight away. Other clients'
/// writes arrive once [`RestStore::start_realtime`] has opened the socket.
pub struct RestStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    session: RwLock<Option<Session>>,
    changes: broadcast::Sender<ChangeEvent>,
    // access token the realtime socket authenticates with
    token: watch::Sender<Option<String>>,
    realtime: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
struct Session {
    access_token: String,
    identity: Identity,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    user: TokenUser,
}

#[derive(Deserialize)]
struct TokenUser {
    id: String,
    email: Option<String>,
}

/// With email confirmation on, sign-up answers with the bare user.
#[derive(Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(TokenUser),
}

#[derive(Deserialize)]
struct ReactionRow {
    emoji: String,
    user_id: String,
}

/// A message row as PostgREST returns it, with the embedded reaction rows.
#[derive(Deserialize)]
struct MessageRow {
    #[serde(flatten)]
    message: Message,
    #[serde(default)]
    message_reactions: Vec<ReactionRow>,
}

#[derive(Serialize)]
struct ReactionInsert<'a> {
    message_id: &'a str,
    user_id: &'a str,
    emoji: &'a str,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> ChatResult<Self> {
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            session: RwLock::new(None),
            changes: broadcast::channel(256).0,
            token: watch::channel(None).0,
            realtime: Mutex::new(None),
        })
    }

    /// Opens the realtime socket and feeds remote row changes into
    /// [`RemoteStore::subscribe`]. Calling it again restarts the socket.
    pub fn start_realtime(&self) {
        let task = tokio::spawn(realtime::run(
            realtime::socket_url(&self.base_url, &self.api_key),
            self.api_key.clone(),
            self.token.subscribe(),
            self.changes.clone(),
        ));
        let previous = self
            .realtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn start_session(&self, access_token: String, identity: Identity) {
        self.token.send_replace(Some(access_token.clone()));
        *self.session.write().await = Some(Session {
            access_token,
            identity,
        });
    }

    fn rest(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = match &*self.session.read().await {
            Some(session) => session.access_token.clone(),
            None => self.api_key.clone(),
        };
        request
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    async fn send(&self, request: RequestBuilder) -> ChatResult<Response> {
        let response = self.authorized(request).await.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::FORBIDDEN {
            return Err(ChatError::Permission);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ChatError::network(anyhow!("{status}: {body}")))
    }

    fn notify(&self, table: Table, kind: ChangeKind, id: Option<&str>) {
        let _ = self.changes.send(ChangeEvent {
            table,
            kind,
            id: id.map(str::to_owned),
        });
    }

    async fn viewer(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.identity.user_id.clone())
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn fetch_messages(&self, query: &MessageQuery) -> ChatResult<Vec<Message>> {
        let order = match query.order {
            SortOrder::Ascending => "created_at.asc",
            SortOrder::Descending => "created_at.desc",
        };
        let mut params = vec![("select", MESSAGE_SELECT.to_owned()), ("order", order.to_owned())];
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        if query.pinned_only {
            params.push(("is_pinned", "eq.true".to_owned()));
        }
        if let Some(before) = query.before {
            let before = before
                .format(&Rfc3339)
                .map_err(|e| ChatError::Storage(e.into()))?;
            params.push(("created_at", format!("lt.{before}")));
        }

        let rows: Vec<MessageRow> = self
            .send(self.http.get(self.rest(Table::Messages)).query(&params))
            .await?
            .json()
            .await?;

        let viewer = self.viewer().await;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut message = row.message;
                message.reactions = summarize_reactions(
                    row.message_reactions
                        .iter()
                        .map(|r| (r.emoji.as_str(), r.user_id.as_str())),
                    viewer.as_deref(),
                );
                message
            })
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message> {
        let rows: Vec<Message> = self
            .send(
                self.http
                    .post(self.rest(Table::Messages))
                    .header("Prefer", "return=representation")
                    .json(&[&message]),
            )
            .await?
            .json()
            .await?;
        let inserted = rows
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::network(anyhow!("insert returned no row")))?;
        self.notify(Table::Messages, ChangeKind::Insert, Some(&inserted.id));
        Ok(inserted)
    }

    async fn update_message(&self, id: &str, patch: &MessagePatch) -> ChatResult<()> {
        self.send(
            self.http
                .patch(self.rest(Table::Messages))
                .query(&[("id", format!("eq.{id}"))])
                .json(patch),
        )
        .await?;
        self.notify(Table::Messages, ChangeKind::Update, Some(id));
        Ok(())
    }

    /// Row-level security hides rows the caller may not delete, so an empty
    /// result means the delete was refused.
    async fn delete_message(&self, id: &str) -> ChatResult<()> {
        let deleted: Vec<serde_json::Value> = self
            .send(
                self.http
                    .delete(self.rest(Table::Messages))
                    .header("Prefer", "return=representation")
                    .query(&[("id", format!("eq.{id}"))]),
            )
            .await?
            .json()
            .await?;
        if deleted.is_empty() {
            return Err(ChatError::Permission);
        }
        self.notify(Table::Messages, ChangeKind::Delete, Some(id));
        Ok(())
    }

    async fn add_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> ChatResult<()> {
        self.send(
            self.http
                .post(self.rest(Table::MessageReactions))
                .json(&[ReactionInsert { message_id, user_id, emoji }]),
        )
        .await?;
        self.notify(Table::MessageReactions, ChangeKind::Insert, Some(message_id));
        Ok(())
    }

    async fn report_message(&self, report: &NewReport) -> ChatResult<()> {
        self.send(self.http.post(self.rest(Table::MessageReports)).json(&[report]))
            .await?;
        self.notify(Table::MessageReports, ChangeKind::Insert, Some(&report.message_id));
        Ok(())
    }

    fn subscribe(&self, table: Table) -> Subscription {
        Subscription::new(table, self.changes.subscribe())
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> ChatResult<()> {
        self.send(
            self.http
                .post(format!("{}/storage/v1/object/{bucket}/{path}", self.base_url))
                .header(header::CONTENT_TYPE, content_type)
                .body(bytes),
        )
        .await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{path}", self.base_url)
    }

    async fn download_blob(&self, bucket: &str, path: &str) -> ChatResult<Option<Blob>> {
        let response = self
            .authorized(self.http.get(self.public_url(bucket, path)))
            .await
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_owned();
        let bytes = response.bytes().await?.to_vec();
        Ok(Some(Blob { bytes, content_type }))
    }

    async fn current_user(&self) -> Option<Identity> {
        self.session.read().await.as_ref().map(|s| s.identity.clone())
    }

    async fn sign_in(&self, credentials: &Credentials) -> ChatResult<Identity> {
        let token: TokenResponse = self
            .send(
                self.http
                    .post(format!("{}/auth/v1/token", self.base_url))
                    .query(&[("grant_type", "password")])
                    .json(&serde_json::json!({
                        "email": credentials.email,
                        "password": credentials.password,
                    })),
            )
            .await?
            .json()
            .await?;

        let identity = Identity {
            user_id: token.user.id,
            email: token.user.email.unwrap_or_else(|| credentials.email.clone()),
        };
        self.start_session(token.access_token, identity.clone()).await;
        Ok(identity)
    }

    /// The full name rides along as user metadata; the backend creates the
    /// profile row from it.
    async fn sign_up(&self, details: &SignUp) -> ChatResult<Identity> {
        let request = self
            .http
            .post(format!("{}/auth/v1/signup", self.base_url))
            .json(&serde_json::json!({
                "email": details.email,
                "password": details.password,
                "data": { "full_name": details.full_name.trim() },
            }));
        let response = self.authorized(request).await.send().await?;
        let status = response.status();
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(ChatError::AlreadyRegistered(details.email.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::network(anyhow!("{status}: {body}")));
        }

        let (user, access_token) = match response.json::<SignUpResponse>().await? {
            SignUpResponse::Session(token) => (token.user, Some(token.access_token)),
            SignUpResponse::User(user) => (user, None),
        };
        let identity = Identity {
            user_id: user.id,
            email: user.email.unwrap_or_else(|| details.email.clone()),
        };
        match access_token {
            Some(access_token) => self.start_session(access_token, identity.clone()).await,
            None => tracing::info!("{} must confirm their email before signing in", identity.email),
        }
        Ok(identity)
    }

    async fn sign_out(&self) -> ChatResult<()> {
        if self.session.read().await.is_none() {
            return Ok(());
        }
        let result = self
            .send(self.http.post(format!("{}/auth/v1/logout", self.base_url)))
            .await;
        // the local session goes away even if the backend could not be told
        *self.session.write().await = None;
        self.token.send_replace(None);
        result.map(|_| ())
    }

    async fn fetch_profile(&self, id: &str) -> ChatResult<Option<Profile>> {
        let rows: Vec<Profile> = self
            .send(
                self.http
                    .get(self.rest(Table::Profiles))
                    .query(&[("select", "*".to_owned()), ("id", format!("eq.{id}"))]),
            )
            .await?
            .json()
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn update_profile(&self, id: &str, patch: &ProfilePatch) -> ChatResult<()> {
        self.send(
            self.http
                .patch(self.rest(Table::Profiles))
                .query(&[("id", format!("eq.{id}"))])
                .json(patch),
        )
        .await?;
        self.notify(Table::Profiles, ChangeKind::Update, Some(id));
        Ok(())
    }

    async fn search_profiles(&self, term: &str) -> ChatResult<Vec<Profile>> {
        Ok(self
            .send(self.http.get(self.rest(Table::Profiles)).query(&[
                ("select", "*".to_owned()),
                ("full_name", ilike_filter(term)),
                ("order", "full_name".to_owned()),
            ]))
            .await?
            .json()
            .await?)
    }
}

impl Drop for RestStore {
    fn drop(&mut self) {
        if let Some(task) = self.realtime.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

/// `ilike` filter matching `term` anywhere. LIKE wildcards in the term are
/// escaped, and the value is quoted so PostgREST reserved characters stay
/// literal. `*` is PostgREST's wildcard even inside quotes, so a literal one
/// can only be matched as a single-character `_`.
fn ilike_filter(term: &str) -> String {
    let mut pattern = String::from("*");
    for c in term.chars() {
        match c {
            '\\' | '%' | '_' => {
                pattern.push('\\');
                pattern.push(c);
            }
            '*' => pattern.push('_'),
            c => pattern.push(c),
        }
    }
    pattern.push('*');
    let quoted = pattern.replace('\\', "\\\\").replace('"', "\\\"");
    format!("ilike.\"{quoted}\"")
}
