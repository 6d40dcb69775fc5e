use std::str::FromStr;

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use time::OffsetDateTime;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::{
    model::{
        summarize_reactions, AuthorProfile, Blob, ChangeEvent, ChangeKind, Credentials, Identity,
        Message, MessagePatch, MessageQuery, NewMessage, NewReport, Profile, ProfilePatch, SignUp,
        SortOrder, Table,
    },
    ChatError, ChatResult,
};

use super::{RemoteStore, Subscription};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS profiles (
        id TEXT PRIMARY KEY,
        email TEXT UNIQUE,
        full_name TEXT,
        avatar_url TEXT,
        theme TEXT,
        bubble_style TEXT,
        primary_color TEXT,
        message_alignment TEXT,
        enable_sounds BOOLEAN,
        show_timestamps BOOLEAN,
        show_read_receipts BOOLEAN,
        enable_notifications BOOLEAN
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        voice_url TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER,
        is_pinned BOOLEAN NOT NULL DEFAULT 0,
        is_edited BOOLEAN NOT NULL DEFAULT 0,
        CHECK (content <> '' OR voice_url IS NOT NULL)
    )",
    "CREATE TABLE IF NOT EXISTS message_reactions (
        message_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        emoji TEXT NOT NULL,
        UNIQUE (message_id, user_id, emoji)
    )",
    "CREATE TABLE IF NOT EXISTS message_reports (
        id TEXT PRIMARY KEY,
        message_id TEXT NOT NULL,
        reporter_id TEXT NOT NULL,
        reason TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS blobs (
        bucket TEXT NOT NULL,
        path TEXT NOT NULL,
        content_type TEXT NOT NULL,
        bytes BLOB NOT NULL,
        PRIMARY KEY (bucket, path)
    )",
];

type MessageRow = (
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<i64>,
    bool,
    bool,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

type ProfileRow = (
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<bool>,
    Option<bool>,
    Option<bool>,
    Option<bool>,
);

const PROFILE_COLUMNS: &str = "id,email,full_name,avatar_url,theme,bubble_style,primary_color,\
    message_alignment,enable_sounds,show_timestamps,show_read_receipts,enable_notifications";

/// Local stand-in for the hosted backend. Row-level rules: only the author may
/// delete or re-word a message.
pub struct SqliteStore {
    db_pool: SqlitePool,
    public_base_url: String,
    changes: broadcast::Sender<ChangeEvent>,
    identity: RwLock<Option<Identity>>,
}

impl SqliteStore {
    pub async fn connect(database_url: &str, public_base_url: impl Into<String>) -> ChatResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool_options = if database_url.contains(":memory:") {
            // every pooled connection would otherwise see its own empty database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(16)
        };
        let db_pool = pool_options.connect_with(options).await?;
        Self::with_pool(db_pool, public_base_url).await
    }

    pub async fn with_pool(db_pool: SqlitePool, public_base_url: impl Into<String>) -> ChatResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&db_pool).await?;
        }
        Ok(Self {
            db_pool,
            public_base_url: public_base_url.into(),
            changes: broadcast::channel(256).0,
            identity: RwLock::new(None),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    fn notify(&self, table: Table, kind: ChangeKind, id: Option<&str>) {
        let _ = self.changes.send(ChangeEvent {
            table,
            kind,
            id: id.map(str::to_owned),
        });
    }

    async fn require_user(&self) -> ChatResult<Identity> {
        self.identity.read().await.clone().ok_or(ChatError::NotSignedIn)
    }
}

fn nanos(at: OffsetDateTime) -> ChatResult<i64> {
    i64::try_from(at.unix_timestamp_nanos())
        .map_err(|_| ChatError::Storage(anyhow!("timestamp {at} does not fit the store")))
}

fn from_nanos(value: i64) -> ChatResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(value.into()).map_err(ChatError::network)
}

fn row_to_message(row: MessageRow) -> ChatResult<Message> {
    let (
        id,
        user_id,
        content,
        voice_url,
        created_at,
        updated_at,
        is_pinned,
        is_edited,
        profile_id,
        full_name,
        avatar_url,
        email,
    ) = row;
    Ok(Message {
        id,
        content,
        voice_url,
        user_id,
        created_at: from_nanos(created_at)?,
        updated_at: updated_at.map(from_nanos).transpose()?,
        is_pinned,
        is_edited,
        reactions: Vec::new(),
        profile: profile_id.map(|_| AuthorProfile {
            full_name,
            avatar_url,
            email,
        }),
    })
}

fn row_to_profile(row: ProfileRow) -> Profile {
    let (
        id,
        email,
        full_name,
        avatar_url,
        theme,
        bubble_style,
        primary_color,
        message_alignment,
        enable_sounds,
        show_timestamps,
        show_read_receipts,
        enable_notifications,
    ) = row;
    Profile {
        id,
        email,
        full_name,
        avatar_url,
        theme,
        bubble_style,
        primary_color,
        message_alignment,
        enable_sounds,
        show_timestamps,
        show_read_receipts,
        enable_notifications,
    }
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn fetch_messages(&self, query: &MessageQuery) -> ChatResult<Vec<Message>> {
        let direction = match query.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let mut conditions = Vec::new();
        if query.pinned_only {
            conditions.push("m.is_pinned");
        }
        if query.before.is_some() {
            conditions.push("m.created_at < ?");
        }
        let filter = match conditions.is_empty() {
            true => String::new(),
            false => format!("WHERE {}", conditions.join(" AND ")),
        };
        let sql = format!(
            "SELECT m.id,m.user_id,m.content,m.voice_url,m.created_at,m.updated_at,m.is_pinned,m.is_edited,\
                    p.id,p.full_name,p.avatar_url,p.email \
             FROM messages m LEFT JOIN profiles p ON p.id=m.user_id \
             {filter} ORDER BY m.created_at {direction}, m.rowid {direction} LIMIT ?"
        );
        let limit = query.limit.map(i64::from).unwrap_or(-1);
        let mut select = sqlx::query_as::<_, MessageRow>(&sql);
        if let Some(before) = query.before {
            select = select.bind(nanos(before)?);
        }
        let rows = select.bind(limit).fetch_all(&self.db_pool).await?;

        let mut messages = rows
            .into_iter()
            .map(row_to_message)
            .collect::<ChatResult<Vec<_>>>()?;

        let reactions: Vec<(String, String, String)> =
            sqlx::query_as("SELECT message_id,emoji,user_id FROM message_reactions ORDER BY rowid")
                .fetch_all(&self.db_pool)
                .await?;
        let viewer = self.identity.read().await.as_ref().map(|i| i.user_id.clone());
        for message in &mut messages {
            message.reactions = summarize_reactions(
                reactions
                    .iter()
                    .filter(|(message_id, _, _)| *message_id == message.id)
                    .map(|(_, emoji, user_id)| (emoji.as_str(), user_id.as_str())),
                viewer.as_deref(),
            );
        }

        Ok(messages)
    }

    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message> {
        let id = Uuid::now_v7().to_string();
        let created_at = message.created_at.unwrap_or_else(OffsetDateTime::now_utc);
        sqlx::query("INSERT INTO messages (id,user_id,content,voice_url,created_at) VALUES (?,?,?,?,?)")
            .bind(&id)
            .bind(&message.user_id)
            .bind(&message.content)
            .bind(&message.voice_url)
            .bind(nanos(created_at)?)
            .execute(&self.db_pool)
            .await?;

        self.notify(Table::Messages, ChangeKind::Insert, Some(&id));

        let profile: Option<(Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT full_name,avatar_url,email FROM profiles WHERE id=?")
                .bind(&message.user_id)
                .fetch_optional(&self.db_pool)
                .await?;

        Ok(Message {
            id,
            content: message.content,
            voice_url: message.voice_url,
            user_id: message.user_id,
            created_at,
            updated_at: None,
            is_pinned: false,
            is_edited: false,
            reactions: Vec::new(),
            profile: profile.map(|(full_name, avatar_url, email)| AuthorProfile {
                full_name,
                avatar_url,
                email,
            }),
        })
    }

    async fn update_message(&self, id: &str, patch: &MessagePatch) -> ChatResult<()> {
        if patch.content.is_some() {
            let user = self.require_user().await?;
            let owner: Option<(String,)> = sqlx::query_as("SELECT user_id FROM messages WHERE id=?")
                .bind(id)
                .fetch_optional(&self.db_pool)
                .await?;
            if owner.is_some_and(|(owner,)| owner != user.user_id) {
                return Err(ChatError::Permission);
            }
        }

        let result = sqlx::query(
            "UPDATE messages SET content=COALESCE(?,content), is_pinned=COALESCE(?,is_pinned), \
             is_edited=COALESCE(?,is_edited), updated_at=COALESCE(?,updated_at) WHERE id=?",
        )
        .bind(&patch.content)
        .bind(patch.is_pinned)
        .bind(patch.is_edited)
        .bind(patch.updated_at.map(nanos).transpose()?)
        .bind(id)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound(format!("message {id}")));
        }
        self.notify(Table::Messages, ChangeKind::Update, Some(id));
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> ChatResult<()> {
        let user = self.require_user().await?;
        let result = sqlx::query("DELETE FROM messages WHERE id=? AND user_id=?")
            .bind(id)
            .bind(&user.user_id)
            .execute(&self.db_pool)
            .await?;
        if result.rows_affected() == 0 {
            tracing::debug!("refusing to delete message {id} for {}", user.user_id);
            return Err(ChatError::Permission);
        }

        sqlx::query("DELETE FROM message_reactions WHERE message_id=?")
            .bind(id)
            .execute(&self.db_pool)
            .await?;

        self.notify(Table::Messages, ChangeKind::Delete, Some(id));
        Ok(())
    }

    async fn add_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> ChatResult<()> {
        sqlx::query("INSERT OR IGNORE INTO message_reactions (message_id,user_id,emoji) VALUES (?,?,?)")
            .bind(message_id)
            .bind(user_id)
            .bind(emoji)
            .execute(&self.db_pool)
            .await?;
        self.notify(Table::MessageReactions, ChangeKind::Insert, Some(message_id));
        Ok(())
    }

    async fn report_message(&self, report: &NewReport) -> ChatResult<()> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM messages WHERE id=?")
            .bind(&report.message_id)
            .fetch_optional(&self.db_pool)
            .await?;
        if exists.is_none() {
            return Err(ChatError::NotFound(format!("message {}", report.message_id)));
        }

        let id = Uuid::now_v7().to_string();
        sqlx::query(
            "INSERT INTO message_reports (id,message_id,reporter_id,reason,status,created_at) \
             VALUES (?,?,?,?,?,?)",
        )
        .bind(&id)
        .bind(&report.message_id)
        .bind(&report.reporter_id)
        .bind(&report.reason)
        .bind(report.status)
        .bind(nanos(OffsetDateTime::now_utc())?)
        .execute(&self.db_pool)
        .await?;
        self.notify(Table::MessageReports, ChangeKind::Insert, Some(&id));
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
        sqlx::query("INSERT INTO blobs (bucket,path,content_type,bytes) VALUES (?,?,?,?)")
            .bind(bucket)
            .bind(path)
            .bind(content_type)
            .bind(bytes)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/{bucket}/{path}", self.public_base_url.trim_end_matches('/'))
    }

    async fn download_blob(&self, bucket: &str, path: &str) -> ChatResult<Option<Blob>> {
        let blob: Option<(Vec<u8>, String)> =
            sqlx::query_as("SELECT bytes,content_type FROM blobs WHERE bucket=? AND path=?")
                .bind(bucket)
                .bind(path)
                .fetch_optional(&self.db_pool)
                .await?;
        Ok(blob.map(|(bytes, content_type)| Blob { bytes, content_type }))
    }

    async fn current_user(&self) -> Option<Identity> {
        self.identity.read().await.clone()
    }

    /// Finds or creates the profile for this email. No password check.
    async fn sign_in(&self, credentials: &Credentials) -> ChatResult<Identity> {
        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM profiles WHERE email=?")
            .bind(&credentials.email)
            .fetch_optional(&self.db_pool)
            .await?;

        let user_id = match existing {
            Some((id,)) => id,
            None => {
                let id = Uuid::now_v7().to_string();
                tracing::info!("creating profile {id} for {}", credentials.email);
                sqlx::query("INSERT INTO profiles (id,email) VALUES (?,?)")
                    .bind(&id)
                    .bind(&credentials.email)
                    .execute(&self.db_pool)
                    .await?;
                self.notify(Table::Profiles, ChangeKind::Insert, Some(&id));
                id
            }
        };

        let identity = Identity {
            user_id,
            email: credentials.email.clone(),
        };
        *self.identity.write().await = Some(identity.clone());
        Ok(identity)
    }

    async fn sign_up(&self, details: &SignUp) -> ChatResult<Identity> {
        let taken: Option<(String,)> = sqlx::query_as("SELECT id FROM profiles WHERE email=?")
            .bind(&details.email)
            .fetch_optional(&self.db_pool)
            .await?;
        if taken.is_some() {
            return Err(ChatError::AlreadyRegistered(details.email.clone()));
        }

        let id = Uuid::now_v7().to_string();
        sqlx::query("INSERT INTO profiles (id,email,full_name) VALUES (?,?,?)")
            .bind(&id)
            .bind(&details.email)
            .bind(details.full_name.trim())
            .execute(&self.db_pool)
            .await?;
        tracing::info!("registered {} as {id}", details.email);
        self.notify(Table::Profiles, ChangeKind::Insert, Some(&id));

        let identity = Identity {
            user_id: id,
            email: details.email.clone(),
        };
        *self.identity.write().await = Some(identity.clone());
        Ok(identity)
    }

    async fn sign_out(&self) -> ChatResult<()> {
        *self.identity.write().await = None;
        Ok(())
    }

    async fn fetch_profile(&self, id: &str) -> ChatResult<Option<Profile>> {
        let row: Option<ProfileRow> =
            sqlx::query_as(&format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id=?"))
                .bind(id)
                .fetch_optional(&self.db_pool)
                .await?;
        Ok(row.map(row_to_profile))
    }

    async fn update_profile(&self, id: &str, patch: &ProfilePatch) -> ChatResult<()> {
        let result = sqlx::query(
            "UPDATE profiles SET full_name=COALESCE(?,full_name), avatar_url=COALESCE(?,avatar_url), \
             theme=COALESCE(?,theme), bubble_style=COALESCE(?,bubble_style), \
             primary_color=COALESCE(?,primary_color), message_alignment=COALESCE(?,message_alignment), \
             enable_sounds=COALESCE(?,enable_sounds), show_timestamps=COALESCE(?,show_timestamps), \
             show_read_receipts=COALESCE(?,show_read_receipts), \
             enable_notifications=COALESCE(?,enable_notifications) WHERE id=?",
        )
        .bind(&patch.full_name)
        .bind(&patch.avatar_url)
        .bind(&patch.theme)
        .bind(&patch.bubble_style)
        .bind(&patch.primary_color)
        .bind(&patch.message_alignment)
        .bind(patch.enable_sounds)
        .bind(patch.show_timestamps)
        .bind(patch.show_read_receipts)
        .bind(patch.enable_notifications)
        .bind(id)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound(format!("profile {id}")));
        }
        self.notify(Table::Profiles, ChangeKind::Update, Some(id));
        Ok(())
    }

    async fn search_profiles(&self, term: &str) -> ChatResult<Vec<Profile>> {
        let rows: Vec<ProfileRow> = sqlx::query_as(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE full_name LIKE ? ESCAPE '\\' ORDER BY full_name"
        ))
        .bind(like_pattern(term))
        .fetch_all(&self.db_pool)
        .await?;
        Ok(rows.into_iter().map(row_to_profile).collect())
    }
}
