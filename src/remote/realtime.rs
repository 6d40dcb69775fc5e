//! Hosted change feed: the realtime websocket, spoken as Phoenix channel frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    sync::{broadcast, watch},
    time::{interval_at, sleep, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as Frame},
};

use crate::model::{ChangeEvent, ChangeKind, Table};

pub const HEARTBEAT: Duration = Duration::from_secs(30);
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const TABLES: [Table; 3] = [Table::Messages, Table::MessageReactions, Table::Profiles];

/// `http(s)://host` becomes `ws(s)://host/realtime/v1/websocket?apikey=..`.
pub fn socket_url(base_url: &str, api_key: &str) -> String {
    let base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_owned()
    };
    format!(
        "{}/realtime/v1/websocket?apikey={api_key}&vsn=1.0.0",
        base.trim_end_matches('/')
    )
}

fn topic(table: Table) -> String {
    format!("realtime:{}", table.name())
}

fn join_frame(table: Table, access_token: &str, reference: u64) -> Frame {
    let reference = reference.to_string();
    Frame::text(
        json!({
            "topic": topic(table),
            "event": "phx_join",
            "payload": {
                "config": {
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": table.name() }
                    ],
                },
                "access_token": access_token,
            },
            "ref": reference,
            "join_ref": reference,
        })
        .to_string(),
    )
}

fn token_frame(table: Table, access_token: &str, reference: u64) -> Frame {
    Frame::text(
        json!({
            "topic": topic(table),
            "event": "access_token",
            "payload": { "access_token": access_token },
            "ref": reference.to_string(),
        })
        .to_string(),
    )
}

fn heartbeat_frame(reference: u64) -> Frame {
    Frame::text(
        json!({
            "topic": "phoenix",
            "event": "heartbeat",
            "payload": {},
            "ref": reference.to_string(),
        })
        .to_string(),
    )
}

#[derive(Deserialize)]
struct Incoming {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct ChangesPayload {
    data: ChangeData,
}

#[derive(Deserialize)]
struct ChangeData {
    table: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

/// Maps a `postgres_changes` frame onto the change feed. Anything else,
/// including tables this client does not know, yields `None`.
pub fn change_event(text: &str) -> Option<ChangeEvent> {
    let incoming: Incoming = serde_json::from_str(text).ok()?;
    if incoming.event != "postgres_changes" {
        if incoming.event == "phx_reply" && incoming.payload["status"] != "ok" {
            tracing::warn!("realtime {} refused: {}", incoming.topic, incoming.payload);
        }
        return None;
    }

    let data = serde_json::from_value::<ChangesPayload>(incoming.payload).ok()?.data;
    let table = Table::from_name(&data.table)?;
    let kind = match data.kind.as_str() {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };
    let id = [&data.record, &data.old_record]
        .into_iter()
        .flatten()
        .find_map(|row| row.get("id")?.as_str().map(str::to_owned));
    Some(ChangeEvent { table, kind, id })
}

enum Ended {
    Closed,
    Shutdown,
}

/// Keeps one socket open, reconnecting with backoff, until the token sender
/// goes away. `None` tokens fall back to the api key.
pub async fn run(
    url: String,
    api_key: String,
    mut token: watch::Receiver<Option<String>>,
    changes: broadcast::Sender<ChangeEvent>,
) {
    let mut backoff = MIN_BACKOFF;
    loop {
        match session(&url, &api_key, &mut token, &changes).await {
            Ok(Ended::Shutdown) => break,
            Ok(Ended::Closed) => {
                tracing::info!("realtime socket closed, reconnecting");
                backoff = MIN_BACKOFF;
            }
            Err(e) => {
                tracing::warn!("realtime socket failed: {e}, retrying in {backoff:?}");
            }
        }

        tokio::select! {
            _ = sleep(backoff) => {}
            changed = token.changed() => if changed.is_err() {
                break;
            },
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    tracing::debug!("realtime stopped");
}

async fn session(
    url: &str,
    api_key: &str,
    token: &mut watch::Receiver<Option<String>>,
    changes: &broadcast::Sender<ChangeEvent>,
) -> Result<Ended, WsError> {
    let (socket, _) = connect_async(url).await?;
    let (mut sink, mut stream) = socket.split();
    let mut reference = 0;

    let access = token.borrow_and_update().clone().unwrap_or_else(|| api_key.to_owned());
    for table in TABLES {
        reference += 1;
        sink.send(join_frame(table, &access, reference)).await?;
    }
    tracing::info!("realtime joined {} tables", TABLES.len());

    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT, HEARTBEAT);
    let ended = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Frame::Text(text))) => {
                    if let Some(event) = change_event(text.as_str()) {
                        tracing::debug!(kind = ?event.kind, id = ?event.id, "{} changed remotely", event.table.name());
                        let _ = changes.send(event);
                    }
                }
                Some(Ok(Frame::Close(_))) | None => break Ok(Ended::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e),
            },
            _ = heartbeat.tick() => {
                reference += 1;
                if let Err(e) = sink.send(heartbeat_frame(reference)).await {
                    break Err(e);
                }
            }
            changed = token.changed() => {
                if changed.is_err() {
                    let _ = sink.close().await;
                    return Ok(Ended::Shutdown);
                }
                let access = token.borrow_and_update().clone().unwrap_or_else(|| api_key.to_owned());
                for table in TABLES {
                    reference += 1;
                    sink.send(token_frame(table, &access, reference)).await?;
                }
            }
        }
    };

    // whatever changed while the socket was down is only seen by a full refresh
    for table in TABLES {
        let _ = changes.send(ChangeEvent { table, kind: ChangeKind::Resync, id: None });
    }
    ended
}
