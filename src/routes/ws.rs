use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::{model::Message, notify::Notice, sync::MessageSync};

use super::messages::SendMessageQuery;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Push<'a> {
    Messages { messages: &'a [Message] },
    Notice { notice: &'a Notice },
}

fn frame(push: &Push) -> Option<WsMessage> {
    match serde_json::to_string(push) {
        Ok(text) => Some(WsMessage::Text(text.into())),
        Err(e) => {
            tracing::warn!("unserializable push frame: {e}");
            None
        }
    }
}

/// Pushes the whole list whenever it changes, and every toast. Incoming
/// `{"content": ...}` frames are sent as messages.
#[debug_handler(state = crate::AppState)]
pub async fn chat_ws(
    State(sync): State<Arc<MessageSync>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(async move |stream| {
        let mut messages = sync.watch_messages();
        let mut notices = sync.toasts().subscribe();
        let (mut sender, mut receiver) = stream.split();

        let mut push_task = tokio::spawn(async move {
            let first = {
                let list = messages.borrow_and_update();
                frame(&Push::Messages { messages: &list })
            };
            if let Some(first) = first {
                if sender.send(first).await.is_err() {
                    return;
                }
            }

            loop {
                let next = tokio::select! {
                    changed = messages.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let list = messages.borrow_and_update().clone();
                        frame(&Push::Messages { messages: &list })
                    }
                    notice = notices.recv() => match notice {
                        Ok(notice) => frame(&Push::Notice { notice: &notice }),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                };
                let Some(next) = next else {
                    continue;
                };
                if sender.send(next).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                incoming = receiver.next() => {
                    let Some(Ok(msg)) = incoming else {
                        break;
                    };
                    let Ok(SendMessageQuery { content }) = serde_json::from_slice(&msg.into_data()) else {
                        continue;
                    };
                    let _ = sync.send(&content).await;
                }
                _ = &mut push_task => break,
            }
        }
        push_task.abort();
    })
}
