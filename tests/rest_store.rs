mod common;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chathub::{
    model::{ChangeKind, Credentials, MessageQuery, NewMessage, NewReport, SignUp, Table},
    remote::{RemoteStore, RestStore},
    ChatError,
};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{net::TcpListener, time::timeout};

#[derive(Clone, Default)]
struct Backend {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Backend {
    fn record(&self, line: String) {
        self.seen.lock().unwrap().push(line);
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    async fn wait_for(&self, line: &str) {
        for _ in 0..200 {
            if self.seen().iter().any(|seen| seen == line) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never saw {line:?}, saw {:?}", self.seen());
    }
}

fn bearer(headers: &HeaderMap) -> String {
    let apikey = headers.get("apikey").and_then(|v| v.to_str().ok()).unwrap_or("-");
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    format!("{apikey} {auth}")
}

async fn token(
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    if params.get("grant_type").map(String::as_str) != Some("password") || body["password"] != "hunter2" {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_grant" }))).into_response();
    }
    Json(json!({
        "access_token": "tok-1",
        "user": { "id": "u1", "email": body["email"] },
    }))
    .into_response()
}

async fn signup(State(backend): State<Backend>, Json(body): Json<Value>) -> Response {
    backend.record(format!("signup {} {}", body["email"], body["data"]["full_name"]));
    match body["email"].as_str() {
        Some("taken@example.com") => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "msg": "User already registered" })),
        )
            .into_response(),
        Some("confirm@example.com") => Json(json!({ "id": "u4", "email": body["email"] })).into_response(),
        _ => Json(json!({
            "access_token": "tok-2",
            "user": { "id": "u3", "email": body["email"] },
        }))
        .into_response(),
    }
}

async fn logout(State(backend): State<Backend>, headers: HeaderMap) -> StatusCode {
    backend.record(format!("logout {}", bearer(&headers)));
    StatusCode::NO_CONTENT
}

async fn list_messages(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    if let Some(created_at) = params.get("created_at") {
        backend.record(format!("before {created_at}"));
    }
    backend.record(format!(
        "list order={} pinned={} {}",
        params.get("order").map(String::as_str).unwrap_or("-"),
        params.get("is_pinned").map(String::as_str).unwrap_or("-"),
        bearer(&headers),
    ));
    Json(json!([{
        "id": "m1",
        "content": "hi",
        "voice_url": null,
        "user_id": "u2",
        "created_at": "2024-05-01T10:00:00Z",
        "updated_at": null,
        "is_pinned": false,
        "is_edited": false,
        "profiles": { "full_name": "Bo", "avatar_url": null, "email": "bo@example.com" },
        "message_reactions": [
            { "emoji": "👍", "user_id": "u1" },
            { "emoji": "👍", "user_id": "u2" },
            { "emoji": "🎉", "user_id": "u2" },
        ],
    }]))
}

async fn insert_message(State(backend): State<Backend>, headers: HeaderMap, Json(rows): Json<Value>) -> Json<Value> {
    let prefer = headers.get("prefer").and_then(|v| v.to_str().ok()).unwrap_or("-");
    backend.record(format!("insert {prefer}"));
    let row = &rows[0];
    Json(json!([{
        "id": "m2",
        "content": row["content"],
        "voice_url": row["voice_url"],
        "user_id": row["user_id"],
        "created_at": "2024-05-01T10:01:00Z",
    }]))
}

async fn delete_message(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    match params.get("id").map(String::as_str) {
        Some("eq.m2") => Json(json!([{ "id": "m2" }])),
        _ => Json(json!([])),
    }
}

async fn report_message(State(backend): State<Backend>, Json(rows): Json<Value>) -> StatusCode {
    let row = &rows[0];
    backend.record(format!(
        "report {} {} {} {}",
        row["message_id"], row["reporter_id"], row["reason"], row["status"]
    ));
    StatusCode::CREATED
}

async fn search_profiles(
    State(backend): State<Backend>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let filter = params.get("full_name").map(String::as_str).unwrap_or("-");
    backend.record(format!("search {filter}"));
    Json(json!([]))
}

async fn realtime(
    State(backend): State<Backend>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    backend.record(format!(
        "realtime apikey={}",
        params.get("apikey").map(String::as_str).unwrap_or("-")
    ));
    ws.on_upgrade(move |socket| relay(socket, backend))
}

/// Acknowledges joins, then reports a row written by someone else.
async fn relay(mut socket: WebSocket, backend: Backend) {
    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        let topic = frame["topic"].as_str().unwrap_or_default().to_owned();
        match frame["event"].as_str() {
            Some("phx_join") => {
                let config = &frame["payload"]["config"]["postgres_changes"][0];
                backend.record(format!(
                    "join {topic} {} token={}",
                    config["table"].as_str().unwrap(),
                    frame["payload"]["access_token"].as_str().unwrap()
                ));
                let reply = json!({
                    "topic": topic,
                    "event": "phx_reply",
                    "payload": { "status": "ok", "response": {} },
                    "ref": frame["ref"],
                });
                socket.send(WsMessage::Text(reply.to_string().into())).await.unwrap();

                if topic == "realtime:messages" {
                    let change = json!({
                        "topic": topic,
                        "event": "postgres_changes",
                        "payload": {
                            "ids": [7],
                            "data": {
                                "schema": "public",
                                "table": "messages",
                                "type": "INSERT",
                                "commit_timestamp": "2024-05-01T10:02:00Z",
                                "record": { "id": "m-remote", "content": "from elsewhere" },
                                "old_record": null,
                            },
                        },
                        "ref": null,
                    });
                    socket.send(WsMessage::Text(change.to_string().into())).await.unwrap();
                }
            }
            Some("access_token") => {
                backend.record(format!(
                    "access_token {topic} {}",
                    frame["payload"]["access_token"].as_str().unwrap()
                ));
            }
            _ => {}
        }
    }
}

async fn public_object(Path((bucket, path)): Path<(String, String)>) -> Response {
    if bucket == "voice-messages" && path == "u1/voice-1.webm" {
        return ([("content-type", "audio/webm")], vec![1u8, 2, 3]).into_response();
    }
    StatusCode::NOT_FOUND.into_response()
}

async fn serve(backend: Backend) -> String {
    let app = Router::new()
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/signup", post(signup))
        .route("/auth/v1/logout", post(logout))
        .route(
            "/rest/v1/messages",
            get(list_messages).post(insert_message).delete(delete_message),
        )
        .route("/rest/v1/message_reports", post(report_message))
        .route("/rest/v1/profiles", get(search_profiles))
        .route("/realtime/v1/websocket", get(realtime))
        .route("/storage/v1/object/public/{bucket}/{*path}", get(public_object))
        .with_state(backend);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

fn creds(password: &str) -> Credentials {
    Credentials {
        email: "ana@example.com".into(),
        password: password.into(),
    }
}

#[tokio::test]
async fn signs_in_and_reads_messages_as_the_user() {
    common::init_test_logging();
    let backend = Backend::default();
    let store = RestStore::new(serve(backend.clone()).await, "anon-key").unwrap();

    assert!(matches!(store.sign_in(&creds("wrong")).await, Err(ChatError::Network(_))));
    assert_eq!(store.current_user().await, None);

    let identity = store.sign_in(&creds("hunter2")).await.unwrap();
    assert_eq!(identity.user_id, "u1");
    assert_eq!(identity.email, "ana@example.com");

    let messages = store.fetch_messages(&MessageQuery::all()).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].author_name(), "Bo");
    let thumbs = &messages[0].reactions[0];
    assert_eq!((thumbs.emoji.as_str(), thumbs.count, thumbs.user_has_reacted), ("👍", 2, true));
    let party = &messages[0].reactions[1];
    assert_eq!((party.count, party.user_has_reacted), (1, false));

    assert_eq!(
        backend.seen(),
        ["list order=created_at.asc pinned=- anon-key Bearer tok-1"]
    );

    store.sign_out().await.unwrap();
    assert_eq!(store.current_user().await, None);
    assert_eq!(backend.seen().last().unwrap(), "logout anon-key Bearer tok-1");
}

#[tokio::test]
async fn anonymous_reads_use_the_api_key() {
    let backend = Backend::default();
    let store = RestStore::new(serve(backend.clone()).await, "anon-key").unwrap();

    let messages = store.fetch_messages(&MessageQuery::all()).await.unwrap();
    assert!(messages[0].reactions.iter().all(|r| !r.user_has_reacted));
    assert_eq!(backend.seen(), ["list order=created_at.asc pinned=- anon-key Bearer anon-key"]);
}

#[tokio::test]
async fn writes_echo_on_the_change_feed() {
    let backend = Backend::default();
    let store = RestStore::new(serve(backend.clone()).await, "anon-key").unwrap();
    let mut feed = store.subscribe(Table::Messages);

    let inserted = store
        .insert_message(NewMessage::text("u1", "hello").unwrap())
        .await
        .unwrap();
    assert_eq!(inserted.id, "m2");
    assert_eq!(inserted.content, "hello");
    assert_eq!(backend.seen(), ["insert return=representation"]);

    let event = feed.next().await.unwrap();
    assert_eq!((event.kind, event.id.as_deref()), (ChangeKind::Insert, Some("m2")));

    store.delete_message("m2").await.unwrap();
    assert_eq!(feed.next().await.unwrap().kind, ChangeKind::Delete);
}

#[tokio::test]
async fn refused_deletes_are_permission_errors() {
    let store = RestStore::new(serve(Backend::default()).await, "anon-key").unwrap();
    assert!(matches!(store.delete_message("m1").await, Err(ChatError::Permission)));
}

#[tokio::test]
async fn public_objects_download_by_url() {
    let base = serve(Backend::default()).await;
    let store = RestStore::new(&base, "anon-key").unwrap();

    let url = store.public_url("voice-messages", "u1/voice-1.webm");
    assert_eq!(url, format!("{base}storage/v1/object/public/voice-messages/u1/voice-1.webm"));

    let blob = store.download_blob("voice-messages", "u1/voice-1.webm").await.unwrap().unwrap();
    assert_eq!(blob.bytes, [1, 2, 3]);
    assert_eq!(blob.content_type, "audio/webm");
    assert_eq!(store.download_blob("voice-messages", "nope.webm").await.unwrap(), None);
}

#[tokio::test]
async fn other_clients_writes_arrive_over_realtime() {
    common::init_test_logging();
    let backend = Backend::default();
    let store = RestStore::new(serve(backend.clone()).await, "anon-key").unwrap();
    let mut feed = store.subscribe(Table::Messages);

    store.start_realtime();
    let event = timeout(Duration::from_secs(5), feed.next()).await.unwrap().unwrap();
    assert_eq!((event.kind, event.id.as_deref()), (ChangeKind::Insert, Some("m-remote")));
    assert_eq!(backend.seen()[0], "realtime apikey=anon-key");
    backend.wait_for("join realtime:messages messages token=anon-key").await;
    backend.wait_for("join realtime:profiles profiles token=anon-key").await;

    store.sign_in(&creds("hunter2")).await.unwrap();
    backend.wait_for("access_token realtime:messages tok-1").await;
}

#[tokio::test]
async fn signing_up_carries_the_full_name() {
    let backend = Backend::default();
    let store = RestStore::new(serve(backend.clone()).await, "anon-key").unwrap();
    let details = |email: &str| SignUp {
        email: email.into(),
        password: "hunter2".into(),
        full_name: "Cy Twombly ".into(),
    };

    let cy = store.sign_up(&details("cy@example.com")).await.unwrap();
    assert_eq!(cy.user_id, "u3");
    assert_eq!(store.current_user().await, Some(cy));
    assert_eq!(backend.seen(), [r#"signup "cy@example.com" "Cy Twombly""#]);

    assert!(matches!(
        store.sign_up(&details("taken@example.com")).await,
        Err(ChatError::AlreadyRegistered(_))
    ));

    store.sign_out().await.unwrap();
    let pending = store.sign_up(&details("confirm@example.com")).await.unwrap();
    assert_eq!(pending.user_id, "u4");
    assert_eq!(store.current_user().await, None);
}

#[tokio::test]
async fn reports_are_posted_pending() {
    let backend = Backend::default();
    let store = RestStore::new(serve(backend.clone()).await, "anon-key").unwrap();
    let mut feed = store.subscribe(Table::MessageReports);

    store
        .report_message(&NewReport::new("m1", "u1", "spam"))
        .await
        .unwrap();
    assert_eq!(backend.seen(), [r#"report "m1" "u1" "spam" "pending""#]);
    assert_eq!(feed.next().await.unwrap().kind, ChangeKind::Insert);
}

#[tokio::test]
async fn paging_sends_the_cursor() {
    let backend = Backend::default();
    let store = RestStore::new(serve(backend.clone()).await, "anon-key").unwrap();
    let cursor = OffsetDateTime::parse("2024-05-01T10:00:00Z", &Rfc3339).unwrap();

    store.fetch_messages(&MessageQuery::page(Some(cursor), 20)).await.unwrap();
    assert_eq!(
        backend.seen(),
        [
            "before lt.2024-05-01T10:00:00Z",
            "list order=created_at.desc pinned=- anon-key Bearer anon-key",
        ]
    );
}

#[tokio::test]
async fn search_terms_cannot_reshape_the_filter() {
    let backend = Backend::default();
    let store = RestStore::new(serve(backend.clone()).await, "anon-key").unwrap();

    store.search_profiles("50%_(a),b*").await.unwrap();
    assert_eq!(backend.seen(), [r#"search ilike."*50\\%\\_(a),b_*""#]);
}
