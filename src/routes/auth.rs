use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::{
    appearance::SettingsStore,
    model::{Credentials, Identity, Profile, SignUp},
    profiles,
    remote::RemoteStore,
    sync::MessageSync,
    AppResult, ChatError,
};

#[derive(Deserialize)]
pub(crate) struct SearchQuery {
    #[serde(default)]
    q: String,
}

/// Signing in also pulls the user's appearance from their profile and reloads
/// the list, since reaction flags depend on who is looking.
#[debug_handler(state = crate::AppState)]
pub async fn sign_in(
    State(store): State<Arc<dyn RemoteStore>>,
    State(sync): State<Arc<MessageSync>>,
    State(settings): State<Arc<SettingsStore>>,
    Json(credentials): Json<Credentials>,
) -> AppResult<Json<Identity>> {
    let identity = store.sign_in(&credentials).await?;
    tracing::info!("signed in as {}", identity.email);

    if let Err(e) = settings.sync_from_profile().await {
        tracing::warn!("keeping local appearance: {e}");
    }
    let _ = sync.refresh().await;
    Ok(Json(identity))
}

/// 201 with the new identity. Without a session (the backend wants the email
/// confirmed first) nobody is signed in yet.
#[debug_handler(state = crate::AppState)]
pub async fn sign_up(
    State(store): State<Arc<dyn RemoteStore>>,
    State(sync): State<Arc<MessageSync>>,
    Json(details): Json<SignUp>,
) -> AppResult<impl IntoResponse> {
    let identity = store
        .sign_up(&details)
        .await
        .inspect_err(|e| sync.toasts().error("Failed to create account", e))?;
    sync.toasts().success("Account created successfully!");

    if store.current_user().await.is_some() {
        let _ = sync.refresh().await;
    }
    Ok((StatusCode::CREATED, Json(identity)))
}

#[debug_handler(state = crate::AppState)]
pub async fn sign_out(
    State(store): State<Arc<dyn RemoteStore>>,
    State(sync): State<Arc<MessageSync>>,
) -> AppResult<StatusCode> {
    store.sign_out().await?;
    let _ = sync.refresh().await;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = crate::AppState)]
pub async fn me(State(store): State<Arc<dyn RemoteStore>>) -> AppResult<Json<Identity>> {
    Ok(Json(store.current_user().await.ok_or(ChatError::NotSignedIn)?))
}

#[debug_handler(state = crate::AppState)]
pub async fn search_profiles(
    State(store): State<Arc<dyn RemoteStore>>,
    Query(SearchQuery { q }): Query<SearchQuery>,
) -> AppResult<Json<Vec<Profile>>> {
    Ok(Json(profiles::search(store.as_ref(), &q).await?))
}

#[debug_handler(state = crate::AppState)]
pub async fn profile(
    State(store): State<Arc<dyn RemoteStore>>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    Ok(match store.fetch_profile(&id).await? {
        Some(profile) => Json(profile).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}
