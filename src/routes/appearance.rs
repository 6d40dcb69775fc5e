use std::sync::Arc;

use axum::{debug_handler, extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::{
    appearance::{AppearancePatch, AppearanceSettings, SettingsStore, VisualState},
    AppResult,
};

#[derive(Serialize, Deserialize)]
pub(crate) struct CodeQuery {
    code: String,
}

#[debug_handler(state = crate::AppState)]
pub async fn current(State(settings): State<Arc<SettingsStore>>) -> Json<AppearanceSettings> {
    Json(settings.settings())
}

#[debug_handler(state = crate::AppState)]
pub async fn update(
    State(settings): State<Arc<SettingsStore>>,
    Json(patch): Json<AppearancePatch>,
) -> AppResult<Json<AppearanceSettings>> {
    Ok(Json(settings.update(patch)?))
}

#[debug_handler(state = crate::AppState)]
pub async fn visual(State(settings): State<Arc<SettingsStore>>) -> Json<VisualState> {
    Json(settings.visual())
}

#[debug_handler(state = crate::AppState)]
pub async fn share_code(State(settings): State<Arc<SettingsStore>>) -> Json<CodeQuery> {
    Json(CodeQuery { code: settings.share_code() })
}

#[debug_handler(state = crate::AppState)]
pub async fn apply_code(
    State(settings): State<Arc<SettingsStore>>,
    Json(CodeQuery { code }): Json<CodeQuery>,
) -> AppResult<Json<AppearanceSettings>> {
    Ok(Json(settings.apply_code(&code)?))
}

#[debug_handler(state = crate::AppState)]
pub async fn save_to_profile(State(settings): State<Arc<SettingsStore>>) -> AppResult<Json<AppearanceSettings>> {
    settings.save_to_profile().await?;
    Ok(Json(settings.settings()))
}

#[debug_handler(state = crate::AppState)]
pub async fn sync_from_profile(State(settings): State<Arc<SettingsStore>>) -> AppResult<Json<AppearanceSettings>> {
    Ok(Json(settings.sync_from_profile().await?))
}
