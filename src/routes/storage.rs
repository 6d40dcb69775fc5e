use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::{remote::RemoteStore, AppResult};

/// Serves uploaded blobs (voice messages) for stores that keep them locally.
#[debug_handler(state = crate::AppState)]
pub async fn download(
    State(store): State<Arc<dyn RemoteStore>>,
    Path((bucket, path)): Path<(String, String)>,
) -> AppResult<Response> {
    Ok(match store.download_blob(&bucket, &path).await? {
        Some(blob) => ([(header::CONTENT_TYPE, blob.content_type)], blob.bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}
