pub mod appearance;
pub mod config;
pub mod local;
pub mod model;
pub mod notify;
pub mod profiles;
pub mod recorder;
pub mod remote;
pub mod routes;
pub mod sync;

mod appresult;
mod error;

use std::sync::Arc;

use axum::{extract::FromRef, Router};
use tower_http::cors::CorsLayer;

pub use appresult::{AppError, AppResult};
pub use error::{ChatError, ChatResult, DecodeError};

use appearance::SettingsStore;
use remote::RemoteStore;
use sync::MessageSync;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub sync: Arc<MessageSync>,
    pub settings: Arc<SettingsStore>,
    pub store: Arc<dyn RemoteStore>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::router())
        .with_state(state)
        .layer(CorsLayer::permissive())
}
