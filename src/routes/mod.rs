mod appearance;
mod auth;
mod messages;
mod storage;
mod ws;

use axum::{
    routing::{get, patch, post, put},
    Router,
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/messages", get(messages::list).post(messages::send))
        .route("/messages/pinned", get(messages::pinned))
        .route("/messages/refresh", post(messages::refresh))
        .route("/messages/history", get(messages::history))
        .route("/messages/load-more", post(messages::load_more))
        .route("/messages/{id}", patch(messages::edit).delete(messages::delete))
        .route("/messages/{id}/pin", post(messages::toggle_pin))
        .route("/messages/{id}/reactions", post(messages::react))
        .route("/messages/{id}/report", post(messages::report))
        .route("/voice", post(messages::send_voice))
        .route("/auto-refresh", put(messages::auto_refresh))

        .route("/appearance", get(appearance::current).put(appearance::update))
        .route("/appearance/visual", get(appearance::visual))
        .route("/appearance/code", get(appearance::share_code).post(appearance::apply_code))
        .route("/appearance/profile", post(appearance::save_to_profile))
        .route("/appearance/profile/sync", post(appearance::sync_from_profile))

        .route("/auth/sign-in", post(auth::sign_in))
        .route("/auth/sign-up", post(auth::sign_up))
        .route("/auth/sign-out", post(auth::sign_out))
        .route("/auth/me", get(auth::me))
        .route("/profiles/search", get(auth::search_profiles))
        .route("/profiles/{id}", get(auth::profile))

        .route("/storage/{bucket}/{*path}", get(storage::download))
        .route("/ws", get(ws::chat_ws))
}
