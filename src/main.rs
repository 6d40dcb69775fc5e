use std::sync::Arc;

use anyhow::bail;
use chathub::{
    appearance::SettingsStore,
    config::{Backend, Config},
    local::FileStorage,
    notify::Toasts,
    remote::{RemoteStore, RestStore, SqliteStore},
    sync::MessageSync,
    AppState,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chathub=info")),
        )
        .init();

    let config = Config::load()?;

    let store: Arc<dyn RemoteStore> = match config.backend {
        Backend::Sqlite => {
            Arc::new(SqliteStore::connect(&config.database_url, &config.public_url).await?)
        }
        Backend::Rest => {
            if config.rest_url.is_empty() {
                bail!("CHATHUB_REST_URL is required for the rest backend");
            }
            let store = RestStore::new(&config.rest_url, &config.rest_key)?;
            store.start_realtime();
            Arc::new(store)
        }
    };
    info!("using the {:?} backend", config.backend);

    let toasts = Toasts::new();

    // appearance is applied before the first request is served
    let settings = SettingsStore::load_or_default(
        Arc::new(FileStorage::new(&config.settings_path)),
        toasts.clone(),
    )
    .with_remote(store.clone());

    let sync = MessageSync::new(store.clone(), toasts);
    sync.start(config.refresh_interval, config.auto_refresh).await;

    let app = chathub::app(AppState {
        sync: sync.clone(),
        settings: Arc::new(settings),
        store,
    });

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    sync.shutdown();
    info!("bye");
    Ok(())
}
