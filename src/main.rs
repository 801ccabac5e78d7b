//! disc-hold-back binary entrypoint wiring the REST API, the hold timer and the storage supervisor.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use disc_hold_back::{
    config::{AppConfig, StorageBackend},
    dao::{
        document_store::{DocumentStore, memory::MemoryDocumentStore},
        storage::StorageError,
    },
    routes,
    services::{hold_timer, notifier::NotificationSink, storage_supervisor},
    state::{AppState, SharedState, clock::SystemClock},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let backend = config.storage.backend;
    let app_state = AppState::new(config, Arc::new(SystemClock), build_notifier());

    spawn_storage_supervisor(app_state.clone(), backend).await?;
    let timer = tokio::spawn(hold_timer::run(app_state.clone()));

    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    timer.abort();
    info!("server stopped");
    Ok(())
}

/// Start the supervisor for the configured backend.
async fn spawn_storage_supervisor(
    state: SharedState,
    backend: StorageBackend,
) -> anyhow::Result<()> {
    match backend {
        StorageBackend::Memory => {
            warn!("using the in-memory store; holds do not survive a restart");
            let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
            tokio::spawn(storage_supervisor::run(state, move || {
                let store = store.clone();
                async move { Ok::<_, StorageError>(store) }
            }));
        }
        StorageBackend::Mongo => {
            #[cfg(feature = "mongo-store")]
            {
                use disc_hold_back::dao::document_store::mongodb::{MongoConfig, MongoDocumentStore};

                let mongo_config = MongoConfig::from_env()
                    .await
                    .context("reading MongoDB configuration")?;
                tokio::spawn(storage_supervisor::run(state, move || {
                    let mongo_config = mongo_config.clone();
                    async move {
                        let store = MongoDocumentStore::connect(mongo_config)
                            .await
                            .map_err(StorageError::from)?;
                        Ok::<_, StorageError>(Arc::new(store) as Arc<dyn DocumentStore>)
                    }
                }));
            }
            #[cfg(not(feature = "mongo-store"))]
            anyhow::bail!("MongoDB backend selected but the `mongo-store` feature is disabled");
        }
        StorageBackend::Couch => {
            #[cfg(feature = "couch-store")]
            {
                use disc_hold_back::dao::document_store::couchdb::{CouchConfig, CouchDocumentStore};

                let couch_config =
                    CouchConfig::from_env().context("reading CouchDB configuration")?;
                tokio::spawn(storage_supervisor::run(state, move || {
                    let couch_config = couch_config.clone();
                    async move {
                        let store = CouchDocumentStore::connect(couch_config)
                            .await
                            .map_err(StorageError::from)?;
                        Ok::<_, StorageError>(Arc::new(store) as Arc<dyn DocumentStore>)
                    }
                }));
            }
            #[cfg(not(feature = "couch-store"))]
            anyhow::bail!("CouchDB backend selected but the `couch-store` feature is disabled");
        }
    }
    Ok(())
}

/// Push sink: Expo when the `expo-push` feature is compiled in, the log otherwise.
fn build_notifier() -> Arc<dyn NotificationSink> {
    #[cfg(feature = "expo-push")]
    {
        info!("delivering push notifications through Expo");
        Arc::new(disc_hold_back::services::notifier::ExpoPushSink::from_env())
    }
    #[cfg(not(feature = "expo-push"))]
    {
        Arc::new(disc_hold_back::services::notifier::LogSink)
    }
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
