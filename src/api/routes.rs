//! Router assembly and HTTP endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::ws;
use crate::bus::{HandlerGuard, MessageBus};
use crate::cache::{CacheConfig, SnapshotCache};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::llm::{
    ChatMessage, ChatOptions, CompletionClient, CompletionStream, LlmError, OpenRouterClient,
};
use crate::settings::{ProviderSettings, SettingsStore};

/// Shared server state.
pub struct AppState {
    pub config: Config,
    pub bus: Arc<MessageBus>,
    pub cache: Arc<SnapshotCache>,
    pub coordinator: Arc<Coordinator>,
    pub settings: Arc<SettingsStore>,
    /// Keeps the coordinator's bus handlers registered for the server's
    /// lifetime.
    _handlers: Vec<HandlerGuard>,
}

/// Completion client that resolves credentials from the settings store on
/// every call, so a settings update applies to the next prompt without a
/// restart.
struct SettingsBackedClient {
    settings: Arc<SettingsStore>,
}

#[async_trait]
impl CompletionClient for SettingsBackedClient {
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<CompletionStream, LlmError> {
        let provider = self.settings.provider().await;
        let api_key = provider.api_key.unwrap_or_default();
        let client = match provider.base_url {
            Some(base_url) => OpenRouterClient::with_base_url(api_key, base_url),
            None => OpenRouterClient::new(api_key),
        };
        client.stream_chat(model, messages, options).await
    }
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let cache = Arc::new(SnapshotCache::new(CacheConfig {
        max_versions: config.max_snapshot_versions,
        max_content_bytes: config.max_content_bytes,
    }));
    let settings = Arc::new(SettingsStore::load(&config).await);
    let client: Arc<dyn CompletionClient> = Arc::new(SettingsBackedClient {
        settings: settings.clone(),
    });
    let bus = Arc::new(MessageBus::with_request_timeout(config.request_timeout));
    let coordinator = Arc::new(Coordinator::new(
        cache.clone(),
        settings.clone(),
        client,
        config.max_history_turns,
    ));
    let handlers = coordinator.attach(&bus);

    // Periodic sweep of stale snapshot versions.
    {
        let cache = cache.clone();
        let max_age = config.snapshot_max_age;
        let period = config.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let dropped = cache.cleanup(max_age).await;
                if dropped > 0 {
                    debug!(dropped, "Snapshot sweep dropped stale versions");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        bus,
        cache,
        coordinator,
        settings,
        _handlers: handlers,
    });

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/pages", get(list_pages))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/ws/page", get(ws::page_ws))
        .route("/ws/ui", get(ws::ui_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct PageSummary {
    id: u64,
    title: String,
    url: String,
    version: u64,
    last_updated: chrono::DateTime<chrono::Utc>,
}

async fn list_pages(State(state): State<Arc<AppState>>) -> Json<Vec<PageSummary>> {
    let pages = state
        .cache
        .latest_snapshots()
        .await
        .into_iter()
        .map(|s| PageSummary {
            id: s.page_id,
            title: s.title,
            url: s.url,
            version: s.version,
            last_updated: s.timestamp,
        })
        .collect();
    Json(pages)
}

/// Provider settings with the key reduced to a presence flag.
#[derive(Debug, Serialize)]
struct SettingsView {
    provider: String,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_url: Option<String>,
    api_key_set: bool,
}

impl From<ProviderSettings> for SettingsView {
    fn from(settings: ProviderSettings) -> Self {
        Self {
            provider: settings.provider,
            model: settings.model,
            base_url: settings.base_url,
            api_key_set: settings.api_key.is_some(),
        }
    }
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<SettingsView> {
    Json(state.settings.provider().await.into())
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ProviderSettings>,
) -> Result<Json<SettingsView>, (StatusCode, String)> {
    match state.settings.update(update).await {
        Ok(merged) => Ok(Json(merged.into())),
        Err(e) => {
            warn!(error = %e, "Failed to persist settings");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_view_redacts_key() {
        let view: SettingsView = ProviderSettings {
            provider: "openrouter".to_string(),
            api_key: Some("sk-secret".to_string()),
            model: "m".to_string(),
            base_url: None,
        }
        .into();
        assert!(view.api_key_set);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("sk-secret"));
    }
}
