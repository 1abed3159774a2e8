//! Server binary for the financial chat agent.

use financial_chat_agent::api::{self, AppConfig, AppState};
use financial_chat_agent::store::InMemoryConversationStore;
use financial_chat_agent::Result;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "financial_chat_agent=info,tower_http=info".into()),
        )
        .init();

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let config = AppConfig {
        openai_api_key: env::var("OPENAI_API_KEY").ok(),
        financial_datasets_api_key: env::var("FINANCIAL_DATASETS_API_KEY").ok(),
        context_rewrite: env::var("CONTEXT_REWRITE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    };
    if config.openai_api_key.is_none() {
        warn!("OPENAI_API_KEY not set, clients must supply a model API key per request");
    }
    if config.financial_datasets_api_key.is_none() {
        warn!("FINANCIAL_DATASETS_API_KEY not set, clients must supply one per request");
    }

    let state = Arc::new(AppState {
        store: Arc::new(InMemoryConversationStore::new()),
        config,
    });

    info!(port, "starting financial chat agent");
    api::serve(port, state).await
}
