//! HTTP surface
//!
//! axum router with permissive CORS:
//! - `GET  /health`    liveness probe
//! - `POST /api/chat`  run a conversation turn, respond with an SSE stream
//! - `DELETE /api/chat?id=` delete a conversation (ownership checked)
//!
//! Identity is an opaque `x-user-id` header set by the fronting layer. Input
//! errors are rejected before the turn starts, so failed requests never leave
//! a half-written conversation behind.

use crate::agent::{TurnConfig, TurnRunner};
use crate::finalize::PersistenceFinalizer;
use crate::gateway::FinancialDatasetsClient;
use crate::llm::OpenAiClient;
use crate::models::{
    find_model, Message, MessageRole, ProgressEvent, ResponseMessage, DEFAULT_MODEL_ID,
    PLANNER_MODEL_ID,
};
use crate::planner::LlmTaskPlanner;
use crate::store::ConversationStore;
use crate::stream::{event_channel, flush_pair};
use crate::tools::FinancialToolCatalog;
use crate::{AgentError, Result};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

// ================= App State =================

/// Server-wide defaults; per-request keys in the body take precedence.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub openai_api_key: Option<String>,
    pub financial_datasets_api_key: Option<String>,
    pub context_rewrite: bool,
}

pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub config: AppConfig,
}

// ================= Request Types =================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub id: Uuid,
    pub messages: Vec<ClientMessage>,
    #[serde(default)]
    pub model_id: Option<String>,
    pub financial_datasets_api_key: Option<String>,
    pub model_api_key: Option<String>,
}

/// The client-side rendition of a message: a role and flat text.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub id: Uuid,
}

// ================= Error Mapping =================

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = match &self {
            AgentError::InvalidRequest(_) | AgentError::InvalidToolInput(_) => {
                StatusCode::BAD_REQUEST
            }
            AgentError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AgentError::ModelNotFound(_) | AgentError::ToolNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::GatewayError { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ================= Router =================

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", axum::routing::post(chat).delete(delete_chat))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ================= Chat =================

async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response> {
    let user_id = require_user(&headers)?;

    let model_id = request.model_id.as_deref().unwrap_or(DEFAULT_MODEL_ID);
    let model = find_model(model_id)
        .ok_or_else(|| AgentError::ModelNotFound(model_id.to_string()))?;

    let user_text = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .ok_or_else(|| AgentError::InvalidRequest("no user message in request".to_string()))?;

    let model_api_key = request
        .model_api_key
        .clone()
        .or_else(|| state.config.openai_api_key.clone())
        .ok_or_else(|| AgentError::InvalidRequest("missing model API key".to_string()))?;
    let financial_api_key = request
        .financial_datasets_api_key
        .clone()
        .or_else(|| state.config.financial_datasets_api_key.clone())
        .ok_or_else(|| {
            AgentError::InvalidRequest("missing financial datasets API key".to_string())
        })?;

    // Get-or-create the conversation, then persist the user message before
    // the turn starts so it survives an abort.
    let conversation_id = request.id;
    match state.store.get_conversation(conversation_id).await? {
        Some(existing) => {
            if existing.user_id != user_id {
                return Err(AgentError::Unauthorized(
                    "conversation belongs to another user".to_string(),
                ));
            }
        }
        None => {
            let conversation =
                crate::models::Conversation::new(conversation_id, user_id, &user_text);
            state.store.create_conversation(conversation).await?;
        }
    }

    let user_message_id = Uuid::new_v4();
    state
        .store
        .append_messages(
            conversation_id,
            vec![Message::user_text(conversation_id, user_message_id, &user_text)],
        )
        .await?;

    let history = to_history(&request.messages);

    // Wire the turn together per request; clients and keys are request-scoped.
    let chat_model = Arc::new(OpenAiClient::new(
        model_api_key.clone(),
        model.api_identifier.to_string(),
    )?);
    let planner_model = Arc::new(OpenAiClient::new(
        model_api_key,
        PLANNER_MODEL_ID.to_string(),
    )?);
    let gateway = FinancialDatasetsClient::new(financial_api_key)?;
    let runner = TurnRunner::new(
        chat_model,
        Arc::new(LlmTaskPlanner::new(planner_model)),
        Arc::new(FinancialToolCatalog::new(gateway)),
        TurnConfig {
            context_rewrite: state.config.context_rewrite,
            ..TurnConfig::default()
        },
    );

    let (sink, rx) = event_channel();
    let (mut flush_notifier, flush_handle) = flush_pair();
    let cancel = CancellationToken::new();
    let turn_cancel = cancel.clone();
    let finalizer = PersistenceFinalizer::new(state.store.clone());

    tokio::spawn(async move {
        match runner
            .run(history, user_message_id, &sink, &turn_cancel)
            .await
        {
            Ok(outcome) => {
                if let Err(e) = finalizer
                    .finalize(conversation_id, outcome, flush_handle)
                    .await
                {
                    error!(%conversation_id, error = %e, "finalization failed");
                }
            }
            Err(e) => {
                error!(%conversation_id, error = %e, "turn failed");
            }
        }
    });

    // The drop guard cancels the turn when the client goes away and the
    // response body is dropped. The flush acknowledgement fires once the
    // finish event has been handed to the transport.
    let guard = cancel.drop_guard();
    let stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let _held = &guard;
        if matches!(event, ProgressEvent::Finish) {
            flush_notifier.notify();
        }
        Event::default().json_data(&event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

// ================= Delete =================

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<DeleteParams>,
) -> Result<Response> {
    let user_id = require_user(&headers)?;

    let conversation = state
        .store
        .get_conversation(params.id)
        .await?
        .ok_or_else(|| AgentError::InvalidRequest("conversation not found".to_string()))?;
    if conversation.user_id != user_id {
        return Err(AgentError::Unauthorized(
            "conversation belongs to another user".to_string(),
        ));
    }

    state.store.delete_conversation(params.id).await?;
    info!(conversation_id = %params.id, "conversation deleted");
    Ok(Json(json!({ "deleted": true })).into_response())
}

// ================= Helpers =================

fn require_user(headers: &HeaderMap) -> Result<Uuid> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AgentError::Unauthorized("missing x-user-id header".to_string()))?;
    Uuid::parse_str(raw)
        .map_err(|_| AgentError::Unauthorized("malformed x-user-id header".to_string()))
}

fn to_history(messages: &[ClientMessage]) -> Vec<ResponseMessage> {
    messages
        .iter()
        .filter_map(|m| {
            let role = match m.role.as_str() {
                "user" => MessageRole::User,
                "assistant" => MessageRole::Assistant,
                _ => return None,
            };
            Some(ResponseMessage {
                role,
                parts: vec![crate::models::ContentPart::Text {
                    text: m.content.clone(),
                }],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_user(user_id: Uuid) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", user_id.to_string().parse().unwrap());
        headers
    }

    #[test]
    fn test_require_user_rejects_missing_header() {
        let result = require_user(&HeaderMap::new());
        assert!(matches!(result, Err(AgentError::Unauthorized(_))));
    }

    #[test]
    fn test_require_user_rejects_malformed_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "not-a-uuid".parse().unwrap());
        assert!(matches!(
            require_user(&headers),
            Err(AgentError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_require_user_accepts_uuid() {
        let user_id = Uuid::new_v4();
        assert_eq!(require_user(&headers_with_user(user_id)).unwrap(), user_id);
    }

    #[test]
    fn test_to_history_skips_unknown_roles() {
        let messages = vec![
            ClientMessage {
                role: "system".to_string(),
                content: "ignored".to_string(),
            },
            ClientMessage {
                role: "user".to_string(),
                content: "hello".to_string(),
            },
            ClientMessage {
                role: "assistant".to_string(),
                content: "hi".to_string(),
            },
        ];

        let history = to_history(&messages);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].role, MessageRole::Assistant);
    }

    #[test]
    fn test_chat_request_accepts_camel_case() {
        let body = json!({
            "id": Uuid::new_v4(),
            "messages": [{ "role": "user", "content": "price of AAPL?" }],
            "modelId": "gpt-4o",
            "financialDatasetsApiKey": "fd-key"
        });

        let request: ChatRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.model_id.as_deref(), Some("gpt-4o"));
        assert_eq!(request.financial_datasets_api_key.as_deref(), Some("fd-key"));
        assert!(request.model_api_key.is_none());
    }
}
