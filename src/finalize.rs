//! Turn finalization - sanitize the raw loop output and persist it
//!
//! The raw message list coming out of the agent loop can contain assistant
//! messages whose tool calls never received a result (the loop stopped first)
//! and tool messages orphaned by that trimming. Sanitization removes both so
//! only coherent call/result pairs reach storage, then the turn is persisted
//! as durable messages once the client has acknowledged stream flush.

use crate::agent::TurnOutcome;
use crate::models::{ContentPart, Message, ResponseMessage};
use crate::store::ConversationStore;
use crate::stream::FlushHandle;
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Drop tool-call parts with no matching result and tool results answering
/// no surviving call, then drop messages left empty. Preserves order.
pub fn sanitize_response_messages(messages: Vec<ResponseMessage>) -> Vec<ResponseMessage> {
    let resolved: HashSet<String> = messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|part| match part {
            ContentPart::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect();

    let requested: HashSet<String> = messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|part| match part {
            ContentPart::ToolCall { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect();

    messages
        .into_iter()
        .filter_map(|mut message| {
            message.parts.retain(|part| match part {
                ContentPart::Text { text } => !text.is_empty(),
                ContentPart::ToolCall { tool_call_id, .. } => resolved.contains(tool_call_id),
                ContentPart::ToolResult { tool_call_id, .. } => requested.contains(tool_call_id),
            });
            if message.parts.is_empty() {
                None
            } else {
                Some(message)
            }
        })
        .collect()
}

/// Persists a completed turn after the event stream has fully drained.
pub struct PersistenceFinalizer {
    store: Arc<dyn ConversationStore>,
}

impl PersistenceFinalizer {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Wait for the flush acknowledgement, then append the turn's sanitized
    /// messages to the conversation. Aborted turns persist nothing. A store
    /// failure is logged rather than surfaced; the stream already completed
    /// from the client's point of view.
    pub async fn finalize(
        &self,
        conversation_id: Uuid,
        outcome: TurnOutcome,
        flush: FlushHandle,
    ) -> Result<Vec<Uuid>> {
        flush.wait().await;

        if outcome.aborted {
            info!(%conversation_id, "aborted turn, skipping persistence");
            return Ok(vec![]);
        }

        let sanitized = sanitize_response_messages(outcome.messages);
        if sanitized.is_empty() {
            debug!(%conversation_id, "no messages survived sanitization");
            return Ok(vec![]);
        }

        let messages: Vec<Message> = sanitized
            .into_iter()
            .map(|m| Message {
                id: Uuid::new_v4(),
                conversation_id,
                role: m.role,
                parts: m.parts,
                created_at: chrono::Utc::now(),
            })
            .collect();
        let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();

        match self.store.append_messages(conversation_id, messages).await {
            Ok(()) => {
                info!(%conversation_id, count = ids.len(), "persisted turn messages");
                Ok(ids)
            }
            Err(e) => {
                error!(%conversation_id, error = %e, "failed to persist turn messages");
                Ok(vec![])
            }
        }
    }
}
