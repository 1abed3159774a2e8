//! Query decomposition for progress display
//!
//! The planner makes a single structured-generation call that breaks the
//! user's question into short, present-progressive task labels ("Retrieving
//! AAPL price"). The labels drive the client's loading state and nothing
//! else: they never gate which tools the agent loop may call.

use crate::error::AgentError;
use crate::llm::LanguageModel;
use crate::models::{ResponseMessage, SubTask};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait TaskPlanner: Send + Sync {
    /// Decompose the latest user message into ordered display sub-tasks.
    async fn decompose(&self, user_message: &str) -> Result<Vec<SubTask>>;
}

/// Planner backed by a small fixed LLM.
pub struct LlmTaskPlanner {
    model: Arc<dyn LanguageModel>,
}

impl LlmTaskPlanner {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    fn build_prompt(user_message: &str) -> String {
        format!(
            r#"You are a reasoning agent.
Given the following user query, break it down into the small, tightly-scoped sub-tasks needed to answer it.

User query: {}

Rules:
- Each task name must be in the present progressive tense, as if telling another agent what to do.
- Include the ticker or company name in the task name where appropriate.
- Task names are short (max 5 words) but comprehensive, friendly, and easy to understand.
- Create the least number of tasks possible while still covering the query; another LLM will execute them with tools, so keep each task simple.
- Examples: "Getting current price for AAPL", "Analyzing revenue trends".

Return ONLY a JSON object of the form:
{{"tasks": [{{"task_name": "...", "class": "..."}}]}}
"#,
            user_message
        )
    }
}

#[async_trait]
impl TaskPlanner for LlmTaskPlanner {
    async fn decompose(&self, user_message: &str) -> Result<Vec<SubTask>> {
        let prompt = Self::build_prompt(user_message);
        let object = self.model.generate_object(&prompt).await?;
        let tasks = parse_tasks(&object)?;

        debug!(task_count = tasks.len(), "planner produced sub-tasks");
        Ok(tasks)
    }
}

/// Deterministic planner for development and tests.
pub struct MockPlanner;

#[async_trait]
impl TaskPlanner for MockPlanner {
    async fn decompose(&self, _user_message: &str) -> Result<Vec<SubTask>> {
        Ok(vec![SubTask {
            name: "Analyzing your query".to_string(),
            class: "analysis".to_string(),
        }])
    }
}

/// Accept either {"tasks": [...]} or a bare top-level array.
fn parse_tasks(object: &Value) -> Result<Vec<SubTask>> {
    let items = object
        .get("tasks")
        .and_then(Value::as_array)
        .or_else(|| object.as_array())
        .ok_or_else(|| {
            AgentError::PlanningError("structured output has no task array".to_string())
        })?;

    let tasks: Vec<SubTask> = items
        .iter()
        .filter_map(|item| {
            let name = item.get("task_name").and_then(Value::as_str)?;
            let class = item
                .get("class")
                .and_then(Value::as_str)
                .unwrap_or("task");
            Some(SubTask {
                name: name.to_string(),
                class: class.to_string(),
            })
        })
        .collect();

    if tasks.is_empty() {
        return Err(AgentError::PlanningError(
            "planner returned no usable tasks".to_string(),
        ));
    }

    Ok(tasks)
}

/// Context rewrite for execution bias: a historical variant in which the
/// task list transiently replaces the last user message fed to the main
/// agent. Off by default; toggled via `TurnConfig`.
pub fn rewrite_for_execution_bias(messages: &mut [ResponseMessage], tasks: &[SubTask]) {
    let task_list = tasks
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    if let Some(last) = messages
        .iter_mut()
        .rev()
        .find(|m| m.role == crate::models::MessageRole::User)
    {
        *last = ResponseMessage::user_text(task_list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tasks_object_form() {
        let object = json!({
            "tasks": [
                { "task_name": "Retrieving AAPL price", "class": "prices" },
                { "task_name": "Summarizing findings", "class": "synthesis" }
            ]
        });

        let tasks = parse_tasks(&object).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "Retrieving AAPL price");
        assert_eq!(tasks[1].class, "synthesis");
    }

    #[test]
    fn test_parse_tasks_bare_array() {
        let object = json!([{ "task_name": "Getting MSFT news" }]);
        let tasks = parse_tasks(&object).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].class, "task");
    }

    #[test]
    fn test_parse_tasks_rejects_empty() {
        assert!(parse_tasks(&json!({ "tasks": [] })).is_err());
        assert!(parse_tasks(&json!({ "other": 1 })).is_err());
    }

    #[test]
    fn test_rewrite_replaces_last_user_message() {
        let mut messages = vec![
            ResponseMessage::user_text("old question"),
            ResponseMessage {
                role: crate::models::MessageRole::Assistant,
                parts: vec![crate::models::ContentPart::Text {
                    text: "earlier answer".to_string(),
                }],
            },
            ResponseMessage::user_text("what is AAPL's price and latest news?"),
        ];
        let tasks = vec![
            SubTask {
                name: "Retrieving AAPL price".to_string(),
                class: "prices".to_string(),
            },
            SubTask {
                name: "Fetching AAPL news".to_string(),
                class: "news".to_string(),
            },
        ];

        rewrite_for_execution_bias(&mut messages, &tasks);

        assert_eq!(
            messages[2].text(),
            "Retrieving AAPL price\nFetching AAPL news"
        );
        // Earlier history is untouched.
        assert_eq!(messages[0].text(), "old question");
    }

    #[tokio::test]
    async fn test_mock_planner_single_task() {
        let tasks = MockPlanner.decompose("anything").await.unwrap();
        assert_eq!(tasks.len(), 1);
    }
}
