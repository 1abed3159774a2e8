//! Core data models for the financial chat agent

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Private
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Create an empty conversation titled after the opening user message.
    pub fn new(id: Uuid, user_id: Uuid, first_user_message: &str) -> Self {
        Self {
            id,
            user_id,
            title: derive_title(first_user_message),
            visibility: Visibility::Private,
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }
}

/// Conversation titles are a bounded prefix of the opening message.
fn derive_title(text: &str) -> String {
    const MAX_TITLE_CHARS: usize = 80;

    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_TITLE_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_TITLE_CHARS).collect();
    format!("{}…", cut.trim_end())
}

//
// ================= Messages =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

/// One piece of message content. Assistant messages interleave text with
/// tool calls; tool messages carry the matching results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: Value,
    },
}

/// A persisted message, attached to a conversation. Append-only once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub parts: Vec<ContentPart>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user_text(conversation_id: Uuid, id: Uuid, text: &str) -> Self {
        Self {
            id,
            conversation_id,
            role: MessageRole::User,
            parts: vec![ContentPart::Text {
                text: text.to_string(),
            }],
            created_at: Utc::now(),
        }
    }
}

/// A raw, not-yet-persisted message produced by the agent loop. The
/// persistence finalizer sanitizes these and assigns fresh identifiers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMessage {
    pub role: MessageRole,
    pub parts: Vec<ContentPart>,
}

impl ResponseMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Concatenated text parts, ignoring tool calls and results.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

//
// ================= Sub-tasks =================
//

/// Transient planner output used only to drive the displayed loading labels.
/// Never persisted; discarded when the turn completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubTask {
    pub name: String,
    pub class: String,
}

//
// ================= Progress events =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryLoadingContent {
    pub is_loading: bool,
    pub task_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolLoadingContent {
    pub tool: String,
    pub is_loading: bool,
    pub message: Option<String>,
}

/// Client-visible turn progress, multiplexed onto one ordered stream.
/// Not part of the persisted conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "content", rename_all = "kebab-case")]
pub enum ProgressEvent {
    UserMessageId(Uuid),
    QueryLoading(QueryLoadingContent),
    ToolLoading(ToolLoadingContent),
    TextDelta(String),
    Finish,
}

//
// ================= Model catalog =================
//

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChatModel {
    pub id: &'static str,
    pub label: &'static str,
    pub api_identifier: &'static str,
    pub description: &'static str,
}

pub const CHAT_MODELS: &[ChatModel] = &[
    ChatModel {
        id: "gpt-4.1-nano-2025-04-14",
        label: "GPT 4.1 nano",
        api_identifier: "gpt-4.1-nano-2025-04-14",
        description: "Fastest, most cost-effective GPT-4.1 model",
    },
    ChatModel {
        id: "gpt-4.1-mini-2025-04-14",
        label: "GPT 4.1 mini",
        api_identifier: "gpt-4.1-mini-2025-04-14",
        description: "Balance between intelligence, speed, and cost",
    },
    ChatModel {
        id: "gpt-4.1-2025-04-14",
        label: "GPT 4.1",
        api_identifier: "gpt-4.1-2025-04-14",
        description: "Flagship model for complex tasks",
    },
    ChatModel {
        id: "gpt-4o",
        label: "GPT-4o",
        api_identifier: "gpt-4o",
        description: "Omni-purpose model for complex tasks",
    },
];

pub const DEFAULT_MODEL_ID: &str = "gpt-4o";

/// Small fixed model used for the planning pass.
pub const PLANNER_MODEL_ID: &str = "gpt-4o-mini";

pub fn find_model(id: &str) -> Option<&'static ChatModel> {
    CHAT_MODELS.iter().find(|m| m.id == id)
}

//
// ================= Tool parameters =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Quarterly,
    Annual,
    Ttm,
}

impl Default for Period {
    fn default() -> Self {
        Period::Ttm
    }
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Quarterly => "quarterly",
            Period::Annual => "annual",
            Period::Ttm => "ttm",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PriceInterval {
    Second,
    Minute,
    Day,
    Week,
    Month,
    Year,
}

impl Default for PriceInterval {
    fn default() -> Self {
        PriceInterval::Day
    }
}

impl PriceInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceInterval::Second => "second",
            PriceInterval::Minute => "minute",
            PriceInterval::Day => "day",
            PriceInterval::Week => "week",
            PriceInterval::Month => "month",
            PriceInterval::Year => "year",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderBy {
    #[serde(rename = "-report_period")]
    ReportPeriodDesc,
    #[serde(rename = "report_period")]
    ReportPeriodAsc,
}

impl Default for OrderBy {
    fn default() -> Self {
        OrderBy::ReportPeriodDesc
    }
}

/// Parameters for the combined snapshot + historical price lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockPricesParams {
    pub ticker: String,
    /// YYYY-MM-DD; defaults to one month ago.
    #[serde(default = "default_start_date")]
    pub start_date: String,
    /// YYYY-MM-DD; defaults to today.
    #[serde(default = "default_end_date")]
    pub end_date: String,
    #[serde(default)]
    pub interval: PriceInterval,
    #[serde(default = "default_interval_multiplier")]
    pub interval_multiplier: u32,
}

/// Shared parameters for the statement-shaped endpoints (income statements,
/// balance sheets, cash flow statements, financial metrics).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatementParams {
    pub ticker: String,
    #[serde(default)]
    pub period: Period,
    #[serde(default = "default_statement_limit")]
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_period_lte: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_period_gte: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchStocksParams {
    pub filters: Vec<StockFilter>,
    #[serde(default)]
    pub period: Period,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
    #[serde(default)]
    pub order_by: OrderBy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewsParams {
    pub ticker: String,
    #[serde(default = "default_news_limit")]
    pub limit: u32,
}

pub fn default_start_date() -> String {
    let today = Utc::now().date_naive();
    today
        .checked_sub_months(Months::new(1))
        .unwrap_or(today)
        .format("%Y-%m-%d")
        .to_string()
}

pub fn default_end_date() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn default_interval_multiplier() -> u32 {
    1
}

fn default_statement_limit() -> u32 {
    5
}

fn default_search_limit() -> u32 {
    5
}

fn default_news_limit() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_wire_format() {
        let event = ProgressEvent::QueryLoading(QueryLoadingContent {
            is_loading: true,
            task_names: vec!["Retrieving AAPL price".to_string()],
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "query-loading");
        assert_eq!(json["content"]["isLoading"], true);
        assert_eq!(json["content"]["taskNames"][0], "Retrieving AAPL price");
    }

    #[test]
    fn test_finish_event_has_no_content() {
        let json = serde_json::to_value(ProgressEvent::Finish).unwrap();
        assert_eq!(json["type"], "finish");
    }

    #[test]
    fn test_statement_params_defaults() {
        let params: StatementParams =
            serde_json::from_value(serde_json::json!({ "ticker": "MSFT" })).unwrap();

        assert_eq!(params.period, Period::Ttm);
        assert_eq!(params.limit, 5);
        assert!(params.report_period_lte.is_none());
        assert!(params.report_period_gte.is_none());
    }

    #[test]
    fn test_price_params_default_date_range() {
        let params: StockPricesParams =
            serde_json::from_value(serde_json::json!({ "ticker": "AAPL" })).unwrap();

        assert_eq!(params.interval, PriceInterval::Day);
        assert_eq!(params.interval_multiplier, 1);
        // Dates are well-formed and the default window is non-empty.
        let start = chrono::NaiveDate::parse_from_str(&params.start_date, "%Y-%m-%d").unwrap();
        let end = chrono::NaiveDate::parse_from_str(&params.end_date, "%Y-%m-%d").unwrap();
        assert!(start < end);
    }

    #[test]
    fn test_order_by_wire_names() {
        let desc = serde_json::to_value(OrderBy::ReportPeriodDesc).unwrap();
        assert_eq!(desc, "-report_period");
        let asc: OrderBy = serde_json::from_value(serde_json::json!("report_period")).unwrap();
        assert_eq!(asc, OrderBy::ReportPeriodAsc);
    }

    #[test]
    fn test_derive_title_truncates() {
        let long = "a".repeat(200);
        let title = derive_title(&long);
        assert!(title.chars().count() <= 81);

        assert_eq!(derive_title("  What is AAPL worth?  "), "What is AAPL worth?");
    }
}
