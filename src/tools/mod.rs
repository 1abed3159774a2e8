//! Tool catalog for the agent loop
//!
//! The callable tool set is a closed, tagged-variant enum: one variant per
//! financial data category, each carrying a statically validated parameter
//! record. Adding a tool is a compile-time-checked extension, not a map
//! entry. Parameter validation happens at parse time, before any network
//! call; a malformed argument set is fed back to the LLM as the tool result
//! so it may retry within the step budget.

use crate::error::AgentError;
use crate::gateway::FinancialDatasetsClient;
use crate::models::{
    default_end_date, default_start_date, NewsParams, SearchStocksParams, StatementParams,
    StockPricesParams, ToolLoadingContent,
};
use crate::stream::EventSink;
use crate::Result;
use serde_json::{json, Value};
use tracing::debug;

pub const GET_STOCK_PRICES: &str = "getStockPrices";
pub const GET_INCOME_STATEMENTS: &str = "getIncomeStatements";
pub const GET_BALANCE_SHEETS: &str = "getBalanceSheets";
pub const GET_CASH_FLOW_STATEMENTS: &str = "getCashFlowStatements";
pub const GET_FINANCIAL_METRICS: &str = "getFinancialMetrics";
pub const SEARCH_STOCKS_BY_FILTERS: &str = "searchStocksByFilters";
pub const GET_NEWS: &str = "getNews";

/// Financial statement fields accepted by the screening endpoint.
pub const VALID_STOCK_SEARCH_FILTERS: &[&str] = &[
    "revenue",
    "gross_profit",
    "operating_expense",
    "operating_income",
    "net_income",
    "ebitda",
    "earnings_per_share",
    "free_cash_flow",
    "operating_cash_flow",
    "capital_expenditure",
    "cash_and_equivalents",
    "total_assets",
    "current_assets",
    "total_liabilities",
    "current_liabilities",
    "total_debt",
    "shareholders_equity",
];

/// One fully validated tool invocation request.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    GetStockPrices(StockPricesParams),
    GetIncomeStatements(StatementParams),
    GetBalanceSheets(StatementParams),
    GetCashFlowStatements(StatementParams),
    GetFinancialMetrics(StatementParams),
    SearchStocksByFilters(SearchStocksParams),
    GetNews(NewsParams),
}

impl ToolCall {
    /// Validate a raw (name, arguments) pair from the LLM into a typed call.
    /// Defaults are applied here, so structurally equal requests normalize to
    /// equal calls regardless of which optional fields were spelled out.
    pub fn parse(name: &str, args: &Value) -> Result<Self> {
        fn decode<T: serde::de::DeserializeOwned>(name: &str, args: &Value) -> Result<T> {
            serde_json::from_value(args.clone())
                .map_err(|e| AgentError::InvalidToolInput(format!("{}: {}", name, e)))
        }

        match name {
            GET_STOCK_PRICES => Ok(ToolCall::GetStockPrices(decode(name, args)?)),
            GET_INCOME_STATEMENTS => Ok(ToolCall::GetIncomeStatements(decode(name, args)?)),
            GET_BALANCE_SHEETS => Ok(ToolCall::GetBalanceSheets(decode(name, args)?)),
            GET_CASH_FLOW_STATEMENTS => Ok(ToolCall::GetCashFlowStatements(decode(name, args)?)),
            GET_FINANCIAL_METRICS => Ok(ToolCall::GetFinancialMetrics(decode(name, args)?)),
            SEARCH_STOCKS_BY_FILTERS => {
                let params: SearchStocksParams = decode(name, args)?;
                if params.filters.is_empty() {
                    return Err(AgentError::InvalidToolInput(
                        "searchStocksByFilters: at least one filter is required".to_string(),
                    ));
                }
                for filter in &params.filters {
                    if !VALID_STOCK_SEARCH_FILTERS.contains(&filter.field.as_str()) {
                        return Err(AgentError::InvalidToolInput(format!(
                            "searchStocksByFilters: unknown filter field '{}'",
                            filter.field
                        )));
                    }
                }
                Ok(ToolCall::SearchStocksByFilters(params))
            }
            GET_NEWS => Ok(ToolCall::GetNews(decode(name, args)?)),
            other => Err(AgentError::ToolNotFound(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::GetStockPrices(_) => GET_STOCK_PRICES,
            ToolCall::GetIncomeStatements(_) => GET_INCOME_STATEMENTS,
            ToolCall::GetBalanceSheets(_) => GET_BALANCE_SHEETS,
            ToolCall::GetCashFlowStatements(_) => GET_CASH_FLOW_STATEMENTS,
            ToolCall::GetFinancialMetrics(_) => GET_FINANCIAL_METRICS,
            ToolCall::SearchStocksByFilters(_) => SEARCH_STOCKS_BY_FILTERS,
            ToolCall::GetNews(_) => GET_NEWS,
        }
    }

    /// Parameter object with all defaults applied, used for dedup keying.
    pub fn normalized_args(&self) -> Value {
        let result = match self {
            ToolCall::GetStockPrices(p) => serde_json::to_value(p),
            ToolCall::GetIncomeStatements(p)
            | ToolCall::GetBalanceSheets(p)
            | ToolCall::GetCashFlowStatements(p)
            | ToolCall::GetFinancialMetrics(p) => serde_json::to_value(p),
            ToolCall::SearchStocksByFilters(p) => serde_json::to_value(p),
            ToolCall::GetNews(p) => serde_json::to_value(p),
        };
        result.unwrap_or(Value::Null)
    }
}

/// Declarative tool entry handed to the LLM provider.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    let ticker = |what: &str| {
        json!({ "type": "string", "description": format!("The ticker of the company to get {} for", what) })
    };
    let statement_schema = |what: &str| {
        json!({
            "type": "object",
            "properties": {
                "ticker": ticker(what),
                "period": {
                    "type": "string",
                    "enum": ["quarterly", "annual", "ttm"],
                    "description": format!("The period of the {} to return", what)
                },
                "limit": {
                    "type": "number",
                    "description": format!("The number of {} to return", what)
                },
                "report_period_lte": {
                    "type": "string",
                    "description": "Upper report-period date bound (YYYY-MM-DD)"
                },
                "report_period_gte": {
                    "type": "string",
                    "description": "Lower report-period date bound (YYYY-MM-DD)"
                }
            },
            "required": ["ticker"]
        })
    };

    vec![
        ToolDefinition {
            name: GET_STOCK_PRICES,
            description: "Get stock prices and market cap for a company: a snapshot of the \
                          current price and market cap, plus historical prices over a given \
                          time period.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "ticker": ticker("historical prices"),
                    "start_date": {
                        "type": "string",
                        "description": "The start date for historical prices (YYYY-MM-DD)"
                    },
                    "end_date": {
                        "type": "string",
                        "description": "The end date for historical prices (YYYY-MM-DD)"
                    },
                    "interval": {
                        "type": "string",
                        "enum": ["second", "minute", "day", "week", "month", "year"],
                        "description": "The interval between price points"
                    },
                    "interval_multiplier": {
                        "type": "number",
                        "description": "The multiplier for the interval"
                    }
                },
                "required": ["ticker"]
            }),
        },
        ToolDefinition {
            name: GET_INCOME_STATEMENTS,
            description: "Get the income statements of a company",
            parameters: statement_schema("income statements"),
        },
        ToolDefinition {
            name: GET_BALANCE_SHEETS,
            description: "Get the balance sheets of a company",
            parameters: statement_schema("balance sheets"),
        },
        ToolDefinition {
            name: GET_CASH_FLOW_STATEMENTS,
            description: "Get the cash flow statements of a company",
            parameters: statement_schema("cash flow statements"),
        },
        ToolDefinition {
            name: GET_FINANCIAL_METRICS,
            description: "Get derived financial metrics of a company, like P/E ratio, that \
                          cannot be found in the income statement, balance sheet, or cash \
                          flow statement.",
            parameters: statement_schema("financial metrics"),
        },
        ToolDefinition {
            name: SEARCH_STOCKS_BY_FILTERS,
            description: "Search for stocks based on financial criteria. Use this tool when \
                          asked to find or screen stocks by metrics like revenue, net income, \
                          or debt. Supports gt, gte, lt, lte, and eq comparisons.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "filters": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "field": { "type": "string", "enum": VALID_STOCK_SEARCH_FILTERS },
                                "operator": { "type": "string", "enum": ["gt", "gte", "lt", "lte", "eq"] },
                                "value": { "type": "number" }
                            },
                            "required": ["field", "operator", "value"]
                        },
                        "description": "The filters to search for, e.g. [{\"field\": \"revenue\", \"operator\": \"gt\", \"value\": 50000000000}]"
                    },
                    "period": { "type": "string", "enum": ["quarterly", "annual", "ttm"] },
                    "limit": { "type": "number", "description": "The number of stocks to return" },
                    "order_by": { "type": "string", "enum": ["-report_period", "report_period"] }
                },
                "required": ["filters"]
            }),
        },
        ToolDefinition {
            name: GET_NEWS,
            description: "Get news and latest events for a company. Returns a list of news \
                          articles; include dates in your output.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "ticker": ticker("news"),
                    "limit": { "type": "number", "description": "The number of news articles to return" }
                },
                "required": ["ticker"]
            }),
        },
    ]
}

/// Execution seam between the agent loop and the outside world. The
/// production implementation talks to the financial data gateway; tests
/// substitute scripted executors.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall, events: &EventSink) -> Result<Value>;
}

/// Tool executor backed by the financial datasets API.
pub struct FinancialToolCatalog {
    gateway: FinancialDatasetsClient,
}

impl FinancialToolCatalog {
    pub fn new(gateway: FinancialDatasetsClient) -> Self {
        Self { gateway }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for FinancialToolCatalog {
    async fn execute(&self, call: &ToolCall, events: &EventSink) -> Result<Value> {
        debug!(tool = call.name(), "executing tool call");

        match call {
            ToolCall::GetStockPrices(params) => {
                let params = widen_degenerate_range(params.clone());

                let snapshot = self.gateway.price_snapshot(&params.ticker).await?;
                let historical = self.gateway.prices(&params).await?;

                Ok(json!({
                    "ticker": params.ticker,
                    "snapshot": snapshot,
                    "historical": historical,
                }))
            }
            ToolCall::GetIncomeStatements(params) => self.gateway.income_statements(params).await,
            ToolCall::GetBalanceSheets(params) => self.gateway.balance_sheets(params).await,
            ToolCall::GetCashFlowStatements(params) => {
                self.gateway.cash_flow_statements(params).await
            }
            ToolCall::GetFinancialMetrics(params) => self.gateway.financial_metrics(params).await,
            ToolCall::SearchStocksByFilters(params) => {
                events.emit(crate::models::ProgressEvent::ToolLoading(
                    ToolLoadingContent {
                        tool: SEARCH_STOCKS_BY_FILTERS.to_string(),
                        is_loading: true,
                        message: Some(
                            "Searching for stocks matching your criteria...".to_string(),
                        ),
                    },
                ));

                let result = self.gateway.search_stocks(params).await;

                events.emit(crate::models::ProgressEvent::ToolLoading(
                    ToolLoadingContent {
                        tool: SEARCH_STOCKS_BY_FILTERS.to_string(),
                        is_loading: false,
                        message: None,
                    },
                ));

                result
            }
            ToolCall::GetNews(params) => self.gateway.news(params).await,
        }
    }
}

/// An empty or inverted price window falls back to the default one-month
/// range ending today.
fn widen_degenerate_range(mut params: StockPricesParams) -> StockPricesParams {
    if params.start_date >= params.end_date {
        params.start_date = default_start_date();
        params.end_date = default_end_date();
    }
    params
}
