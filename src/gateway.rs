//! External data gateway for the financial datasets provider
//!
//! One method per data category. Every call is a single authenticated HTTP
//! request; failures propagate to the agent loop, which surfaces them to the
//! LLM as tool-error results. No retries at this layer.

use crate::error::AgentError;
use crate::models::{NewsParams, SearchStocksParams, StatementParams, StockPricesParams};
use crate::Result;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_BASE_URL: &str = "https://api.financialdatasets.ai";

/// Connection-pooled client for the financial datasets API.
#[derive(Clone)]
pub struct FinancialDatasetsClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl FinancialDatasetsClient {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Current price and market cap snapshot for a ticker.
    pub async fn price_snapshot(&self, ticker: &str) -> Result<Value> {
        self.get_json(
            "/prices/snapshot",
            &[("ticker", Some(ticker.to_string()))],
        )
        .await
    }

    /// Historical price series over the requested window.
    pub async fn prices(&self, params: &StockPricesParams) -> Result<Value> {
        self.get_json(
            "/prices/",
            &[
                ("ticker", Some(params.ticker.clone())),
                ("start_date", Some(params.start_date.clone())),
                ("end_date", Some(params.end_date.clone())),
                ("interval", Some(params.interval.as_str().to_string())),
                (
                    "interval_multiplier",
                    Some(params.interval_multiplier.to_string()),
                ),
            ],
        )
        .await
    }

    pub async fn income_statements(&self, params: &StatementParams) -> Result<Value> {
        self.get_statements("/financials/income-statements/", params)
            .await
    }

    pub async fn balance_sheets(&self, params: &StatementParams) -> Result<Value> {
        self.get_statements("/financials/balance-sheets/", params)
            .await
    }

    pub async fn cash_flow_statements(&self, params: &StatementParams) -> Result<Value> {
        self.get_statements("/financials/cash-flow-statements/", params)
            .await
    }

    pub async fn financial_metrics(&self, params: &StatementParams) -> Result<Value> {
        self.get_statements("/financial-metrics/", params).await
    }

    /// Multi-field screening. The only POST endpoint; filters travel in the body.
    pub async fn search_stocks(&self, params: &SearchStocksParams) -> Result<Value> {
        let body = json!({
            "filters": params.filters,
            "period": params.period,
            "limit": params.limit,
            "order_by": params.order_by,
        });
        self.post_json("/financials/search/", &body).await
    }

    pub async fn news(&self, params: &NewsParams) -> Result<Value> {
        self.get_json(
            "/news/",
            &[
                ("ticker", Some(params.ticker.clone())),
                ("limit", Some(params.limit.to_string())),
            ],
        )
        .await
    }

    async fn get_statements(&self, path: &str, params: &StatementParams) -> Result<Value> {
        self.get_json(path, &statement_query(params)).await
    }

    /// GET with only the defined query pairs; unset optional bounds are
    /// omitted rather than sent as empty values.
    async fn get_json(&self, path: &str, query: &[(&str, Option<String>)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let pairs = present_pairs(query);

        debug!(path, "financial datasets GET");

        let response = self
            .client
            .get(&url)
            .query(&pairs)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;

        Self::decode(path, response).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        debug!(path, "financial datasets POST");

        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(body)
            .send()
            .await?;

        Self::decode(path, response).await
    }

    async fn decode(path: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(path, status = status.as_u16(), %body, "financial datasets error");
            return Err(AgentError::GatewayError {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.json::<Value>().await.map_err(|e| {
            AgentError::GatewayError {
                status: status.as_u16(),
                body: format!("invalid JSON response from {}: {}", path, e),
            }
        })?;

        Ok(body)
    }
}

fn statement_query(params: &StatementParams) -> [(&'static str, Option<String>); 5] {
    [
        ("ticker", Some(params.ticker.clone())),
        ("period", Some(params.period.as_str().to_string())),
        ("limit", Some(params.limit.to_string())),
        ("report_period_lte", params.report_period_lte.clone()),
        ("report_period_gte", params.report_period_gte.clone()),
    ]
}

/// Keep only the pairs whose value is present.
fn present_pairs<'a>(query: &'a [(&'a str, Option<String>)]) -> Vec<(&'a str, &'a str)> {
    query
        .iter()
        .filter_map(|(k, v)| v.as_deref().map(|v| (*k, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_report_period_bounds_are_omitted() {
        let params: StatementParams =
            serde_json::from_value(json!({ "ticker": "AAPL" })).unwrap();

        let query = statement_query(&params);
        let pairs = present_pairs(&query);
        let keys: Vec<&str> = pairs.iter().map(|(k, _)| *k).collect();

        assert!(keys.contains(&"ticker"));
        assert!(keys.contains(&"period"));
        assert!(keys.contains(&"limit"));
        // Unset bounds never appear, not even as empty values.
        assert!(!keys.contains(&"report_period_lte"));
        assert!(!keys.contains(&"report_period_gte"));
    }

    #[test]
    fn test_set_report_period_bound_is_sent() {
        let params: StatementParams = serde_json::from_value(json!({
            "ticker": "AAPL",
            "report_period_lte": "2024-12-31",
        }))
        .unwrap();

        let query = statement_query(&params);
        let pairs = present_pairs(&query);

        assert!(pairs.contains(&("report_period_lte", "2024-12-31")));
        assert!(!pairs.iter().any(|(k, _)| *k == "report_period_gte"));
    }

    #[test]
    fn test_search_body_shape() {
        use crate::models::{FilterOperator, Period, SearchStocksParams, StockFilter};

        let params = SearchStocksParams {
            filters: vec![StockFilter {
                field: "revenue".to_string(),
                operator: FilterOperator::Gt,
                value: 50_000_000_000.0,
            }],
            period: Period::Ttm,
            limit: 5,
            order_by: Default::default(),
        };

        let body = json!({
            "filters": params.filters,
            "period": params.period,
            "limit": params.limit,
            "order_by": params.order_by,
        });

        assert_eq!(body["filters"][0]["operator"], "gt");
        assert_eq!(body["period"], "ttm");
        assert_eq!(body["order_by"], "-report_period");
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let client = FinancialDatasetsClient::with_base_url(
            "key".to_string(),
            "https://example.test/".to_string(),
        )
        .unwrap();
        assert_eq!(client.base_url, "https://example.test");
    }
}
