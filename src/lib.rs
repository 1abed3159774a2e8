//! Financial chat agent
//!
//! An agentic question-answering service for financial research. Each turn a
//! planning model decomposes the user's query into display-friendly sub-tasks,
//! then the main model runs a bounded tool-calling loop against live market
//! data (prices, statements, metrics, screening, news), streaming progress and
//! answer text to the client as server-sent events. Completed turns are
//! sanitized and persisted once the client acknowledges the stream flush.
//!
//! Module map:
//! - [`agent`] - the per-turn step driver
//! - [`planner`] - query decomposition into sub-tasks
//! - [`tools`] - the closed tool set and its executor
//! - [`dedup`] - per-turn duplicate tool-call suppression
//! - [`gateway`] - financialdatasets.ai HTTP client
//! - [`llm`] - language model abstraction and OpenAI-compatible client
//! - [`stream`] - progress event channel and flush acknowledgement
//! - [`finalize`] - response sanitization and persistence
//! - [`store`] - conversation storage
//! - [`api`] - axum HTTP surface

pub mod agent;
pub mod api;
pub mod dedup;
pub mod error;
pub mod finalize;
pub mod gateway;
pub mod llm;
pub mod models;
pub mod planner;
pub mod store;
pub mod stream;
pub mod tools;

pub use error::{AgentError, Result};
