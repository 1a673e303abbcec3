//! Upstream provider seams: post search and LLM summarization.
//!
//! Both providers are abstract traits so the poller, aggregator, and digest
//! service never depend on a concrete upstream. Live clients live in
//! `x_search` and `grok`; deterministic mocks in `mock` back tests and
//! credential-less development.

pub mod grok;
pub mod mock;
pub mod x_search;

pub use grok::GrokClient;
pub use mock::{MockSearchClient, MockSummaryClient};
pub use x_search::{UpstreamRateLimit, XSearchClient};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{BarDigestEntry, BarSummary, Tick, TopicDigest};

/// Post-search failures, split by how the caller should react.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Permanent until an operator intervenes.
    #[error("search auth failed: {0}")]
    Auth(String),
    /// Upstream budget exhausted; carries the advertised reset state.
    #[error("search rate limit exceeded")]
    RateLimited {
        reset_at: Option<DateTime<Utc>>,
        remaining: Option<u32>,
        limit: Option<u32>,
    },
    /// Timeout or connection failure; retriable on the next cycle.
    #[error("search transport failure: {0}")]
    Transport(String),
    /// Non-retriable upstream rejection.
    #[error("search upstream error {status}")]
    Api { status: u16, body: String },
}

/// Summarization failures. The caller never receives fallback data.
#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("model auth failed: {0}")]
    Auth(String),
    #[error("model transport failure: {0}")]
    Transport(String),
    #[error("model upstream error {status}")]
    Api { status: u16, body: String },
    /// Response did not match the target schema.
    #[error("malformed model response: {0}")]
    Schema(String),
}

/// Issues time-bounded search queries and parses responses into ticks.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Fetch posts matching `query` in `[start, end)`, labelled with
    /// `topic_label`. `max_results` is clamped to [10, 100]. An `end`
    /// closer to now than the upstream freshness buffer returns empty
    /// without contacting upstream.
    async fn search(
        &self,
        query: &str,
        topic_label: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<Tick>, SearchError>;
}

/// Issues structured LLM calls returning typed summary payloads.
#[async_trait]
pub trait SummaryProvider: Send + Sync {
    /// Summarize one closed bar window. Charges the fast-model budget.
    async fn summarize_bar(
        &self,
        topic: &str,
        ticks: &[Tick],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarSummary, SummaryError>;

    /// Synthesize a digest over a run of recent bars. Charges the
    /// reasoning-model budget.
    async fn synthesize_digest(
        &self,
        topic: &str,
        bars: &[BarDigestEntry],
        lookback_hours: i64,
    ) -> Result<TopicDigest, SummaryError>;
}
