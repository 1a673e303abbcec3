//! X API v2 recent-search client.
//!
//! Fetches posts for a topic window and converts them into ticks. Every
//! attempt publishes the upstream rate-limit headers to a shared observer
//! snapshot, including on error responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{SearchError, SearchProvider};
use crate::models::{
    Tick, METRIC_IMPRESSIONS, METRIC_LIKES, METRIC_QUOTES, METRIC_REPLIES, METRIC_RETWEETS,
};
use crate::ratelimit::{RateLimiter, CAT_SEARCH};

const SEARCH_URL: &str = "https://api.x.com/2/tweets/search/recent";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Upstream rejects windows ending closer to now than this buffer.
pub const FRESHNESS_BUFFER_SECS: i64 = 15;

/// Last-observed upstream rate-limit state, published after every attempt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpstreamRateLimit {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

pub struct XSearchClient {
    http: Client,
    bearer_token: String,
    limiter: Arc<RateLimiter>,
    status: Arc<RwLock<UpstreamRateLimit>>,
}

impl XSearchClient {
    pub fn new(bearer_token: String, limiter: Arc<RateLimiter>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build search HTTP client")?;

        Ok(Self {
            http,
            bearer_token,
            limiter,
            status: Arc::new(RwLock::new(UpstreamRateLimit::default())),
        })
    }

    /// Handle observers can poll for the last-seen upstream limit state.
    pub fn rate_limit_status(&self) -> Arc<RwLock<UpstreamRateLimit>> {
        self.status.clone()
    }

    fn observe_headers(&self, headers: &HeaderMap) {
        let parse_u32 = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u32>().ok())
        };
        let reset_at = headers
            .get("x-rate-limit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        let mut status = self.status.write();
        if let Some(limit) = parse_u32("x-rate-limit-limit") {
            status.limit = Some(limit);
        }
        if let Some(remaining) = parse_u32("x-rate-limit-remaining") {
            status.remaining = Some(remaining);
            if remaining <= 5 {
                warn!(remaining, "upstream search budget nearly exhausted");
            }
        }
        if reset_at.is_some() {
            status.reset_at = reset_at;
        }
        status.last_updated = Some(Utc::now());
    }

    fn parse_ticks(body: SearchResponse, topic: &str) -> Vec<Tick> {
        let users: HashMap<String, String> = body
            .includes
            .map(|inc| {
                inc.users
                    .into_iter()
                    .map(|u| (u.id, u.username))
                    .collect()
            })
            .unwrap_or_default();

        body.data
            .into_iter()
            .map(|tweet| {
                let author = tweet
                    .author_id
                    .as_ref()
                    .and_then(|id| users.get(id).cloned())
                    .unwrap_or_else(|| "unknown".to_string());

                let timestamp = tweet
                    .created_at
                    .as_deref()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);

                let pm = tweet.public_metrics.unwrap_or_default();
                let metrics = HashMap::from([
                    (METRIC_LIKES.to_string(), pm.like_count),
                    (METRIC_RETWEETS.to_string(), pm.retweet_count),
                    (METRIC_REPLIES.to_string(), pm.reply_count),
                    (METRIC_QUOTES.to_string(), pm.quote_count),
                    (METRIC_IMPRESSIONS.to_string(), pm.impression_count),
                ]);

                Tick {
                    id: tweet.id,
                    author,
                    text: tweet.text,
                    timestamp,
                    metrics,
                    topic: topic.to_string(),
                }
            })
            .collect()
    }
}

/// Append the retweet exclusion once when the operator's query lacks it.
fn with_retweet_filter(query: &str) -> String {
    if query.to_lowercase().contains("-is:retweet") {
        query.to_string()
    } else {
        format!("{query} -is:retweet")
    }
}

fn format_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[async_trait]
impl SearchProvider for XSearchClient {
    async fn search(
        &self,
        query: &str,
        topic_label: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<Tick>, SearchError> {
        let max_results = max_results.clamp(10, 100);

        // Windows ending inside the freshness buffer would be rejected
        // upstream; report them as empty instead of burning budget.
        let safe_end = Utc::now() - chrono::Duration::seconds(FRESHNESS_BUFFER_SECS);
        if end > safe_end {
            warn!(
                topic = topic_label,
                end = %end,
                "window end inside upstream freshness buffer, returning empty"
            );
            return Ok(Vec::new());
        }

        let query = with_retweet_filter(query);
        self.limiter.acquire(CAT_SEARCH).await;

        let start_time = format_time(start);
        let end_time = format_time(end);
        let max_results = max_results.to_string();

        let response = self
            .http
            .get(SEARCH_URL)
            .bearer_auth(&self.bearer_token)
            .query(&[
                ("query", query.as_str()),
                ("start_time", start_time.as_str()),
                ("end_time", end_time.as_str()),
                ("max_results", max_results.as_str()),
                (
                    "tweet.fields",
                    "id,text,created_at,author_id,public_metrics,lang",
                ),
                ("expansions", "author_id"),
                ("user.fields", "username,name,verified"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Transport("search request timed out".to_string())
                } else {
                    SearchError::Transport(format!("search request failed: {e}"))
                }
            })?;

        self.observe_headers(response.headers());

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(SearchError::Auth(
                "invalid or expired bearer token".to_string(),
            ));
        }
        if status.as_u16() == 429 {
            let observed = self.status.read().clone();
            return Err(SearchError::RateLimited {
                reset_at: observed.reset_at,
                remaining: observed.remaining,
                limit: observed.limit,
            });
        }
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Api {
                status: status.as_u16(),
                body: body.chars().take(800).collect(),
            });
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Transport(format!("search response decode failed: {e}")))?;

        let ticks = Self::parse_ticks(body, topic_label);
        info!(topic = topic_label, count = ticks.len(), "fetched ticks");
        Ok(ticks)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<RawTweet>,
    #[serde(default)]
    includes: Option<Includes>,
}

#[derive(Debug, Deserialize)]
struct RawTweet {
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    public_metrics: Option<PublicMetrics>,
}

#[derive(Debug, Default, Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    retweet_count: u64,
    #[serde(default)]
    reply_count: u64,
    #[serde(default)]
    quote_count: u64,
    #[serde(default)]
    impression_count: u64,
}

#[derive(Debug, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: String,
    username: String,
}
