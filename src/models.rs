use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engagement metric names recognized on a tick.
pub const METRIC_LIKES: &str = "like_count";
pub const METRIC_RETWEETS: &str = "retweet_count";
pub const METRIC_REPLIES: &str = "reply_count";
pub const METRIC_QUOTES: &str = "quote_count";
pub const METRIC_IMPRESSIONS: &str = "impression_count";

/// A single observed post. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    /// Provider-unique post id.
    pub id: String,
    /// Author handle without the leading '@'.
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Engagement name -> non-negative count (like_count, retweet_count, ...).
    #[serde(default)]
    pub metrics: HashMap<String, u64>,
    /// Topic label this tick was fetched under.
    pub topic: String,
}

impl Tick {
    pub fn metric(&self, name: &str) -> u64 {
        self.metrics.get(name).copied().unwrap_or(0)
    }
}

/// Bar width. Closed set; every member is an integer multiple of the
/// 15 second minimum, so higher-resolution boundaries always coincide
/// with lower-resolution ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "15s")]
    S15,
    #[serde(rename = "30s")]
    S30,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
}

/// The fundamental polling cadence and shortest permitted bar width.
pub const MIN_RESOLUTION: Resolution = Resolution::S15;

/// Read-path default when a topic is created without a resolution.
pub const DEFAULT_RESOLUTION: Resolution = Resolution::M5;

impl Resolution {
    pub const ALL: [Resolution; 7] = [
        Resolution::S15,
        Resolution::S30,
        Resolution::M1,
        Resolution::M5,
        Resolution::M15,
        Resolution::M30,
        Resolution::H1,
    ];

    pub const fn seconds(&self) -> i64 {
        match self {
            Resolution::S15 => 15,
            Resolution::S30 => 30,
            Resolution::M1 => 60,
            Resolution::M5 => 300,
            Resolution::M15 => 900,
            Resolution::M30 => 1800,
            Resolution::H1 => 3600,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::S15 => "15s",
            Resolution::S30 => "30s",
            Resolution::M1 => "1m",
            Resolution::M5 => "5m",
            Resolution::M15 => "15m",
            Resolution::M30 => "30m",
            Resolution::H1 => "1h",
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "15s" => Ok(Resolution::S15),
            "30s" => Ok(Resolution::S30),
            "1m" => Ok(Resolution::M1),
            "5m" => Ok(Resolution::M5),
            "15m" => Ok(Resolution::M15),
            "30m" => Ok(Resolution::M30),
            "1h" => Ok(Resolution::H1),
            other => Err(format!("unknown resolution '{other}'")),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementLevel {
    Low,
    Medium,
    High,
}

/// LLM-derived summary attached to a closed bar.
///
/// `sentiment` is a score in [0.0, 1.0] with 0.5 neutral. `post_count`
/// always mirrors the bar's own count at attachment time and
/// `highlight_posts` holds at most 2 tick ids observed in the bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSummary {
    pub summary: String,
    pub key_themes: Vec<String>,
    pub sentiment: f64,
    pub post_count: u64,
    pub engagement_level: EngagementLevel,
    #[serde(default)]
    pub highlight_posts: Vec<String>,
}

/// Projection of ticks over a half-open, boundary-aligned time window.
///
/// A bar is a value: regenerating from the same ticks yields an equal bar
/// except for `summary`, which is externally derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub topic: String,
    pub resolution: Resolution,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub post_count: u64,
    pub total_likes: u64,
    pub total_retweets: u64,
    pub total_replies: u64,
    pub total_quotes: u64,
    /// Up to 5 tick ids in ascending time order.
    pub sample_post_ids: Vec<String>,
    pub summary: Option<BarSummary>,
}

/// Digest-facing shape of one bar: aggregate metrics plus the flattened
/// summary fields, with raw ticks dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarDigestEntry {
    pub topic: String,
    pub resolution: Resolution,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub post_count: u64,
    pub total_likes: u64,
    pub total_retweets: u64,
    pub total_replies: u64,
    pub total_quotes: u64,
    pub sample_post_ids: Vec<String>,
    pub summary: Option<String>,
    pub sentiment: Option<f64>,
    pub key_themes: Vec<String>,
    pub highlight_posts: Vec<String>,
}

impl From<&Bar> for BarDigestEntry {
    fn from(bar: &Bar) -> Self {
        Self {
            topic: bar.topic.clone(),
            resolution: bar.resolution,
            start: bar.start,
            end: bar.end,
            post_count: bar.post_count,
            total_likes: bar.total_likes,
            total_retweets: bar.total_retweets,
            total_replies: bar.total_replies,
            total_quotes: bar.total_quotes,
            sample_post_ids: bar.sample_post_ids.clone(),
            summary: bar.summary.as_ref().map(|s| s.summary.clone()),
            sentiment: bar.summary.as_ref().map(|s| s.sentiment),
            key_themes: bar
                .summary
                .as_ref()
                .map(|s| s.key_themes.clone())
                .unwrap_or_default(),
            highlight_posts: bar
                .summary
                .as_ref()
                .map(|s| s.highlight_posts.clone())
                .unwrap_or_default(),
        }
    }
}

/// Executive narrative synthesized over a run of recent bars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicDigest {
    pub topic: String,
    pub generated_at: DateTime<Utc>,
    pub time_range: String,
    pub overall_summary: String,
    pub key_developments: Vec<String>,
    pub trending_elements: Vec<String>,
    pub sentiment_trend: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    Active,
    Paused,
    Error,
}

impl TopicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicStatus::Active => "active",
            TopicStatus::Paused => "paused",
            TopicStatus::Error => "error",
        }
    }
}

/// One watched-topic subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    /// Display label; also the tick/bar store key, decoupled from `id`.
    pub label: String,
    /// Opaque upstream search expression.
    pub query: String,
    /// Default resolution on the read path.
    pub resolution: Resolution,
    pub status: TopicStatus,
    pub created_at: DateTime<Utc>,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub poll_count: u64,
    pub tick_count: u64,
}

impl Topic {
    pub fn new(id: String, label: String, query: String, resolution: Resolution) -> Self {
        Self {
            id,
            label,
            query,
            resolution,
            status: TopicStatus::Active,
            created_at: Utc::now(),
            last_poll: None,
            last_error: None,
            poll_count: 0,
            tick_count: 0,
        }
    }
}

/// Derive a registry id from a display label: lowercase, with '$' and
/// whitespace stripped.
pub fn derive_topic_id(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .filter(|c| *c != '$' && !c.is_whitespace())
        .collect()
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub poll_interval_seconds: u64,
    pub auto_start: bool,
    pub max_ticks_per_topic: usize,
    pub max_bars_per_resolution: usize,
    pub search_bearer_token: Option<String>,
    pub model_api_key: Option<String>,
    pub model_fast: String,
    pub model_reasoning: String,
    pub mock_providers: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let poll_interval_seconds = std::env::var("POLL_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(MIN_RESOLUTION.seconds() as u64);

        let auto_start = std::env::var("AUTO_START")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        let max_ticks_per_topic = std::env::var("MAX_TICKS_PER_TOPIC")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(10_000);

        let max_bars_per_resolution = std::env::var("MAX_BARS_PER_RESOLUTION")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(500);

        let mock_providers = std::env::var("MOCK_PROVIDERS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        let search_bearer_token = std::env::var("SEARCH_BEARER_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let model_api_key = std::env::var("MODEL_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());

        if !mock_providers {
            if search_bearer_token.is_none() {
                anyhow::bail!("SEARCH_BEARER_TOKEN missing (set env var or MOCK_PROVIDERS=true)");
            }
            if model_api_key.is_none() {
                anyhow::bail!("MODEL_API_KEY missing (set env var or MOCK_PROVIDERS=true)");
            }
        }

        let model_fast =
            std::env::var("GROK_MODEL_FAST").unwrap_or_else(|_| "grok-4-1-fast".to_string());
        let model_reasoning = std::env::var("GROK_MODEL_REASONING")
            .unwrap_or_else(|_| "grok-4-1-fast-reasoning".to_string());

        Ok(Self {
            port,
            poll_interval_seconds,
            auto_start,
            max_ticks_per_topic,
            max_bars_per_resolution,
            search_bearer_token,
            model_api_key,
            model_fast,
            model_reasoning,
            mock_providers,
        })
    }
}
