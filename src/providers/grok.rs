//! Grok chat-completions client for bar summaries and topic digests.
//!
//! Calls are structured: the model is instructed to answer with a single
//! JSON object, the body is deserialized into a fixed schema, and anything
//! malformed surfaces as a schema error. No fallback data is ever injected.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SummaryError, SummaryProvider};
use crate::models::{BarDigestEntry, BarSummary, EngagementLevel, Tick, TopicDigest};
use crate::ratelimit::{RateLimiter, CAT_SUMMARY_FAST, CAT_SUMMARY_REASONING};

const API_URL: &str = "https://api.x.ai/v1/chat/completions";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Posts included verbatim in a bar-summary prompt; the rest are counted.
const PROMPT_POST_LIMIT: usize = 10;
/// Bars included verbatim in a digest prompt.
const PROMPT_BAR_LIMIT: usize = 12;

const BAR_SYSTEM_PROMPT: &str = "You are summarizing one time window of social media posts for a \
live monitoring dashboard. Ignore spam, bot chatter, and promotional reposts. Respond with a \
single JSON object with keys: summary (string), key_themes (array of short strings), sentiment \
(number between 0.0 and 1.0, 0.5 neutral), engagement_level (one of low/medium/high). Focus only \
on what happened inside this window.";

const DIGEST_SYSTEM_PROMPT: &str = "You are writing an executive digest of a topic's recent \
activity across multiple time windows. Provide contextual analysis of trends and developments. \
Respond with a single JSON object with keys: overall_summary (string), key_developments (array \
of strings), trending_elements (array of strings), sentiment_trend (string), recommendations \
(array of strings).";

pub struct GrokClient {
    http: Client,
    api_key: String,
    model_fast: String,
    model_reasoning: String,
    limiter: Arc<RateLimiter>,
}

impl GrokClient {
    pub fn new(
        api_key: String,
        model_fast: String,
        model_reasoning: String,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build model HTTP client")?;

        Ok(Self {
            http,
            api_key,
            model_fast,
            model_reasoning,
            limiter,
        })
    }

    async fn structured_call(
        &self,
        model: &str,
        category: &str,
        system: &str,
        user: &str,
    ) -> Result<String, SummaryError> {
        self.limiter.acquire(category).await;

        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.2),
            max_tokens: Some(1024),
            response_format: Some(ResponseFormat {
                kind: "json_object".to_string(),
            }),
        };

        let response = self
            .http
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SummaryError::Transport("model request timed out".to_string())
                } else {
                    SummaryError::Transport(format!("model request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(SummaryError::Auth("invalid model API key".to_string()));
        }
        if !status.is_success() {
            return Err(SummaryError::Api {
                status: status.as_u16(),
                body: body.chars().take(800).collect(),
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| SummaryError::Schema(format!("completion envelope: {e}")))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .ok_or_else(|| SummaryError::Schema("completion had no message content".to_string()))?;

        debug!(model, category, "model call succeeded");
        Ok(content)
    }
}

#[async_trait]
impl SummaryProvider for GrokClient {
    async fn summarize_bar(
        &self,
        topic: &str,
        ticks: &[Tick],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarSummary, SummaryError> {
        if ticks.is_empty() {
            return Ok(BarSummary {
                summary: "No posts in this time window".to_string(),
                key_themes: Vec::new(),
                sentiment: 0.5,
                post_count: 0,
                engagement_level: EngagementLevel::Low,
                highlight_posts: Vec::new(),
            });
        }

        let posts_text = ticks
            .iter()
            .take(PROMPT_POST_LIMIT)
            .map(|t| format!("@{}: {}", t.author, truncate(&t.text, 200)))
            .collect::<Vec<_>>()
            .join("\n");
        let overflow = if ticks.len() > PROMPT_POST_LIMIT {
            format!("\n... and {} more posts", ticks.len() - PROMPT_POST_LIMIT)
        } else {
            String::new()
        };

        let user_prompt = format!(
            "Topic: {topic}\nTime Window: {}-{}\nPosts ({} total):\n\n{posts_text}{overflow}",
            start.format("%H:%M"),
            end.format("%H:%M"),
            ticks.len(),
        );

        let content = self
            .structured_call(
                &self.model_fast,
                CAT_SUMMARY_FAST,
                BAR_SYSTEM_PROMPT,
                &user_prompt,
            )
            .await?;

        let wire: BarSummaryWire = serde_json::from_str(extract_json(&content))
            .map_err(|e| SummaryError::Schema(format!("bar summary payload: {e}")))?;
        let mut summary = wire.into_summary()?;
        summary.post_count = ticks.len() as u64;
        Ok(summary)
    }

    async fn synthesize_digest(
        &self,
        topic: &str,
        bars: &[BarDigestEntry],
        lookback_hours: i64,
    ) -> Result<TopicDigest, SummaryError> {
        let bars_text = bars
            .iter()
            .take(PROMPT_BAR_LIMIT)
            .enumerate()
            .map(|(i, bar)| {
                format!(
                    "Bar {} ({}): {} ({} posts)",
                    i + 1,
                    bar.start.format("%H:%M"),
                    bar.summary.as_deref().unwrap_or("no summary"),
                    bar.post_count,
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let user_prompt = format!(
            "Topic: {topic}\nTime Period: last {lookback_hours} hour(s)\nBar summaries ({} total \
             bars):\n\n{bars_text}",
            bars.len(),
        );

        let content = self
            .structured_call(
                &self.model_reasoning,
                CAT_SUMMARY_REASONING,
                DIGEST_SYSTEM_PROMPT,
                &user_prompt,
            )
            .await?;

        let wire: TopicDigestWire = serde_json::from_str(extract_json(&content))
            .map_err(|e| SummaryError::Schema(format!("digest payload: {e}")))?;

        Ok(TopicDigest {
            topic: topic.to_string(),
            generated_at: Utc::now(),
            time_range: format!("Last {lookback_hours} hour(s)"),
            overall_summary: wire.overall_summary,
            key_developments: wire.key_developments,
            trending_elements: wire.trending_elements,
            sentiment_trend: wire.sentiment_trend,
            recommendations: wire.recommendations,
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Models occasionally wrap JSON answers in a markdown fence; strip it.
fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim_end_matches("```").trim()
}

#[derive(Debug, Deserialize)]
struct BarSummaryWire {
    summary: String,
    #[serde(default)]
    key_themes: Vec<String>,
    sentiment: f64,
    engagement_level: String,
}

impl BarSummaryWire {
    fn into_summary(self) -> Result<BarSummary, SummaryError> {
        if !(0.0..=1.0).contains(&self.sentiment) {
            return Err(SummaryError::Schema(format!(
                "sentiment {} outside [0.0, 1.0]",
                self.sentiment
            )));
        }
        let engagement_level = match self.engagement_level.to_ascii_lowercase().as_str() {
            "low" => EngagementLevel::Low,
            "medium" => EngagementLevel::Medium,
            "high" => EngagementLevel::High,
            other => {
                return Err(SummaryError::Schema(format!(
                    "unknown engagement level '{other}'"
                )))
            }
        };

        Ok(BarSummary {
            summary: self.summary,
            key_themes: self.key_themes,
            sentiment: self.sentiment,
            post_count: 0,
            engagement_level,
            highlight_posts: Vec::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TopicDigestWire {
    overall_summary: String,
    #[serde(default)]
    key_developments: Vec<String>,
    #[serde(default)]
    trending_elements: Vec<String>,
    sentiment_trend: String,
    #[serde(default)]
    recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_strips_fences() {
        assert_eq!(extract_json("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
    }

    #[test]
    fn bar_summary_wire_rejects_out_of_range_sentiment() {
        let wire = BarSummaryWire {
            summary: "busy window".to_string(),
            key_themes: vec!["earnings".to_string()],
            sentiment: 1.4,
            engagement_level: "high".to_string(),
        };
        assert!(matches!(
            wire.into_summary(),
            Err(SummaryError::Schema(_))
        ));
    }

    #[test]
    fn bar_summary_wire_rejects_unknown_engagement() {
        let wire = BarSummaryWire {
            summary: "busy window".to_string(),
            key_themes: Vec::new(),
            sentiment: 0.7,
            engagement_level: "extreme".to_string(),
        };
        assert!(matches!(
            wire.into_summary(),
            Err(SummaryError::Schema(_))
        ));
    }

    #[test]
    fn bar_summary_wire_accepts_valid_payload() {
        let wire: BarSummaryWire = serde_json::from_str(
            r#"{"summary": "quiet", "key_themes": [], "sentiment": 0.5, "engagement_level": "Low"}"#,
        )
        .unwrap();
        let summary = wire.into_summary().unwrap();
        assert_eq!(summary.engagement_level, EngagementLevel::Low);
        assert_eq!(summary.sentiment, 0.5);
    }
}
