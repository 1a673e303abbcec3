//! Deterministic mock providers.
//!
//! Seeded from the request itself so repeated calls return identical data.
//! Used by tests and by credential-less development (`MOCK_PROVIDERS=true`);
//! never wired up when live credentials are configured.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::{SearchError, SummaryError, SearchProvider, SummaryProvider};
use crate::models::{
    BarDigestEntry, BarSummary, EngagementLevel, Tick, TopicDigest, METRIC_LIKES, METRIC_QUOTES,
    METRIC_REPLIES, METRIC_RETWEETS,
};
use crate::providers::x_search::FRESHNESS_BUFFER_SECS;

fn seeded_rng(seed_source: &str) -> StdRng {
    let mut hasher = DefaultHasher::new();
    seed_source.hash(&mut hasher);
    StdRng::seed_from_u64(hasher.finish())
}

const MOCK_AUTHORS: [&str; 6] = [
    "marketwatcher",
    "quantdaily",
    "newsflash",
    "chartist",
    "longterm_larry",
    "fastmoney",
];

const MOCK_TEXTS: [&str; 6] = [
    "Interesting move here, volume picking up fast.",
    "Morning thread on what this means for the sector.",
    "Not convinced by the latest numbers, watching closely.",
    "Huge if true. Waiting for confirmation before acting.",
    "This keeps trending for a reason.",
    "Adding this to the watchlist after today's action.",
];

/// Search mock: a small deterministic batch of ticks inside the window.
#[derive(Debug, Default)]
pub struct MockSearchClient;

#[async_trait]
impl SearchProvider for MockSearchClient {
    async fn search(
        &self,
        _query: &str,
        topic_label: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<Tick>, SearchError> {
        let safe_end = Utc::now() - Duration::seconds(FRESHNESS_BUFFER_SECS);
        if end > safe_end {
            return Ok(Vec::new());
        }

        let max_results = max_results.clamp(10, 100) as usize;
        let mut rng = seeded_rng(&format!("{topic_label}:{}", start.timestamp()));
        let count = rng.gen_range(0..=5).min(max_results);
        let window_secs = (end - start).num_seconds().max(1);

        let ticks = (0..count)
            .map(|i| {
                let offset = window_secs * i as i64 / count.max(1) as i64;
                let metrics = HashMap::from([
                    (METRIC_LIKES.to_string(), rng.gen_range(0..50)),
                    (METRIC_RETWEETS.to_string(), rng.gen_range(0..10)),
                    (METRIC_REPLIES.to_string(), rng.gen_range(0..8)),
                    (METRIC_QUOTES.to_string(), rng.gen_range(0..4)),
                ]);
                Tick {
                    id: format!("mock-{}-{}-{i}", topic_label, start.timestamp()),
                    author: MOCK_AUTHORS[rng.gen_range(0..MOCK_AUTHORS.len())].to_string(),
                    text: MOCK_TEXTS[rng.gen_range(0..MOCK_TEXTS.len())].to_string(),
                    timestamp: start + Duration::seconds(offset),
                    metrics,
                    topic: topic_label.to_string(),
                }
            })
            .collect();

        Ok(ticks)
    }
}

/// Summary mock: plausible themes and a seeded sentiment score.
#[derive(Debug, Default)]
pub struct MockSummaryClient;

#[async_trait]
impl SummaryProvider for MockSummaryClient {
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

        let mut rng = seeded_rng(&format!(
            "{topic}:{}:{}",
            start.timestamp(),
            end.timestamp()
        ));

        let mut themes: Vec<&str> = vec!["discussion", "updates", "reactions", "analysis"];
        let lower = topic.to_lowercase();
        if lower.contains("ai") || lower.contains("tech") {
            themes.extend(["innovation", "development", "trends"]);
        } else if topic.contains('$') || lower.contains("finance") {
            themes.extend(["market", "investment", "analysis"]);
        }
        let key_themes: Vec<String> = themes
            .choose_multiple(&mut rng, 3)
            .map(|t| t.to_string())
            .collect();

        let total_engagement: u64 = ticks
            .iter()
            .map(|t| t.metric(METRIC_LIKES) + t.metric(METRIC_RETWEETS) + t.metric(METRIC_REPLIES))
            .sum();
        let engagement_level = if total_engagement >= 200 {
            EngagementLevel::High
        } else if total_engagement >= 40 {
            EngagementLevel::Medium
        } else {
            EngagementLevel::Low
        };

        let sentiment: f64 = rng.gen_range(0.25..0.75);

        Ok(BarSummary {
            summary: format!(
                "{} posts about {topic} in this window with steady discussion.",
                ticks.len()
            ),
            key_themes,
            sentiment,
            post_count: ticks.len() as u64,
            engagement_level,
            highlight_posts: ticks.iter().take(2).map(|t| t.id.clone()).collect(),
        })
    }

    async fn synthesize_digest(
        &self,
        topic: &str,
        bars: &[BarDigestEntry],
        lookback_hours: i64,
    ) -> Result<TopicDigest, SummaryError> {
        let mut rng = seeded_rng(&format!("{topic}:digest:{lookback_hours}"));

        let total_posts: u64 = bars.iter().map(|b| b.post_count).sum();
        let active_bars = bars.iter().filter(|b| b.post_count > 0).count();
        let time_range = format!("Last {lookback_hours} hour(s)");

        if total_posts == 0 {
            return Ok(TopicDigest {
                topic: topic.to_string(),
                generated_at: Utc::now(),
                time_range,
                overall_summary: format!(
                    "No significant activity for {topic} in the last {lookback_hours} hour(s)"
                ),
                key_developments: Vec::new(),
                trending_elements: Vec::new(),
                sentiment_trend: "stable".to_string(),
                recommendations: vec!["Continue monitoring for emerging activity".to_string()],
            });
        }

        let sentiment_trend = ["improving", "declining", "stable", "volatile"]
            .choose(&mut rng)
            .unwrap()
            .to_string();

        Ok(TopicDigest {
            topic: topic.to_string(),
            generated_at: Utc::now(),
            time_range,
            overall_summary: format!(
                "{topic} shows {sentiment_trend} activity with {total_posts} posts across {} time \
                 windows.",
                bars.len()
            ),
            key_developments: vec![
                format!("Consistent discussion across {active_bars} time windows"),
                format!("Total of {total_posts} posts analyzed"),
            ],
            trending_elements: vec!["Community engagement".to_string()],
            sentiment_trend,
            recommendations: vec![
                "Maintain current monitoring intensity".to_string(),
                "Increase check frequency if volume grows".to_string(),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_search_is_deterministic() {
        let client = MockSearchClient;
        let end = Utc::now() - Duration::seconds(60);
        let start = end - Duration::seconds(60);

        let a = client.search("q", "btc", start, end, 100).await.unwrap();
        let b = client.search("q", "btc", start, end, 100).await.unwrap();

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.timestamp, y.timestamp);
        }
        for tick in &a {
            assert!(tick.timestamp >= start && tick.timestamp < end);
        }
    }

    #[tokio::test]
    async fn mock_summary_reports_observed_count_and_bounded_sentiment() {
        let client = MockSummaryClient;
        let end = Utc::now() - Duration::seconds(60);
        let start = end - Duration::seconds(60);
        let ticks = vec![Tick {
            id: "t1".to_string(),
            author: "a".to_string(),
            text: "hello".to_string(),
            timestamp: start,
            metrics: HashMap::new(),
            topic: "btc".to_string(),
        }];

        let summary = client.summarize_bar("btc", &ticks, start, end).await.unwrap();
        assert_eq!(summary.post_count, 1);
        assert!((0.0..=1.0).contains(&summary.sentiment));
    }

    #[tokio::test]
    async fn mock_digest_empty_bars_is_canned() {
        let client = MockSummaryClient;
        let digest = client.synthesize_digest("btc", &[], 1).await.unwrap();
        assert_eq!(digest.sentiment_trend, "stable");
        assert!(digest.key_developments.is_empty());
    }
}
