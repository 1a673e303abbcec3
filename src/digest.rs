//! Digest synthesis over a run of recent bars.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::models::{Bar, BarDigestEntry, TopicDigest};
use crate::providers::{SummaryError, SummaryProvider};

pub struct DigestService {
    summary_provider: Arc<dyn SummaryProvider>,
}

impl DigestService {
    pub fn new(summary_provider: Arc<dyn SummaryProvider>) -> Self {
        Self { summary_provider }
    }

    /// Synthesize a digest from `bars` (most recent first, already limited
    /// to the caller's lookback). An empty run returns a canned digest
    /// without contacting the provider; provider errors surface as-is.
    pub async fn create_digest(
        &self,
        topic: &str,
        bars: &[Bar],
    ) -> Result<TopicDigest, SummaryError> {
        if bars.is_empty() {
            warn!(topic, "no bars available, returning empty digest");
            return Ok(TopicDigest {
                topic: topic.to_string(),
                generated_at: Utc::now(),
                time_range: "No data".to_string(),
                overall_summary: format!("No recent activity to summarize for {topic}"),
                key_developments: Vec::new(),
                trending_elements: Vec::new(),
                sentiment_trend: "stable".to_string(),
                recommendations: vec!["Continue monitoring for activity".to_string()],
            });
        }

        let oldest = bars.iter().map(|b| b.start).min().expect("non-empty bars");
        let newest = bars.iter().map(|b| b.end).max().expect("non-empty bars");
        let lookback_hours = ((newest - oldest).num_seconds() / 3600).max(1);

        let entries: Vec<BarDigestEntry> = bars.iter().map(BarDigestEntry::from).collect();

        let digest = self
            .summary_provider
            .synthesize_digest(topic, &entries, lookback_hours)
            .await?;
        info!(topic, bars = bars.len(), lookback_hours, "generated digest");
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BarSummary, EngagementLevel, Resolution, Tick};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSummary {
        lookbacks: Mutex<Vec<i64>>,
        fail: bool,
    }

    #[async_trait]
    impl SummaryProvider for RecordingSummary {
        async fn summarize_bar(
            &self,
            _topic: &str,
            _ticks: &[Tick],
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<BarSummary, SummaryError> {
            unreachable!("digest service never summarizes single bars")
        }

        async fn synthesize_digest(
            &self,
            topic: &str,
            bars: &[BarDigestEntry],
            lookback_hours: i64,
        ) -> Result<TopicDigest, SummaryError> {
            if self.fail {
                return Err(SummaryError::Api {
                    status: 500,
                    body: "model overloaded".to_string(),
                });
            }
            self.lookbacks.lock().push(lookback_hours);
            Ok(TopicDigest {
                topic: topic.to_string(),
                generated_at: Utc::now(),
                time_range: format!("Last {lookback_hours} hour(s)"),
                overall_summary: format!("{} bars reviewed", bars.len()),
                key_developments: Vec::new(),
                trending_elements: Vec::new(),
                sentiment_trend: "stable".to_string(),
                recommendations: Vec::new(),
            })
        }
    }

    fn bar(start_secs: i64, with_summary: bool) -> Bar {
        let start = Utc.timestamp_opt(start_secs, 0).unwrap();
        Bar {
            topic: "btc".to_string(),
            resolution: Resolution::M5,
            start,
            end: start + chrono::Duration::seconds(300),
            post_count: 3,
            total_likes: 5,
            total_retweets: 1,
            total_replies: 0,
            total_quotes: 0,
            sample_post_ids: vec!["t1".to_string()],
            summary: with_summary.then(|| BarSummary {
                summary: "active window".to_string(),
                key_themes: vec!["news".to_string()],
                sentiment: 0.6,
                post_count: 3,
                engagement_level: EngagementLevel::Medium,
                highlight_posts: Vec::new(),
            }),
        }
    }

    #[tokio::test]
    async fn empty_bars_return_canned_digest_without_provider_call() {
        let provider = Arc::new(RecordingSummary::default());
        let service = DigestService::new(provider.clone());

        let digest = service.create_digest("btc", &[]).await.unwrap();
        assert_eq!(digest.time_range, "No data");
        assert!(provider.lookbacks.lock().is_empty());
    }

    #[tokio::test]
    async fn lookback_hours_derived_from_bar_span() {
        let provider = Arc::new(RecordingSummary::default());
        let service = DigestService::new(provider.clone());

        // Two hours of 5m bars, most recent first.
        let bars = vec![bar(7200, true), bar(3600, true), bar(0, false)];
        let digest = service.create_digest("btc", &bars).await.unwrap();

        assert_eq!(provider.lookbacks.lock().as_slice(), &[2]);
        assert_eq!(digest.overall_summary, "3 bars reviewed");
    }

    #[tokio::test]
    async fn short_spans_round_up_to_one_hour() {
        let provider = Arc::new(RecordingSummary::default());
        let service = DigestService::new(provider.clone());

        let digest = service.create_digest("btc", &[bar(0, true)]).await.unwrap();
        assert_eq!(provider.lookbacks.lock().as_slice(), &[1]);
        assert_eq!(digest.time_range, "Last 1 hour(s)");
    }

    #[tokio::test]
    async fn provider_errors_surface_as_is() {
        let provider = Arc::new(RecordingSummary {
            fail: true,
            ..Default::default()
        });
        let service = DigestService::new(provider);

        let err = service.create_digest("btc", &[bar(0, true)]).await.unwrap_err();
        assert!(matches!(err, SummaryError::Api { status: 500, .. }));
    }
}
