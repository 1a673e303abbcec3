//! Bar generation: pure projection of ticks into aligned time windows,
//! optionally enriched with a provider summary.
//!
//! Ticks are the source of truth. Bars at any resolution are projected
//! deterministically on demand; the cache in `BarStore` is an optimization
//! maintained by the scheduler, never the authority.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;

use crate::models::{
    Bar, Resolution, Tick, METRIC_LIKES, METRIC_QUOTES, METRIC_REPLIES, METRIC_RETWEETS,
};
use crate::providers::SummaryProvider;
use crate::store::TickStore;

/// Tick ids sampled onto each bar, in time order.
const SAMPLE_POST_LIMIT: usize = 5;
/// Highlight posts attached to a summary.
const HIGHLIGHT_LIMIT: usize = 2;

/// Weights of the engagement score used for highlight selection.
///
/// Defaults: likes x2, retweets x3, replies x4, quotes x2.
#[derive(Debug, Clone, Copy)]
pub struct HighlightWeights {
    pub like: u64,
    pub retweet: u64,
    pub reply: u64,
    pub quote: u64,
}

impl Default for HighlightWeights {
    fn default() -> Self {
        Self {
            like: 2,
            retweet: 3,
            reply: 4,
            quote: 2,
        }
    }
}

impl HighlightWeights {
    pub fn score(&self, tick: &Tick) -> u64 {
        self.like * tick.metric(METRIC_LIKES)
            + self.retweet * tick.metric(METRIC_RETWEETS)
            + self.reply * tick.metric(METRIC_REPLIES)
            + self.quote * tick.metric(METRIC_QUOTES)
    }
}

/// Floor an instant to the containing `resolution` boundary.
pub fn floor_to_resolution(t: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
    let secs = resolution.seconds();
    let floored = t.timestamp() - t.timestamp().rem_euclid(secs);
    Utc.timestamp_opt(floored, 0).single().expect("aligned timestamp in range")
}

/// Pick up to 2 highlight ids: engagement desc, then timestamp desc, then
/// id asc. Fully deterministic for any tie.
pub fn select_highlights(ticks: &[Tick], weights: &HighlightWeights) -> Vec<String> {
    let mut ranked: Vec<&Tick> = ticks.iter().collect();
    ranked.sort_by(|a, b| {
        weights
            .score(b)
            .cmp(&weights.score(a))
            .then(b.timestamp.cmp(&a.timestamp))
            .then(a.id.cmp(&b.id))
    });
    ranked
        .into_iter()
        .take(HIGHLIGHT_LIMIT)
        .map(|t| t.id.clone())
        .collect()
}

pub struct BarGenerator {
    tick_store: Arc<TickStore>,
    summary_provider: Arc<dyn SummaryProvider>,
    weights: HighlightWeights,
}

impl BarGenerator {
    pub fn new(tick_store: Arc<TickStore>, summary_provider: Arc<dyn SummaryProvider>) -> Self {
        Self {
            tick_store,
            summary_provider,
            weights: HighlightWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: HighlightWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Project the `[start, end)` window into a bar.
    ///
    /// With `with_summary` set and a non-empty window, a summary is fetched
    /// and attached with `post_count` overwritten to the observed value and
    /// highlights chosen locally. Summary failure degrades to a metrics-only
    /// bar; it never fails the call.
    pub async fn generate_bar(
        &self,
        topic: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Resolution,
        with_summary: bool,
    ) -> Bar {
        let ticks = self.tick_store.get(topic, Some(start), Some(end));
        let mut bar = project(topic, resolution, start, end, &ticks);

        if with_summary && !ticks.is_empty() {
            match self
                .summary_provider
                .summarize_bar(topic, &ticks, start, end)
                .await
            {
                Ok(mut summary) => {
                    summary.post_count = bar.post_count;
                    summary.highlight_posts = select_highlights(&ticks, &self.weights);
                    bar.summary = Some(summary);
                }
                Err(e) => {
                    warn!(
                        topic,
                        start = %start,
                        error = %e,
                        "bar summary failed, returning metrics-only bar"
                    );
                }
            }
        }

        bar
    }

    /// Project the `limit` most recent closed windows before `end_time`
    /// (defaulting to now), most recent first.
    pub async fn generate_bars(
        &self,
        topic: &str,
        resolution: Resolution,
        limit: usize,
        with_summaries: bool,
        end_time: Option<DateTime<Utc>>,
    ) -> Vec<Bar> {
        let mut bar_end = floor_to_resolution(end_time.unwrap_or_else(Utc::now), resolution);
        let width = chrono::Duration::seconds(resolution.seconds());

        let mut bars = Vec::with_capacity(limit);
        for _ in 0..limit {
            let start = bar_end - width;
            bars.push(
                self.generate_bar(topic, start, bar_end, resolution, with_summaries)
                    .await,
            );
            bar_end = start;
        }
        bars
    }
}

/// Pure tick-to-bar projection.
fn project(
    topic: &str,
    resolution: Resolution,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    ticks: &[Tick],
) -> Bar {
    Bar {
        topic: topic.to_string(),
        resolution,
        start,
        end,
        post_count: ticks.len() as u64,
        total_likes: ticks.iter().map(|t| t.metric(METRIC_LIKES)).sum(),
        total_retweets: ticks.iter().map(|t| t.metric(METRIC_RETWEETS)).sum(),
        total_replies: ticks.iter().map(|t| t.metric(METRIC_REPLIES)).sum(),
        total_quotes: ticks.iter().map(|t| t.metric(METRIC_QUOTES)).sum(),
        sample_post_ids: ticks
            .iter()
            .take(SAMPLE_POST_LIMIT)
            .map(|t| t.id.clone())
            .collect(),
        summary: None,
    }
}
