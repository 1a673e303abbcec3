//! Per-resolution bar-close scheduling.
//!
//! One task per supported resolution wakes shortly after every boundary,
//! builds the just-closed bar for each active topic, and stores it. Missed
//! boundaries are skipped, never queued: after a slow cycle the next wake is
//! computed from a fresh now, and the read path's on-demand projection
//! covers any gap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregator::{floor_to_resolution, BarGenerator};
use crate::models::Resolution;
use crate::registry::TopicRegistry;
use crate::store::BarStore;

/// Wake this long after a boundary so the closed window is fully visible
/// to the search provider.
pub const CLOSE_MARGIN: Duration = Duration::from_secs(2);

/// Historical metrics-only bars generated per (topic, resolution) at
/// startup so reads are never empty.
pub const INITIAL_BACKFILL_COUNT: usize = 50;

/// The next bar-close boundary at or after `now`.
pub fn next_close(now: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
    let floored = floor_to_resolution(now, resolution);
    if floored == now {
        now
    } else {
        floored + chrono::Duration::seconds(resolution.seconds())
    }
}

pub struct BarScheduler {
    registry: Arc<TopicRegistry>,
    bar_store: Arc<BarStore>,
    generator: Arc<BarGenerator>,
    backfill_count: usize,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BarScheduler {
    pub fn new(
        registry: Arc<TopicRegistry>,
        bar_store: Arc<BarStore>,
        generator: Arc<BarGenerator>,
    ) -> Self {
        Self {
            registry,
            bar_store,
            generator,
            backfill_count: INITIAL_BACKFILL_COUNT,
            shutdown: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn with_backfill(mut self, backfill_count: usize) -> Self {
        self.backfill_count = backfill_count;
        self
    }

    /// Spawn one close-loop task per supported resolution. Each task
    /// backfills its resolution before entering the loop.
    pub fn start(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_some() {
            warn!("bar scheduler already running");
            return;
        }

        let (tx, rx) = watch::channel(false);
        *shutdown = Some(tx);

        let mut handles = self.handles.lock();
        for resolution in Resolution::ALL {
            let scheduler = self.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_resolution(resolution, rx).await;
            }));
        }

        info!(resolutions = Resolution::ALL.len(), "bar scheduler started");
    }

    pub async fn stop(&self) {
        let Some(tx) = self.shutdown.lock().take() else {
            return;
        };
        let _ = tx.send(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("bar scheduler stopped");
    }

    async fn run_resolution(&self, resolution: Resolution, mut shutdown: watch::Receiver<bool>) {
        self.backfill(resolution).await;

        loop {
            let boundary = next_close(Utc::now(), resolution);
            let wake = boundary + chrono::Duration::from_std(CLOSE_MARGIN).expect("small margin");
            let sleep_for = (wake - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => return,
            }

            self.close_bars_at(boundary, resolution).await;
        }
    }

    /// Build and store the just-closed bar for every active topic. Keys
    /// already holding a summary-bearing bar are skipped, which makes
    /// repeated passes over the same window idempotent.
    async fn close_bars_at(&self, boundary: DateTime<Utc>, resolution: Resolution) {
        let start = boundary - chrono::Duration::seconds(resolution.seconds());

        for topic in self.registry.active() {
            if self
                .bar_store
                .has_summary(&topic.label, resolution, start.timestamp())
            {
                continue;
            }

            let bar = self
                .generator
                .generate_bar(&topic.label, start, boundary, resolution, true)
                .await;
            debug!(
                topic = %topic.label,
                resolution = %resolution,
                start = %start,
                posts = bar.post_count,
                summarized = bar.summary.is_some(),
                "closed bar"
            );
            self.bar_store.put(bar);
        }
    }

    /// Metrics-only history for every active topic at one resolution,
    /// written oldest-first so later bars never precede earlier ones.
    async fn backfill(&self, resolution: Resolution) {
        for topic in self.registry.active() {
            let bars = self
                .generator
                .generate_bars(&topic.label, resolution, self.backfill_count, false, None)
                .await;
            for bar in bars.into_iter().rev() {
                self.bar_store.put(bar);
            }
        }
        debug!(resolution = %resolution, "backfill complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Bar, BarDigestEntry, BarSummary, EngagementLevel, Tick, TopicDigest, METRIC_LIKES,
    };
    use crate::providers::{SummaryError, SummaryProvider};
    use crate::store::TickStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSummary {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl SummaryProvider for CountingSummary {
        async fn summarize_bar(
            &self,
            _topic: &str,
            ticks: &[Tick],
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<BarSummary, SummaryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SummaryError::Transport("model down".to_string()));
            }
            Ok(BarSummary {
                summary: "window".to_string(),
                key_themes: Vec::new(),
                sentiment: 0.5,
                post_count: ticks.len() as u64,
                engagement_level: EngagementLevel::Low,
                highlight_posts: Vec::new(),
            })
        }

        async fn synthesize_digest(
            &self,
            _topic: &str,
            _bars: &[BarDigestEntry],
            _lookback_hours: i64,
        ) -> Result<TopicDigest, SummaryError> {
            Err(SummaryError::Transport("not used".to_string()))
        }
    }

    fn tick(id: &str, secs: i64) -> Tick {
        let mut metrics = HashMap::new();
        metrics.insert(METRIC_LIKES.to_string(), 1);
        Tick {
            id: id.to_string(),
            author: "a".to_string(),
            text: "t".to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            metrics,
            topic: "btc".to_string(),
        }
    }

    fn setup(
        summary: Arc<CountingSummary>,
    ) -> (Arc<TopicRegistry>, Arc<TickStore>, Arc<BarStore>, Arc<BarScheduler>) {
        let registry = Arc::new(TopicRegistry::new());
        let tick_store = Arc::new(TickStore::new(1000));
        let bar_store = Arc::new(BarStore::new(500));
        let generator = Arc::new(BarGenerator::new(tick_store.clone(), summary));
        let scheduler = Arc::new(
            BarScheduler::new(registry.clone(), bar_store.clone(), generator).with_backfill(10),
        );
        (registry, tick_store, bar_store, scheduler)
    }

    #[test]
    fn next_close_rounds_up_to_boundary() {
        let t: DateTime<Utc> = "2025-03-01T12:03:44Z".parse().unwrap();
        assert_eq!(
            next_close(t, Resolution::M5),
            "2025-03-01T12:05:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            next_close(t, Resolution::S15),
            "2025-03-01T12:03:45Z".parse::<DateTime<Utc>>().unwrap()
        );

        let aligned: DateTime<Utc> = "2025-03-01T12:05:00Z".parse().unwrap();
        assert_eq!(next_close(aligned, Resolution::M5), aligned);
    }

    #[tokio::test]
    async fn close_pass_is_idempotent_per_window() {
        let summary = Arc::new(CountingSummary::default());
        let (registry, tick_store, bar_store, scheduler) = setup(summary.clone());
        registry.add("BTC", "btc", Resolution::M1).unwrap();

        let boundary: DateTime<Utc> = "2025-03-01T12:01:00Z".parse().unwrap();
        tick_store.add("BTC", vec![tick("t1", boundary.timestamp() - 30)]);

        scheduler.close_bars_at(boundary, Resolution::M1).await;
        scheduler.close_bars_at(boundary, Resolution::M1).await;

        // Second pass skipped the already-summarized key.
        assert_eq!(summary.calls.load(Ordering::SeqCst), 1);
        let latest = bar_store.get_latest("BTC", Resolution::M1).unwrap();
        assert!(latest.summary.is_some());
        assert_eq!(latest.post_count, 1);
    }

    #[tokio::test]
    async fn failed_summary_is_retried_on_next_pass() {
        let summary = Arc::new(CountingSummary::default());
        summary.fail.store(true, Ordering::SeqCst);
        let (registry, tick_store, bar_store, scheduler) = setup(summary.clone());
        registry.add("BTC", "btc", Resolution::M1).unwrap();

        let boundary: DateTime<Utc> = "2025-03-01T12:01:00Z".parse().unwrap();
        tick_store.add("BTC", vec![tick("t1", boundary.timestamp() - 30)]);

        scheduler.close_bars_at(boundary, Resolution::M1).await;
        let stored = bar_store.get_latest("BTC", Resolution::M1).unwrap();
        assert!(stored.summary.is_none(), "metrics survive a summary failure");

        summary.fail.store(false, Ordering::SeqCst);
        scheduler.close_bars_at(boundary, Resolution::M1).await;
        let upgraded = bar_store.get_latest("BTC", Resolution::M1).unwrap();
        assert!(upgraded.summary.is_some());
        assert_eq!(summary.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn backfill_fills_metrics_only_history() {
        let summary = Arc::new(CountingSummary::default());
        let (registry, tick_store, bar_store, scheduler) = setup(summary.clone());
        registry.add("BTC", "btc", Resolution::M1).unwrap();

        let now = Utc::now().timestamp();
        tick_store.add("BTC", vec![tick("t1", now - 90), tick("t2", now - 150)]);

        scheduler.backfill(Resolution::M1).await;

        let bars = bar_store.get("BTC", Resolution::M1, 50);
        assert_eq!(bars.len(), 10);
        assert!(bars.iter().all(|b| b.summary.is_none()));
        assert_eq!(summary.calls.load(Ordering::SeqCst), 0);

        // Most recent first and contiguous.
        for pair in bars.windows(2) {
            assert_eq!(pair[0].start, pair[1].end);
        }
    }

    #[tokio::test]
    async fn paused_topics_are_skipped() {
        let summary = Arc::new(CountingSummary::default());
        let (registry, tick_store, bar_store, scheduler) = setup(summary.clone());
        registry.add("BTC", "btc", Resolution::M1).unwrap();
        registry.pause("btc").unwrap();

        let boundary: DateTime<Utc> = "2025-03-01T12:01:00Z".parse().unwrap();
        tick_store.add("BTC", vec![tick("t1", boundary.timestamp() - 30)]);

        scheduler.close_bars_at(boundary, Resolution::M1).await;
        assert!(bar_store.get_latest("BTC", Resolution::M1).is_none());
    }

    #[tokio::test]
    async fn start_stop_joins_cleanly() {
        let summary = Arc::new(CountingSummary::default());
        let (registry, _tick_store, _bar_store, scheduler) = setup(summary);
        registry.add("BTC", "btc", Resolution::M1).unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await;
    }
}
