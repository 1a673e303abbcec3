//! Periodic tick collection across all watched topics.
//!
//! Every cycle the poller asks the search provider for each topic's safe
//! window and feeds the tick store. Failures flip the owning topic to the
//! error state but never kill the loop; rate-limited topics back off until
//! the upstream-advertised reset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{Topic, TopicStatus, MIN_RESOLUTION};
use crate::providers::{SearchError, SearchProvider};
use crate::registry::TopicRegistry;
use crate::store::TickStore;

/// Upstream freshness buffer: the poll window ends this far in the past.
const WINDOW_LAG_SECS: i64 = 15;
/// Width of each poll window, matching the minimum resolution.
const WINDOW_WIDTH_SECS: i64 = MIN_RESOLUTION.seconds();
/// Pause between topics so one topic cannot monopolize shared budgets.
const INTER_TOPIC_PAUSE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct PollOutcome {
    pub new_ticks: usize,
    pub total_ticks: usize,
}

/// When a topic in the error state may be polled again.
#[derive(Debug, Clone, Copy)]
enum RetryGate {
    /// Retriable from the given instant (transport, rate limit).
    At(DateTime<Utc>),
    /// Operator must resume the topic first (auth, upstream rejection).
    Manual,
}

/// Poll one topic's safe window and fold the result into the stores.
///
/// The window is `[now - 30s, now - 15s)`: one minimum-resolution width,
/// ending inside the upstream's accepted freshness range.
pub async fn poll_topic_once(
    topic: &Topic,
    search: &dyn SearchProvider,
    tick_store: &TickStore,
    registry: &TopicRegistry,
) -> Result<PollOutcome, SearchError> {
    let end = Utc::now() - chrono::Duration::seconds(WINDOW_LAG_SECS);
    let start = end - chrono::Duration::seconds(WINDOW_WIDTH_SECS);

    match search
        .search(&topic.query, &topic.label, start, end, 100)
        .await
    {
        Ok(ticks) => {
            let new_ticks = tick_store.add(&topic.label, ticks);
            let total_ticks = tick_store.count(&topic.label);
            let _ = registry.record_poll_success(&topic.id, total_ticks as u64);
            debug!(topic = %topic.id, new_ticks, total_ticks, "poll succeeded");
            Ok(PollOutcome {
                new_ticks,
                total_ticks,
            })
        }
        Err(e) => {
            let _ = registry.record_poll_error(&topic.id, &e.to_string());
            error!(topic = %topic.id, error = %e, "poll failed");
            Err(e)
        }
    }
}

pub struct TickPoller {
    registry: Arc<TopicRegistry>,
    tick_store: Arc<TickStore>,
    search: Arc<dyn SearchProvider>,
    poll_interval: Duration,
    retry_gates: Arc<Mutex<HashMap<String, RetryGate>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TickPoller {
    pub fn new(
        registry: Arc<TopicRegistry>,
        tick_store: Arc<TickStore>,
        search: Arc<dyn SearchProvider>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            tick_store,
            search,
            poll_interval,
            retry_gates: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_some() {
            warn!("poller already running");
            return;
        }

        let (tx, rx) = watch::channel(false);
        *shutdown = Some(tx);

        let poller = self.clone();
        let handle = tokio::spawn(async move {
            poller.run(rx).await;
        });
        *self.handle.lock() = Some(handle);

        info!(interval_s = self.poll_interval.as_secs(), "tick poller started");
    }

    /// Signal shutdown and wait for the loop to finish. Any in-flight
    /// topic's store insert completes before the task exits.
    pub async fn stop(&self) {
        let Some(tx) = self.shutdown.lock().take() else {
            return;
        };
        let _ = tx.send(true);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("tick poller stopped");
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.poll_cycle(&shutdown).await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One pass over every pollable topic.
    async fn poll_cycle(&self, shutdown: &watch::Receiver<bool>) {
        let candidates = self.pollable_topics();
        if candidates.is_empty() {
            debug!("no pollable topics this cycle");
            return;
        }

        debug!(count = candidates.len(), "polling topics");
        for topic in candidates {
            if *shutdown.borrow() {
                return;
            }

            match poll_topic_once(&topic, self.search.as_ref(), &self.tick_store, &self.registry)
                .await
            {
                Ok(_) => {
                    self.retry_gates.lock().remove(&topic.id);
                }
                Err(e) => self.note_failure(&topic.id, &e),
            }

            tokio::time::sleep(INTER_TOPIC_PAUSE).await;
        }
    }

    /// Active topics, plus errored topics whose retry gate has opened.
    fn pollable_topics(&self) -> Vec<Topic> {
        let now = Utc::now();
        let gates = self.retry_gates.lock();
        self.registry
            .list()
            .into_iter()
            .filter(|topic| match topic.status {
                TopicStatus::Active => true,
                TopicStatus::Paused => false,
                TopicStatus::Error => match gates.get(&topic.id) {
                    Some(RetryGate::At(at)) => *at <= now,
                    Some(RetryGate::Manual) => false,
                    // Errored outside the poller (e.g. manual poll): retry.
                    None => true,
                },
            })
            .collect()
    }

    fn note_failure(&self, topic_id: &str, error: &SearchError) {
        let gate = match error {
            SearchError::Transport(_) => RetryGate::At(Utc::now()),
            SearchError::RateLimited { reset_at, .. } => {
                let until = reset_at.unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
                warn!(topic = topic_id, until = %until, "rate limited, backing off");
                RetryGate::At(until)
            }
            SearchError::Auth(_) | SearchError::Api { .. } => RetryGate::Manual,
        };
        self.retry_gates.lock().insert(topic_id.to_string(), gate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Resolution, Tick};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum StubBehavior {
        Ticks(usize),
        Fail(fn() -> SearchError),
    }

    struct StubSearch {
        behavior: StubBehavior,
        calls: AtomicUsize,
    }

    impl StubSearch {
        fn ticks(n: usize) -> Self {
            Self {
                behavior: StubBehavior::Ticks(n),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(f: fn() -> SearchError) -> Self {
            Self {
                behavior: StubBehavior::Fail(f),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SearchProvider for StubSearch {
        async fn search(
            &self,
            _query: &str,
            topic_label: &str,
            start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _max_results: u32,
        ) -> Result<Vec<Tick>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                StubBehavior::Ticks(n) => Ok((0..*n)
                    .map(|i| Tick {
                        id: format!("{}-{}-{i}", topic_label, start.timestamp()),
                        author: "a".to_string(),
                        text: "t".to_string(),
                        timestamp: start,
                        metrics: StdHashMap::new(),
                        topic: topic_label.to_string(),
                    })
                    .collect()),
                StubBehavior::Fail(f) => Err(f()),
            }
        }
    }

    fn setup(search: StubSearch) -> (Arc<TopicRegistry>, Arc<TickStore>, Arc<TickPoller>) {
        let registry = Arc::new(TopicRegistry::new());
        let tick_store = Arc::new(TickStore::new(1000));
        let poller = Arc::new(TickPoller::new(
            registry.clone(),
            tick_store.clone(),
            Arc::new(search),
            Duration::from_secs(15),
        ));
        (registry, tick_store, poller)
    }

    #[tokio::test]
    async fn successful_poll_updates_topic_stats() {
        let (registry, tick_store, _poller) = setup(StubSearch::ticks(3));
        let topic = registry.add("btc", "btc", Resolution::M1).unwrap();

        let search = StubSearch::ticks(3);
        let outcome = poll_topic_once(&topic, &search, &tick_store, &registry)
            .await
            .unwrap();

        assert_eq!(outcome.new_ticks, 3);
        assert_eq!(outcome.total_ticks, 3);

        let topic = registry.get("btc").unwrap();
        assert_eq!(topic.poll_count, 1);
        assert_eq!(topic.tick_count, 3);
        assert!(topic.last_poll.is_some());
        assert_eq!(topic.tick_count as usize, tick_store.count("btc"));
    }

    #[tokio::test]
    async fn failed_poll_flips_topic_to_error_but_keeps_it() {
        let (registry, tick_store, _poller) = setup(StubSearch::ticks(0));
        let topic = registry.add("btc", "btc", Resolution::M1).unwrap();

        let search = StubSearch::failing(|| SearchError::Transport("timeout".to_string()));
        let err = poll_topic_once(&topic, &search, &tick_store, &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Transport(_)));

        let topic = registry.get("btc").unwrap();
        assert_eq!(topic.status, TopicStatus::Error);
        assert!(topic.last_error.as_deref().unwrap().contains("transport"));
    }

    #[tokio::test]
    async fn paused_topics_are_never_pollable() {
        let (registry, _tick_store, poller) = setup(StubSearch::ticks(1));
        registry.add("btc", "btc", Resolution::M1).unwrap();
        registry.pause("btc").unwrap();

        assert!(poller.pollable_topics().is_empty());
    }

    #[tokio::test]
    async fn transport_errors_retry_next_cycle() {
        let (registry, _tick_store, poller) = setup(StubSearch::ticks(1));
        registry.add("btc", "btc", Resolution::M1).unwrap();
        registry.record_poll_error("btc", "timeout").unwrap();

        poller.note_failure("btc", &SearchError::Transport("timeout".to_string()));
        assert_eq!(poller.pollable_topics().len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_topics_wait_for_reset() {
        let (registry, _tick_store, poller) = setup(StubSearch::ticks(1));
        registry.add("btc", "btc", Resolution::M1).unwrap();
        registry.record_poll_error("btc", "rate limited").unwrap();

        poller.note_failure(
            "btc",
            &SearchError::RateLimited {
                reset_at: Some(Utc::now() + chrono::Duration::seconds(300)),
                remaining: Some(0),
                limit: Some(300),
            },
        );
        assert!(poller.pollable_topics().is_empty());
    }

    #[tokio::test]
    async fn auth_errors_require_operator_resume() {
        let (registry, _tick_store, poller) = setup(StubSearch::ticks(1));
        registry.add("btc", "btc", Resolution::M1).unwrap();
        registry.record_poll_error("btc", "bad token").unwrap();

        poller.note_failure("btc", &SearchError::Auth("bad token".to_string()));
        assert!(poller.pollable_topics().is_empty());

        // Operator resume reactivates the topic regardless of the gate.
        registry.resume("btc").unwrap();
        assert_eq!(poller.pollable_topics().len(), 1);
    }

    #[tokio::test]
    async fn stop_completes_inflight_cycle() {
        let (registry, tick_store, poller) = setup(StubSearch::ticks(2));
        registry.add("btc", "btc", Resolution::M1).unwrap();

        poller.start();
        // Give the first cycle a moment to run, then stop.
        tokio::time::sleep(Duration::from_millis(500)).await;
        poller.stop().await;

        assert_eq!(tick_store.count("btc"), 2);
        let topic = registry.get("btc").unwrap();
        assert!(topic.poll_count >= 1);
    }
}
