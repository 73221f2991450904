//! Async sink: detached side effects, record batching, event publishing
//!
//! Every verdict and learning event leaves the request path through this
//! component. Two independent fan-outs:
//!
//! - analytics records are buffered and flushed every flush interval or
//!   when a batch fills, whichever comes first; a failed flush is logged
//!   and the batch discarded (the store is best-effort)
//! - one bus event per verdict (keyed by device) and one per learning
//!   event (keyed by object), published without blocking the caller
//!
//! Detached side-effect tasks (last-known updates, unknown-source anchor
//! creation) run on a semaphore-bounded pool with a 5 second deadline
//! each; a full pool applies back-pressure to enqueue. On shutdown the
//! sink stops accepting work, waits for in-flight tasks up to a deadline,
//! then flushes the remaining batch synchronously.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coordcheck_common::events::{CoordEvent, EventBus};
use coordcheck_common::model::{LearningEvent, PointStatsRecord, VerdictRecord};
use coordcheck_common::params::ConfigRegistry;
use coordcheck_common::Result;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::analytics::AnalyticsStore;

/// Deadline for one detached side-effect task
const TASK_DEADLINE: Duration = Duration::from_secs(5);

enum SinkRecord {
    Verdict(VerdictRecord),
    PointStats(PointStatsRecord),
}

pub struct AsyncSink {
    record_tx: Mutex<Option<mpsc::Sender<SinkRecord>>>,
    pool: Arc<Semaphore>,
    pool_size: usize,
    closed: AtomicBool,
    bus: EventBus,
    config: Arc<ConfigRegistry>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    task_failures: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl AsyncSink {
    pub fn new(
        analytics: Arc<dyn AnalyticsStore>,
        bus: EventBus,
        config: Arc<ConfigRegistry>,
    ) -> Arc<Self> {
        let settings = config.snapshot();
        let batch_size = settings.analytics_batch_size.max(1);
        let flush_interval = Duration::from_secs(settings.analytics_flush_interval_secs.max(1));
        let pool_size = settings.sink_pool_size.max(1);

        let (tx, rx) = mpsc::channel(batch_size.max(8) * 2);
        let flusher = tokio::spawn(run_flusher(analytics, rx, batch_size, flush_interval));

        Arc::new(Self {
            record_tx: Mutex::new(Some(tx)),
            pool: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            closed: AtomicBool::new(false),
            bus,
            config,
            flusher: Mutex::new(Some(flusher)),
            task_failures: Arc::new(AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
        })
    }

    /// Record one verdict: enqueue for the analytics batch and publish the
    /// bus event keyed by device
    pub async fn record_verdict(&self, record: VerdictRecord) {
        let topic = self.config.snapshot().refinement_topic;
        self.bus.emit_ignore(CoordEvent::VerdictIssued {
            topic,
            key: record.device_id.clone(),
            record: record.clone(),
        });
        self.enqueue(SinkRecord::Verdict(record)).await;
    }

    /// Enqueue one per-source statistics row for the analytics batch
    pub async fn record_point_stats(&self, record: PointStatsRecord) {
        self.enqueue(SinkRecord::PointStats(record)).await;
    }

    /// Publish one learning event keyed by object
    pub fn publish_learning(&self, event: LearningEvent) {
        let topic = self.config.snapshot().learning_topic;
        self.bus.emit_ignore(CoordEvent::SourceLearned {
            topic,
            key: event.object_id.clone(),
            event,
        });
    }

    /// Run a side effect as a detached bounded task with its own deadline
    ///
    /// Acquiring a pool slot applies back-pressure when the pool is full.
    /// Failures and timeouts are counted and logged, never surfaced.
    pub async fn spawn_detached<F>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("sink closed; dropping detached task: {}", label);
            return;
        }

        let permit = match self.pool.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let counter = self.task_failures.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(TASK_DEADLINE, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                    warn!("detached task {} failed: {}", label, e);
                }
                Err(_) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                    warn!("detached task {} exceeded {:?} deadline", label, TASK_DEADLINE);
                }
            }
        });
    }

    /// Total background failures and timeouts since startup
    pub fn failure_count(&self) -> u64 {
        self.task_failures.load(Ordering::Relaxed)
    }

    /// Records and tasks dropped (sink closed or overflowed)
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain the sink: stop intake, wait for in-flight tasks, final flush
    pub async fn shutdown(&self, deadline: Duration) {
        self.closed.store(true, Ordering::SeqCst);

        // Wait for in-flight detached tasks to finish
        let drained = tokio::time::timeout(
            deadline,
            self.pool.acquire_many(self.pool_size as u32),
        )
        .await;
        match drained {
            Ok(Ok(permits)) => drop(permits),
            _ => warn!("sink shutdown: in-flight tasks still running at deadline"),
        }

        // Close the record channel; the flusher drains it and performs the
        // final synchronous flush before exiting
        self.record_tx
            .lock()
            .expect("record_tx lock poisoned")
            .take();

        let handle = self
            .flusher
            .lock()
            .expect("flusher lock poisoned")
            .take();
        if let Some(handle) = handle {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("sink shutdown: flusher did not drain before deadline");
            }
        }
        debug!(
            "sink drained (failures={}, dropped={})",
            self.failure_count(),
            self.dropped_count()
        );
    }

    async fn enqueue(&self, record: SinkRecord) {
        let tx = self
            .record_tx
            .lock()
            .expect("record_tx lock poisoned")
            .clone();
        match tx {
            Some(tx) => {
                if tx.send(record).await.is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("record channel closed; dropping sink record");
                }
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn run_flusher(
    analytics: Arc<dyn AnalyticsStore>,
    mut rx: mpsc::Receiver<SinkRecord>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut verdicts: Vec<VerdictRecord> = Vec::with_capacity(batch_size);
    let mut point_stats: Vec<PointStatsRecord> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush(&analytics, &mut verdicts, &mut point_stats).await;
            }
            msg = rx.recv() => match msg {
                Some(SinkRecord::Verdict(r)) => {
                    verdicts.push(r);
                    if verdicts.len() >= batch_size {
                        flush(&analytics, &mut verdicts, &mut point_stats).await;
                    }
                }
                Some(SinkRecord::PointStats(r)) => {
                    point_stats.push(r);
                    if point_stats.len() >= batch_size {
                        flush(&analytics, &mut verdicts, &mut point_stats).await;
                    }
                }
                None => break,
            }
        }
    }

    // Final synchronous flush on shutdown
    flush(&analytics, &mut verdicts, &mut point_stats).await;
}

/// Attempt one flush of both buffers; failed batches are discarded
async fn flush(
    analytics: &Arc<dyn AnalyticsStore>,
    verdicts: &mut Vec<VerdictRecord>,
    point_stats: &mut Vec<PointStatsRecord>,
) {
    if !verdicts.is_empty() {
        if let Err(e) = analytics.insert_verdicts(verdicts).await {
            warn!("discarding batch of {} verdict records: {}", verdicts.len(), e);
        }
        verdicts.clear();
    }
    if !point_stats.is_empty() {
        if let Err(e) = analytics.insert_point_stats(point_stats).await {
            warn!(
                "discarding batch of {} point stats records: {}",
                point_stats.len(),
                e
            );
        }
        point_stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::MemoryAnalytics;
    use chrono::Utc;
    use coordcheck_common::model::Verdict;
    use coordcheck_common::params::Settings;

    fn record(device: &str) -> VerdictRecord {
        VerdictRecord {
            device_id: device.into(),
            latitude: 55.75,
            longitude: 37.62,
            accuracy: 20.0,
            timestamp: 1_700_000_000,
            has_wifi: false,
            has_bt: false,
            has_cell: false,
            verdict: Verdict::Valid,
            confidence: 1.0,
            flow_type: "refinement".into(),
            insert_time: Utc::now(),
        }
    }

    fn setup(
        mutate: impl FnOnce(&mut Settings),
    ) -> (Arc<MemoryAnalytics>, EventBus, Arc<AsyncSink>) {
        let analytics = Arc::new(MemoryAnalytics::new());
        let bus = EventBus::new(64);
        let mut settings = Settings::from_env();
        mutate(&mut settings);
        let config = Arc::new(ConfigRegistry::new(settings));
        let sink = AsyncSink::new(analytics.clone(), bus.clone(), config);
        (analytics, bus, sink)
    }

    #[tokio::test]
    async fn test_full_batch_flushes_immediately() {
        let (analytics, _bus, sink) = setup(|s| {
            s.analytics_batch_size = 2;
            s.analytics_flush_interval_secs = 3600;
        });

        sink.record_verdict(record("d1")).await;
        sink.record_verdict(record("d2")).await;

        // Give the flusher task a moment to run
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = analytics.verdicts();
        assert_eq!(stored.len(), 2);
        // Flush order matches enqueue order
        assert_eq!(stored[0].device_id, "d1");
        assert_eq!(stored[1].device_id, "d2");
    }

    #[tokio::test]
    async fn test_verdict_event_published_to_bus() {
        let (_analytics, bus, sink) = setup(|_| {});
        let mut rx = bus.subscribe();

        sink.record_verdict(record("d1")).await;

        match rx.recv().await.unwrap() {
            CoordEvent::VerdictIssued { key, topic, .. } => {
                assert_eq!(key, "d1");
                assert_eq!(topic, "coordinate-refinement");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_learning_event_keyed_by_object() {
        let (_analytics, bus, sink) = setup(|_| {});
        let mut rx = bus.subscribe();

        sink.publish_learning(LearningEvent {
            object_id: "obj-7".into(),
            latitude: 55.75,
            longitude: 37.62,
            timestamp: 1_700_000_000,
            result: coordcheck_common::model::LearnOutcome::Learned,
            stationary_sources: vec![],
            random_sources: vec![],
            event_time: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            CoordEvent::SourceLearned { key, topic, .. } => {
                assert_eq!(key, "obj-7");
                assert_eq!(topic, "coordinate-learning");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_flush_discards_batch_and_continues() {
        let (analytics, _bus, sink) = setup(|s| {
            s.analytics_batch_size = 1;
            s.analytics_flush_interval_secs = 3600;
        });

        analytics.set_failing(true);
        sink.record_verdict(record("lost")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(analytics.verdicts().is_empty());

        // The sink keeps working after a discarded batch
        analytics.set_failing(false);
        sink.record_verdict(record("kept")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = analytics.verdicts();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].device_id, "kept");
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_batch() {
        let (analytics, _bus, sink) = setup(|s| {
            s.analytics_batch_size = 100;
            s.analytics_flush_interval_secs = 3600;
        });

        sink.record_verdict(record("pending")).await;
        sink.shutdown(Duration::from_secs(2)).await;

        assert_eq!(analytics.verdicts().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_detached_tasks() {
        let (analytics, _bus, sink) = setup(|s| {
            s.analytics_batch_size = 100;
            s.analytics_flush_interval_secs = 3600;
        });

        let sink2 = sink.clone();
        sink.spawn_detached("slow-write", async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sink2
                .record_point_stats(PointStatsRecord {
                    source_type: coordcheck_common::model::SourceType::Wifi,
                    source_id: "aa:bb:cc:dd:ee:ff".into(),
                    latitude: 1.0,
                    longitude: 2.0,
                    observations: 1,
                    last_updated: Utc::now(),
                })
                .await;
            Ok(())
        })
        .await;

        sink.shutdown(Duration::from_secs(2)).await;
        assert_eq!(analytics.point_stats().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_new_tasks() {
        let (_analytics, _bus, sink) = setup(|_| {});
        sink.shutdown(Duration::from_millis(200)).await;

        sink.spawn_detached("late", async { Ok(()) }).await;
        assert_eq!(sink.dropped_count(), 1);

        let failures = sink.failure_count();
        assert_eq!(failures, 0);
    }
}
