//! Event exporter: drains the probe's event ring onto a bounded queue.
//!
//! The exporter runs as its own task. It stops reading as soon as its stop
//! token is cancelled, including while it waits for queue space or sleeps
//! between failed reads.

use super::EventSource;
use crate::config::{ExportConfig, OverflowPolicy};
use crate::{FlowlatError, Result};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters reported when the exporter exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub records: u64,
    pub dropped: u64,
    pub read_errors: u64,
}

/// Spawn the exporter on the current runtime.
///
/// Returns the consumer end of the queue and the task handle. The task
/// yields its stats once stopped, or an error once reads kept failing.
pub fn spawn_exporter<S: EventSource>(
    source: S,
    config: &ExportConfig,
    stop: CancellationToken,
) -> (mpsc::Receiver<Bytes>, JoinHandle<Result<ExportStats>>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let exporter = Exporter {
        source,
        tx,
        stop,
        overflow: config.overflow,
        max_failures: config.max_consecutive_read_errors,
        initial_backoff: config.initial_backoff(),
        max_backoff: config.max_backoff(),
        stats: ExportStats::default(),
    };
    (rx, tokio::spawn(exporter.run()))
}

struct Exporter<S> {
    source: S,
    tx: mpsc::Sender<Bytes>,
    stop: CancellationToken,
    overflow: OverflowPolicy,
    max_failures: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    stats: ExportStats,
}

impl<S: EventSource> Exporter<S> {
    async fn run(mut self) -> Result<ExportStats> {
        debug!(overflow = ?self.overflow, "event exporter started");

        let mut failures = 0u32;
        let mut backoff = self.initial_backoff;

        loop {
            let record = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                record = self.source.next_record() => record,
            };

            match record {
                Ok(record) => {
                    failures = 0;
                    backoff = self.initial_backoff;
                    self.stats.records += 1;
                    if !self.publish(record).await {
                        break;
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.stats.read_errors += 1;

                    if failures >= self.max_failures {
                        error!(failures, error = %e, "event source keeps failing, giving up");
                        return Err(FlowlatError::EventReadExhausted {
                            failures,
                            last: e.to_string(),
                        });
                    }

                    warn!(failures, error = %e, "event read failed, retrying in {:?}", backoff);
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
            }
        }

        info!(
            records = self.stats.records,
            dropped = self.stats.dropped,
            read_errors = self.stats.read_errors,
            "event exporter stopped"
        );
        Ok(self.stats)
    }

    /// Hand one record to the consumer. Returns false once the exporter
    /// should stop (stop requested or consumer gone).
    async fn publish(&mut self, record: Bytes) -> bool {
        match self.overflow {
            OverflowPolicy::Block => {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => false,
                    sent = self.tx.send(record) => sent.is_ok(),
                }
            }
            OverflowPolicy::Drop => match self.tx.try_send(record) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.stats.dropped += 1;
                    if self.stats.dropped.is_power_of_two() {
                        warn!(dropped = self.stats.dropped, "event queue full, dropping records");
                    }
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
        }
    }
}

#[cfg(target_os = "linux")]
pub use ring::RingBufSource;

#[cfg(target_os = "linux")]
mod ring {
    use super::EventSource;
    use crate::{FlowlatError, Result};
    use async_trait::async_trait;
    use aya::maps::{MapData, RingBuf};
    use bytes::Bytes;
    use tokio::io::unix::AsyncFd;

    /// The probe's ring buffer map, polled through the runtime's reactor.
    pub struct RingBufSource {
        inner: AsyncFd<RingBuf<MapData>>,
    }

    impl RingBufSource {
        /// Must be called from within a tokio runtime.
        pub fn new(ring: RingBuf<MapData>) -> Result<Self> {
            let inner = AsyncFd::new(ring)?;
            Ok(Self { inner })
        }
    }

    #[async_trait]
    impl EventSource for RingBufSource {
        async fn next_record(&mut self) -> Result<Bytes> {
            loop {
                let mut guard = self
                    .inner
                    .readable_mut()
                    .await
                    .map_err(|e| FlowlatError::EventRead(e.to_string()))?;

                if let Some(item) = guard.get_inner_mut().next() {
                    return Ok(Bytes::copy_from_slice(&item));
                }
                guard.clear_ready();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    /// Plays back a script, then signals `drained` and waits forever.
    struct ScriptedSource {
        script: VecDeque<Result<Bytes>>,
        drained: Arc<Notify>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Bytes>>) -> (Self, Arc<Notify>) {
            let drained = Arc::new(Notify::new());
            let source = Self {
                script: script.into(),
                drained: drained.clone(),
            };
            (source, drained)
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn next_record(&mut self) -> Result<Bytes> {
            match self.script.pop_front() {
                Some(next) => next,
                None => {
                    self.drained.notify_one();
                    std::future::pending().await
                }
            }
        }
    }

    /// Produces records as fast as it is polled.
    struct Firehose;

    #[async_trait]
    impl EventSource for Firehose {
        async fn next_record(&mut self) -> Result<Bytes> {
            tokio::task::yield_now().await;
            Ok(Bytes::from_static(b"record"))
        }
    }

    /// Fails every read.
    struct Broken;

    #[async_trait]
    impl EventSource for Broken {
        async fn next_record(&mut self) -> Result<Bytes> {
            Err(FlowlatError::EventRead("EBADF".to_string()))
        }
    }

    fn fast_config() -> ExportConfig {
        ExportConfig {
            queue_capacity: 8,
            max_consecutive_read_errors: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_records_forwarded_in_order() {
        let (source, _drained) = ScriptedSource::new(vec![
            Ok(Bytes::from_static(&[1])),
            Ok(Bytes::from_static(&[2])),
            Ok(Bytes::from_static(&[3])),
        ]);
        let stop = CancellationToken::new();
        let (mut rx, task) = spawn_exporter(source, &fast_config(), stop.clone());

        for expected in 1u8..=3 {
            let record = rx.recv().await.expect("record");
            assert_eq!(record.as_ref(), &[expected]);
        }

        stop.cancel();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_stop_while_queue_full() {
        let config = ExportConfig {
            queue_capacity: 1,
            ..fast_config()
        };
        let stop = CancellationToken::new();
        // Nobody drains rx, so the exporter ends up parked on a full queue.
        let (_rx, task) = spawn_exporter(Firehose, &config, stop.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();

        let stats = timeout(Duration::from_secs(5), task)
            .await
            .expect("exporter exits after stop")
            .unwrap()
            .unwrap();
        assert!(stats.records >= 1);
    }

    #[tokio::test]
    async fn test_exits_when_consumer_gone() {
        let stop = CancellationToken::new();
        let (rx, task) = spawn_exporter(Firehose, &fast_config(), stop);
        drop(rx);

        let result = timeout(Duration::from_secs(5), task)
            .await
            .expect("exporter exits once the queue is closed")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_read_failures_escalate() {
        let stop = CancellationToken::new();
        let (mut rx, task) = spawn_exporter(Broken, &fast_config(), stop);

        let err = timeout(Duration::from_secs(5), task)
            .await
            .expect("exporter gives up")
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            FlowlatError::EventReadExhausted { failures: 3, .. }
        ));
        assert!(rx.recv().await.is_none(), "queue closes with the task");
    }

    #[tokio::test]
    async fn test_transient_failure_resets_counter() {
        let (source, drained) = ScriptedSource::new(vec![
            Err(FlowlatError::EventRead("EAGAIN".to_string())),
            Err(FlowlatError::EventRead("EAGAIN".to_string())),
            Ok(Bytes::from_static(b"a")),
            Err(FlowlatError::EventRead("EAGAIN".to_string())),
            Err(FlowlatError::EventRead("EAGAIN".to_string())),
            Ok(Bytes::from_static(b"b")),
        ]);
        let stop = CancellationToken::new();
        let (mut rx, task) = spawn_exporter(source, &fast_config(), stop.clone());

        drained.notified().await;
        stop.cancel();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.read_errors, 4);
        assert_eq!(rx.recv().await.unwrap().as_ref(), b"a");
        assert_eq!(rx.recv().await.unwrap().as_ref(), b"b");
    }

    #[tokio::test]
    async fn test_drop_policy_counts_overflow() {
        let config = ExportConfig {
            queue_capacity: 1,
            overflow: OverflowPolicy::Drop,
            ..fast_config()
        };
        let (source, drained) = ScriptedSource::new(vec![
            Ok(Bytes::from_static(b"1")),
            Ok(Bytes::from_static(b"2")),
            Ok(Bytes::from_static(b"3")),
        ]);
        let stop = CancellationToken::new();
        let (mut rx, task) = spawn_exporter(source, &config, stop.clone());

        drained.notified().await;
        stop.cancel();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(rx.recv().await.unwrap().as_ref(), b"1");
    }
}
