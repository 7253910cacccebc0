//! In-process progress bus keyed by upload id.
//!
//! Each subscriber owns a small bounded queue for intermediate snapshots plus a separate
//! slot for the terminal one, so a slow reader may miss intermediate updates but always
//! sees `completed` or `failed`. Dropping a [`Subscription`] unregisters it.

use lumen_core::models::{fraction, ProgressPhase, ProgressSnapshot};
use lumen_core::AppError;
use lumen_worker::{DerivationListener, DerivationTask, TaskOutcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 32;

struct Subscriber {
    id: u64,
    updates: mpsc::Sender<ProgressSnapshot>,
    terminal: watch::Sender<Option<ProgressSnapshot>>,
}

struct Channel {
    latest: ProgressSnapshot,
    subscribers: Vec<Subscriber>,
    touched: Instant,
}

impl Channel {
    fn is_terminal(&self) -> bool {
        self.latest.is_terminal()
    }
}

struct BusInner {
    channels: RwLock<HashMap<String, Channel>>,
    next_id: AtomicU64,
    subscriber_capacity: usize,
}

impl BusInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Channel>> {
        self.channels.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Channel>> {
        self.channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pub/sub of [`ProgressSnapshot`]s.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_subscriber_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_subscriber_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                subscriber_capacity: capacity.max(1),
            }),
        }
    }

    /// Publish a snapshot without blocking.
    ///
    /// The first publish for a key creates its channel. Publishes after a terminal event are
    /// ignored, as are intermediate snapshots that would move `uploadedBytes` backwards.
    pub fn publish(&self, mut snapshot: ProgressSnapshot) {
        let mut channels = self.inner.write();
        let channel = channels
            .entry(snapshot.upload_id.clone())
            .or_insert_with(|| Channel {
                latest: ProgressSnapshot::new(
                    snapshot.upload_id.clone(),
                    0,
                    snapshot.total_bytes,
                    ProgressPhase::Uploading,
                ),
                subscribers: Vec::new(),
                touched: Instant::now(),
            });

        if channel.is_terminal() {
            tracing::debug!(upload_id = %snapshot.upload_id, "Ignoring publish after terminal event");
            return;
        }
        if snapshot.uploaded_bytes < channel.latest.uploaded_bytes {
            if !snapshot.is_terminal() {
                tracing::trace!(upload_id = %snapshot.upload_id, "Dropping out-of-order progress snapshot");
                return;
            }
            snapshot.uploaded_bytes = channel.latest.uploaded_bytes;
            snapshot.progress = fraction(snapshot.uploaded_bytes, snapshot.total_bytes);
        }

        channel.latest = snapshot.clone();
        channel.touched = Instant::now();

        let terminal = snapshot.is_terminal();
        channel.subscribers.retain(|subscriber| {
            if terminal {
                subscriber.terminal.send_replace(Some(snapshot.clone()));
                true
            } else {
                match subscriber.updates.try_send(snapshot.clone()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            }
        });
    }

    /// Latest snapshot for `upload_id`.
    pub fn latest(&self, upload_id: &str) -> Option<ProgressSnapshot> {
        self.inner.read().get(upload_id).map(|c| c.latest.clone())
    }

    /// Subscribe to a known key. The latest snapshot is replayed first.
    pub fn subscribe(&self, upload_id: &str) -> Result<Subscription, AppError> {
        let mut channels = self.inner.write();
        let channel = channels
            .get_mut(upload_id)
            .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", upload_id)))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (updates_tx, updates_rx) = mpsc::channel(self.inner.subscriber_capacity);
        let (terminal_tx, terminal_rx) = watch::channel(None);

        if channel.is_terminal() {
            terminal_tx.send_replace(Some(channel.latest.clone()));
        } else {
            let _ = updates_tx.try_send(channel.latest.clone());
        }

        channel.subscribers.push(Subscriber {
            id,
            updates: updates_tx,
            terminal: terminal_tx,
        });

        Ok(Subscription {
            upload_id: upload_id.to_string(),
            id,
            updates: updates_rx,
            terminal: terminal_rx,
            bus: Arc::downgrade(&self.inner),
            finished: false,
        })
    }

    pub fn subscriber_count(&self, upload_id: &str) -> usize {
        self.inner
            .read()
            .get(upload_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    pub fn remove(&self, upload_id: &str) {
        self.inner.write().remove(upload_id);
    }

    /// Drop channels that have not been published to within `ttl`. Their subscribers see
    /// the end of the stream.
    pub fn prune_idle(&self, ttl: Duration) -> usize {
        let mut channels = self.inner.write();
        let before = channels.len();
        channels.retain(|_, channel| channel.touched.elapsed() < ttl);
        before - channels.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Terminal progress reporting for derivations started by an upload.
impl DerivationListener for ProgressBus {
    fn derivation_finished(&self, task: &DerivationTask, outcome: &TaskOutcome) {
        let Some(key) = task.progress_key.as_deref() else {
            return;
        };
        let Some(latest) = self.latest(key) else {
            return;
        };
        let total = latest.total_bytes;
        let snapshot = match outcome {
            TaskOutcome::Ready(record) => {
                ProgressSnapshot::new(key, total, total, ProgressPhase::Completed)
                    .with_media_id(record.id.clone())
            }
            TaskOutcome::Failed { reason } => {
                ProgressSnapshot::new(key, total, total, ProgressPhase::Failed)
                    .with_media_id(task.media_id.clone())
                    .with_error(reason.clone())
            }
            TaskOutcome::Discarded => ProgressSnapshot::new(key, total, total, ProgressPhase::Failed)
                .with_media_id(task.media_id.clone())
                .with_error("not-found: media was deleted during processing"),
            TaskOutcome::Skipped | TaskOutcome::Deferred { .. } => return,
        };
        self.publish(snapshot);
    }
}

/// Receiving end of one subscriber.
pub struct Subscription {
    upload_id: String,
    id: u64,
    updates: mpsc::Receiver<ProgressSnapshot>,
    terminal: watch::Receiver<Option<ProgressSnapshot>>,
    bus: Weak<BusInner>,
    finished: bool,
}

impl Subscription {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Next snapshot in publication order. Returns `None` after the terminal snapshot has
    /// been delivered or once the channel is dropped from the bus.
    pub async fn recv(&mut self) -> Option<ProgressSnapshot> {
        if self.finished {
            return None;
        }
        loop {
            // Intermediate updates queued before the terminal one go out first.
            if let Ok(snapshot) = self.updates.try_recv() {
                return Some(snapshot);
            }
            if let Some(snapshot) = self.terminal.borrow_and_update().clone() {
                self.finished = true;
                return Some(snapshot);
            }

            tokio::select! {
                biased;
                update = self.updates.recv() => match update {
                    Some(snapshot) => return Some(snapshot),
                    None => {
                        self.finished = true;
                        return self.terminal.borrow().clone();
                    }
                },
                changed = self.terminal.changed() => {
                    if changed.is_err() {
                        self.finished = true;
                        return self.terminal.borrow().clone();
                    }
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Some(channel) = bus.write().get_mut(&self.upload_id) {
                channel.subscribers.retain(|s| s.id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(bytes: u64, phase: ProgressPhase) -> ProgressSnapshot {
        ProgressSnapshot::new("up-1", bytes, 100, phase)
    }

    #[tokio::test]
    async fn test_subscriber_sees_publication_order_then_terminal() {
        let bus = ProgressBus::new();
        bus.publish(snap(0, ProgressPhase::Uploading));
        let mut sub = bus.subscribe("up-1").unwrap();

        bus.publish(snap(40, ProgressPhase::Uploading));
        bus.publish(snap(100, ProgressPhase::Processing));
        bus.publish(snap(100, ProgressPhase::Completed).with_media_id("m1"));

        let seen: Vec<u64> = [
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
        ]
        .iter()
        .map(|s| s.uploaded_bytes)
        .collect();
        assert_eq!(seen, vec![0, 40, 100]);

        let last = sub.recv().await.unwrap();
        assert_eq!(last.phase, ProgressPhase::Completed);
        assert_eq!(last.media_id.as_deref(), Some("m1"));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_still_gets_terminal_event() {
        let bus = ProgressBus::with_subscriber_capacity(2);
        bus.publish(snap(0, ProgressPhase::Uploading));
        let mut sub = bus.subscribe("up-1").unwrap();

        for bytes in 1..=50 {
            bus.publish(snap(bytes, ProgressPhase::Uploading));
        }
        bus.publish(snap(50, ProgressPhase::Failed).with_error("idle-timeout"));

        let mut last = None;
        let mut previous = 0;
        while let Some(snapshot) = sub.recv().await {
            assert!(snapshot.uploaded_bytes >= previous);
            previous = snapshot.uploaded_bytes;
            last = Some(snapshot);
        }
        let last = last.unwrap();
        assert_eq!(last.phase, ProgressPhase::Failed);
        assert_eq!(last.error.as_deref(), Some("idle-timeout"));
    }

    #[tokio::test]
    async fn test_terminal_events_are_final_and_monotone() {
        let bus = ProgressBus::new();
        bus.publish(snap(60, ProgressPhase::Uploading));
        bus.publish(snap(30, ProgressPhase::Uploading));
        assert_eq!(bus.latest("up-1").unwrap().uploaded_bytes, 60);

        bus.publish(snap(10, ProgressPhase::Failed));
        let latest = bus.latest("up-1").unwrap();
        assert_eq!(latest.phase, ProgressPhase::Failed);
        assert_eq!(latest.uploaded_bytes, 60);

        bus.publish(snap(100, ProgressPhase::Completed));
        assert_eq!(bus.latest("up-1").unwrap().phase, ProgressPhase::Failed);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay_of_terminal() {
        let bus = ProgressBus::new();
        bus.publish(snap(100, ProgressPhase::Completed));
        let mut sub = bus.subscribe("up-1").unwrap();
        assert_eq!(sub.recv().await.unwrap().phase, ProgressPhase::Completed);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let bus = ProgressBus::new();
        bus.publish(snap(0, ProgressPhase::Uploading));
        let sub = bus.subscribe("up-1").unwrap();
        assert_eq!(bus.subscriber_count("up-1"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("up-1"), 0);
        bus.publish(snap(10, ProgressPhase::Uploading));
    }

    #[tokio::test]
    async fn test_unknown_key_and_pruning() {
        let bus = ProgressBus::new();
        assert!(matches!(bus.subscribe("nope"), Err(AppError::NotFound(_))));

        bus.publish(snap(0, ProgressPhase::Uploading));
        let mut sub = bus.subscribe("up-1").unwrap();
        assert_eq!(sub.recv().await.unwrap().uploaded_bytes, 0);

        assert_eq!(bus.prune_idle(Duration::ZERO), 1);
        assert!(bus.is_empty());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_listener_reports_derivation_outcome() {
        let bus = ProgressBus::new();
        bus.publish(snap(100, ProgressPhase::Processing));
        let task = DerivationTask::new("m1").with_progress_key("up-1");

        bus.derivation_finished(
            &task,
            &TaskOutcome::Failed {
                reason: "decode-failed: bad".into(),
            },
        );
        let latest = bus.latest("up-1").unwrap();
        assert_eq!(latest.phase, ProgressPhase::Failed);
        assert_eq!(latest.error.as_deref(), Some("decode-failed: bad"));

        // Tasks without a progress key publish nothing.
        bus.derivation_finished(&DerivationTask::new("m2"), &TaskOutcome::Skipped);
        assert_eq!(bus.len(), 1);
    }
}
