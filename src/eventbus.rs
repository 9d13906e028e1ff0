//! # Stage: Event Bus
//!
//! ## Responsibility
//! Generic broadcast of values of type `T` to every registered subscriber.
//! Each subscriber owns a bounded queue and drains it in its own task, so one
//! slow or failing observer never stalls the publisher or its peers.
//!
//! ## Guarantees
//! - Non-blocking: [`Bus::send`] only ever does `try_send`; a full queue drops
//!   the value for that subscriber alone and counts it in [`Bus::dropped`]
//! - Ordered: sends are serialized per bus, so every subscriber sees values in
//!   publish order
//! - Idempotent unsubscribe: an [`Unsubscribe`] handle runs at most once, from
//!   any task, including while a send is in flight
//! - Latest-value views: [`subscribe_with_filter`] keeps only the newest
//!   accepted value (drop-oldest) for consumers that render state, not history
//!
//! ## NOT Responsible For
//! - Deciding what a subscriber may see (that is [`crate::filter`])
//! - Replaying history to late subscribers

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use futures_util::Stream;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// BusConfig
// ---------------------------------------------------------------------------

/// Default number of undelivered values a subscriber may hold.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Configuration for a [`Bus`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Queue capacity of each subscription.
    pub subscriber_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Unsubscribe
// ---------------------------------------------------------------------------

type UnsubscribeFn = Box<dyn FnOnce() + Send>;

/// Handle that removes a subscriber from its bus.
///
/// Clone freely; the first [`unsubscribe`](Self::unsubscribe) call wins and
/// later calls are no-ops.
#[derive(Clone)]
pub struct Unsubscribe {
    f: Arc<Mutex<Option<UnsubscribeFn>>>,
}

impl Unsubscribe {
    fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            f: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// Remove the subscriber and run its hook. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        let f = self.f.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(f) = f {
            f();
        }
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.f.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("done", &self.is_unsubscribed())
            .finish()
    }
}

/// Unsubscribes when dropped.
struct UnsubscribeOnDrop(Unsubscribe);

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One observer's end of a [`Bus`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    guard: UnsubscribeOnDrop,
}

impl<T: Send + 'static> Subscription<T> {
    /// Next value, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// A handle that can end this subscription from elsewhere.
    pub fn unsubscriber(&self) -> Unsubscribe {
        self.guard.0.clone()
    }

    /// Adapt into a [`Stream`]; dropping the stream unsubscribes.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + Unpin {
        use tokio_stream::StreamExt;
        let Subscription { rx, guard } = self;
        tokio_stream::wrappers::ReceiverStream::new(rx).map(move |v| {
            let _ = &guard;
            v
        })
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct BusState<T> {
    cfg: BusConfig,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<T>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

/// Broadcast bus for values of type `T`.
///
/// Clones share the same subscriber registry.
///
/// # Example
/// ```ignore
/// let bus: Bus<u32> = Bus::new(BusConfig::default());
/// let mut sub = bus.subscribe();
/// bus.send(7);
/// assert_eq!(sub.recv().await, Some(7));
/// ```
pub struct Bus<T> {
    inner: Arc<BusState<T>>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Bus<T> {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl<T: Clone + Send + 'static> Bus<T> {
    pub fn new(cfg: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusState {
                cfg,
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Deliver `event` to every current subscriber.
    pub fn send(&self, event: T) {
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let mut closed = Vec::new();
        for (id, tx) in subs.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(subscriber = id, "subscriber queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            subs.remove(&id);
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription<T> {
        self.subscribe_with_hook(|| {})
    }

    /// Register a new subscriber; `on_unsubscribe` runs once when it leaves.
    pub fn subscribe_with_hook(
        &self,
        on_unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.inner.cfg.subscriber_capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        debug!(subscriber = id, "subscribed");

        let registry: Weak<BusState<T>> = Arc::downgrade(&self.inner);
        let unsubscribe = Unsubscribe::new(move || {
            if let Some(state) = registry.upgrade() {
                state
                    .subscribers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
            }
            debug!(subscriber = id, "unsubscribed");
            on_unsubscribe();
        });

        Subscription {
            rx,
            guard: UnsubscribeOnDrop(unsubscribe),
        }
    }

    /// Number of registered subscribers.
    pub fn subscribers(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Total values dropped because a subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Latest-value subscriptions
// ---------------------------------------------------------------------------

/// Receiving end of a single-slot, newest-wins channel.
///
/// If a value has not been read when a newer one arrives, the older value is
/// discarded. Dropping the receiver ends whatever feeds it.
pub struct Latest<R> {
    rx: watch::Receiver<Option<R>>,
}

impl<R: Clone + Send + Sync + 'static> Latest<R> {
    pub(crate) fn channel() -> (watch::Sender<Option<R>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// Wait for a value newer than the last one returned.
    ///
    /// Returns `None` once the producer has gone and nothing unseen is left.
    pub async fn next(&mut self) -> Option<R> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(v) = self.rx.borrow_and_update().clone() {
                return Some(v);
            }
        }
    }

    /// Adapt into a [`Stream`] of newest values.
    pub fn into_stream(self) -> impl Stream<Item = R> + Send {
        futures_util::stream::unfold(self, |mut latest| async move {
            latest.next().await.map(|v| (v, latest))
        })
    }
}

/// Subscribe to `bus` through `predicate`, keeping only the newest accepted value.
///
/// `predicate` maps each event to `Some(value)` to deliver or `None` to skip.
/// It runs on a dedicated task. The subscription ends when the returned
/// [`Unsubscribe`] is invoked or the [`Latest`] receiver is dropped. A panic
/// in `predicate` ends only this subscription.
pub fn subscribe_with_filter<T, R, F>(bus: &Bus<T>, predicate: F) -> (Latest<R>, Unsubscribe)
where
    T: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
    F: Fn(T) -> Option<R> + Send + 'static,
{
    let mut sub = bus.subscribe();
    let unsubscribe = sub.unsubscriber();
    let (tx, latest) = Latest::channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                event = sub.recv() => {
                    let Some(event) = event else { break };
                    if let Some(value) = predicate(event) {
                        if tx.send(Some(value)).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    (latest, unsubscribe)
}

/// Forward every event from `source` into `sink` until `cancel` fires.
///
/// The source subscription is released when the relay stops.
pub fn relay<T>(cancel: CancellationToken, source: &Bus<T>, sink: Bus<T>) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    let mut sub = source.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = sub.recv() => match event {
                    Some(event) => sink.send(event),
                    None => break,
                },
            }
        }
        debug!("relay stopped");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    fn bus() -> Bus<u32> {
        Bus::new(BusConfig::default())
    }

    // ===== BusConfig =====

    #[test]
    fn test_bus_config_default_capacity() {
        assert_eq!(BusConfig::default().subscriber_capacity, DEFAULT_SUBSCRIBER_CAPACITY);
    }

    // ===== send / subscribe =====

    #[tokio::test]
    async fn test_send_reaches_every_subscriber() {
        let bus = bus();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.send(1);
        bus.send(2);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_fine() {
        bus().send(9);
    }

    #[tokio::test]
    async fn test_subscribers_count_tracks_registry() {
        let bus = bus();
        assert_eq!(bus.subscribers(), 0);
        let a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.subscribers(), 2);
        a.unsubscriber().unsubscribe();
        assert_eq!(bus.subscribers(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_for_slow_subscriber() {
        let bus: Bus<u32> = Bus::new(BusConfig { subscriber_capacity: 2 });
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        bus.send(1);
        assert_eq!(fast.recv().await, Some(1));
        bus.send(2);
        assert_eq!(fast.recv().await, Some(2));
        bus.send(3);
        assert_eq!(fast.recv().await, Some(3));

        assert_eq!(bus.dropped(), 1);
        assert_eq!(slow.recv().await, Some(1));
        assert_eq!(slow.recv().await, Some(2));
    }

    // ===== unsubscribe =====

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_runs_hook_once() {
        let bus = bus();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let sub = bus.subscribe_with_hook(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let u = sub.unsubscriber();
        u.unsubscribe();
        u.unsubscribe();
        u.clone().unsubscribe();
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(u.is_unsubscribed());
        assert_eq!(bus.subscribers(), 0);
    }

    #[tokio::test]
    async fn test_drop_subscription_unsubscribes() {
        let bus = bus();
        let sub = bus.subscribe();
        assert_eq!(bus.subscribers(), 1);
        drop(sub);
        assert_eq!(bus.subscribers(), 0);
    }

    #[tokio::test]
    async fn test_recv_ends_after_unsubscribe() {
        let bus = bus();
        let mut sub = bus.subscribe();
        bus.send(5);
        sub.unsubscriber().unsubscribe();
        assert_eq!(sub.recv().await, Some(5));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_unsubscribe_from_inside_delivery() {
        let bus = bus();
        let mut sub = bus.subscribe();
        let u = sub.unsubscriber();
        let b = bus.clone();
        let task = tokio::spawn(async move {
            while let Some(v) = sub.recv().await {
                if v == 2 {
                    u.unsubscribe();
                }
            }
        });
        for i in 0..5 {
            b.send(i);
        }
        timeout(Duration::from_secs(1), task).await.expect("timeout").unwrap();
        assert_eq!(bus.subscribers(), 0);
    }

    #[tokio::test]
    async fn test_into_stream_drop_unsubscribes() {
        use futures_util::StreamExt;
        let bus = bus();
        let mut stream = Box::pin(bus.subscribe().into_stream());
        bus.send(4);
        assert_eq!(stream.next().await, Some(4));
        drop(stream);
        assert_eq!(bus.subscribers(), 0);
    }

    // ===== subscribe_with_filter =====

    #[tokio::test]
    async fn test_filter_forwards_only_accepted() {
        let bus = bus();
        let (mut latest, _u) = subscribe_with_filter(&bus, |v: u32| (v % 2 == 0).then(|| v * 10));
        bus.send(1);
        bus.send(2);
        let got = timeout(Duration::from_millis(500), latest.next()).await.expect("timeout");
        assert_eq!(got, Some(20));
    }

    #[tokio::test]
    async fn test_filter_keeps_newest_value() {
        let bus = bus();
        let (mut latest, _u) = subscribe_with_filter(&bus, Some);
        for i in 1..=5 {
            bus.send(i);
        }
        // let the filter task drain the subscription before reading
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(latest.next().await, Some(5));
    }

    #[tokio::test]
    async fn test_filter_unsubscribe_ends_latest() {
        let bus = bus();
        let (mut latest, u) = subscribe_with_filter(&bus, Some);
        u.unsubscribe();
        let got = timeout(Duration::from_millis(500), latest.next()).await.expect("timeout");
        assert_eq!(got, None);
        assert_eq!(bus.subscribers(), 0);
    }

    #[tokio::test]
    async fn test_filter_drop_latest_releases_subscription() {
        let bus = bus();
        let (latest, _u) = subscribe_with_filter(&bus, Some);
        assert_eq!(bus.subscribers(), 1);
        drop(latest);
        bus.send(1);
        timeout(Duration::from_millis(500), async {
            while bus.subscribers() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("filter task should release its subscription");
    }

    #[tokio::test]
    async fn test_filter_panic_only_ends_that_subscription() {
        let bus = bus();
        let (mut good, _g) = subscribe_with_filter(&bus, Some);
        let (mut bad, _b) = subscribe_with_filter(&bus, |v: u32| {
            if v == 1 {
                panic!("predicate failed on {v}");
            }
            Some(v)
        });
        assert_eq!(bus.subscribers(), 2);

        bus.send(1);
        let got = timeout(Duration::from_millis(500), bad.next()).await.expect("timeout");
        assert_eq!(got, None);
        assert_eq!(bus.subscribers(), 1);

        bus.send(2);
        let reached = timeout(Duration::from_millis(500), async {
            while let Some(v) = good.next().await {
                if v == 2 {
                    return true;
                }
            }
            false
        })
        .await
        .expect("timeout");
        assert!(reached);
    }

    // ===== relay =====

    #[tokio::test]
    async fn test_relay_forwards_until_cancelled() {
        let source = bus();
        let sink = bus();
        let mut out = sink.subscribe();
        let cancel = CancellationToken::new();
        let handle = relay(cancel.clone(), &source, sink.clone());

        source.send(1);
        let got = timeout(Duration::from_millis(500), out.recv()).await.expect("timeout");
        assert_eq!(got, Some(1));

        cancel.cancel();
        timeout(Duration::from_millis(500), handle).await.expect("timeout").unwrap();
        assert_eq!(source.subscribers(), 0);

        source.send(2);
        assert!(timeout(Duration::from_millis(50), out.recv()).await.is_err());
    }
}
