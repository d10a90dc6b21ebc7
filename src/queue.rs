//! FIFO notarization queue and its drain scheduler.
//!
//! Requests enter by id only; the captured payload stays in the
//! [`RequestCache`](crate::capture::RequestCache) until dequeue time. The
//! scheduler dequeues strictly one request at a time and enforces a minimum
//! delay between two completed notarizations. Failures are terminal: no
//! attempt is ever retried automatically, and only a successful attempt
//! moves the pacing timestamp forward.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::capture::RequestCache;
use crate::clock::Clock;
use crate::context::Shutdown;
use crate::error::Error;
use crate::notary::{NotarizeRequest, Notarizer, NotarySettings};
use crate::probe;
use crate::publish::{self, ProofCipher, ProofPublisher};
use crate::store::{
    HistoryRecord, HistoryStore, NotarizeStatus, SettingsStore,
};

/// Lifecycle state of a request id known to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting in the FIFO.
    Queued,
    /// Currently being notarized. At most one id is ever in this state.
    InFlight,
    /// Terminal: the notary produced a proof.
    Notarized,
    /// Terminal: the attempt failed. A fresh explicit enqueue may retry.
    Failed,
}

#[derive(Default)]
struct QueueInner {
    /// FIFO of queued ids. Only ids in the `Queued` state live here.
    order: VecDeque<String>,
    states: HashMap<String, EntryState>,
    in_flight: Option<String>,
    /// Completion time of the last successful attempt; zero means no
    /// attempt has succeeded yet so the first dequeue is immediate.
    last_completed_ms: u64,
}

/// The notarization scheduler.
///
/// All time comes from the injected [`Clock`] and all external calls go
/// through the injected [`Notarizer`], so the whole schedule is
/// deterministic under test.
pub struct NotarizeQueue<S> {
    inner: Mutex<QueueInner>,
    clock: Arc<dyn Clock>,
    notarizer: Arc<dyn Notarizer>,
    store: S,
    cache: Arc<RequestCache>,
    publisher: Option<(ProofCipher, Arc<dyn ProofPublisher>)>,
    min_delay: Duration,
    tick_interval: Duration,
    /// Woken on enqueue so a fresh request does not wait for the next
    /// interval tick.
    wakeup: Notify,
}

impl<S> std::fmt::Debug for NotarizeQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotarizeQueue")
            .field("len", &self.inner.lock().order.len())
            .finish()
    }
}

impl<S> NotarizeQueue<S>
where
    S: SettingsStore + HistoryStore + 'static,
{
    pub fn new(
        clock: Arc<dyn Clock>,
        notarizer: Arc<dyn Notarizer>,
        store: S,
        cache: Arc<RequestCache>,
        publisher: Option<(ProofCipher, Arc<dyn ProofPublisher>)>,
        min_delay: Duration,
        tick_interval: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            clock,
            notarizer,
            store,
            cache,
            publisher,
            min_delay,
            tick_interval,
            wakeup: Notify::new(),
        }
    }

    /// Adds a request id to the back of the queue.
    ///
    /// Idempotent: an id that is already queued, in flight, or notarized is
    /// a no-op. A previously failed id is re-admitted, which is the only
    /// retry path there is.
    pub fn enqueue(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.states.get(request_id) {
            Some(EntryState::Queued)
            | Some(EntryState::InFlight)
            | Some(EntryState::Notarized) => return false,
            Some(EntryState::Failed) | None => {}
        }
        inner
            .states
            .insert(request_id.to_owned(), EntryState::Queued);
        inner.order.push_back(request_id.to_owned());
        drop(inner);
        tracing::debug!(
            target: probe::TARGET,
            kind = %probe::Kind::Notarize,
            request_id,
            "request queued for notarization"
        );
        self.wakeup.notify_one();
        true
    }

    /// Removes a queued id. In-flight and terminal ids are untouched.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.states.get(request_id) != Some(&EntryState::Queued) {
            return false;
        }
        inner.states.remove(request_id);
        inner.order.retain(|id| id != request_id);
        true
    }

    /// Current state of a request id, if the queue has seen it.
    pub fn state(&self, request_id: &str) -> Option<EntryState> {
        self.inner.lock().states.get(request_id).copied()
    }

    /// Number of ids waiting in the FIFO.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to dequeue and notarize the head of the queue.
    ///
    /// Returns the id whose attempt reached a terminal state, or `None` if
    /// the pacing gate kept the queue untouched. Internal errors never
    /// propagate out of here; the scheduler must not die.
    pub async fn tick(&self) -> Option<String> {
        let request_id = {
            let mut inner = self.inner.lock();
            if inner.in_flight.is_some() {
                return None;
            }
            let now = self.clock.now_ms();
            if inner.last_completed_ms != 0
                && now
                    < inner.last_completed_ms
                        + self.min_delay.as_millis() as u64
            {
                return None;
            }
            let request_id = inner.order.pop_front()?;
            inner.in_flight = Some(request_id.clone());
            inner
                .states
                .insert(request_id.clone(), EntryState::InFlight);
            request_id
        };

        let captured = match self.cache.get(&request_id) {
            Some(captured) => captured,
            None => {
                // the entry expired or was evicted between enqueue and
                // dequeue; terminal failure, never head-spin on it.
                self.finish(&request_id, false);
                let e = Error::RequestNotCaptured {
                    request_id: request_id.clone(),
                };
                tracing::warn!(
                    target: probe::TARGET,
                    kind = %probe::Kind::Notarize,
                    %request_id,
                    error = %e,
                    "dropping uncapturable request"
                );
                return Some(request_id);
            }
        };

        let settings = match self.notary_settings() {
            Ok(settings) => settings,
            Err(e) => {
                self.finish(&request_id, false);
                tracing::error!(
                    target: probe::TARGET,
                    kind = %probe::Kind::Notarize,
                    %request_id,
                    error = %e,
                    "failed to load notary settings"
                );
                return Some(request_id);
            }
        };

        let request =
            match NotarizeRequest::from_captured(&captured, &settings) {
                Ok(request) => request,
                Err(e) => {
                    self.finish(&request_id, false);
                    tracing::warn!(
                        target: probe::TARGET,
                        kind = %probe::Kind::Notarize,
                        %request_id,
                        error = %e,
                        "captured request cannot be notarized"
                    );
                    return Some(request_id);
                }
            };

        tracing::debug!(
            target: probe::TARGET,
            kind = %probe::Kind::Notarize,
            %request_id,
            url = %captured.url,
            "notarization started"
        );

        match self.notarizer.notarize(request).await {
            Ok(response) if response.is_success() => {
                let completed_at = self.finish(&request_id, true);
                tracing::info!(
                    target: probe::TARGET,
                    kind = %probe::Kind::Notarize,
                    %request_id,
                    "notarization succeeded"
                );
                let record = HistoryRecord {
                    id: request_id.clone(),
                    status: NotarizeStatus::Success,
                    proof: response.proof,
                    timestamp_ms: completed_at,
                    url: captured.url,
                    method: captured.method,
                };
                if let Err(e) = self.store.append_record(record.clone()) {
                    tracing::error!(
                        target: probe::TARGET,
                        kind = %probe::Kind::Notarize,
                        %request_id,
                        error = %e,
                        "failed to persist history record"
                    );
                }
                if let Some((cipher, publisher)) = &self.publisher {
                    publish::publish_record(
                        cipher,
                        publisher.as_ref(),
                        &record,
                    )
                    .await;
                }
            }
            Ok(response) => {
                self.finish(&request_id, false);
                let e = Error::Notarization {
                    request_id: request_id.clone(),
                    reason: response
                        .error
                        .unwrap_or(response.status),
                };
                tracing::warn!(
                    target: probe::TARGET,
                    kind = %probe::Kind::Notarize,
                    %request_id,
                    error = %e,
                    "notary rejected the request"
                );
            }
            Err(e) => {
                self.finish(&request_id, false);
                tracing::warn!(
                    target: probe::TARGET,
                    kind = %probe::Kind::Notarize,
                    %request_id,
                    error = %e,
                    "notarization call failed"
                );
            }
        }
        Some(request_id)
    }

    /// Runs the drain loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = self.wakeup.notified() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    tracing::debug!(
                        target: probe::TARGET,
                        kind = %probe::Kind::Lifecycle,
                        "notarize queue shutting down"
                    );
                    break;
                }
            }
        }
    }

    /// Marks an attempt terminal and releases the in-flight slot. Only a
    /// success moves the pacing timestamp. Returns the completion time.
    fn finish(&self, request_id: &str, success: bool) -> u64 {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.in_flight = None;
        if success {
            inner
                .states
                .insert(request_id.to_owned(), EntryState::Notarized);
            inner.last_completed_ms = now;
        } else {
            inner
                .states
                .insert(request_id.to_owned(), EntryState::Failed);
        }
        now
    }

    fn notary_settings(&self) -> crate::Result<NotarySettings> {
        Ok(NotarySettings {
            notary_url: self.store.notary_api()?,
            proxy_url: self.store.proxy_api()?,
            max_sent: self.store.max_sent_data()?,
            max_recv: self.store.max_recv_data()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::capture::{Header, RequestPatch};
    use crate::clock::ManualClock;
    use crate::notary::NotarizeResponse;
    use crate::store::InMemoryStore;

    struct MockNotarizer {
        succeed: bool,
        calls: AtomicUsize,
        /// When set, each call waits here before responding.
        gate: Option<Arc<Notify>>,
    }

    impl MockNotarizer {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                succeed: true,
                calls: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                succeed: false,
                calls: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                succeed: true,
                calls: AtomicUsize::new(0),
                gate: Some(gate),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Notarizer for MockNotarizer {
        async fn notarize(
            &self,
            _request: NotarizeRequest,
        ) -> crate::Result<NotarizeResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.succeed {
                Ok(NotarizeResponse {
                    status: "success".into(),
                    proof: Some("proof-bytes".into()),
                    error: None,
                })
            } else {
                Ok(NotarizeResponse {
                    status: "error".into(),
                    proof: None,
                    error: Some("notary unavailable".into()),
                })
            }
        }

        async fn verify(&self, _proof: String) -> crate::Result<bool> {
            Ok(true)
        }
    }

    struct Fixture {
        queue: Arc<NotarizeQueue<InMemoryStore>>,
        cache: Arc<RequestCache>,
        clock: Arc<ManualClock>,
        store: InMemoryStore,
    }

    fn fixture(notarizer: Arc<dyn Notarizer>) -> Fixture {
        let clock = Arc::new(ManualClock::starting_at(1_000_000));
        let cache = Arc::new(RequestCache::new(
            Duration::from_secs(300),
            1_000,
            clock.clone(),
        ));
        let store = InMemoryStore::default();
        let queue = Arc::new(NotarizeQueue::new(
            clock.clone(),
            notarizer,
            store.clone(),
            cache.clone(),
            None,
            Duration::from_millis(3_000),
            Duration::from_millis(5_000),
        ));
        Fixture {
            queue,
            cache,
            clock,
            store,
        }
    }

    fn capture(cache: &RequestCache, id: &str) {
        cache.put(
            id,
            RequestPatch {
                tab_id: Some(1),
                url: Some(
                    "https://x.com/i/api/1.1/dm/user_updates.json".into(),
                ),
                method: Some("GET".into()),
                request_headers: Some(vec![Header::new("Cookie", "a=1")]),
                ..Default::default()
            },
        );
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let f = fixture(MockNotarizer::succeeding());
        capture(&f.cache, "r1");
        assert!(f.queue.enqueue("r1"));
        assert!(!f.queue.enqueue("r1"));
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn first_tick_dequeues_immediately() {
        let notarizer = MockNotarizer::succeeding();
        let f = fixture(notarizer.clone());
        capture(&f.cache, "r1");
        f.queue.enqueue("r1");
        assert_eq!(f.queue.tick().await.as_deref(), Some("r1"));
        assert_eq!(notarizer.calls(), 1);
        assert_eq!(f.queue.state("r1"), Some(EntryState::Notarized));
        assert!(f.store.contains_record("r1").unwrap());
    }

    #[tokio::test]
    async fn min_delay_paces_successive_requests() {
        let notarizer = MockNotarizer::succeeding();
        let f = fixture(notarizer.clone());
        for id in ["r1", "r2", "r3"] {
            capture(&f.cache, id);
            f.queue.enqueue(id);
        }
        assert_eq!(f.queue.tick().await.as_deref(), Some("r1"));
        // within the delay window nothing is dequeued, no matter how many
        // ticks fire.
        f.clock.advance(2_999);
        assert_eq!(f.queue.tick().await, None);
        assert_eq!(f.queue.tick().await, None);
        assert_eq!(notarizer.calls(), 1);
        f.clock.advance(1);
        assert_eq!(f.queue.tick().await.as_deref(), Some("r2"));
        f.clock.advance(3_000);
        assert_eq!(f.queue.tick().await.as_deref(), Some("r3"));
        assert_eq!(notarizer.calls(), 3);
    }

    #[tokio::test]
    async fn at_most_one_request_in_flight() {
        let gate = Arc::new(Notify::new());
        let notarizer = MockNotarizer::gated(gate.clone());
        let f = fixture(notarizer.clone());
        capture(&f.cache, "r1");
        capture(&f.cache, "r2");
        f.queue.enqueue("r1");
        f.queue.enqueue("r2");

        let queue = f.queue.clone();
        let first = tokio::spawn(async move { queue.tick().await });
        // wait until the first attempt is actually in flight.
        while f.queue.state("r1") != Some(EntryState::InFlight) {
            tokio::task::yield_now().await;
        }
        // a concurrent tick must not start a second attempt.
        assert_eq!(f.queue.tick().await, None);
        assert_eq!(notarizer.calls(), 1);

        gate.notify_one();
        assert_eq!(first.await.unwrap().as_deref(), Some("r1"));
        assert_eq!(f.queue.state("r2"), Some(EntryState::Queued));
    }

    #[tokio::test]
    async fn failure_is_terminal_and_does_not_move_the_pace() {
        let notarizer = MockNotarizer::failing();
        let f = fixture(notarizer.clone());
        capture(&f.cache, "r1");
        capture(&f.cache, "r2");
        f.queue.enqueue("r1");
        f.queue.enqueue("r2");
        assert_eq!(f.queue.tick().await.as_deref(), Some("r1"));
        assert_eq!(f.queue.state("r1"), Some(EntryState::Failed));
        // failures never land in history.
        assert!(!f.store.contains_record("r1").unwrap());
        // pacing timestamp unchanged, so the next request goes right away.
        assert_eq!(f.queue.tick().await.as_deref(), Some("r2"));
        // the failed id is never dequeued again on its own.
        f.clock.advance(10_000);
        assert_eq!(f.queue.tick().await, None);
        // but an explicit re-enqueue is accepted.
        assert!(f.queue.enqueue("r1"));
    }

    #[tokio::test]
    async fn missing_capture_entry_fails_terminally() {
        let notarizer = MockNotarizer::succeeding();
        let f = fixture(notarizer.clone());
        f.queue.enqueue("ghost");
        assert_eq!(f.queue.tick().await.as_deref(), Some("ghost"));
        assert_eq!(f.queue.state("ghost"), Some(EntryState::Failed));
        assert_eq!(notarizer.calls(), 0);
    }

    #[tokio::test]
    async fn cancel_only_removes_queued_entries() {
        let f = fixture(MockNotarizer::succeeding());
        capture(&f.cache, "r1");
        f.queue.enqueue("r1");
        assert!(f.queue.cancel("r1"));
        assert_eq!(f.queue.state("r1"), None);
        assert_eq!(f.queue.tick().await, None);
        assert!(!f.queue.cancel("r1"));
    }
}
