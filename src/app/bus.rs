// ConvStream - app/bus.rs
//
// Event bus: topic-addressed publish/subscribe with a bounded replay buffer.
//
// Architecture:
//   - One `Mutex<BusState>` guards the ring buffer and the subscription list.
//     Publishing appends to the ring and fans out to matching queues while
//     holding it, so every subscription sees envelopes in publish order.
//   - Each subscription owns a bounded `SubQueue` (VecDeque + Condvar).
//     Overflow drops the oldest queued envelope and counts a dead letter;
//     publishers never block on a slow consumer.
//   - Pull consumers call `recv` / `try_recv` on their `Subscription`.
//     Handler subscriptions get a dispatcher thread that pulls from the queue
//     and runs the handler, isolating returned errors and panics.
//   - Subscribers hold their id and queue only. Dropping a handle closes the
//     queue; the bus prunes closed queues on the next publish.
//
// Retention: oldest-first eviction once the ring exceeds the count cap or an
// envelope was published longer ago than the retention period.

use crate::core::filter::EventFilter;
use crate::core::model::{BusEnvelope, BusPayload, ConversationEvent, TimeWindow};
use crate::core::topic::TopicPattern;
use crate::util::cancel::CancelToken;
use crate::util::constants::{
    CANCEL_CHECK_INTERVAL_MS, DEFAULT_MAX_BUFFERED_EVENTS, DEFAULT_RETENTION_HOURS,
    DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
};
use crate::util::error::SubscriberError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Error type returned by subscription handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Envelopes published longer ago than this are evicted.
    pub retention: chrono::Duration,
    /// Ring buffer count cap.
    pub max_buffered: usize,
    /// Capacity of each subscription queue.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::hours(DEFAULT_RETENTION_HOURS),
            max_buffered: DEFAULT_MAX_BUFFERED_EVENTS,
            queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
        }
    }
}

// =============================================================================
// Subscription queue
// =============================================================================

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<BusEnvelope>>,
    closed: bool,
}

/// Bounded per-subscription delivery queue, shared between the bus (producer)
/// and the subscription handle (consumer).
#[derive(Debug)]
struct SubQueue {
    id: u64,
    pattern: TopicPattern,
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Condvar,
    delivered: AtomicU64,
    dead_letters: AtomicU64,
    handler_failures: AtomicU64,
}

impl SubQueue {
    fn new(id: u64, pattern: TopicPattern, capacity: usize) -> Self {
        Self {
            id,
            pattern,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            delivered: AtomicU64::new(0),
            dead_letters: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Enqueue, dropping the oldest entry on overflow.
    fn push(&self, envelope: Arc<BusEnvelope>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if state.items.len() >= self.capacity {
            if let Some(dropped) = state.items.pop_front() {
                let total = self.dead_letters.fetch_add(1, Ordering::Relaxed) + 1;
                if total == 1 {
                    tracing::warn!(
                        subscription = self.id,
                        pattern = %self.pattern,
                        capacity = self.capacity,
                        "Subscriber queue full; dropping oldest envelopes"
                    );
                } else {
                    tracing::debug!(
                        subscription = self.id,
                        sequence = dropped.sequence,
                        dead_letters = total,
                        "Dead letter"
                    );
                }
            }
        }
        state.items.push_back(envelope);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.ready.notify_one();
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.items.clear();
        drop(state);
        self.ready.notify_all();
    }

    fn try_pop(&self) -> Option<Arc<BusEnvelope>> {
        self.lock().items.pop_front()
    }

    /// Wait up to `timeout` for an envelope. `None` on timeout or close.
    fn pop_timeout(&self, timeout: Duration) -> Option<Arc<BusEnvelope>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(env) = state.items.pop_front() {
                return Some(env);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(p) => p.into_inner().0,
            };
        }
    }

    /// Block until an envelope arrives. `None` once closed.
    fn pop_blocking(&self) -> Option<Arc<BusEnvelope>> {
        let mut state = self.lock();
        loop {
            if let Some(env) = state.items.pop_front() {
                return Some(env);
            }
            if state.closed {
                return None;
            }
            state = match self.ready.wait(state) {
                Ok(guard) => guard,
                Err(p) => p.into_inner(),
            };
        }
    }

    fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            id: self.id,
            pattern: self.pattern.as_str().to_string(),
            queued: self.lock().items.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Subscription handles
// =============================================================================

/// Pull-style subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    queue: Arc<SubQueue>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.queue.id
    }

    pub fn pattern(&self) -> &TopicPattern {
        &self.queue.pattern
    }

    /// Next queued envelope without waiting.
    pub fn try_recv(&self) -> Option<Arc<BusEnvelope>> {
        self.queue.try_pop()
    }

    /// Wait up to `timeout` for the next envelope.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<BusEnvelope>> {
        self.queue.pop_timeout(timeout)
    }

    /// Block until the next envelope; `None` once unsubscribed.
    pub fn recv(&self) -> Option<Arc<BusEnvelope>> {
        self.queue.pop_blocking()
    }

    /// Everything currently queued.
    pub fn drain(&self) -> Vec<Arc<BusEnvelope>> {
        let mut state = self.queue.lock();
        state.items.drain(..).collect()
    }

    pub fn dead_letters(&self) -> u64 {
        self.queue.dead_letters.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Subscription driven by its own dispatcher thread.
///
/// Dropping it cancels the dispatcher and closes the queue without waiting
/// for the thread; use [`HandlerSubscription::stop`] to wait.
#[derive(Debug)]
pub struct HandlerSubscription {
    queue: Arc<SubQueue>,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl HandlerSubscription {
    pub fn id(&self) -> u64 {
        self.queue.id
    }

    /// Handler errors and panics so far.
    pub fn handler_failures(&self) -> u64 {
        self.queue.handler_failures.load(Ordering::Relaxed)
    }

    pub fn dead_letters(&self) -> u64 {
        self.queue.dead_letters.load(Ordering::Relaxed)
    }

    /// Stop the dispatcher and wait for it to exit.
    pub fn stop(mut self) {
        self.cancel.cancel();
        self.queue.close();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!(subscription = self.queue.id, "Dispatcher thread panicked");
            }
        }
    }
}

impl Drop for HandlerSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.queue.close();
    }
}

/// Body of a dispatcher thread: pull, run handler, isolate failures.
fn run_dispatcher<F>(queue: Arc<SubQueue>, cancel: CancelToken, mut handler: F)
where
    F: FnMut(&BusEnvelope) -> Result<(), HandlerError>,
{
    let slice = Duration::from_millis(CANCEL_CHECK_INTERVAL_MS);
    tracing::debug!(subscription = queue.id, pattern = %queue.pattern, "Dispatcher started");

    while !cancel.is_cancelled() {
        let Some(envelope) = queue.pop_timeout(slice) else {
            if queue.is_closed() {
                break;
            }
            continue;
        };

        let failure = match catch_unwind(AssertUnwindSafe(|| handler(&envelope))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(SubscriberError::handler(queue.id, e.to_string())),
            Err(panic) => Some(SubscriberError::Panicked {
                subscription: queue.id,
                message: panic_message(panic.as_ref()),
            }),
        };

        if let Some(err) = failure {
            queue.handler_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                sequence = envelope.sequence,
                topic = %envelope.topic,
                error = %err,
                "Subscription handler failed"
            );
        }
    }

    tracing::debug!(subscription = queue.id, "Dispatcher stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub id: u64,
    pub pattern: String,
    pub queued: usize,
    pub delivered: u64,
    pub dead_letters: u64,
    pub handler_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    /// Envelopes published since start.
    pub published: u64,
    /// Envelopes currently in the replay buffer.
    pub buffered: usize,
    /// Envelopes evicted from the replay buffer.
    pub evicted: u64,
    pub subscriptions: Vec<SubscriptionStats>,
}

// =============================================================================
// EventBus
// =============================================================================

#[derive(Debug, Default)]
struct BusState {
    ring: VecDeque<Arc<BusEnvelope>>,
    subs: Vec<Arc<SubQueue>>,
    next_sequence: u64,
    evicted: u64,
    /// Latest payload timestamp among evicted envelopes.
    evicted_until: Option<DateTime<Utc>>,
}

impl BusState {
    fn evict(&mut self, config: &BusConfig, now: DateTime<Utc>) {
        let cutoff = now - config.retention;
        loop {
            let over_count = self.ring.len() > config.max_buffered;
            let expired = self
                .ring
                .front()
                .is_some_and(|env| env.published_at < cutoff);
            if !(over_count || expired) {
                break;
            }
            let Some(old) = self.ring.pop_front() else {
                break;
            };
            self.evicted += 1;
            let ts = old.payload.timestamp();
            if self.evicted_until.map_or(true, |t| ts > t) {
                self.evicted_until = Some(ts);
            }
        }
    }
}

/// Topic router with replay. Constructed explicitly and shared by `Arc`.
#[derive(Debug)]
pub struct EventBus {
    config: BusConfig,
    state: Mutex<BusState>,
    next_sub_id: AtomicU64,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        tracing::debug!(
            max_buffered = config.max_buffered,
            retention_hours = config.retention.num_hours(),
            queue_capacity = config.queue_capacity,
            "EventBus created"
        );
        Self {
            config,
            state: Mutex::new(BusState::default()),
            next_sub_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Publish `payload` under `topic`. Returns the envelope sequence.
    pub fn publish(&self, topic: &str, payload: BusPayload) -> u64 {
        let now = Utc::now();
        let mut state = self.lock();
        state.next_sequence += 1;
        let envelope = Arc::new(BusEnvelope {
            sequence: state.next_sequence,
            topic: topic.to_string(),
            published_at: now,
            payload,
        });

        state.ring.push_back(Arc::clone(&envelope));
        state.evict(&self.config, now);

        state.subs.retain(|q| !q.is_closed());
        for queue in &state.subs {
            if queue.pattern.matches(topic) {
                queue.push(Arc::clone(&envelope));
            }
        }

        envelope.sequence
    }

    /// Publish under the payload's own topic.
    pub fn emit(&self, payload: BusPayload) -> u64 {
        let topic = payload.topic();
        self.publish(&topic, payload)
    }

    fn register(&self, state: &mut BusState, pattern: TopicPattern) -> Arc<SubQueue> {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubQueue::new(id, pattern, self.config.queue_capacity));
        state.subs.push(Arc::clone(&queue));
        tracing::debug!(subscription = id, pattern = %queue.pattern, "Subscribed");
        queue
    }

    /// Pull subscription for envelopes published from now on.
    pub fn subscribe(&self, pattern: impl Into<TopicPattern>) -> Subscription {
        let mut state = self.lock();
        let queue = self.register(&mut state, pattern.into());
        Subscription { queue }
    }

    /// Buffered envelopes matching `pattern` whose payload timestamp is at or
    /// after `since`, in publish order.
    pub fn replay(&self, pattern: &TopicPattern, since: DateTime<Utc>) -> Vec<Arc<BusEnvelope>> {
        let state = self.lock();
        collect_replay(&state, pattern, since)
    }

    /// Replay plus live subscription, registered under the same lock so no
    /// envelope is missed or seen twice.
    pub fn subscribe_with_replay(
        &self,
        pattern: impl Into<TopicPattern>,
        since: DateTime<Utc>,
    ) -> (Vec<Arc<BusEnvelope>>, Subscription) {
        let pattern = pattern.into();
        let mut state = self.lock();
        let replayed = collect_replay(&state, &pattern, since);
        let queue = self.register(&mut state, pattern);
        (replayed, Subscription { queue })
    }

    /// Subscription whose envelopes are handed to `handler` on a dedicated
    /// dispatcher thread.
    pub fn subscribe_with_handler<F>(
        &self,
        pattern: impl Into<TopicPattern>,
        handler: F,
    ) -> std::io::Result<HandlerSubscription>
    where
        F: FnMut(&BusEnvelope) -> Result<(), HandlerError> + Send + 'static,
    {
        let queue = {
            let mut state = self.lock();
            self.register(&mut state, pattern.into())
        };
        let cancel = CancelToken::new();
        let thread = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            std::thread::Builder::new()
                .name(format!("convstream-sub-{}", queue.id))
                .spawn(move || run_dispatcher(queue, cancel, handler))
        };
        match thread {
            Ok(handle) => Ok(HandlerSubscription {
                queue,
                cancel,
                thread: Some(handle),
            }),
            Err(e) => {
                queue.close();
                Err(e)
            }
        }
    }

    /// Stop delivery to `subscription` and release its queue.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let id = subscription.id();
        subscription.queue.close();
        self.lock().subs.retain(|q| q.id != id);
        tracing::debug!(subscription = id, "Unsubscribed");
    }

    /// Up to `limit` most recent conversation events matching `filter`, oldest
    /// first.
    pub fn query_recent(&self, limit: usize, filter: &EventFilter) -> Vec<ConversationEvent> {
        let state = self.lock();
        let mut out: Vec<ConversationEvent> = state
            .ring
            .iter()
            .rev()
            .filter_map(|env| env.payload.as_conversation())
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Buffered conversation events whose timestamp falls in `window` and that
    /// match `filter`, in publish order.
    pub fn conversations_in(&self, window: &TimeWindow, filter: &EventFilter) -> Vec<ConversationEvent> {
        let state = self.lock();
        state
            .ring
            .iter()
            .filter_map(|env| env.payload.as_conversation())
            .filter(|e| window.contains(e.timestamp_utc()) && filter.matches(e))
            .cloned()
            .collect()
    }

    /// Envelopes evicted since the bus was created.
    pub fn evicted_count(&self) -> u64 {
        self.lock().evicted
    }

    /// Whether eviction may have removed events that belong in `window`.
    pub fn has_evicted_within(&self, window: &TimeWindow) -> bool {
        self.lock()
            .evicted_until
            .is_some_and(|t| t >= window.start)
    }

    /// Earliest and latest conversation timestamps in the buffer.
    pub fn conversation_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let state = self.lock();
        let mut span: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
        for e in state.ring.iter().filter_map(|env| env.payload.as_conversation()) {
            let ts = e.timestamp_utc();
            span = Some(match span {
                None => (ts, ts),
                Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
            });
        }
        span
    }

    pub fn stats(&self) -> BusStats {
        let state = self.lock();
        BusStats {
            published: state.next_sequence,
            buffered: state.ring.len(),
            evicted: state.evicted,
            subscriptions: state
                .subs
                .iter()
                .filter(|q| !q.is_closed())
                .map(|q| q.stats())
                .collect(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn collect_replay(
    state: &BusState,
    pattern: &TopicPattern,
    since: DateTime<Utc>,
) -> Vec<Arc<BusEnvelope>> {
    state
        .ring
        .iter()
        .filter(|env| pattern.matches(&env.topic) && env.payload.timestamp() >= since)
        .cloned()
        .collect()
}
