//! Soft-Timeout Timer
//!
//! The native layer has no deadline concept, so timeouts are enforced in
//! software: a dedicated thread races a scheduled cancel against natural
//! completion.
//!
//! # Design
//!
//! - Callers arm a timeout with [`TimerService::schedule`], which pushes a
//!   [`TimerWorkItem`] onto one of one or two request queues. With two
//!   queues the timer thread drains one while producers fill the other,
//!   swapping every cycle.
//! - Items are bucketed into [`TimeSlot`]s by their fire time rounded up to
//!   the check interval. Slots are kept in ascending time order.
//! - Every check interval, slots whose time has passed are removed and each
//!   still-ACTIVE item fires. An item flips ACTIVE to CANCELLED before its
//!   callback runs, so it fires at most once.
//! - Every prune interval, slots with no ACTIVE items and no insertions for
//!   the prune threshold are dropped.
//!
//! # Staleness
//!
//! Each item captures the future's reuse counter at registration. The
//! callback compares it to the live counter, so a timeout armed for an
//! earlier operation never touches a future that has been reset since.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::TimerConfig;
use crate::future::IoFuture;
use crate::log::targets;
use crate::panic::run_isolated;

const ACTIVE: u8 = 0;
const CANCELLED: u8 = 1;

/// Receiver of expired timeouts.
pub trait TimerCallback: Send + Sync {
    /// Called on the timer thread when `future`'s timeout expires.
    /// `reuse_count` is the future's reuse counter when the timeout was armed.
    fn timer_fired(&self, future: Arc<IoFuture>, reuse_count: u64, timeout: Duration);
}

/// A pending soft-timeout request.
pub struct TimerWorkItem {
    fire_at: Instant,
    timeout: Duration,
    state: AtomicU8,
    callback: Arc<dyn TimerCallback>,
    attachment: Weak<IoFuture>,
    reuse_count: u64,
}

impl TimerWorkItem {
    /// When the item is due.
    pub fn fire_at(&self) -> Instant {
        self.fire_at
    }

    /// Reuse counter captured at registration.
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count
    }

    /// Whether the item can still fire.
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// Disarm the item. Returns `false` if it had already fired or been
    /// cancelled.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn fire(&self) -> bool {
        if !self.cancel() {
            return false;
        }
        let Some(future) = self.attachment.upgrade() else {
            return false;
        };
        let callback = self.callback.clone();
        let (reuse_count, timeout) = (self.reuse_count, self.timeout);
        run_isolated("timer callback", move || {
            callback.timer_fired(future, reuse_count, timeout)
        })
    }
}

impl fmt::Debug for TimerWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWorkItem")
            .field("timeout", &self.timeout)
            .field("active", &self.is_active())
            .field("reuse_count", &self.reuse_count)
            .finish()
    }
}

/// Items sharing one rounded fire time.
#[derive(Debug)]
pub struct TimeSlot {
    tick: u64,
    items: Vec<Arc<TimerWorkItem>>,
    last_insert: Instant,
}

impl TimeSlot {
    fn has_active(&self) -> bool {
        self.items.iter().any(|item| item.is_active())
    }
}

/// Timer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    /// Timeouts armed.
    pub scheduled: u64,
    /// Callbacks run.
    pub fired: u64,
    /// Items dropped because they were cancelled before insertion.
    pub dropped: u64,
    /// Slots removed by pruning.
    pub pruned_slots: u64,
    /// Slots currently held.
    pub slots: usize,
}

struct TimerShared {
    config: TimerConfig,
    epoch: Instant,
    queues: Vec<Mutex<Vec<Arc<TimerWorkItem>>>>,
    producer_queue: AtomicUsize,
    shutdown: AtomicBool,
    scheduled: AtomicU64,
    fired: AtomicU64,
    dropped: AtomicU64,
    pruned: AtomicU64,
    slot_count: AtomicUsize,
}

impl TimerShared {
    fn resolution(&self) -> Duration {
        self.config.check_interval.max(Duration::from_millis(1))
    }

    /// Round `at` up to the next tick boundary.
    fn tick_for(&self, at: Instant) -> u64 {
        let nanos = at.saturating_duration_since(self.epoch).as_nanos();
        let res = self.resolution().as_nanos().max(1);
        nanos.div_ceil(res) as u64
    }

    fn tick_deadline(&self, tick: u64) -> Instant {
        let res = self.resolution().as_nanos().max(1);
        let offset = (tick as u128).saturating_mul(res).min(u64::MAX as u128) as u64;
        self.epoch + Duration::from_nanos(offset)
    }
}

/// Handle to the timer thread.
pub struct TimerService {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Start the timer thread.
    pub fn start(config: TimerConfig) -> io::Result<Self> {
        let queue_count = config.queue_count.clamp(1, 2);
        let shared = Arc::new(TimerShared {
            config,
            epoch: Instant::now(),
            queues: (0..queue_count).map(|_| Mutex::new(Vec::new())).collect(),
            producer_queue: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            scheduled: AtomicU64::new(0),
            fired: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
            slot_count: AtomicUsize::new(0),
        });

        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("aio-timer".to_string())
            .spawn(move || TimerLoop::new(worker).run())?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Arm a timeout for `future`. The returned item can be cancelled.
    pub fn schedule(
        &self,
        timeout: Duration,
        callback: Arc<dyn TimerCallback>,
        future: &Arc<IoFuture>,
        reuse_count: u64,
    ) -> Arc<TimerWorkItem> {
        let item = Arc::new(TimerWorkItem {
            fire_at: Instant::now() + timeout,
            timeout,
            state: AtomicU8::new(ACTIVE),
            callback,
            attachment: Arc::downgrade(future),
            reuse_count,
        });
        let queue = self.shared.producer_queue.load(Ordering::Acquire) % self.shared.queues.len();
        self.shared.queues[queue].lock().push(item.clone());
        self.shared.scheduled.fetch_add(1, Ordering::Relaxed);
        item
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TimerStats {
        TimerStats {
            scheduled: self.shared.scheduled.load(Ordering::Relaxed),
            fired: self.shared.fired.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            pruned_slots: self.shared.pruned.load(Ordering::Relaxed),
            slots: self.shared.slot_count.load(Ordering::Relaxed),
        }
    }

    /// Stop the timer thread and wait for it. Pending items never fire.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!(target: targets::TIMER, "timer thread panicked");
            }
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("stats", &self.stats())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

struct TimerLoop {
    shared: Arc<TimerShared>,
    slots: VecDeque<TimeSlot>,
    next_check: Instant,
    next_prune: Instant,
}

impl TimerLoop {
    fn new(shared: Arc<TimerShared>) -> Self {
        let now = Instant::now();
        let next_prune = now + shared.config.prune_interval;
        Self {
            shared,
            slots: VecDeque::new(),
            next_check: now,
            next_prune,
        }
    }

    fn run(mut self) {
        tracing::debug!(target: targets::TIMER, queues = self.shared.queues.len(), "timer started");
        while !self.shared.shutdown.load(Ordering::Acquire) {
            let backlog = self.drain_requests();

            let now = Instant::now();
            if now >= self.next_check {
                self.fire_expired(now);
                self.next_check = now + self.shared.config.check_interval;
            }
            if now >= self.next_prune {
                self.prune(now);
                self.next_prune = now + self.shared.config.prune_interval;
            }
            self.shared.slot_count.store(self.slots.len(), Ordering::Relaxed);

            if !backlog {
                thread::park_timeout(self.shared.config.sleep_interval);
            }
        }
        tracing::debug!(target: targets::TIMER, "timer stopped");
    }

    /// Move up to one batch of requests into slots. Returns `true` if more
    /// requests are waiting.
    fn drain_requests(&mut self) -> bool {
        let queues = self.shared.queues.len();
        let consumed = self.shared.producer_queue.fetch_add(1, Ordering::AcqRel) % queues;
        let batch: Vec<Arc<TimerWorkItem>> = {
            let mut queue = self.shared.queues[consumed].lock();
            let take = queue.len().min(self.shared.config.batch_size.max(1));
            queue.drain(..take).collect()
        };

        let now = Instant::now();
        for item in batch {
            if !item.is_active() {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let tick = self.shared.tick_for(item.fire_at);
            self.insert(tick, item, now);
        }

        self.shared.queues.iter().any(|q| !q.lock().is_empty())
    }

    fn insert(&mut self, tick: u64, item: Arc<TimerWorkItem>, now: Instant) {
        match self.slots.binary_search_by_key(&tick, |slot| slot.tick) {
            Ok(at) => {
                let slot = &mut self.slots[at];
                slot.items.push(item);
                slot.last_insert = now;
            }
            Err(at) => self.slots.insert(
                at,
                TimeSlot {
                    tick,
                    items: vec![item],
                    last_insert: now,
                },
            ),
        }
    }

    fn fire_expired(&mut self, now: Instant) {
        while let Some(front) = self.slots.front() {
            if self.shared.tick_deadline(front.tick) > now {
                break;
            }
            let Some(slot) = self.slots.pop_front() else {
                break;
            };
            for item in slot.items {
                if item.fire() {
                    self.shared.fired.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        let threshold = self.shared.config.prune_threshold;
        let before = self.slots.len();
        self.slots
            .retain(|slot| slot.has_active() || now.duration_since(slot.last_insert) < threshold);
        let removed = before - self.slots.len();
        if removed > 0 {
            self.shared.pruned.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::trace!(target: targets::TIMER, removed, "pruned idle slots");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureKind;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        hits: AtomicUsize,
        last_reuse: AtomicU64,
    }

    impl TimerCallback for Recorder {
        fn timer_fired(&self, _future: Arc<IoFuture>, reuse_count: u64, _timeout: Duration) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.last_reuse.store(reuse_count, Ordering::SeqCst);
        }
    }

    fn fast_config() -> TimerConfig {
        TimerConfig {
            batch_size: 4,
            sleep_interval: Duration::from_millis(1),
            queue_count: 2,
            check_interval: Duration::from_millis(2),
            prune_interval: Duration::from_millis(20),
            prune_threshold: Duration::from_millis(10),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_item_fires_once_after_deadline() {
        let timer = TimerService::start(fast_config()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let future = IoFuture::detached(FutureKind::Read);
        let started = Instant::now();
        let item = timer.schedule(Duration::from_millis(20), recorder.clone(), &future, 7);

        assert!(wait_until(|| recorder.hits.load(Ordering::SeqCst) == 1));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(recorder.last_reuse.load(Ordering::SeqCst), 7);
        assert!(!item.is_active());

        thread::sleep(Duration::from_millis(20));
        assert_eq!(recorder.hits.load(Ordering::SeqCst), 1);
        timer.shutdown();
    }

    #[test]
    fn test_cancelled_item_never_fires() {
        let timer = TimerService::start(fast_config()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let future = IoFuture::detached(FutureKind::Write);
        let item = timer.schedule(Duration::from_millis(10), recorder.clone(), &future, 0);
        assert!(item.cancel());
        assert!(!item.cancel());

        thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.hits.load(Ordering::SeqCst), 0);
        timer.shutdown();
    }

    #[test]
    fn test_dropped_future_is_skipped() {
        let timer = TimerService::start(fast_config()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let future = IoFuture::detached(FutureKind::Read);
        timer.schedule(Duration::from_millis(5), recorder.clone(), &future, 0);
        drop(future);

        thread::sleep(Duration::from_millis(40));
        assert_eq!(recorder.hits.load(Ordering::SeqCst), 0);
        timer.shutdown();
    }

    #[test]
    fn test_many_items_fire_in_batches() {
        let timer = TimerService::start(fast_config()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let futures: Vec<_> = (0..20).map(|_| IoFuture::detached(FutureKind::Read)).collect();
        for (i, future) in futures.iter().enumerate() {
            timer.schedule(Duration::from_millis(5 + i as u64), recorder.clone(), future, 0);
        }
        assert!(wait_until(|| recorder.hits.load(Ordering::SeqCst) == 20));
        assert_eq!(timer.stats().fired, 20);
        timer.shutdown();
    }

    #[test]
    fn test_single_queue_mode() {
        let config = TimerConfig {
            queue_count: 1,
            ..fast_config()
        };
        let timer = TimerService::start(config).unwrap();
        let recorder = Arc::new(Recorder::default());
        let future = IoFuture::detached(FutureKind::Read);
        timer.schedule(Duration::from_millis(5), recorder.clone(), &future, 0);
        assert!(wait_until(|| recorder.hits.load(Ordering::SeqCst) == 1));
        timer.shutdown();
    }

    #[test]
    fn test_idle_slots_are_pruned() {
        let timer = TimerService::start(fast_config()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let future = IoFuture::detached(FutureKind::Read);
        let item = timer.schedule(Duration::from_secs(60), recorder.clone(), &future, 0);
        assert!(wait_until(|| timer.stats().slots == 1));
        item.cancel();
        assert!(wait_until(|| timer.stats().slots == 0));
        assert!(timer.stats().pruned_slots >= 1);
        timer.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let timer = TimerService::start(fast_config()).unwrap();
        timer.shutdown();
        timer.shutdown();
        assert!(timer.is_shut_down());
    }
}
