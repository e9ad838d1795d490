//! Suspension machinery for the request loop: a single timeout heap
//! with one armed scheduler task, plus per-request waiters that plugins
//! or payment callbacks can wake early. On shutdown every parked
//! request is resumed so it can produce a final response.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;

use anastasis_authorization::Trigger;

/// Why a suspended request resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The event the request was waiting for fired.
    Event,

    /// The request's deadline passed.
    Timeout,

    /// The service is shutting down.
    Shutdown,
}

/// The sender for the currently armed wait, tagged with its arm token
/// so stale heap entries from earlier waits cannot fire it.
type Slot = Arc<Mutex<Option<(u64, oneshot::Sender<WakeReason>)>>>;

struct Inner {
    /// Min-heap of (deadline, waiter id, arm token). Entries for waits
    /// that already resolved are stale; the scheduler skips them by
    /// token comparison.
    heap: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    slots: HashMap<u64, Slot>,
    next_id: u64,
    next_token: u64,
    shutting_down: bool,
}

/// Registry of all currently suspended requests.
pub struct WaitRegistry {
    inner: Mutex<Inner>,
    rearm: Notify,
}

impl WaitRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                slots: HashMap::new(),
                next_id: 1,
                next_token: 1,
                shutting_down: false,
            }),
            rearm: Notify::new(),
        })
    }

    /// Start the single scheduler task that fires expired waiters. It
    /// sleeps until the earliest deadline and is re-armed whenever an
    /// earlier deadline is inserted.
    pub fn spawn_scheduler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut inner = registry.inner.lock().expect("wait registry poisoned");
                    if inner.shutting_down {
                        break;
                    }
                    let now = Instant::now();
                    while let Some(Reverse((deadline, id, token))) = inner.heap.peek().copied() {
                        if deadline > now {
                            break;
                        }
                        inner.heap.pop();
                        if let Some(slot) = inner.slots.get(&id) {
                            let mut slot = slot.lock().expect("slot poisoned");
                            // Only fire the wait this entry was armed for.
                            if matches!(&*slot, Some((t, _)) if *t == token) {
                                let (_, tx) = slot.take().expect("checked above");
                                debug!(waiter = id, "waiter timed out");
                                let _ = tx.send(WakeReason::Timeout);
                            }
                        }
                    }
                    inner
                        .heap
                        .peek()
                        .map(|Reverse((deadline, _, _))| *deadline)
                };
                match next {
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {}
                            _ = registry.rearm.notified() => {}
                        }
                    }
                    None => registry.rearm.notified().await,
                }
            }
        })
    }

    /// Create a waiter for one request.
    pub fn new_waiter(self: &Arc<Self>) -> Waiter {
        let mut inner = self.inner.lock().expect("wait registry poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        let slot: Slot = Arc::new(Mutex::new(None));
        inner.slots.insert(id, Arc::clone(&slot));
        Waiter {
            registry: Arc::clone(self),
            slot,
            id,
        }
    }

    fn arm(&self, id: u64, slot: &Slot, deadline: Instant) -> oneshot::Receiver<WakeReason> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("wait registry poisoned");
        if inner.shutting_down {
            let _ = tx.send(WakeReason::Shutdown);
            return rx;
        }
        let token = inner.next_token;
        inner.next_token += 1;
        *slot.lock().expect("slot poisoned") = Some((token, tx));
        let is_earliest = inner
            .heap
            .peek()
            .map(|Reverse((d, _, _))| *d > deadline)
            .unwrap_or(true);
        inner.heap.push(Reverse((deadline, id, token)));
        if is_earliest {
            self.rearm.notify_one();
        }
        rx
    }

    fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().expect("wait registry poisoned");
        inner.slots.remove(&id);
    }

    /// Resume every parked request with [`WakeReason::Shutdown`] and
    /// stop the scheduler.
    pub fn shutdown(&self) {
        let slots: Vec<Slot> = {
            let mut inner = self.inner.lock().expect("wait registry poisoned");
            inner.shutting_down = true;
            inner.slots.values().cloned().collect()
        };
        for slot in slots {
            if let Some((_, tx)) = slot.lock().expect("slot poisoned").take() {
                let _ = tx.send(WakeReason::Shutdown);
            }
        }
        self.rearm.notify_one();
    }
}

/// One request's handle into the registry. Dropping it deregisters.
pub struct Waiter {
    registry: Arc<WaitRegistry>,
    slot: Slot,
    id: u64,
}

impl Waiter {
    /// A trigger that wakes this waiter with [`WakeReason::Event`];
    /// handed to authorization plugins.
    pub fn trigger(&self) -> Trigger {
        let registry = Arc::clone(&self.registry);
        let slot = Arc::clone(&self.slot);
        Trigger::new(move || {
            if let Some((_, tx)) = slot.lock().expect("slot poisoned").take() {
                let _ = tx.send(WakeReason::Event);
            }
            registry.rearm.notify_one();
        })
    }

    /// Park until the trigger fires, the deadline passes, or shutdown.
    pub async fn wait_until(&self, deadline: Instant) -> WakeReason {
        let rx = self.registry.arm(self.id, &self.slot, deadline);
        rx.await.unwrap_or(WakeReason::Shutdown)
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn timeout_fires() {
        let registry = WaitRegistry::new();
        let _scheduler = registry.spawn_scheduler();
        let waiter = registry.new_waiter();
        let reason = waiter
            .wait_until(Instant::now() + Duration::from_millis(20))
            .await;
        assert_eq!(reason, WakeReason::Timeout);
    }

    #[tokio::test]
    async fn trigger_wakes_before_timeout() {
        let registry = WaitRegistry::new();
        let _scheduler = registry.spawn_scheduler();
        let waiter = registry.new_waiter();
        let trigger = waiter.trigger();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.fire();
        });
        let reason = waiter
            .wait_until(Instant::now() + Duration::from_secs(30))
            .await;
        assert_eq!(reason, WakeReason::Event);
    }

    #[tokio::test]
    async fn stale_heap_entries_do_not_fire_later_waits() {
        let registry = WaitRegistry::new();
        let _scheduler = registry.spawn_scheduler();
        let waiter = registry.new_waiter();
        let trigger = waiter.trigger();

        // First wait resolves early via the trigger, leaving its heap
        // entry behind.
        let first_deadline = Instant::now() + Duration::from_millis(50);
        tokio::spawn({
            let trigger = trigger.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                trigger.fire();
            }
        });
        assert_eq!(waiter.wait_until(first_deadline).await, WakeReason::Event);

        // The second wait has a much later deadline; the stale entry
        // expiring must not wake it.
        let reason = tokio::time::timeout(
            Duration::from_millis(200),
            waiter.wait_until(Instant::now() + Duration::from_secs(60)),
        )
        .await;
        assert!(reason.is_err(), "stale entry woke the second wait");
    }

    #[tokio::test]
    async fn shutdown_resumes_everything() {
        let registry = WaitRegistry::new();
        let _scheduler = registry.spawn_scheduler();
        let w1 = registry.new_waiter();
        let w2 = registry.new_waiter();
        let r2 = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            r2.shutdown();
        });
        let far = Instant::now() + Duration::from_secs(60);
        let (a, b) = tokio::join!(w1.wait_until(far), w2.wait_until(far));
        assert_eq!(a, WakeReason::Shutdown);
        assert_eq!(b, WakeReason::Shutdown);
    }

    #[tokio::test]
    async fn waiting_after_shutdown_resolves_immediately() {
        let registry = WaitRegistry::new();
        let _scheduler = registry.spawn_scheduler();
        registry.shutdown();
        let waiter = registry.new_waiter();
        let reason = waiter
            .wait_until(Instant::now() + Duration::from_secs(60))
            .await;
        assert_eq!(reason, WakeReason::Shutdown);
    }

    #[tokio::test]
    async fn earlier_deadline_rearms_scheduler() {
        let registry = WaitRegistry::new();
        let _scheduler = registry.spawn_scheduler();
        let slow = registry.new_waiter();
        let fast = registry.new_waiter();
        let slow_fut = slow.wait_until(Instant::now() + Duration::from_secs(5));
        let fast_fut = fast.wait_until(Instant::now() + Duration::from_millis(20));
        tokio::select! {
            _ = slow_fut => panic!("slow waiter should not fire first"),
            reason = fast_fut => assert_eq!(reason, WakeReason::Timeout),
        }
    }
}
