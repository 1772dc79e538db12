//! Priority-aware concurrency limiter.
//!
//! Admits a bounded number of concurrent invocations (default 1). Waiters
//! queue on a heap keyed by `(effective priority, enqueue time)`; a ticker
//! raises every waiter's effective priority one level per second, capped
//! at [`Priority::High`], so no waiter is starved.

use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Limiter error types
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("Acquire cancelled")]
    Cancelled,

    #[error("Limiter closed")]
    Closed,
}

/// Base priority of a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    fn level(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 5,
            Priority::High => MAX_LEVEL,
        }
    }
}

const MAX_LEVEL: u8 = 10;

struct Waiter {
    base: u8,
    effective: u8,
    enqueued_at: Instant,
    seq: u64,
    permit_tx: oneshot::Sender<()>,
}

impl Waiter {
    fn age_to(&mut self, now: Instant, step: Duration) {
        let elapsed = now.saturating_duration_since(self.enqueued_at);
        let levels = if step.is_zero() {
            u64::from(MAX_LEVEL)
        } else {
            elapsed.as_millis() as u64 / step.as_millis().max(1) as u64
        };
        self.effective = self
            .base
            .saturating_add(levels.min(u64::from(MAX_LEVEL)) as u8)
            .min(MAX_LEVEL);
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher effective priority first, earlier enqueue time
        // breaks ties.
        self.effective
            .cmp(&other.effective)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    seq: u64,
}

struct Inner {
    state: Mutex<State>,
    aging_step: Duration,
}

impl Inner {
    fn release(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Hand the slot to the best waiter still listening; cancelled
        // waiters left a dead channel behind and are skipped.
        while let Some(waiter) = state.waiters.pop() {
            if waiter.permit_tx.send(()).is_ok() {
                return;
            }
        }
        state.available += 1;
    }

    fn reheap(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.waiters.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut waiters: Vec<Waiter> = std::mem::take(&mut state.waiters).into_vec();
        for waiter in &mut waiters {
            waiter.age_to(now, self.aging_step);
        }
        state.waiters = waiters.into();
    }
}

/// Priority-aging concurrency limiter.
pub struct PriorityLimiter {
    inner: Arc<Inner>,
}

impl PriorityLimiter {
    /// A limiter with the given slot count and the default one-second
    /// aging step.
    pub fn new(slots: usize) -> Self {
        Self::with_aging_step(slots, Duration::from_secs(1))
    }

    /// A limiter whose waiters gain one priority level per `aging_step`.
    pub fn with_aging_step(slots: usize, aging_step: Duration) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                available: slots.max(1),
                waiters: BinaryHeap::new(),
                seq: 0,
            }),
            aging_step,
        });

        // The ticker holds only a weak handle so dropping the limiter
        // stops it.
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let step = aging_step;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(step.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.reheap(),
                    None => break,
                }
            }
        });

        Self { inner }
    }

    /// Acquire a slot, waiting with the given base priority.
    ///
    /// Returns [`AcquireError::Cancelled`] when the token fires first; the
    /// waiter is removed from the queue either way.
    pub async fn acquire(
        &self,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<Permit, AcquireError> {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        let permit_rx = {
            let mut state = self
                .inner
                .state
                .lock()
                .map_err(|_| AcquireError::Closed)?;
            if state.available > 0 {
                state.available -= 1;
                return Ok(Permit {
                    inner: Arc::clone(&self.inner),
                });
            }

            let (permit_tx, permit_rx) = oneshot::channel();
            state.seq += 1;
            let seq = state.seq;
            let level = priority.level();
            state.waiters.push(Waiter {
                base: level,
                effective: level,
                enqueued_at: Instant::now(),
                seq,
                permit_tx,
            });
            permit_rx
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                // Dropping the receiver leaves a dead channel; release()
                // skips it. Nothing else to clean up.
                Err(AcquireError::Cancelled)
            }
            granted = permit_rx => match granted {
                Ok(()) => Ok(Permit {
                    inner: Arc::clone(&self.inner),
                }),
                Err(_) => Err(AcquireError::Closed),
            },
        }
    }
}

impl Default for PriorityLimiter {
    fn default() -> Self {
        Self::new(1)
    }
}

/// A held slot; releasing happens on drop, on every exit path.
pub struct Permit {
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_with_free_slot_is_immediate() {
        let limiter = PriorityLimiter::new(2);
        let cancel = CancellationToken::new();
        let _a = limiter.acquire(Priority::Low, &cancel).await.expect("slot");
        let _b = limiter.acquire(Priority::Low, &cancel).await.expect("slot");
    }

    #[tokio::test]
    async fn test_release_grants_to_highest_priority_waiter() {
        let limiter = Arc::new(PriorityLimiter::new(1));
        let cancel = CancellationToken::new();
        let held = limiter.acquire(Priority::High, &cancel).await.expect("slot");

        let (low_tx, mut low_rx) = oneshot::channel();
        let (high_tx, high_rx) = oneshot::channel();
        let (release_high_tx, release_high_rx) = oneshot::channel::<()>();

        let low_limiter = Arc::clone(&limiter);
        let low_cancel = cancel.clone();
        tokio::spawn(async move {
            let permit = low_limiter.acquire(Priority::Low, &low_cancel).await;
            let _ = low_tx.send(());
            drop(permit);
        });
        // Make sure the low-priority waiter queues first.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let high_limiter = Arc::clone(&limiter);
        let high_cancel = cancel.clone();
        tokio::spawn(async move {
            let permit = high_limiter.acquire(Priority::High, &high_cancel).await;
            let _ = high_tx.send(());
            let _ = release_high_rx.await;
            drop(permit);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        // Priority beats queue order: the high waiter is granted while the
        // earlier low waiter keeps waiting.
        high_rx.await.expect("high waiter granted");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(low_rx.try_recv().is_err());

        release_high_tx.send(()).expect("release");
        low_rx.await.expect("low waiter granted after");
    }

    #[tokio::test]
    async fn test_aged_waiter_outranks_fresh_high_priority() {
        // Aggressive aging so the low waiter saturates quickly.
        let limiter = Arc::new(PriorityLimiter::with_aging_step(
            1,
            Duration::from_millis(5),
        ));
        let cancel = CancellationToken::new();
        let held = limiter.acquire(Priority::High, &cancel).await.expect("slot");

        let (old_tx, old_rx) = oneshot::channel();
        let (release_old_tx, release_old_rx) = oneshot::channel::<()>();
        let old_limiter = Arc::clone(&limiter);
        let old_cancel = cancel.clone();
        tokio::spawn(async move {
            let permit = old_limiter.acquire(Priority::Low, &old_cancel).await;
            let _ = old_tx.send(());
            let _ = release_old_rx.await;
            drop(permit);
        });

        // Let the low waiter age to the cap.
        tokio::time::sleep(Duration::from_millis(120)).await;

        let (fresh_tx, mut fresh_rx) = oneshot::channel();
        let fresh_limiter = Arc::clone(&limiter);
        let fresh_cancel = cancel.clone();
        tokio::spawn(async move {
            let permit = fresh_limiter.acquire(Priority::High, &fresh_cancel).await;
            let _ = fresh_tx.send(());
            drop(permit);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        // Equal effective priority now; the earlier enqueue wins.
        old_rx.await.expect("aged waiter granted first");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fresh_rx.try_recv().is_err());

        release_old_tx.send(()).expect("release");
        fresh_rx.await.expect("fresh waiter granted after");
    }

    #[tokio::test]
    async fn test_cancelled_acquire_returns_error() {
        let limiter = PriorityLimiter::new(1);
        let cancel = CancellationToken::new();
        let _held = limiter.acquire(Priority::High, &cancel).await.expect("slot");

        let waiter_cancel = cancel.child_token();
        waiter_cancel.cancel();
        let outcome = limiter.acquire(Priority::High, &waiter_cancel).await;
        assert!(matches!(outcome, Err(AcquireError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_the_slot() {
        let limiter = Arc::new(PriorityLimiter::new(1));
        let cancel = CancellationToken::new();
        let held = limiter.acquire(Priority::High, &cancel).await.expect("slot");

        let waiter_cancel = CancellationToken::new();
        let waiting = {
            let limiter = Arc::clone(&limiter);
            let token = waiter_cancel.clone();
            tokio::spawn(async move { limiter.acquire(Priority::Low, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_cancel.cancel();
        let outcome = waiting.await.expect("join");
        assert!(matches!(outcome, Err(AcquireError::Cancelled)));

        // The slot released after cancellation is acquirable again.
        drop(held);
        let _next = limiter.acquire(Priority::Low, &cancel).await.expect("slot");
    }
}
