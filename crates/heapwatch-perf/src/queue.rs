//! Bounded priority operation queue
//!
//! `queue_operation` runs the operation immediately while concurrency
//! permits are free, otherwise the caller waits for admission. Waiters
//! are granted strictly by priority with FIFO tie-break, each carries a
//! deadline covering wait plus execution, and the pending set is bounded
//! at twice the concurrency limit; overflow drops the lowest-priority
//! tail.

use heapwatch_common::{AgentEvent, Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Options for one queued operation.
#[derive(Debug, Clone, Copy)]
pub struct OperationOptions {
    pub priority: i32,
    /// Covers both queue wait and execution.
    pub timeout: Duration,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Queue counters for the query surface.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueStats {
    pub executed: u64,
    pub dropped: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub active: usize,
    pub pending: usize,
}

struct Waiter {
    priority: i32,
    seq: u64,
    grant: oneshot::Sender<()>,
}

struct QueueState {
    active: usize,
    pending: Vec<Waiter>,
    next_seq: u64,
    shutting_down: bool,
    stats: QueueStats,
}

struct QueueInner {
    max_concurrent: usize,
    state: Mutex<QueueState>,
    events: broadcast::Sender<AgentEvent>,
}

/// The operation queue. Clone-cheap handle over shared state.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

enum Admission {
    Run,
    Wait(oneshot::Receiver<()>),
}

impl OperationQueue {
    pub fn new(max_concurrent: usize, events: broadcast::Sender<AgentEvent>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(QueueState {
                    active: 0,
                    pending: Vec::new(),
                    next_seq: 0,
                    shutting_down: false,
                    stats: QueueStats::default(),
                }),
                events,
            }),
        }
    }

    /// Run `operation` under admission control.
    pub async fn queue_operation<F, Fut, T>(
        &self,
        operation: F,
        options: OperationOptions,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let admission = self.admit(options.priority)?;

        if let Admission::Wait(mut grant_rx) = admission {
            tokio::select! {
                granted = &mut grant_rx => {
                    if granted.is_err() {
                        // Grant sender dropped: the waiter was evicted
                        // from the pending tail or the queue shut down.
                        let shutting_down = self.inner.state.lock().shutting_down;
                        return Err(if shutting_down {
                            Error::Shutdown("operation queue is shutting down".into())
                        } else {
                            Error::ResourceExhausted(
                                "operation dropped from the admission queue".into(),
                            )
                        });
                    }
                }
                _ = tokio::time::sleep(options.timeout) => {
                    // A grant may have raced the deadline; if it did, the
                    // permit is ours to pass on rather than leak.
                    match grant_rx.try_recv() {
                        Ok(()) => self.release(),
                        Err(_) => {
                            drop(grant_rx);
                            self.abandon_wait();
                        }
                    }
                    let mut state = self.inner.state.lock();
                    state.stats.timed_out += 1;
                    return Err(Error::Timeout(format!(
                        "operation timed out after {:?} waiting for admission",
                        options.timeout
                    )));
                }
            }
        }

        // Admitted: the remaining budget covers execution.
        let remaining = options.timeout.saturating_sub(started.elapsed());
        let result = match tokio::time::timeout(remaining, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let mut state = self.inner.state.lock();
                state.stats.timed_out += 1;
                drop(state);
                self.release();
                return Err(Error::Timeout(format!(
                    "operation exceeded its {:?} budget",
                    options.timeout
                )));
            }
        };

        {
            let mut state = self.inner.state.lock();
            state.stats.executed += 1;
        }
        self.release();
        result
    }

    fn admit(&self, priority: i32) -> Result<Admission> {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            state.stats.rejected += 1;
            return Err(Error::Shutdown("operation queue is shutting down".into()));
        }

        if state.active < self.inner.max_concurrent {
            state.active += 1;
            return Ok(Admission::Run);
        }

        let (grant, grant_rx) = oneshot::channel();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(Waiter {
            priority,
            seq,
            grant,
        });

        // Bound the pending set at 2 x max_concurrent, dropping the
        // lowest-priority tail (youngest within equal priority).
        let bound = 2 * self.inner.max_concurrent;
        let mut dropped = 0;
        while state.pending.len() > bound {
            let worst = state
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, w)| (w.priority, std::cmp::Reverse(w.seq)))
                .map(|(i, _)| i);
            let Some(index) = worst else { break };
            let victim = state.pending.swap_remove(index);
            debug!(priority = victim.priority, "dropping queued operation");
            state.stats.dropped += 1;
            dropped += 1;
            // Dropping the sender wakes the waiter with an error.
        }
        drop(state);

        if dropped > 0 {
            let _ = self
                .inner
                .events
                .send(AgentEvent::OperationsDropped { count: dropped });
        }
        Ok(Admission::Wait(grant_rx))
    }

    /// Remove this caller's expired waiter; if the grant raced ahead of
    /// the timeout, pass the permit on instead of leaking it.
    fn abandon_wait(&self) {
        let mut state = self.inner.state.lock();
        // The waiter that timed out is the one whose grant channel is
        // closed; everything else is still live.
        state.pending.retain(|w| !w.grant.is_closed());
    }

    /// Free one permit, handing it to the best waiter if any.
    fn release(&self) {
        let mut state = self.inner.state.lock();
        loop {
            let best = state
                .pending
                .iter()
                .enumerate()
                .max_by_key(|(_, w)| (w.priority, std::cmp::Reverse(w.seq)))
                .map(|(i, _)| i);
            let Some(index) = best else {
                state.active = state.active.saturating_sub(1);
                return;
            };
            let waiter = state.pending.swap_remove(index);
            if waiter.grant.send(()).is_ok() {
                // Permit transferred; active count unchanged.
                return;
            }
            // The waiter timed out between selection and grant; try the
            // next one.
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            active: state.active,
            pending: state.pending.len(),
            ..state.stats
        }
    }

    /// Reject all pending waiters and refuse new work.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutting_down = true;
        let drained = state.pending.drain(..).count();
        if drained > 0 {
            warn!(drained, "operation queue rejected pending work at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;
    use tokio::time::sleep;

    fn queue(max_concurrent: usize) -> (OperationQueue, broadcast::Receiver<AgentEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (OperationQueue::new(max_concurrent, tx), rx)
    }

    fn opts(priority: i32, timeout_ms: u64) -> OperationOptions {
        OperationOptions {
            priority,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn runs_immediately_under_the_limit() {
        let (queue, _rx) = queue(2);
        let result = queue
            .queue_operation(|| async { Ok::<_, Error>(7) }, opts(0, 1_000))
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(queue.stats().executed, 1);
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test]
    async fn dequeues_by_priority_with_fifo_tie_break() {
        let (queue, _rx) = queue(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single permit.
        let q = queue.clone();
        let blocker = tokio::spawn(async move {
            q.queue_operation(
                || async {
                    sleep(Duration::from_millis(50)).await;
                    Ok::<_, Error>(())
                },
                opts(0, 1_000),
            )
            .await
        });
        sleep(Duration::from_millis(10)).await;

        // Three waiters: low, high, and a second high (FIFO within ties).
        let mut handles = Vec::new();
        for (label, priority) in [("low", 1), ("high-a", 5), ("high-b", 5)] {
            let q = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                q.queue_operation(
                    || async move {
                        order.lock().push(label);
                        Ok::<_, Error>(())
                    },
                    opts(priority, 2_000),
                )
                .await
            }));
            // Deterministic enqueue order.
            sleep(Duration::from_millis(5)).await;
        }

        blocker.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec!["high-a", "high-b", "low"]);
    }

    #[tokio::test]
    async fn waiters_time_out() {
        let (queue, _rx) = queue(1);

        let q = queue.clone();
        let blocker = tokio::spawn(async move {
            q.queue_operation(
                || async {
                    sleep(Duration::from_millis(200)).await;
                    Ok::<_, Error>(())
                },
                opts(0, 1_000),
            )
            .await
        });
        sleep(Duration::from_millis(10)).await;

        let result = queue
            .queue_operation(|| async { Ok::<_, Error>(()) }, opts(0, 30))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(queue.stats().timed_out, 1);
        blocker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn execution_counts_against_the_budget() {
        let (queue, _rx) = queue(1);
        let result = queue
            .queue_operation(
                || async {
                    sleep(Duration::from_millis(200)).await;
                    Ok::<_, Error>(())
                },
                opts(0, 40),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        // The permit was released despite the timeout.
        let ok = queue
            .queue_operation(|| async { Ok::<_, Error>(1) }, opts(0, 500))
            .await;
        assert_eq!(ok.unwrap(), 1);
    }

    #[tokio::test]
    async fn overflow_drops_the_lowest_priority_tail() {
        let (queue, mut rx) = queue(1);
        let completed = Arc::new(AtomicUsize::new(0));

        let q = queue.clone();
        let blocker = tokio::spawn(async move {
            q.queue_operation(
                || async {
                    sleep(Duration::from_millis(100)).await;
                    Ok::<_, Error>(())
                },
                opts(0, 2_000),
            )
            .await
        });
        sleep(Duration::from_millis(10)).await;

        // Bound is 2: the third pending waiter forces a drop of the
        // lowest-priority entry.
        let mut handles = Vec::new();
        for priority in [5, 4, 1] {
            let q = queue.clone();
            let completed = completed.clone();
            handles.push(tokio::spawn(async move {
                let result = q
                    .queue_operation(
                        || async {
                            completed.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, Error>(())
                        },
                        opts(priority, 2_000),
                    )
                    .await;
                (priority, result)
            }));
            sleep(Duration::from_millis(5)).await;
        }

        blocker.await.unwrap().unwrap();
        let mut dropped_priorities = Vec::new();
        for handle in handles {
            let (priority, result) = handle.await.unwrap();
            if matches!(result, Err(Error::ResourceExhausted(_))) {
                dropped_priorities.push(priority);
            }
        }
        assert_eq!(dropped_priorities, vec![1]);
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert_eq!(queue.stats().dropped, 1);

        let mut saw_drop_event = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, AgentEvent::OperationsDropped { count: 1 }) {
                saw_drop_event = true;
            }
        }
        assert!(saw_drop_event);
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_and_new_work() {
        let (queue, _rx) = queue(1);

        let q = queue.clone();
        let blocker = tokio::spawn(async move {
            q.queue_operation(
                || async {
                    sleep(Duration::from_millis(100)).await;
                    Ok::<_, Error>(())
                },
                opts(0, 1_000),
            )
            .await
        });
        sleep(Duration::from_millis(10)).await;

        let q = queue.clone();
        let waiter = tokio::spawn(async move {
            q.queue_operation(|| async { Ok::<_, Error>(()) }, opts(0, 1_000))
                .await
        });
        sleep(Duration::from_millis(10)).await;

        queue.shutdown();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Shutdown(_))));

        let new_work = queue
            .queue_operation(|| async { Ok::<_, Error>(()) }, opts(0, 100))
            .await;
        assert!(matches!(new_work, Err(Error::Shutdown(_))));
        let _ = blocker.await.unwrap();
    }
}
