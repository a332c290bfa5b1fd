//! Work queue and worker pool.
//!
//! Keys are coalesced: a key already waiting is not queued twice, and a key re-added
//! while a worker holds it is parked as dirty and queued again once that worker calls
//! `done`. So no two workers ever reconcile the same request at once.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opreq_core::ObjectKey;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{reconcile, Action, Context, Result};

#[derive(Default)]
struct Inner {
    order: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    processing: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    failures: FxHashMap<ObjectKey, u32>,
    closed: bool,
}

impl Inner {
    fn enqueue(&mut self, key: ObjectKey) -> bool {
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl WorkQueue {
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self { inner: Mutex::new(Inner::default()), notify: Notify::new(), backoff_base, backoff_max }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn add(&self, key: ObjectKey) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        if inner.processing.contains(&key) {
            inner.dirty.insert(key);
            return;
        }
        if inner.enqueue(key) {
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Re-add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(key) = inner.order.pop_front() {
                    inner.queued.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key`; a dirty key goes straight back on the queue.
    pub fn done(&self, key: &ObjectKey) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.remove(key) && !inner.closed && inner.enqueue(key.clone()) {
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Record a failure and return the delay before the next attempt:
    /// base, 2*base, 4*base, ... capped at the maximum.
    pub fn backoff(&self, key: &ObjectKey) -> Duration {
        let mut inner = self.lock();
        let n = inner.failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        let factor = 1u32.checked_shl(*n - 1).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    pub fn forget(&self, key: &ObjectKey) { self.lock().failures.remove(key); }

    pub fn len(&self) -> usize { self.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn shutdown(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }
}

/// Drain `queue` with `handler`. Each key runs in its own task so a panicking
/// handler costs one attempt, not the worker; the key is released either way.
async fn drain<F, Fut>(queue: Arc<WorkQueue>, id: usize, handler: F)
where
    F: Fn(ObjectKey) -> Fut,
    Fut: Future<Output = Result<Action>> + Send + 'static,
{
    while let Some(key) = queue.next().await {
        let failed = match tokio::spawn(handler(key.clone())).await {
            Ok(Ok(Action::Done)) => {
                queue.forget(&key);
                false
            }
            Ok(Ok(Action::RequeueAfter(delay))) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
                false
            }
            Ok(Err(_)) => true,
            Err(e) => {
                error!(worker = id, request = %key, error = %e, "reconcile panicked");
                true
            }
        };
        if failed {
            let delay = queue.backoff(&key);
            debug!(worker = id, request = %key, delay = ?delay, "backing off");
            queue.add_after(key.clone(), delay);
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

/// Spawn `ctx.config.workers` tasks draining `queue` until it shuts down.
pub fn run_workers(ctx: Arc<Context>, queue: Arc<WorkQueue>) -> Vec<JoinHandle<()>> {
    let workers = ctx.config.workers.max(1);
    info!(workers, "starting reconcile workers");
    (0..workers)
        .map(|id| {
            let ctx = Arc::clone(&ctx);
            let handler = move |key: ObjectKey| {
                let ctx = Arc::clone(&ctx);
                async move { reconcile(&ctx, &key).await }
            };
            tokio::spawn(drain(Arc::clone(&queue), id, handler))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Error;

    fn key(name: &str) -> ObjectKey { ObjectKey::new("team", name) }

    fn queue() -> Arc<WorkQueue> { Arc::new(WorkQueue::new(Duration::from_secs(5), Duration::from_secs(300))) }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = queue();
        q.add(key("a"));
        q.add(key("b"));
        q.add(key("a"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await, Some(key("a")));
        assert_eq!(q.next().await, Some(key("b")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_deferred_until_done() {
        let q = queue();
        q.add(key("a"));
        let held = q.next().await.unwrap();
        q.add(key("a"));
        assert!(q.is_empty(), "in-flight key must not be handed out twice");
        q.done(&held);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await, Some(key("a")));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let q = WorkQueue::new(Duration::from_secs(5), Duration::from_secs(30));
        let k = key("a");
        let delays: Vec<u64> = (0..5).map(|_| q.backoff(&k).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
        q.forget(&k);
        assert_eq!(q.backoff(&k), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_waits_for_delay() {
        let q = queue();
        q.add_after(key("a"), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_survives_a_panicking_reconcile() {
        let q = queue();
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = {
            let calls = Arc::clone(&calls);
            tokio::spawn(drain(Arc::clone(&q), 0, move |_key| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("labels are not a map");
                    }
                    Ok::<_, Error>(Action::Done)
                }
            }))
        };

        q.add(key("a"));
        // Retried after the first backoff step.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // The key was released, so a new event is processed right away.
        q.add(key("a"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        q.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.next().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        q.add(key("late"));
        assert!(q.is_empty());
    }
}
