//! Submission-ordered per-key queues.
//!
//! Each mutating call takes a ticket and records, under one lock, the calls
//! it must wait for: the current holder of each of its keys plus the last
//! exclusive call. An exclusive call waits for every keyed call registered
//! since the previous exclusive one. Because registration order is total and
//! atomic, overlapping key sets cannot deadlock, and same-key calls run in
//! submission order.
//!
//! Per-key entries are created on demand and removed when their last holder
//! releases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::oneshot;

use super::keys::{Access, ResourceKey};

type DoneSignal = Shared<BoxFuture<'static, ()>>;

struct Waiter {
    ticket: u64,
    done: DoneSignal,
}

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    tails: HashMap<ResourceKey, Waiter>,
    exclusive_tail: Option<Waiter>,
    /// Keyed calls registered after the last exclusive call.
    since_exclusive: HashMap<u64, DoneSignal>,
}

impl QueueState {
    fn active_keys(&self) -> usize {
        self.tails.len()
    }
}

enum Claim {
    Keys(Vec<ResourceKey>),
    Exclusive,
}

struct Held {
    state: Arc<Mutex<QueueState>>,
    ticket: u64,
    claim: Claim,
    /// Dropping the sender wakes every successor.
    done: oneshot::Sender<()>,
}

impl Held {
    fn release(self) {
        {
            let mut state = lock(&self.state);
            match &self.claim {
                Claim::Keys(keys) => {
                    for key in keys {
                        if state.tails.get(key).map(|w| w.ticket) == Some(self.ticket) {
                            state.tails.remove(key);
                        }
                    }
                    state.since_exclusive.remove(&self.ticket);
                }
                Claim::Exclusive => {
                    if state.exclusive_tail.as_ref().map(|w| w.ticket) == Some(self.ticket) {
                        state.exclusive_tail = None;
                    }
                }
            }
        }
        let _ = self.done.send(());
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn done_signal() -> (oneshot::Sender<()>, DoneSignal) {
    let (tx, rx) = oneshot::channel();
    (tx, rx.map(|_| ()).boxed().shared())
}

/// Ordering queue shared by every batch of one scheduler.
#[derive(Clone, Default)]
pub struct KeyedQueue {
    state: Arc<Mutex<QueueState>>,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a place in line. Must be called in submission order.
    ///
    /// Returns `None` for read-only access, which never waits.
    pub fn register(&self, access: &Access) -> Option<Registration> {
        let (done_tx, done) = done_signal();
        let mut state = lock(&self.state);
        let ticket = state.next_ticket;

        let (claim, predecessors) = match access {
            Access::ReadOnly => return None,
            Access::Keys(keys) => {
                let mut predecessors: Vec<DoneSignal> = Vec::new();
                if let Some(exclusive) = &state.exclusive_tail {
                    predecessors.push(exclusive.done.clone());
                }
                // BTreeSet iteration is already sorted
                for key in keys {
                    let previous = state.tails.insert(
                        key.clone(),
                        Waiter {
                            ticket,
                            done: done.clone(),
                        },
                    );
                    if let Some(previous) = previous {
                        predecessors.push(previous.done);
                    }
                }
                state.since_exclusive.insert(ticket, done.clone());
                (Claim::Keys(keys.iter().cloned().collect()), predecessors)
            }
            Access::Exclusive => {
                let mut predecessors: Vec<DoneSignal> =
                    state.since_exclusive.drain().map(|(_, d)| d).collect();
                if let Some(previous) = state.exclusive_tail.take() {
                    predecessors.push(previous.done);
                }
                state.tails.clear();
                state.exclusive_tail = Some(Waiter {
                    ticket,
                    done: done.clone(),
                });
                (Claim::Exclusive, predecessors)
            }
        };
        state.next_ticket += 1;
        drop(state);

        Some(Registration {
            held: Some(Held {
                state: self.state.clone(),
                ticket,
                claim,
                done: done_tx,
            }),
            predecessors,
        })
    }

    /// Number of keys with a registered holder.
    pub fn active_keys(&self) -> usize {
        lock(&self.state).active_keys()
    }
}

/// A place in line that has not started running yet.
///
/// Dropping it before [`Registration::ready`] completes still releases in
/// order: successors are woken only after this call's own predecessors
/// finish.
pub struct Registration {
    held: Option<Held>,
    predecessors: Vec<DoneSignal>,
}

impl Registration {
    /// Wait for every predecessor, then hold the keys until the permit drops.
    pub async fn ready(mut self) -> Permit {
        join_all(self.predecessors.clone()).await;
        self.predecessors.clear();
        Permit {
            held: self.held.take(),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        let predecessors = std::mem::take(&mut self.predecessors);
        if predecessors.is_empty() {
            held.release();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    join_all(predecessors).await;
                    held.release();
                });
            }
            Err(_) => held.release(),
        }
    }
}

/// Held keys of a running call. Released on drop.
pub struct Permit {
    held: Option<Held>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            held.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::time::Duration;

    fn keys(paths: &[&str]) -> Access {
        Access::Keys(
            paths
                .iter()
                .map(|p| ResourceKey::Path(PathBuf::from(p)))
                .collect::<BTreeSet<_>>(),
        )
    }

    #[tokio::test]
    async fn test_disjoint_keys_do_not_wait() {
        let queue = KeyedQueue::new();
        let a = queue.register(&keys(&["/a"])).unwrap();
        let b = queue.register(&keys(&["/b"])).unwrap();

        let _pa = a.ready().await;
        let _pb = tokio::time::timeout(Duration::from_secs(1), b.ready())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_same_key_waits_for_release() {
        let queue = KeyedQueue::new();
        let first = queue.register(&keys(&["/a"])).unwrap();
        let second = queue.register(&keys(&["/a"])).unwrap();

        let permit = first.ready().await;
        let waiting = tokio::spawn(second.ready());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(permit);
        let _second = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_keyed_and_blocks_later() {
        let queue = KeyedQueue::new();
        let keyed = queue.register(&keys(&["/a"])).unwrap();
        let exclusive = queue.register(&Access::Exclusive).unwrap();
        let later = queue.register(&keys(&["/b"])).unwrap();

        let keyed_permit = keyed.ready().await;
        let exclusive_wait = tokio::spawn(exclusive.ready());
        let later_wait = tokio::spawn(later.ready());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!exclusive_wait.is_finished());
        assert!(!later_wait.is_finished());

        drop(keyed_permit);
        let exclusive_permit = tokio::time::timeout(Duration::from_secs(1), exclusive_wait)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!later_wait.is_finished());

        drop(exclusive_permit);
        tokio::time::timeout(Duration::from_secs(1), later_wait)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_registration_keeps_order() {
        let queue = KeyedQueue::new();
        let first = queue.register(&keys(&["/a"])).unwrap();
        let abandoned = queue.register(&keys(&["/a"])).unwrap();
        let third = queue.register(&keys(&["/a"])).unwrap();

        let first_permit = first.ready().await;
        drop(abandoned);

        let third_wait = tokio::spawn(third.ready());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third_wait.is_finished());

        drop(first_permit);
        tokio::time::timeout(Duration::from_secs(1), third_wait)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_keys_are_removed_after_release() {
        let queue = KeyedQueue::new();
        let a = queue.register(&keys(&["/a", "/b"])).unwrap();
        assert_eq!(queue.active_keys(), 2);

        drop(a.ready().await);
        assert_eq!(queue.active_keys(), 0);
        assert!(queue.register(&Access::ReadOnly).is_none());
    }
}
