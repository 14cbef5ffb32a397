// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Bounded-concurrency task queue with identity-key deduplication and
//! per-task cancellation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// The value by which queued/active tasks are deduplicated: a repo id for
/// per-repo tasks, a well-known constant for global tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    Repo(i32),
    UpdateAll,
    Reconcile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a task with this identity is already queued or active")]
pub struct AlreadyInProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub active_count: usize,
    pub queued_count: usize,
}

struct State {
    queued: HashSet<Identity>,
    active: HashSet<Identity>,
    tokens: HashMap<Identity, CancellationToken>,
}

struct Inner {
    semaphore: Arc<Semaphore>,
    state: Mutex<State>,
}

/// Bounded task manager. Cloning shares the same underlying queue.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

/// Held by a worker for the lifetime of one running task. Dropping it
/// releases the semaphore permit and clears the identity's registration,
/// making the identity eligible for enqueue again.
pub struct Lease {
    inner: Arc<Inner>,
    identity: Identity,
    cancellation: CancellationToken,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("task manager state poisoned");
        state.active.remove(&self.identity);
        state.tokens.remove(&self.identity);
    }
}

impl Manager {
    /// `concurrency` is the semaphore size (configurable 1..16, default 4).
    pub fn new(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
                state: Mutex::new(State {
                    queued: HashSet::new(),
                    active: HashSet::new(),
                    tokens: HashMap::new(),
                }),
            }),
        }
    }

    /// Registers `identity` as queued, then waits for a free permit. Fails
    /// immediately (no waiting) if the identity is already queued or
    /// active.
    pub async fn enqueue(&self, identity: Identity) -> Result<Lease, AlreadyInProgress> {
        {
            let mut state = self.inner.state.lock().expect("task manager state poisoned");
            if state.queued.contains(&identity) || state.active.contains(&identity) {
                return Err(AlreadyInProgress);
            }
            state.queued.insert(identity);
        }

        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("task semaphore is never closed");

        let cancellation = CancellationToken::new();
        {
            let mut state = self.inner.state.lock().expect("task manager state poisoned");
            state.queued.remove(&identity);
            state.active.insert(identity);
            state.tokens.insert(identity, cancellation.clone());
        }

        Ok(Lease {
            inner: self.inner.clone(),
            identity,
            cancellation,
            _permit: permit,
        })
    }

    /// Non-blocking peek used by callers that must refuse a duplicate
    /// without waiting on a permit (the facade's enqueue methods): true if
    /// `identity` is currently queued or active. A call that passes this
    /// check can still race a concurrent enqueue and fail inside
    /// [`Manager::enqueue`] itself; callers treat that failure the same way.
    pub fn is_active_or_queued(&self, identity: Identity) -> bool {
        let state = self.inner.state.lock().expect("task manager state poisoned");
        state.queued.contains(&identity) || state.active.contains(&identity)
    }

    /// Idempotent: cancelling an identity with no active/queued task is a
    /// no-op.
    pub fn cancel(&self, identity: Identity) {
        let state = self.inner.state.lock().expect("task manager state poisoned");
        if let Some(token) = state.tokens.get(&identity) {
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let state = self.inner.state.lock().expect("task manager state poisoned");
        for token in state.tokens.values() {
            token.cancel();
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock().expect("task manager state poisoned");
        Snapshot {
            active_count: state.active.len(),
            queued_count: state.queued.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_enqueue_of_same_identity_is_refused() {
        let manager = Manager::new(4);
        let lease = manager.enqueue(Identity::Repo(1)).await.unwrap();
        assert!(manager.enqueue(Identity::Repo(1)).await.is_err());
        drop(lease);
        assert!(manager.enqueue(Identity::Repo(1)).await.is_ok());
    }

    #[tokio::test]
    async fn distinct_identities_run_concurrently_up_to_the_semaphore_limit() {
        let manager = Manager::new(2);
        let a = manager.enqueue(Identity::Repo(1)).await.unwrap();
        let b = manager.enqueue(Identity::Repo(2)).await.unwrap();
        assert_eq!(manager.snapshot().active_count, 2);

        let manager2 = manager.clone();
        let waiting = tokio::spawn(async move { manager2.enqueue(Identity::Repo(3)).await });

        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(a);
        let c = waiting.await.unwrap().unwrap();
        assert_eq!(manager.snapshot().active_count, 2);

        drop(b);
        drop(c);
        assert_eq!(manager.snapshot().active_count, 0);
    }

    #[tokio::test]
    async fn cancel_all_signals_every_active_lease() {
        let manager = Manager::new(4);
        let a = manager.enqueue(Identity::Repo(1)).await.unwrap();
        let b = manager.enqueue(Identity::Repo(2)).await.unwrap();

        manager.cancel_all();

        assert!(a.cancellation().is_cancelled());
        assert!(b.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_for_unknown_identity() {
        let manager = Manager::new(4);
        manager.cancel(Identity::Repo(99));
    }
}
