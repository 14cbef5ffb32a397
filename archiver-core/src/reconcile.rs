// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Thin timer-driven wrapper around `ReconcileStatus(all)` (C9). It does not
//! run the reconciliation itself — it just calls the same
//! [`Facade::enqueue_reconcile`] a manual "reconcile now" request uses, so
//! a scheduled tick and a user-triggered reconcile dedup against each other
//! through C7's `Identity::Reconcile`, exactly as one task whether timer- or
//! user-triggered.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::facade::Facade;
use crate::Error;

/// Owns the background polling loop; dropping or [`stop`](Scheduler::stop)
/// ends it.
pub struct Scheduler {
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Spawns a loop firing every `interval`, calling `facade.enqueue_reconcile()`
    /// on each tick. `AlreadyInProgress` (a previous reconcile still
    /// running) is the expected steady-state outcome of a slow
    /// reconciliation overlapping the next tick, not a failure worth
    /// logging; any other error is.
    pub fn start(facade: Facade, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match facade.enqueue_reconcile() {
                    Ok(()) | Err(Error::AlreadyInProgress) => {}
                    Err(err) => tracing::warn!(%err, "scheduled reconcile failed to enqueue"),
                }
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
