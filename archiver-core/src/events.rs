// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Fan-out publisher (C10). `tokio::sync::broadcast` gives every subscriber
//! its own lag counter: a slow subscriber misses events (and learns how
//! many, via `RecvError::Lagged`) rather than blocking the publisher.

use tokio::sync::broadcast;

use crate::db::repository::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Cloning,
    Fetching,
    Archiving,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum Event {
    TaskProgress {
        repo_id: i32,
        repo_url: String,
        stage: Stage,
        fraction: Option<f32>,
        message: Option<String>,
    },
    RepoUpdated {
        repository: Repository,
    },
    TaskError {
        repo_id: Option<i32>,
        kind: &'static str,
        message: String,
    },
}

pub type Receiver = broadcast::Receiver<Event>;

/// Default per-subscriber buffer depth. A subscriber that falls this far
/// behind loses the oldest events rather than stalling the worker that
/// published them.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<Event>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> Receiver {
        self.sender.subscribe()
    }

    /// Best-effort: if there are no subscribers this is a no-op.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_subscriber_that_falls_behind_reports_lag_instead_of_blocking_the_publisher() {
        let bus = Bus::new(2);
        let mut slow = bus.subscribe();

        for i in 0..5 {
            bus.publish(Event::TaskError {
                repo_id: None,
                kind: "test",
                message: i.to_string(),
            });
        }

        assert!(matches!(slow.recv().await, Err(broadcast::error::RecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = Bus::new(4);
        bus.publish(Event::TaskError {
            repo_id: Some(1),
            kind: "test",
            message: "x".to_owned(),
        });
    }
}
