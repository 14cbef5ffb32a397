// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Thin wrappers around the cooperative async scheduler, so CPU- and
//! IO-heavy component calls (clone, hash, pack) never run inline on a
//! worker task.

use tokio::runtime::Handle;

/// Runs a blocking closure on the runtime's dedicated blocking-task pool.
pub async fn unblock<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let handle = Handle::current();
    handle.spawn_blocking(f).await.expect("spawn blocking")
}
