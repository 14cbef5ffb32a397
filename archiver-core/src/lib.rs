// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Drives mirrored-clone archival of forge repositories: clone/fetch a bare
//! mirror, snapshot its working content into compressed tar files, and keep
//! lifecycle status in sync with the forge's metadata API.
//!
//! [`facade`] is the only module a host application calls; everything else
//! is internal plumbing it composes.

pub mod db;
pub mod events;
pub mod facade;
pub mod secrets;
pub mod task;

mod reconcile;
mod runtime;
mod worker;

pub use events::{Bus, Event, Stage};
pub use facade::Facade;

/// Initializes the process-wide `tracing` subscriber from a config string in
/// `tracing_common::LogConfig`'s format (e.g. `"info:json:stderr"`). A host
/// application calls this once, before constructing its first [`Facade`] —
/// the engine itself never claims the global subscriber, since that is a
/// binary's decision, not a library's.
pub fn init_logging(spec: &str) -> Result<(), Error> {
    let config: tracing_common::LogConfig = spec.parse().map_err(Error::StorageFailure)?;
    tracing_common::init(config.format, config.level, config.destination);
    Ok(())
}

/// The taxonomy every `archiver-core` operation's failure is reported
/// through. Each component's own error type maps into exactly one of
/// these; `GitFailure`/`ForgeApiFailure`/`ArchiveFailure`/`StorageFailure`
/// each carry a compact human-readable reason rather than the source
/// error's full detail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid repository url: {0}")]
    InvalidUrl(String),
    #[error("a repository with this url or owner/name already exists")]
    DuplicateRepo,
    #[error("git operation failed: {0}")]
    GitFailure(String),
    #[error("forge api call failed: {0}")]
    ForgeApiFailure(String),
    #[error("forge api rate limited, resets at epoch {reset_epoch}")]
    RateLimited { reset_epoch: i64 },
    #[error("archive operation failed: {0}")]
    ArchiveFailure(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("a task for this identity is already queued or active")]
    AlreadyInProgress,
    #[error("task was cancelled")]
    Cancelled,
    #[error("secret store failure: {0}")]
    SecretsFailure(String),
}

impl From<db::Error> for Error {
    fn from(err: db::Error) -> Self {
        match err {
            db::Error::DuplicateRepo => Error::DuplicateRepo,
            other => Error::StorageFailure(other.to_string()),
        }
    }
}

impl From<git_mirror::Error> for Error {
    fn from(err: git_mirror::Error) -> Self {
        match err {
            git_mirror::Error::Cancelled => Error::Cancelled,
            other => Error::GitFailure(other.to_string()),
        }
    }
}

impl From<forge_client::Error> for Error {
    fn from(err: forge_client::Error) -> Self {
        match err {
            forge_client::Error::RateLimited { reset_epoch } => Error::RateLimited { reset_epoch },
            other => Error::ForgeApiFailure(other.to_string()),
        }
    }
}

impl From<snapshot_pack::Error> for Error {
    fn from(err: snapshot_pack::Error) -> Self {
        Error::ArchiveFailure(err.to_string())
    }
}

impl From<hash_index::Error> for Error {
    fn from(err: hash_index::Error) -> Self {
        Error::ArchiveFailure(err.to_string())
    }
}

impl From<secrets::Error> for Error {
    fn from(err: secrets::Error) -> Self {
        Error::SecretsFailure(err.to_string())
    }
}

impl From<task::AlreadyInProgress> for Error {
    fn from(_: task::AlreadyInProgress) -> Self {
        Error::AlreadyInProgress
    }
}

impl From<url_canon::CanonError> for Error {
    fn from(err: url_canon::CanonError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}
