// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! The only module a host application calls: composes the metadata store,
//! task manager, event bus, forge client, and secret keeper into the
//! inbound operations the presentation/shell layer needs, dispatching long
//! work through the Task Manager and reporting progress on the Event Bus
//! instead of blocking the caller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

use crate::db::archive::{Archive, NewArchive};
use crate::db::repository::{Repository, Status, StatusFilter};
use crate::db::{Database, SettingKey};
use crate::events::{Bus, Receiver};
use crate::reconcile::Scheduler;
use crate::secrets::SecretStore;
use crate::task::{self, Identity};
use crate::worker::{self, EnsureMirroredArgs};
use crate::Error;

/// Service name under which the forge token is filed in the Secret Keeper;
/// one engine instance talks to exactly one forge.
const FORGE_SERVICE: &str = "forge";

const DEFAULT_CONCURRENCY: usize = 4;

/// No fallback value is recorded for an unset `auto_poll_interval_seconds`
/// Setting; one hour is conservative enough that forge rate limits are a
/// non-issue while still catching upstream deletions within a work day.
const DEFAULT_POLL_INTERVAL_SECONDS: usize = 3600;

fn read_usize_setting(db: &Database, key: SettingKey, default: usize) -> usize {
    db.settings().get(key).ok().flatten().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Result of [`Facade::import_legacy`].
#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    pub imported_count: usize,
    pub archives_found: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    last_cloned: Option<DateTime<Utc>>,
    last_updated: Option<DateTime<Utc>>,
    local_path: Option<String>,
    description: Option<String>,
    status: Option<String>,
}

/// Composes the engine's process-wide services (Metadata Store, Task
/// Manager, Event Bus) with the per-process forge client and secret store.
/// Cheap to clone: every field is itself a handle to shared state.
#[derive(Clone)]
pub struct Facade {
    db: Database,
    bus: Bus,
    tasks: task::Manager,
    secrets: Arc<dyn SecretStore>,
    forge: Arc<RwLock<Arc<forge_client::Client>>>,
    forge_api_base: Url,
    data_dir: PathBuf,
    /// Set exactly once, immediately after construction, in [`Facade::new`].
    /// `OnceLock` rather than a plain field only because the scheduler needs
    /// a fully-built `Facade` clone to drive `enqueue_reconcile` — there is
    /// no cyclic initialization otherwise.
    reconcile: Arc<OnceLock<Scheduler>>,
}

impl Facade {
    /// Opens (creating if absent) the metadata store at
    /// `<data_dir>/archiver.sqlite3`, sizes the Task Manager from the
    /// `max_concurrency` Setting (default 4, clamped to 1..=16), builds a
    /// forge client against `forge_api_base` using whatever token the
    /// Secret Keeper currently holds, and starts the C9 reconcile scheduler
    /// at the `auto_poll_interval_seconds` Setting (default one hour). Must
    /// be called from within a running Tokio runtime, since it spawns that
    /// scheduler's background task immediately.
    pub fn new(data_dir: PathBuf, forge_api_base: Url, secrets: Arc<dyn SecretStore>) -> Result<Self, Error> {
        std::fs::create_dir_all(&data_dir).map_err(|e| Error::StorageFailure(e.to_string()))?;
        let db_path = data_dir.join("archiver.sqlite3");
        let db = Database::new(&db_path.to_string_lossy())?;

        let concurrency = read_usize_setting(&db, SettingKey::MaxConcurrency, DEFAULT_CONCURRENCY).clamp(1, 16);
        let tasks = task::Manager::new(concurrency);
        let bus = Bus::default();

        let token = secrets.get_token(FORGE_SERVICE)?;
        let forge = forge_client::Client::new(forge_api_base.clone(), token).map_err(|e| Error::ForgeApiFailure(e.to_string()))?;

        let poll_interval_secs = read_usize_setting(&db, SettingKey::AutoPollIntervalSeconds, DEFAULT_POLL_INTERVAL_SECONDS).max(1) as u64;

        let facade = Self {
            db,
            bus,
            tasks,
            secrets,
            forge: Arc::new(RwLock::new(Arc::new(forge))),
            forge_api_base,
            data_dir,
            reconcile: Arc::new(OnceLock::new()),
        };

        let scheduler = Scheduler::start(facade.clone(), Duration::from_secs(poll_interval_secs));
        let _ = facade.reconcile.set(scheduler);

        Ok(facade)
    }

    fn forge(&self) -> Arc<forge_client::Client> {
        self.forge.read().expect("forge client lock poisoned").clone()
    }

    fn default_depth(&self) -> Option<u32> {
        self.db
            .settings()
            .get(SettingKey::DefaultMirrorDepth)
            .ok()
            .flatten()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|d| *d > 0)
    }

    /// Attaches a new subscriber to the Event Bus. Subscribers attach once
    /// and remain for the process lifetime.
    pub fn subscribe(&self) -> Receiver {
        self.bus.subscribe()
    }

    /// Cancels every active task and waits for the Task Manager to drain,
    /// for a graceful process exit — the Metadata Store handle is simply
    /// dropped along with this `Facade`.
    pub async fn shutdown(&self) {
        self.tasks.cancel_all();
        loop {
            let snapshot = self.tasks.snapshot();
            if snapshot.active_count == 0 && snapshot.queued_count == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn add_repo(&self, url: &str) -> Result<Repository, Error> {
        let canonical = url_canon::canonicalize(url)?;
        self.db.repositories().insert_new(canonical.owner(), canonical.name(), canonical.as_str()).map_err(Error::from)
    }

    pub fn list_repos(&self, status_filter: Option<Status>) -> Result<Vec<Repository>, Error> {
        let filter = status_filter.map_or(StatusFilter::Any, StatusFilter::Is);
        self.db.repositories().list(filter).map_err(Error::from)
    }

    /// Deletes the Repository row (cascading to its Archive and FileHash
    /// rows). With `remove_files`, also removes the mirror directory
    /// (mirror + versions) from disk; a directory already gone is not an
    /// error.
    pub fn delete_repo(&self, id: i32, remove_files: bool) -> Result<(), Error> {
        let repo = self
            .db
            .repositories()
            .get_by_id(id)?
            .ok_or_else(|| Error::StorageFailure(format!("repository {id} does not exist")))?;

        self.db.repositories().delete(id)?;

        if remove_files {
            if let Some(mirror_path) = repo.mirror_path {
                let _ = std::fs::remove_dir_all(mirror_path);
            }
        }

        Ok(())
    }

    /// Enqueues `EnsureMirrored(id)`. Fails fast with `AlreadyInProgress` if
    /// a task for this repository is already queued or active; otherwise
    /// returns immediately and reports progress on the Event Bus.
    pub fn enqueue_update(&self, id: i32) -> Result<(), Error> {
        self.spawn_ensure_mirrored(id)
    }

    fn spawn_ensure_mirrored(&self, repo_id: i32) -> Result<(), Error> {
        let identity = Identity::Repo(repo_id);
        if self.tasks.is_active_or_queued(identity) {
            return Err(Error::AlreadyInProgress);
        }

        let db = self.db.clone();
        let bus = self.bus.clone();
        let tasks = self.tasks.clone();
        let secrets = self.secrets.clone();
        let data_dir = self.data_dir.clone();
        let depth = self.default_depth();

        tokio::spawn(async move {
            let lease = match tasks.enqueue(identity).await {
                Ok(lease) => lease,
                // Lost a race against a concurrent enqueue of the same identity;
                // the task that won is responsible for the work.
                Err(_) => return,
            };

            let auth_token = secrets.get_token(FORGE_SERVICE).ok().flatten();
            let cancel = lease.cancellation().clone();

            let result = worker::ensure_mirrored(EnsureMirroredArgs {
                db: &db,
                bus: &bus,
                data_dir: &data_dir,
                repo_id,
                depth,
                auth_token,
                cancel,
            })
            .await;

            if let Err(err) = result {
                tracing::warn!(repo_id, %err, "ensure_mirrored task ended in error");
            }

            drop(lease);
        });

        Ok(())
    }

    /// Enqueues `EnsureMirrored` for every tracked repository not already
    /// deleted (and, unless `include_archived`, not archived either). Each
    /// repository still dedups against its own identity: a repo whose
    /// update is already in flight is skipped rather than treated as a
    /// failure of the batch.
    pub fn enqueue_update_all(&self, include_archived: bool) -> Result<(), Error> {
        let identity = Identity::UpdateAll;
        if self.tasks.is_active_or_queued(identity) {
            return Err(Error::AlreadyInProgress);
        }

        let db = self.db.clone();
        let tasks = self.tasks.clone();
        let facade = self.clone();

        tokio::spawn(async move {
            let lease = match tasks.enqueue(identity).await {
                Ok(lease) => lease,
                Err(_) => return,
            };

            let repos = match db.repositories().list(StatusFilter::Any) {
                Ok(repos) => repos,
                Err(err) => {
                    tracing::warn!(%err, "enqueue_update_all failed to list repositories");
                    return;
                }
            };

            for repo in repos {
                match repo.status() {
                    Status::Deleted => continue,
                    Status::Archived if !include_archived => continue,
                    _ => {}
                }
                let _ = facade.spawn_ensure_mirrored(repo.id);
            }

            drop(lease);
        });

        Ok(())
    }

    pub fn stop_all(&self) {
        self.tasks.cancel_all();
    }

    /// Enqueues `ReconcileStatus(all)`. The timer-driven [`crate::reconcile::Scheduler`]
    /// calls this same method, so a manual "reconcile now" and a scheduled
    /// tick dedup against each other via the shared `Identity::Reconcile`.
    pub fn enqueue_reconcile(&self) -> Result<(), Error> {
        let identity = Identity::Reconcile;
        if self.tasks.is_active_or_queued(identity) {
            return Err(Error::AlreadyInProgress);
        }

        let db = self.db.clone();
        let bus = self.bus.clone();
        let tasks = self.tasks.clone();
        let forge = self.forge();

        tokio::spawn(async move {
            let lease = match tasks.enqueue(identity).await {
                Ok(lease) => lease,
                Err(_) => return,
            };

            if let Err(err) = worker::reconcile_status(&db, &bus, &forge).await {
                tracing::warn!(%err, "reconcile task ended in error");
            }

            drop(lease);
        });

        Ok(())
    }

    pub fn list_archives(&self, repo_id: i32) -> Result<Vec<Archive>, Error> {
        self.db.archives().list(repo_id).map_err(Error::from)
    }

    pub fn extract_archive(&self, archive_id: i32, destination: &Path) -> Result<(), Error> {
        let archive = self
            .db
            .archives()
            .get(archive_id)?
            .ok_or_else(|| Error::StorageFailure(format!("archive {archive_id} does not exist")))?;

        snapshot_pack::unpack(Path::new(&archive.file_path), destination).map_err(Error::from)
    }

    /// Deletes the Archive row and its on-disk file. The file may already
    /// be gone (orphan cleanup, crash recovery) without this failing.
    pub fn delete_archive(&self, archive_id: i32) -> Result<(), Error> {
        let archive = self
            .db
            .archives()
            .get(archive_id)?
            .ok_or_else(|| Error::StorageFailure(format!("archive {archive_id} does not exist")))?;

        self.db.archives().delete(archive_id)?;
        snapshot_pack::delete(Path::new(&archive.file_path));
        Ok(())
    }

    pub fn get_settings(&self) -> Result<BTreeMap<String, String>, Error> {
        self.db.settings().load_all().map_err(Error::from)
    }

    /// Writes every entry of `settings` against the allowlist (an unknown
    /// key aborts before anything is written, so a partial typo never
    /// leaves half the batch applied). When `token` is `Some`, also updates
    /// the Secret Keeper and rebuilds the forge client so the new token
    /// takes effect on the next call, without restarting the process.
    pub fn save_settings(&self, settings: &BTreeMap<String, String>, token: Option<String>) -> Result<(), Error> {
        for (key, _) in settings {
            key.parse::<SettingKey>().map_err(|_| crate::db::Error::UnknownSetting(key.clone()))?;
        }
        for (key, value) in settings {
            self.db.settings().set_raw(key, value)?;
        }

        if let Some(token) = token {
            self.secrets.set_token(FORGE_SERVICE, &token)?;
            let rebuilt =
                forge_client::Client::new(self.forge_api_base.clone(), Some(token)).map_err(|e| Error::ForgeApiFailure(e.to_string()))?;
            *self.forge.write().expect("forge client lock poisoned") = Arc::new(rebuilt);
        }

        Ok(())
    }

    pub async fn get_rate_limit(&self) -> Result<forge_client::RateLimit, Error> {
        self.forge().rate_limit().await.map_err(Error::from)
    }

    /// Imports a legacy JSON blob: inserts one Repository per key, coercing
    /// an unrecognized legacy `status` to `pending`, then — when the record
    /// names a `local_path` — scans `<local_path>/versions/*.tar.xz` and
    /// inserts one orphaned Archive row per file found (`file_count = 0`,
    /// `incremental = false`; recovering the true count would mean
    /// re-reading every archive, a cost this importer does not pay). A
    /// per-key failure is recorded in `errors` and does not abort the rest
    /// of the import.
    pub fn import_legacy(&self, serialized_blob: &str) -> Result<ImportSummary, Error> {
        let records: BTreeMap<String, LegacyRecord> =
            serde_json::from_str(serialized_blob).map_err(|e| Error::StorageFailure(format!("legacy import blob is not valid json: {e}")))?;

        let mut summary = ImportSummary::default();

        for (url, record) in &records {
            match self.import_legacy_one(url, record) {
                Ok(archives_found) => {
                    summary.imported_count += 1;
                    summary.archives_found += archives_found;
                }
                Err(err) => summary.errors.push(format!("{url}: {err}")),
            }
        }

        Ok(summary)
    }

    fn import_legacy_one(&self, url: &str, record: &LegacyRecord) -> Result<usize, Error> {
        let canonical = url_canon::canonicalize(url)?;
        let repo = self.db.repositories().insert_new(canonical.owner(), canonical.name(), canonical.as_str())?;

        let status: Status = record.status.as_deref().and_then(|s| s.parse().ok()).unwrap_or(Status::Pending);
        if status != Status::Pending {
            self.db.repositories().update_status(repo.id, status, None)?;
        }

        if record.description.is_some() {
            self.db.repositories().update_metadata(repo.id, record.description.as_deref(), false)?;
        }

        if record.last_cloned.is_some() || record.last_updated.is_some() {
            self.db.repositories().update_timestamps(repo.id, record.last_cloned, record.last_updated, None)?;
        }

        let Some(local_path) = &record.local_path else {
            return Ok(0);
        };
        self.db.repositories().set_mirror_path(repo.id, local_path)?;

        let versions = Path::new(local_path).join("versions");
        let Ok(entries) = std::fs::read_dir(&versions) else {
            return Ok(0);
        };

        let mut archives_found = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let filename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if !filename.ends_with(".tar.xz") {
                continue;
            }
            let Ok(metadata) = entry.metadata() else { continue };

            self.db.archives().insert(NewArchive {
                repository_id: repo.id,
                filename: &filename,
                file_path: &path.to_string_lossy(),
                size_bytes: metadata.len() as i64,
                file_count: 0,
                incremental: false,
            })?;
            archives_found += 1;
        }

        Ok(archives_found)
    }
}
