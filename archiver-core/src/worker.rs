// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Drives the `EnsureMirrored`/`ReconcileStatus` task state machines (C8)
//! against C1/C3/C4/C5/C6. `StopAll` has no state machine of its own — it
//! is just `task::Manager::cancel_all`, called directly by the facade.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::db::archive::NewArchive;
use crate::db::repository::{ReconcileMetadata, ReconcileUpdate, Status};
use crate::db::Database;
use crate::events::{Bus, Event, Stage};
use crate::runtime;

/// Subjects are chunked to this size before each `batch_get_repos` call,
/// matching C6's own per-request chunking.
const RECONCILE_CHUNK_SIZE: usize = 100;

fn mirror_root(data_dir: &Path, owner: &str, name: &str) -> PathBuf {
    data_dir.join(format!("{owner}_{name}"))
}

fn versions_dir(mirror_root: &Path) -> PathBuf {
    mirror_root.join("versions")
}

fn archive_filename(owner: &str, name: &str, at: DateTime<Utc>) -> String {
    format!("{owner}_{name}__{}.tar.xz", at.format("%Y%m%dT%H%M%SZ"))
}

/// Bridges the engine-wide `CancellationToken` to the `git_mirror::Cancellation`
/// flag `git2`'s blocking callbacks poll. The watcher task is harmless to
/// leave running past the blocking call's completion; callers abort it
/// explicitly once the call returns so it doesn't outlive the request.
fn bridge_cancellation(cancel: CancellationToken) -> (git_mirror::Cancellation, tokio::task::JoinHandle<()>) {
    let flag = git_mirror::Cancellation::new();
    let flag_for_watcher = flag.clone();
    let handle = tokio::spawn(async move {
        cancel.cancelled().await;
        flag_for_watcher.cancel();
    });
    (flag, handle)
}

pub(crate) struct EnsureMirroredArgs<'a> {
    pub db: &'a Database,
    pub bus: &'a Bus,
    pub data_dir: &'a Path,
    pub repo_id: i32,
    pub depth: Option<u32>,
    pub auth_token: Option<String>,
    pub cancel: CancellationToken,
}

/// Runs one `EnsureMirrored(repo_id)` task to completion: clone-or-update
/// the mirror, then snapshot it if anything advanced. Cancellation at any
/// stage ends the task with a `Cancelled` progress event rather than an
/// error; terminal failures record `status = error` on the repository
/// before propagating.
pub(crate) async fn ensure_mirrored(args: EnsureMirroredArgs<'_>) -> Result<(), Error> {
    let EnsureMirroredArgs {
        db,
        bus,
        data_dir,
        repo_id,
        depth,
        auth_token,
        cancel,
    } = args;

    let repo = db
        .repositories()
        .get_by_id(repo_id)?
        .ok_or_else(|| Error::StorageFailure(format!("repository {repo_id} no longer exists")))?;
    let repo_url = repo.canonical_url.clone();

    let emit = |stage: Stage, fraction: Option<f32>, message: Option<String>| {
        bus.publish(Event::TaskProgress {
            repo_id,
            repo_url: repo_url.clone(),
            stage,
            fraction,
            message,
        });
    };

    let mirror_path = mirror_root(data_dir, &repo.owner, &repo.name);
    let needs_clone = repo.mirror_path.is_none() || !mirror_path.join("HEAD").exists();

    let (flag, watcher) = bridge_cancellation(cancel.clone());

    let advanced = if needs_clone {
        let outcome = clone_mirror(db, bus, &emit, repo_id, &repo_url, &mirror_path, depth, auth_token.as_deref(), &flag).await;
        watcher.abort();
        match outcome {
            ClonedOrSkipped::Advanced => true,
            ClonedOrSkipped::Terminated(result) => return result,
        }
    } else {
        let outcome = update_mirror(db, bus, &emit, repo_id, &repo_url, &mirror_path, auth_token.as_deref(), &flag).await;
        watcher.abort();
        match outcome {
            ClonedOrSkipped::Advanced => true,
            ClonedOrSkipped::Terminated(result) => return result,
        }
    };

    if !advanced {
        emit(Stage::Done, None, None);
        return Ok(());
    }

    if cancel.is_cancelled() {
        emit(Stage::Cancelled, None, None);
        return Ok(());
    }

    emit(Stage::Archiving, None, None);

    match snapshot(db, &mirror_path, repo_id, &repo.owner, &repo.name, &cancel).await {
        Ok(true) => {
            if let Some(updated) = db.repositories().get_by_id(repo_id)? {
                bus.publish(Event::RepoUpdated { repository: updated });
            }
            emit(Stage::Done, None, None);
            Ok(())
        }
        Ok(false) => {
            // diff was empty after an advancing fetch; tolerated, not an error.
            emit(Stage::Done, None, None);
            Ok(())
        }
        Err(SnapshotFailure::Cancelled) => {
            emit(Stage::Cancelled, None, None);
            Ok(())
        }
        Err(SnapshotFailure::Error(err)) => {
            let message = err.to_string();
            db.repositories().update_status(repo_id, Status::Error, Some(&message))?;
            bus.publish(Event::TaskError {
                repo_id: Some(repo_id),
                kind: "archive",
                message: message.clone(),
            });
            Err(err)
        }
    }
}

/// Either the mirror advanced and a snapshot should follow, or the task is
/// already fully resolved (error recorded, event published) and the caller
/// should return `result` as-is.
enum ClonedOrSkipped {
    Advanced,
    Terminated(Result<(), Error>),
}

#[allow(clippy::too_many_arguments)]
async fn clone_mirror(
    db: &Database,
    bus: &Bus,
    emit: &impl Fn(Stage, Option<f32>, Option<String>),
    repo_id: i32,
    repo_url: &str,
    mirror_path: &Path,
    depth: Option<u32>,
    auth_token: Option<&str>,
    flag: &git_mirror::Cancellation,
) -> ClonedOrSkipped {
    emit(Stage::Cloning, None, None);

    let url = match url::Url::parse(repo_url) {
        Ok(url) => url,
        Err(err) => return ClonedOrSkipped::Terminated(Err(Error::InvalidUrl(err.to_string()))),
    };

    let progress_bus = bus.clone();
    let progress_repo_url = repo_url.to_owned();
    let mirror_path = mirror_path.to_path_buf();
    let auth_token = auth_token.map(str::to_owned);
    let flag = flag.clone();

    let result = runtime::unblock(move || {
        git_mirror::clone(
            &url,
            &mirror_path,
            depth,
            auth_token.as_deref(),
            |progress| {
                progress_bus.publish(Event::TaskProgress {
                    repo_id,
                    repo_url: progress_repo_url.clone(),
                    stage: Stage::Cloning,
                    fraction: progress.fraction,
                    message: Some(progress.message),
                });
            },
            &flag,
        )
        .map(|()| mirror_path)
    })
    .await;

    match result {
        Ok(mirror_path) => {
            let now = Utc::now();
            let outcome = (|| -> Result<(), crate::db::Error> {
                db.repositories().set_mirror_path(repo_id, &mirror_path.to_string_lossy())?;
                db.repositories().update_timestamps(repo_id, Some(now), None, None)?;
                db.repositories().update_status(repo_id, Status::Active, None)?;
                Ok(())
            })();
            match outcome {
                Ok(()) => ClonedOrSkipped::Advanced,
                Err(err) => ClonedOrSkipped::Terminated(Err(err.into())),
            }
        }
        Err(git_mirror::Error::Cancelled) => {
            emit(Stage::Cancelled, None, None);
            ClonedOrSkipped::Terminated(Ok(()))
        }
        Err(git_mirror::Error::NotFound) => {
            let result = db.repositories().update_status(repo_id, Status::Deleted, None).map_err(Error::from);
            emit(Stage::Done, None, Some("upstream repository no longer exists".to_owned()));
            ClonedOrSkipped::Terminated(result)
        }
        Err(err @ git_mirror::Error::Unauthorized) => {
            let message = "authentication failed while cloning".to_owned();
            let record = db.repositories().update_status(repo_id, Status::Error, Some(&message));
            bus.publish(Event::TaskError {
                repo_id: Some(repo_id),
                kind: "git",
                message: message.clone(),
            });
            let result = record.map_err(Error::from).and_then(|()| Err(err.into()));
            ClonedOrSkipped::Terminated(result)
        }
        Err(err) => {
            let message = err.to_string();
            let record = db.repositories().update_status(repo_id, Status::Error, Some(&message));
            bus.publish(Event::TaskError {
                repo_id: Some(repo_id),
                kind: "git",
                message: message.clone(),
            });
            let result = record.map_err(Error::from).and_then(|()| Err(err.into()));
            ClonedOrSkipped::Terminated(result)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn update_mirror(
    db: &Database,
    bus: &Bus,
    emit: &impl Fn(Stage, Option<f32>, Option<String>),
    repo_id: i32,
    repo_url: &str,
    mirror_path: &Path,
    auth_token: Option<&str>,
    flag: &git_mirror::Cancellation,
) -> ClonedOrSkipped {
    emit(Stage::Fetching, None, None);

    let probe_path = mirror_path.to_path_buf();
    let probe_token = auth_token.map(str::to_owned);
    let has_updates = runtime::unblock(move || git_mirror::fetch_has_updates(&probe_path, probe_token.as_deref())).await;

    let has_updates = match has_updates {
        Ok(has_updates) => has_updates,
        Err(git_mirror::Error::Cancelled) => {
            emit(Stage::Cancelled, None, None);
            return ClonedOrSkipped::Terminated(Ok(()));
        }
        Err(git_mirror::Error::NotFound) => {
            let result = db.repositories().update_status(repo_id, Status::Deleted, None).map_err(Error::from);
            emit(Stage::Done, None, Some("upstream repository no longer exists".to_owned()));
            return ClonedOrSkipped::Terminated(result);
        }
        Err(err) => return ClonedOrSkipped::Terminated(record_git_failure(db, bus, repo_id, err)),
    };

    if !has_updates {
        emit(Stage::Done, None, None);
        return ClonedOrSkipped::Terminated(Ok(()));
    }

    let progress_bus = bus.clone();
    let progress_repo_url = repo_url.to_owned();
    let pull_path = mirror_path.to_path_buf();
    let pull_token = auth_token.map(str::to_owned);
    let pull_flag = flag.clone();

    let advanced = runtime::unblock(move || {
        git_mirror::pull_fast_forward(
            &pull_path,
            pull_token.as_deref(),
            |progress| {
                progress_bus.publish(Event::TaskProgress {
                    repo_id,
                    repo_url: progress_repo_url.clone(),
                    stage: Stage::Fetching,
                    fraction: progress.fraction,
                    message: Some(progress.message),
                });
            },
            &pull_flag,
        )
    })
    .await;

    match advanced {
        Ok(true) => ClonedOrSkipped::Advanced,
        Ok(false) => {
            emit(Stage::Done, None, None);
            ClonedOrSkipped::Terminated(Ok(()))
        }
        Err(git_mirror::Error::Cancelled) => {
            emit(Stage::Cancelled, None, None);
            ClonedOrSkipped::Terminated(Ok(()))
        }
        Err(err) => ClonedOrSkipped::Terminated(record_git_failure(db, bus, repo_id, err)),
    }
}

fn record_git_failure(db: &Database, bus: &Bus, repo_id: i32, err: git_mirror::Error) -> Result<(), Error> {
    let message = err.to_string();
    let record = db.repositories().update_status(repo_id, Status::Error, Some(&message));
    bus.publish(Event::TaskError {
        repo_id: Some(repo_id),
        kind: "git",
        message: message.clone(),
    });
    record.map_err(Error::from).and_then(|()| Err(err.into()))
}

enum SnapshotFailure {
    Cancelled,
    Error(Error),
}

impl From<Error> for SnapshotFailure {
    fn from(err: Error) -> Self {
        SnapshotFailure::Error(err)
    }
}

/// Hashes the mirror's current working content, diffs it against the
/// previously recorded set, and packs either a full or incremental
/// snapshot, committing the result atomically. Returns `Ok(false)` when an
/// advancing fetch nonetheless produced no content diff (tolerated, not
/// expected in practice).
async fn snapshot(
    db: &Database,
    mirror_path: &Path,
    repo_id: i32,
    owner: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<bool, SnapshotFailure> {
    let exclusions = hash_index::ExclusionSet::with_defaults();

    let hash_path = mirror_path.to_path_buf();
    let hash_exclusions = exclusions.clone();
    let curr = runtime::unblock(move || hash_index::hash_tree(&hash_path, &hash_exclusions))
        .await
        .map_err(|e| Error::ArchiveFailure(e.to_string()))?;

    if cancel.is_cancelled() {
        return Err(SnapshotFailure::Cancelled);
    }

    let prev = db.file_hashes().get_map(repo_id).map_err(|e| SnapshotFailure::Error(Error::from(e)))?;

    let (file_list, incremental) = if prev.is_empty() {
        (None, false)
    } else {
        let diff = hash_index::diff(&prev, &curr);
        if diff.is_empty() {
            return Ok(false);
        }
        (Some(diff), true)
    };

    let versions = versions_dir(mirror_path);
    let now = Utc::now();
    let filename = archive_filename(owner, name, now);
    let output_path = versions.join(&filename);

    let pack_root = mirror_path.to_path_buf();
    let pack_exclusions = exclusions.clone();
    let pack_output = output_path.clone();
    let pack_file_list = file_list.clone();

    let stats = runtime::unblock(move || snapshot_pack::pack(&pack_root, &pack_output, pack_file_list.as_deref(), &pack_exclusions)).await;

    if cancel.is_cancelled() {
        snapshot_pack::delete(&output_path);
        return Err(SnapshotFailure::Cancelled);
    }

    let stats = stats.map_err(|e| Error::ArchiveFailure(e.to_string()))?;

    let archive = db.commit_snapshot(
        NewArchive {
            repository_id: repo_id,
            filename: &filename,
            file_path: &output_path.to_string_lossy(),
            size_bytes: stats.size_bytes as i64,
            file_count: stats.file_count as i64,
            incremental,
        },
        &curr,
        now,
    );

    match archive {
        Ok(_) => Ok(true),
        Err(err) => {
            snapshot_pack::delete(&output_path);
            Err(SnapshotFailure::Error(Error::from(err)))
        }
    }
}

/// Consults the forge's batched metadata lookup for every tracked
/// repository, in chunks of at most `RECONCILE_CHUNK_SIZE`, and writes
/// lifecycle fields back in one transaction per chunk. A failure against
/// one chunk degrades to leaving those repositories' status unchanged and
/// publishing a warning event; it never aborts the rest of the run.
pub(crate) async fn reconcile_status(db: &Database, bus: &Bus, forge: &forge_client::Client) -> Result<(), Error> {
    let subjects = db.repositories().list(crate::db::repository::StatusFilter::Any)?;

    for chunk in subjects.chunks(RECONCILE_CHUNK_SIZE) {
        let pairs: Vec<(String, String)> = chunk.iter().map(|r| (r.owner.clone(), r.name.clone())).collect();

        let results = match forge.batch_get_repos(&pairs).await {
            Ok(results) => results,
            Err(err) => {
                bus.publish(Event::TaskError {
                    repo_id: None,
                    kind: "reconcile",
                    message: format!("reconcile chunk failed, leaving status unchanged: {err}"),
                });
                continue;
            }
        };

        let updates: Vec<ReconcileUpdate<'_>> = chunk
            .iter()
            .zip(results.iter())
            .map(|(repo, info)| ReconcileUpdate {
                id: repo.id,
                status: if info.not_found {
                    Status::Deleted
                } else if info.archived {
                    Status::Archived
                } else {
                    Status::Active
                },
                metadata: if info.not_found {
                    None
                } else {
                    Some(ReconcileMetadata {
                        description: info.description.as_deref(),
                        private: info.private,
                    })
                },
            })
            .collect();

        db.repositories().batch_reconcile(&updates)?;

        for repo in chunk {
            if let Some(updated) = db.repositories().get_by_id(repo.id)? {
                bus.publish(Event::RepoUpdated { repository: updated });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::db::Database;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("db.sqlite3").to_string_lossy()).unwrap();
        (dir, db)
    }

    /// Unauthenticated client pointed at a loopback mock server, exercising
    /// the REST fallback path (`batch_chunk` only tries GraphQL when a
    /// token is configured).
    async fn unauthenticated_client(server: &MockServer) -> forge_client::Client {
        let base = url::Url::parse(&format!("{}/", server.uri())).unwrap();
        forge_client::Client::with_options(base, None, None, true).unwrap()
    }

    #[tokio::test]
    async fn reconcile_marks_repository_deleted_when_upstream_is_gone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (_dir, db) = open_db();
        let repo = db.repositories().insert_new("acme", "widgets", "https://github.com/acme/widgets").unwrap();
        db.repositories().update_status(repo.id, Status::Active, None).unwrap();

        let bus = Bus::default();
        let forge = unauthenticated_client(&server).await;

        reconcile_status(&db, &bus, &forge).await.unwrap();

        assert_eq!(db.repositories().get_by_id(repo.id).unwrap().unwrap().status(), Status::Deleted);
    }

    #[tokio::test]
    async fn reconcile_reinstates_a_previously_deleted_repository_that_reappears() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "description": "back from the dead",
                "private": false,
                "archived": false,
            })))
            .mount(&server)
            .await;

        let (_dir, db) = open_db();
        let repo = db.repositories().insert_new("acme", "widgets", "https://github.com/acme/widgets").unwrap();
        db.repositories().update_status(repo.id, Status::Deleted, None).unwrap();

        let bus = Bus::default();
        let forge = unauthenticated_client(&server).await;

        reconcile_status(&db, &bus, &forge).await.unwrap();

        let updated = db.repositories().get_by_id(repo.id).unwrap().unwrap();
        assert_eq!(updated.status(), Status::Active);
        assert_eq!(updated.description.as_deref(), Some("back from the dead"));
    }

    #[tokio::test]
    async fn a_failed_chunk_leaves_status_unchanged_and_does_not_abort_the_run() {
        // The server is stopped before the client is built against its
        // address, so every request in the chunk fails at the transport
        // level (connection refused) rather than returning a 404.
        let server = MockServer::start().await;
        let forge = unauthenticated_client(&server).await;
        drop(server);

        let (_dir, db) = open_db();
        let repo = db.repositories().insert_new("acme", "widgets", "https://github.com/acme/widgets").unwrap();
        db.repositories().update_status(repo.id, Status::Active, None).unwrap();

        let bus = Bus::default();

        reconcile_status(&db, &bus, &forge).await.unwrap();

        assert_eq!(db.repositories().get_by_id(repo.id).unwrap().unwrap().status(), Status::Active);
    }
}
