// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Wraps `git2` (libgit2 bindings, not the `git` CLI) to maintain bare
//! mirrors of upstream repositories.
//!
//! A mirror clone maps every upstream ref 1:1 (`refs/*:refs/*`); updates
//! after the initial clone use a non-force refspec so a ref only ever
//! advances when the new tip is a fast-forward of the old one. A upstream
//! history rewrite is surfaced as [`Error::NonFastForward`] rather than
//! silently applied, per the "mirrors are never force-updated" rule.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use git2::{Cred, Direction, FetchOptions, Oid, RemoteCallbacks, Repository};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// A cooperative cancellation flag, checked inside git2's progress
/// callbacks (the only points where an in-flight clone/fetch can be
/// interrupted promptly).
#[derive(Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct Progress {
    /// `received_objects / total_objects`, when the transfer has begun
    /// negotiating a pack; `None` during the initial handshake.
    pub fraction: Option<f32>,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cancelled")]
    Cancelled,
    #[error("repository not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("ref {0} could not be fast-forwarded; upstream history was rewritten")]
    NonFastForward(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git error: {0}")]
    Other(String),
}

/// Bare-clones `url` into `destination` as a full mirror. When `depth` is
/// `Some`, only that many most-recent commits per ref are fetched;
/// otherwise full history is cloned. `progress` is invoked throughout the
/// transfer; `cancel` is polled on every callback invocation, and a
/// cancellation mid-clone aborts the transfer and removes the partial
/// destination.
pub fn clone(
    url: &Url,
    destination: &Path,
    depth: Option<u32>,
    auth_token: Option<&str>,
    mut progress: impl FnMut(Progress),
    cancel: &Cancellation,
) -> Result<(), Error> {
    let mut callbacks = RemoteCallbacks::new();
    install_credentials(&mut callbacks, auth_token);

    let cancel_for_transfer = cancel.clone();
    callbacks.transfer_progress(move |stats| {
        let fraction = if stats.total_objects() > 0 {
            Some(stats.received_objects() as f32 / stats.total_objects() as f32)
        } else {
            None
        };
        progress(Progress {
            fraction,
            message: format!(
                "received {}/{} objects ({} bytes)",
                stats.received_objects(),
                stats.total_objects(),
                stats.received_bytes()
            ),
        });
        !cancel_for_transfer.is_cancelled()
    });

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks);
    if let Some(depth) = depth {
        fetch_options.depth(depth as i32);
    }

    let mut builder = git2::build::RepoBuilder::new();
    builder.bare(true);
    builder.fetch_options(fetch_options);
    builder.remote_create(|repo, name, url| repo.remote_with_fetch(name, url, "+refs/*:refs/*"));

    debug!(url = url.as_str(), destination = %destination.display(), "cloning mirror");
    match builder.clone(url.as_str(), destination) {
        Ok(_) => Ok(()),
        Err(err) => {
            if let Err(cleanup_err) = fs_err::remove_dir_all(destination) {
                if cleanup_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %cleanup_err, "failed to remove partial mirror destination");
                }
            }
            if cancel.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                Err(classify(&err))
            }
        }
    }
}

/// Connects to the default remote and compares its advertised refs against
/// the mirror's current refs, without downloading any objects or writing
/// any local state.
pub fn fetch_has_updates(mirror_path: &Path, auth_token: Option<&str>) -> Result<bool, Error> {
    let repo = Repository::open_bare(mirror_path).map_err(|e| classify(&e))?;
    let mut remote = repo.find_remote("origin").map_err(|e| classify(&e))?;

    let mut callbacks = RemoteCallbacks::new();
    install_credentials(&mut callbacks, auth_token);

    remote
        .connect_auth(Direction::Fetch, Some(callbacks), None)
        .map_err(|e| classify(&e))?;
    let server_refs = collect_remote_heads(&remote).map_err(|e| classify(&e))?;
    let _ = remote.disconnect();

    let local_refs = snapshot_refs(&repo)?;

    let advances = server_refs.iter().any(|(name, oid)| local_refs.get(name) != Some(oid));
    debug!(mirror = %mirror_path.display(), advances, "checked remote for updates");
    Ok(advances)
}

/// Fetches and fast-forwards every ref the mirror tracks. Returns `true`
/// iff at least one ref advanced. A ref whose upstream tip is not a
/// descendant of the mirror's current tip is left untouched and reported
/// as [`Error::NonFastForward`].
pub fn pull_fast_forward(
    mirror_path: &Path,
    auth_token: Option<&str>,
    mut progress: impl FnMut(Progress),
    cancel: &Cancellation,
) -> Result<bool, Error> {
    let repo = Repository::open_bare(mirror_path).map_err(|e| classify(&e))?;
    let mut remote = repo.find_remote("origin").map_err(|e| classify(&e))?;

    let before = snapshot_refs(&repo)?;

    let mut probe_callbacks = RemoteCallbacks::new();
    install_credentials(&mut probe_callbacks, auth_token);
    remote
        .connect_auth(Direction::Fetch, Some(probe_callbacks), None)
        .map_err(|e| classify(&e))?;
    let server_refs = collect_remote_heads(&remote).map_err(|e| classify(&e))?;
    let _ = remote.disconnect();

    let updated = RefCell::new(HashMap::<String, (Oid, Oid)>::new());
    let mut callbacks = RemoteCallbacks::new();
    install_credentials(&mut callbacks, auth_token);

    let cancel_for_transfer = cancel.clone();
    callbacks.transfer_progress(move |stats| {
        progress(Progress {
            fraction: if stats.total_objects() > 0 {
                Some(stats.received_objects() as f32 / stats.total_objects() as f32)
            } else {
                None
            },
            message: format!("received {}/{} objects", stats.received_objects(), stats.total_objects()),
        });
        !cancel_for_transfer.is_cancelled()
    });
    callbacks.update_tips(|name, old, new| {
        updated.borrow_mut().insert(name.to_owned(), (old, new));
        true
    });

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks);

    let result = remote.fetch(&["refs/*:refs/*"], Some(&mut fetch_options), None);

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    result.map_err(|e| classify(&e))?;

    let updated = updated.into_inner();

    for (name, server_oid) in &server_refs {
        if let Some(local_oid) = before.get(name) {
            if server_oid != local_oid && !updated.contains_key(name) {
                warn!(mirror = %mirror_path.display(), reference = name, "non-fast-forward update rejected");
                return Err(Error::NonFastForward(name.clone()));
            }
        }
    }

    debug!(mirror = %mirror_path.display(), advanced = updated.len(), "pulled fast-forward updates");
    Ok(!updated.is_empty())
}

fn snapshot_refs(repo: &Repository) -> Result<HashMap<String, Oid>, Error> {
    let mut out = HashMap::new();
    let refs = repo.references().map_err(|e| classify(&e))?;
    for reference in refs {
        let reference = reference.map_err(|e| classify(&e))?;
        if let (Some(name), Some(oid)) = (reference.name(), reference.target()) {
            out.insert(name.to_owned(), oid);
        }
    }
    Ok(out)
}

fn collect_remote_heads(remote: &git2::Remote<'_>) -> Result<HashMap<String, Oid>, git2::Error> {
    Ok(remote.list()?.iter().map(|head| (head.name().to_owned(), head.oid())).collect())
}

fn install_credentials(callbacks: &mut RemoteCallbacks<'_>, auth_token: Option<&str>) {
    let token = auth_token.map(str::to_owned);
    callbacks.credentials(move |_url, username_from_url, allowed_types| {
        if let Some(token) = &token {
            if allowed_types.contains(git2::CredentialType::USER_PASS_PLAINTEXT) {
                return Cred::userpass_plaintext("x-access-token", token);
            }
        }
        if allowed_types.contains(git2::CredentialType::SSH_KEY) {
            if let Some(username) = username_from_url {
                return Cred::ssh_key_from_agent(username);
            }
        }
        Cred::default()
    });
}

fn classify(err: &git2::Error) -> Error {
    let message = err.message().to_ascii_lowercase();

    if message.contains("not found") || message.contains("404") {
        Error::NotFound
    } else if message.contains("authentication")
        || message.contains("unauthorized")
        || message.contains("401")
        || message.contains("403")
        || message.contains("permission denied")
    {
        Error::Unauthorized
    } else if matches!(err.class(), git2::ErrorClass::Net | git2::ErrorClass::Http | git2::ErrorClass::Ssh) {
        Error::Network(err.message().to_owned())
    } else {
        Error::Other(err.message().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;
    use tempfile::tempdir;

    fn make_upstream(dir: &Path) {
        Command::new("git").args(["init", "--quiet"]).current_dir(dir).status().unwrap();
        fs::write(dir.join("a.txt"), b"one").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir).status().unwrap();
        Command::new("git")
            .args(["-c", "user.email=t@t.com", "-c", "user.name=t", "commit", "-q", "-m", "c1"])
            .current_dir(dir)
            .status()
            .unwrap();
    }

    fn git_available() -> bool {
        Command::new("git").arg("--version").status().map(|s| s.success()).unwrap_or(false)
    }

    #[test]
    fn clone_then_no_updates_then_fast_forward() {
        if !git_available() {
            eprintln!("skipping: git not available");
            return;
        }

        let upstream = tempdir().unwrap();
        make_upstream(upstream.path());

        let mirror_parent = tempdir().unwrap();
        let mirror_path = mirror_parent.path().join("mirror.git");
        let url = Url::parse(&format!("file://{}", upstream.path().display())).unwrap();

        clone(&url, &mirror_path, None, None, |_| {}, &Cancellation::new()).unwrap();
        assert!(mirror_path.join("HEAD").exists());

        assert!(!fetch_has_updates(&mirror_path, None).unwrap());

        fs::write(upstream.path().join("b.txt"), b"two").unwrap();
        Command::new("git").args(["add", "."]).current_dir(upstream.path()).status().unwrap();
        Command::new("git")
            .args(["-c", "user.email=t@t.com", "-c", "user.name=t", "commit", "-q", "-m", "c2"])
            .current_dir(upstream.path())
            .status()
            .unwrap();

        assert!(fetch_has_updates(&mirror_path, None).unwrap());
        assert!(pull_fast_forward(&mirror_path, None, |_| {}, &Cancellation::new()).unwrap());
        assert!(!fetch_has_updates(&mirror_path, None).unwrap());
    }

    #[test]
    fn cancellation_during_clone_leaves_no_partial_mirror() {
        if !git_available() {
            eprintln!("skipping: git not available");
            return;
        }

        let upstream = tempdir().unwrap();
        make_upstream(upstream.path());

        let mirror_parent = tempdir().unwrap();
        let mirror_path = mirror_parent.path().join("mirror.git");
        let url = Url::parse(&format!("file://{}", upstream.path().display())).unwrap();

        let cancel = Cancellation::new();
        cancel.cancel();

        let result = clone(&url, &mirror_path, None, None, |_| {}, &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!mirror_path.exists());
    }
}
