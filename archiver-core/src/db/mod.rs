// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Embedded, single-process relational store (C1). ACID transactions,
//! foreign keys, WAL journaling — no external migration step, no network.

use std::sync::Mutex;

use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{Connection as _, SqliteConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use thiserror::Error;

pub mod archive;
pub mod file_hash;
pub mod repository;
pub mod schema;
pub mod setting;

pub use archive::Archive;
pub use repository::{Repository, Status};
pub use setting::SettingKey;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("src/db/migrations");

/// SQLite's default compiled-in limit on bound parameters per statement;
/// batch operations chunk against it.
const MAX_VARIABLE_NUMBER: usize = 999;

#[derive(Debug, Error)]
pub enum Error {
    #[error("a repository with this (owner, name) or canonical url already exists")]
    DuplicateRepo,
    #[error("setting key {0:?} is not in the allowlist")]
    UnknownSetting(String),
    #[error("storage error: {0}")]
    Other(#[from] DieselError),
    #[error("migration error: {0}")]
    Migration(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("could not open database: {0}")]
    Connection(#[from] diesel::ConnectionError),
}

fn classify(err: DieselError) -> Error {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => Error::DuplicateRepo,
        other => Error::Other(other),
    }
}

/// A connection to the metadata store. One writer at a time; readers are
/// not blocked by an in-flight writer because of WAL journaling.
#[derive(Clone)]
pub struct Database {
    conn: Connection,
}

#[derive(Clone)]
struct Connection(std::sync::Arc<Mutex<SqliteConnection>>);

impl Connection {
    fn new(conn: SqliteConnection) -> Self {
        Self(std::sync::Arc::new(Mutex::new(conn)))
    }

    fn exec<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> Result<T, DieselError>) -> Result<T, Error> {
        let mut conn = self.0.lock().expect("db mutex poisoned");
        f(&mut conn).map_err(classify)
    }

    fn exclusive_tx<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> Result<T, DieselError>) -> Result<T, Error> {
        let mut conn = self.0.lock().expect("db mutex poisoned");
        conn.transaction(f).map_err(classify)
    }
}

impl Database {
    /// Opens (creating if absent) the database at `url`, applies any
    /// pending migrations, and enables WAL journaling plus foreign-key
    /// enforcement on the connection.
    pub fn new(url: &str) -> Result<Self, Error> {
        let mut conn = SqliteConnection::establish(url)?;

        diesel::sql_query("PRAGMA journal_mode = WAL")
            .execute(&mut conn)
            .map_err(classify)?;
        diesel::sql_query("PRAGMA foreign_keys = ON")
            .execute(&mut conn)
            .map_err(classify)?;

        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| Error::Migration(e.into()))?;

        Ok(Database {
            conn: Connection::new(conn),
        })
    }

    pub fn repositories(&self) -> repository::Store<'_> {
        repository::Store { conn: &self.conn }
    }

    pub fn archives(&self) -> archive::Store<'_> {
        archive::Store { conn: &self.conn }
    }

    pub fn file_hashes(&self) -> file_hash::Store<'_> {
        file_hash::Store { conn: &self.conn }
    }

    pub fn settings(&self) -> setting::Store<'_> {
        setting::Store { conn: &self.conn }
    }

    /// Atomically commits a snapshot: inserts the Archive row, replaces the
    /// FileHash set for its repository, and records `last_updated_at`. All
    /// three become visible together or not at all, because they run
    /// inside one transaction rather than through the three stores' own
    /// independent transactions.
    pub fn commit_snapshot(
        &self,
        new_archive: archive::NewArchive<'_>,
        file_hashes: &std::collections::BTreeMap<String, String>,
        updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<archive::Archive, Error> {
        self.conn.exclusive_tx(|tx| {
            diesel::insert_into(schema::archive::table)
                .values((
                    schema::archive::repository_id.eq(new_archive.repository_id),
                    schema::archive::filename.eq(new_archive.filename),
                    schema::archive::file_path.eq(new_archive.file_path),
                    schema::archive::size_bytes.eq(new_archive.size_bytes),
                    schema::archive::file_count.eq(new_archive.file_count),
                    schema::archive::incremental.eq(new_archive.incremental),
                    schema::archive::created_at.eq(chrono::Utc::now().to_rfc3339()),
                ))
                .execute(tx)?;

            let inserted: archive::Archive = schema::archive::table
                .order(schema::archive::id.desc())
                .select(archive::Archive::as_select())
                .first(tx)?;

            diesel::delete(
                schema::file_hash::table.filter(schema::file_hash::repository_id.eq(new_archive.repository_id)),
            )
            .execute(tx)?;

            let now = chrono::Utc::now().to_rfc3339();
            let rows: Vec<_> = file_hashes
                .iter()
                .map(|(path, digest)| {
                    (
                        schema::file_hash::repository_id.eq(new_archive.repository_id),
                        schema::file_hash::relative_path.eq(path.as_str()),
                        schema::file_hash::digest.eq(digest.as_str()),
                        schema::file_hash::last_seen.eq(now.clone()),
                    )
                })
                .collect();
            for chunk in rows.chunks(MAX_VARIABLE_NUMBER / 4) {
                diesel::insert_into(schema::file_hash::table).values(chunk).execute(tx)?;
            }

            diesel::update(schema::repository::table.find(new_archive.repository_id))
                .set(schema::repository::last_updated_at.eq(updated_at.to_rfc3339()))
                .execute(tx)?;

            Ok(inserted)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn commit_snapshot_inserts_archive_and_replaces_file_hashes_together() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3").to_str().unwrap()).unwrap();
        let repo = db
            .repositories()
            .insert_new("octocat", "hello-world", "https://github.com/octocat/hello-world")
            .unwrap();

        let hashes = std::collections::BTreeMap::from([("a.txt".to_owned(), "aaa".to_owned())]);
        let archive = db
            .commit_snapshot(
                archive::NewArchive {
                    repository_id: repo.id,
                    filename: "x.tar.xz",
                    file_path: "/data/x.tar.xz",
                    size_bytes: 10,
                    file_count: 1,
                    incremental: false,
                },
                &hashes,
                Utc::now(),
            )
            .unwrap();

        assert_eq!(db.archives().list(repo.id).unwrap().len(), 1);
        assert_eq!(db.file_hashes().get_map(repo.id).unwrap(), hashes);
        assert!(db.repositories().get_by_id(repo.id).unwrap().unwrap().last_updated_at().is_some());
        assert_eq!(archive.repository_id, repo.id);
    }

    #[test]
    fn opens_memory_backed_file_and_runs_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archiver.sqlite3");
        let db = Database::new(path.to_str().unwrap()).unwrap();
        assert!(db.settings().load_all().unwrap().is_empty());
    }
}
