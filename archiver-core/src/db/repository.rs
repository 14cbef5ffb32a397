// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use super::{Connection, Error, schema::repository};

/// Lifecycle state of a tracked [`Repository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    Pending,
    Active,
    Archived,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = repository)]
pub struct Repository {
    pub id: i32,
    pub owner: String,
    pub name: String,
    pub canonical_url: String,
    pub description: Option<String>,
    #[diesel(column_name = status)]
    status_raw: String,
    pub private: bool,
    pub mirror_path: Option<String>,
    #[diesel(column_name = last_cloned_at)]
    last_cloned_at_raw: Option<String>,
    #[diesel(column_name = last_updated_at)]
    last_updated_at_raw: Option<String>,
    #[diesel(column_name = last_checked_at)]
    last_checked_at_raw: Option<String>,
    pub error_message: Option<String>,
    #[diesel(column_name = created_at)]
    created_at_raw: String,
}

impl Repository {
    pub fn status(&self) -> Status {
        self.status_raw.parse().unwrap_or(Status::Error)
    }

    pub fn last_cloned_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.last_cloned_at_raw.as_deref())
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.last_updated_at_raw.as_deref())
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.last_checked_at_raw.as_deref())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        parse_timestamp(Some(&self.created_at_raw)).expect("created_at is always set")
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|dt| dt.with_timezone(&Utc))
}

#[derive(Insertable)]
#[diesel(table_name = repository)]
struct NewRepository<'a> {
    owner: &'a str,
    name: &'a str,
    canonical_url: &'a str,
    status: &'static str,
    created_at: String,
}

pub struct Store<'a> {
    pub(super) conn: &'a Connection,
}

/// Filter passed to [`Store::list`].
#[derive(Debug, Clone, Copy)]
pub enum StatusFilter {
    Any,
    Is(Status),
}

/// One repository's new lifecycle fields, as produced by a batched forge
/// metadata lookup. `metadata` is `None` for a repository the forge no
/// longer reports (status is `Deleted`), so a prior description/private
/// flag is left untouched instead of being overwritten with placeholders.
pub struct ReconcileUpdate<'a> {
    pub id: i32,
    pub status: Status,
    pub metadata: Option<ReconcileMetadata<'a>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileMetadata<'a> {
    pub description: Option<&'a str>,
    pub private: bool,
}

impl Store<'_> {
    pub fn insert_new(&self, owner: &str, name: &str, canonical_url: &str) -> Result<Repository, Error> {
        self.conn.exec(|conn| {
            let new_row = NewRepository {
                owner,
                name,
                canonical_url,
                status: "pending",
                created_at: Utc::now().to_rfc3339(),
            };

            diesel::insert_into(repository::table).values(&new_row).execute(conn)?;

            repository::table
                .order(repository::id.desc())
                .select(Repository::as_select())
                .first(conn)
        })
    }

    pub fn get_by_id(&self, id: i32) -> Result<Option<Repository>, Error> {
        self.conn
            .exec(|conn| repository::table.find(id).select(Repository::as_select()).first(conn).optional())
    }

    pub fn get_by_url(&self, canonical_url: &str) -> Result<Option<Repository>, Error> {
        self.conn.exec(|conn| {
            repository::table
                .filter(repository::canonical_url.eq(canonical_url))
                .select(Repository::as_select())
                .first(conn)
                .optional()
        })
    }

    pub fn list(&self, filter: StatusFilter) -> Result<Vec<Repository>, Error> {
        self.conn.exec(|conn| match filter {
            StatusFilter::Any => repository::table
                .order(repository::id.asc())
                .select(Repository::as_select())
                .load(conn),
            StatusFilter::Is(status) => repository::table
                .filter(repository::status.eq(status.to_string()))
                .order(repository::id.asc())
                .select(Repository::as_select())
                .load(conn),
        })
    }

    pub fn update_status(&self, id: i32, status: Status, error_message: Option<&str>) -> Result<(), Error> {
        self.conn.exec(|conn| {
            diesel::update(repository::table.find(id))
                .set((
                    repository::status.eq(status.to_string()),
                    repository::error_message.eq(error_message),
                ))
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn update_metadata(&self, id: i32, description: Option<&str>, private: bool) -> Result<(), Error> {
        self.conn.exec(|conn| {
            diesel::update(repository::table.find(id))
                .set((repository::description.eq(description), repository::private.eq(private)))
                .execute(conn)?;
            Ok(())
        })
    }

    /// Updates whichever timestamps are `Some`; `None` fields are left
    /// untouched.
    pub fn update_timestamps(
        &self,
        id: i32,
        cloned: Option<DateTime<Utc>>,
        updated: Option<DateTime<Utc>>,
        checked: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        self.conn.exec(|conn| {
            if let Some(cloned) = cloned {
                diesel::update(repository::table.find(id))
                    .set(repository::last_cloned_at.eq(cloned.to_rfc3339()))
                    .execute(conn)?;
            }
            if let Some(updated) = updated {
                diesel::update(repository::table.find(id))
                    .set(repository::last_updated_at.eq(updated.to_rfc3339()))
                    .execute(conn)?;
            }
            if let Some(checked) = checked {
                diesel::update(repository::table.find(id))
                    .set(repository::last_checked_at.eq(checked.to_rfc3339()))
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    pub fn set_mirror_path(&self, id: i32, mirror_path: &str) -> Result<(), Error> {
        self.conn.exec(|conn| {
            diesel::update(repository::table.find(id))
                .set(repository::mirror_path.eq(mirror_path))
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn delete(&self, id: i32) -> Result<(), Error> {
        self.conn.exec(|conn| {
            diesel::delete(repository::table.find(id)).execute(conn)?;
            Ok(())
        })
    }

    /// Updates status for a batch of repositories in a single transaction,
    /// setting `last_checked_at` on all of them. A repository with `metadata
    /// = None` (the forge no longer reports it) only has its status and
    /// `last_checked_at` touched, so a prior description/private flag
    /// survives the disappearance rather than being blanked out.
    pub fn batch_reconcile(&self, updates: &[ReconcileUpdate<'_>]) -> Result<(), Error> {
        self.conn.exclusive_tx(|tx| {
            let now = Utc::now().to_rfc3339();
            for update in updates {
                match &update.metadata {
                    Some(metadata) => {
                        diesel::update(repository::table.find(update.id))
                            .set((
                                repository::status.eq(update.status.to_string()),
                                repository::description.eq(metadata.description),
                                repository::private.eq(metadata.private),
                                repository::last_checked_at.eq(&now),
                            ))
                            .execute(tx)?;
                    }
                    None => {
                        diesel::update(repository::table.find(update.id))
                            .set((
                                repository::status.eq(update.status.to_string()),
                                repository::last_checked_at.eq(&now),
                            ))
                            .execute(tx)?;
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn open() -> Database {
        let dir = tempfile::tempdir().unwrap();
        Database::new(dir.path().join("db.sqlite3").to_str().unwrap()).unwrap()
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let db = open();
        let repo = db
            .repositories()
            .insert_new("octocat", "hello-world", "https://github.com/octocat/hello-world")
            .unwrap();
        assert_eq!(repo.status(), Status::Pending);

        let fetched = db.repositories().get_by_id(repo.id).unwrap().unwrap();
        assert_eq!(fetched.owner, "octocat");
        assert!(fetched.last_cloned_at().is_none());
    }

    #[test]
    fn duplicate_canonical_url_is_rejected() {
        let db = open();
        db.repositories()
            .insert_new("octocat", "hello-world", "https://github.com/octocat/hello-world")
            .unwrap();

        let err = db
            .repositories()
            .insert_new("octocat", "hello-world", "https://github.com/octocat/hello-world")
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRepo));
    }

    #[test]
    fn duplicate_owner_name_with_different_url_is_also_rejected() {
        let db = open();
        db.repositories()
            .insert_new("octocat", "hello-world", "https://github.com/octocat/hello-world")
            .unwrap();

        let err = db
            .repositories()
            .insert_new("octocat", "hello-world", "https://github.com/octocat/hello-world.git")
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRepo));
    }

    #[test]
    fn list_filters_by_status() {
        let db = open();
        let repo = db
            .repositories()
            .insert_new("octocat", "hello-world", "https://github.com/octocat/hello-world")
            .unwrap();
        db.repositories().update_status(repo.id, Status::Active, None).unwrap();

        assert_eq!(db.repositories().list(StatusFilter::Is(Status::Active)).unwrap().len(), 1);
        assert_eq!(db.repositories().list(StatusFilter::Is(Status::Pending)).unwrap().len(), 0);
    }

    #[test]
    fn delete_removes_the_row() {
        let db = open();
        let repo = db
            .repositories()
            .insert_new("octocat", "hello-world", "https://github.com/octocat/hello-world")
            .unwrap();
        db.repositories().delete(repo.id).unwrap();
        assert!(db.repositories().get_by_id(repo.id).unwrap().is_none());
    }
}
