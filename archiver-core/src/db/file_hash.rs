// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;

use chrono::Utc;
use diesel::prelude::*;

use super::{Connection, Error, MAX_VARIABLE_NUMBER, schema::file_hash};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = file_hash)]
struct Row {
    relative_path: String,
    digest: String,
}

#[derive(Insertable)]
#[diesel(table_name = file_hash)]
struct NewRow<'a> {
    repository_id: i32,
    relative_path: &'a str,
    digest: &'a str,
    last_seen: String,
}

pub struct Store<'a> {
    pub(super) conn: &'a Connection,
}

impl Store<'_> {
    pub fn get_map(&self, repository_id: i32) -> Result<BTreeMap<String, String>, Error> {
        self.conn.exec(|conn| {
            file_hash::table
                .filter(file_hash::repository_id.eq(repository_id))
                .select(Row::as_select())
                .load(conn)
                .map(|rows| rows.into_iter().map(|row| (row.relative_path, row.digest)).collect())
        })
    }

    /// Atomically replaces the stored digest set for `repository_id` with
    /// `new_map`: existing rows are cleared and the new set inserted in the
    /// same transaction.
    pub fn replace_set(&self, repository_id: i32, new_map: &BTreeMap<String, String>) -> Result<(), Error> {
        self.conn.exclusive_tx(|tx| {
            diesel::delete(file_hash::table.filter(file_hash::repository_id.eq(repository_id))).execute(tx)?;

            let now = Utc::now().to_rfc3339();
            let rows: Vec<_> = new_map
                .iter()
                .map(|(path, digest)| NewRow {
                    repository_id,
                    relative_path: path,
                    digest,
                    last_seen: now.clone(),
                })
                .collect();

            for chunk in rows.chunks(MAX_VARIABLE_NUMBER / 4) {
                diesel::insert_into(file_hash::table).values(chunk).execute(tx)?;
            }

            Ok(())
        })
    }

    pub fn clear(&self, repository_id: i32) -> Result<(), Error> {
        self.conn.exec(|conn| {
            diesel::delete(file_hash::table.filter(file_hash::repository_id.eq(repository_id))).execute(conn)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn open_with_repo() -> (Database, i32) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3").to_str().unwrap()).unwrap();
        let repo = db
            .repositories()
            .insert_new("octocat", "hello-world", "https://github.com/octocat/hello-world")
            .unwrap();
        (db, repo.id)
    }

    #[test]
    fn replace_set_then_get_map_roundtrips() {
        let (db, repo_id) = open_with_repo();
        let map = BTreeMap::from([("a.txt".to_owned(), "aaa".to_owned()), ("b.txt".to_owned(), "bbb".to_owned())]);

        db.file_hashes().replace_set(repo_id, &map).unwrap();
        assert_eq!(db.file_hashes().get_map(repo_id).unwrap(), map);
    }

    #[test]
    fn replace_set_drops_paths_no_longer_present() {
        let (db, repo_id) = open_with_repo();
        let first = BTreeMap::from([("a.txt".to_owned(), "aaa".to_owned()), ("b.txt".to_owned(), "bbb".to_owned())]);
        db.file_hashes().replace_set(repo_id, &first).unwrap();

        let second = BTreeMap::from([("b.txt".to_owned(), "bbb".to_owned())]);
        db.file_hashes().replace_set(repo_id, &second).unwrap();

        assert_eq!(db.file_hashes().get_map(repo_id).unwrap(), second);
    }

    #[test]
    fn empty_map_clears_all_rows() {
        let (db, repo_id) = open_with_repo();
        let map = BTreeMap::from([("a.txt".to_owned(), "aaa".to_owned())]);
        db.file_hashes().replace_set(repo_id, &map).unwrap();

        db.file_hashes().replace_set(repo_id, &BTreeMap::new()).unwrap();
        assert!(db.file_hashes().get_map(repo_id).unwrap().is_empty());
    }
}
