// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use super::{Connection, Error, schema::archive};

/// An immutable snapshot record.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = archive)]
pub struct Archive {
    pub id: i32,
    pub repository_id: i32,
    pub filename: String,
    pub file_path: String,
    pub size_bytes: i64,
    pub file_count: i64,
    pub incremental: bool,
    #[diesel(column_name = created_at)]
    created_at_raw: String,
}

impl Archive {
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.created_at_raw)
            .expect("created_at is always a valid rfc3339 timestamp")
            .with_timezone(&Utc)
    }
}

#[derive(Insertable)]
#[diesel(table_name = archive)]
pub struct NewArchive<'a> {
    pub repository_id: i32,
    pub filename: &'a str,
    pub file_path: &'a str,
    pub size_bytes: i64,
    pub file_count: i64,
    pub incremental: bool,
}

pub struct Store<'a> {
    pub(super) conn: &'a Connection,
}

impl Store<'_> {
    pub fn insert(&self, new_archive: NewArchive<'_>) -> Result<Archive, Error> {
        self.conn.exec(|conn| {
            diesel::insert_into(archive::table)
                .values((
                    archive::repository_id.eq(new_archive.repository_id),
                    archive::filename.eq(new_archive.filename),
                    archive::file_path.eq(new_archive.file_path),
                    archive::size_bytes.eq(new_archive.size_bytes),
                    archive::file_count.eq(new_archive.file_count),
                    archive::incremental.eq(new_archive.incremental),
                    archive::created_at.eq(Utc::now().to_rfc3339()),
                ))
                .execute(conn)?;

            archive::table.order(archive::id.desc()).select(Archive::as_select()).first(conn)
        })
    }

    pub fn list(&self, repository_id: i32) -> Result<Vec<Archive>, Error> {
        self.conn.exec(|conn| {
            archive::table
                .filter(archive::repository_id.eq(repository_id))
                .order(archive::created_at.asc())
                .select(Archive::as_select())
                .load(conn)
        })
    }

    pub fn get(&self, id: i32) -> Result<Option<Archive>, Error> {
        self.conn
            .exec(|conn| archive::table.find(id).select(Archive::as_select()).first(conn).optional())
    }

    pub fn delete(&self, id: i32) -> Result<(), Error> {
        self.conn.exec(|conn| {
            diesel::delete(archive::table.find(id)).execute(conn)?;
            Ok(())
        })
    }
}
