// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;

use diesel::prelude::*;

use super::{Connection, Error, schema::setting};

/// The closed allowlist of setting keys: any non-allowlisted key is
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SettingKey {
    DataDirectory,
    DefaultMirrorDepth,
    MaxConcurrency,
    AutoPollIntervalSeconds,
}

pub struct Store<'a> {
    pub(super) conn: &'a Connection,
}

impl Store<'_> {
    pub fn get(&self, key: SettingKey) -> Result<Option<String>, Error> {
        self.conn.exec(|conn| {
            setting::table
                .find(key.to_string())
                .select(setting::value)
                .first(conn)
                .optional()
        })
    }

    pub fn set(&self, key: SettingKey, value: &str) -> Result<(), Error> {
        self.conn.exec(|conn| {
            diesel::insert_into(setting::table)
                .values((setting::key.eq(key.to_string()), setting::value.eq(value)))
                .on_conflict(setting::key)
                .do_update()
                .set(setting::value.eq(value))
                .execute(conn)?;
            Ok(())
        })
    }

    /// Parses a raw (untrusted) key string against the allowlist before
    /// writing, for callers accepting settings from outside the process.
    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), Error> {
        let key: SettingKey = key.parse().map_err(|_| Error::UnknownSetting(key.to_owned()))?;
        self.set(key, value)
    }

    pub fn load_all(&self) -> Result<BTreeMap<String, String>, Error> {
        self.conn
            .exec(|conn| setting::table.select((setting::key, setting::value)).load(conn).map(|rows| rows.into_iter().collect()))
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
    fn set_then_get_roundtrips() {
        let db = open();
        db.settings().set(SettingKey::MaxConcurrency, "8").unwrap();
        assert_eq!(db.settings().get(SettingKey::MaxConcurrency).unwrap(), Some("8".to_owned()));
    }

    #[test]
    fn set_overwrites_existing_value() {
        let db = open();
        db.settings().set(SettingKey::MaxConcurrency, "8").unwrap();
        db.settings().set(SettingKey::MaxConcurrency, "12").unwrap();
        assert_eq!(db.settings().get(SettingKey::MaxConcurrency).unwrap(), Some("12".to_owned()));
    }

    #[test]
    fn set_raw_rejects_unknown_key() {
        let db = open();
        let err = db.settings().set_raw("not_a_real_setting", "x").unwrap_err();
        assert!(matches!(err, Error::UnknownSetting(_)));
    }

    #[test]
    fn load_all_returns_every_stored_key() {
        let db = open();
        db.settings().set(SettingKey::MaxConcurrency, "4").unwrap();
        db.settings().set(SettingKey::DefaultMirrorDepth, "0").unwrap();

        let all = db.settings().load_all().unwrap();
        assert_eq!(all.get("max_concurrency"), Some(&"4".to_owned()));
        assert_eq!(all.get("default_mirror_depth"), Some(&"0".to_owned()));
    }
}
