// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

// Hand-written to mirror `migrations/2026-01-01-000000_init`; kept in sync
// manually since this workspace has no `diesel print-schema` step.

diesel::table! {
    repository (id) {
        id -> Integer,
        owner -> Text,
        name -> Text,
        canonical_url -> Text,
        description -> Nullable<Text>,
        status -> Text,
        private -> Bool,
        mirror_path -> Nullable<Text>,
        last_cloned_at -> Nullable<Text>,
        last_updated_at -> Nullable<Text>,
        last_checked_at -> Nullable<Text>,
        error_message -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    archive (id) {
        id -> Integer,
        repository_id -> Integer,
        filename -> Text,
        file_path -> Text,
        size_bytes -> BigInt,
        file_count -> BigInt,
        incremental -> Bool,
        created_at -> Text,
    }
}

diesel::table! {
    file_hash (repository_id, relative_path) {
        repository_id -> Integer,
        relative_path -> Text,
        digest -> Text,
        last_seen -> Text,
    }
}

diesel::table! {
    setting (key) {
        key -> Text,
        value -> Text,
    }
}

diesel::joinable!(archive -> repository (repository_id));
diesel::joinable!(file_hash -> repository (repository_id));
diesel::allow_tables_to_appear_in_same_query!(repository, archive, file_hash, setting);
