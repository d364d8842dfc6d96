//! SQL schema for the profile store.
//!
//! [`SCHEMA`] runs on every connection. Steps that may fail on older data are
//! gated on `PRAGMA user_version`.

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Table DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS profiles (
    row_id                INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id            TEXT NOT NULL,
    email                 TEXT NOT NULL,
    display_name          TEXT,
    avatar_url            TEXT,
    roles                 TEXT NOT NULL DEFAULT '[]',   -- JSON array, sorted
    providers             TEXT NOT NULL DEFAULT '[]',   -- JSON array, sorted
    created_at            TEXT,                         -- RFC 3339 UTC; NULL on legacy rows
    last_authenticated_at TEXT NOT NULL
);
";

/// Version 1, step one. Tables from before the unique index may hold several
/// rows per subject; keep the most senior (dated before undated, earliest
/// `created_at`, then lowest `row_id`) and delete the rest.
pub const COLLAPSE_DUPLICATES: &str = "
DELETE FROM profiles
WHERE row_id IN (
    SELECT row_id FROM (
        SELECT row_id,
               ROW_NUMBER() OVER (
                   PARTITION BY subject_id
                   ORDER BY created_at IS NULL, created_at, row_id
               ) AS seniority
        FROM profiles
    )
    WHERE seniority > 1
)
";

/// Version 1, step two. One row per subject; upserts target this index.
pub const UNIQUE_SUBJECT: &str =
  "CREATE UNIQUE INDEX IF NOT EXISTS profiles_subject_uidx ON profiles(subject_id);";

/// Column list shared by every statement that returns a full row.
pub const PROFILE_COLUMNS: &str = "row_id, subject_id, email, display_name, avatar_url, \
   roles, providers, created_at, last_authenticated_at";
