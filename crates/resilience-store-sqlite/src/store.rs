//! [`SqliteProfileStore`], the SQLite implementation of [`ProfileStore`].

use std::path::Path;

use rusqlite::OptionalExtension as _;
use tracing::{debug, info};

use resilience_core::{
  identity::SubjectId,
  profile::{NewProfile, Profile, ProfilePatch},
  store::ProfileStore,
};

use crate::{
  Error, Result,
  encode::{RawProfile, encode_dt, encode_set},
  schema::{COLLAPSE_DUPLICATES, PROFILE_COLUMNS, SCHEMA, SCHEMA_VERSION, UNIQUE_SUBJECT},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A profile store backed by a single SQLite file.
///
/// Cloning is cheap: the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteProfileStore {
  conn: tokio_rusqlite::Connection,
}

/// Column values for an insert, already encoded.
struct EncodedProfile {
  subject_id:            String,
  email:                 String,
  display_name:          Option<String>,
  avatar_url:            Option<String>,
  roles:                 String,
  providers:             String,
  created_at:            Option<String>,
  last_authenticated_at: String,
}

impl EncodedProfile {
  fn new(input: NewProfile) -> Result<Self> {
    Ok(Self {
      roles:                 encode_set(&input.roles)?,
      providers:             encode_set(&input.providers)?,
      created_at:            input.created_at.map(encode_dt),
      last_authenticated_at: encode_dt(input.last_authenticated_at),
      subject_id:            input.subject_id.as_str().to_owned(),
      email:                 input.email,
      display_name:          input.display_name,
      avatar_url:            input.avatar_url,
    })
  }
}

impl SqliteProfileStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::from_connection(conn).await
  }

  /// Open an in-memory store, mainly for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::from_connection(conn).await
  }

  /// Wrap an already-open connection and run schema initialisation.
  pub(crate) async fn from_connection(conn: tokio_rusqlite::Connection) -> Result<Self> {
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  pub(crate) async fn init_schema(&self) -> Result<()> {
    let collapsed = self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version >= SCHEMA_VERSION {
          return Ok(0);
        }

        let tx = conn.transaction()?;
        let collapsed = tx.execute(COLLAPSE_DUPLICATES, [])?;
        tx.execute_batch(UNIQUE_SUBJECT)?;
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tx.commit()?;
        Ok(collapsed)
      })
      .await?;

    if collapsed > 0 {
      info!(collapsed, "removed duplicate profile rows before adding the unique index");
    }
    Ok(())
  }

  /// Run an `INSERT` built from `sql` (which must end in a `RETURNING`
  /// clause) and decode the returned row.
  async fn insert_returning(&self, sql: String, input: NewProfile) -> Result<Profile> {
    let row = EncodedProfile::new(input)?;

    let raw = self
      .conn
      .call(move |conn| {
        let raw = conn.query_row(
          &sql,
          rusqlite::params![
            row.subject_id,
            row.email,
            row.display_name,
            row.avatar_url,
            row.roles,
            row.providers,
            row.created_at,
            row.last_authenticated_at,
          ],
          RawProfile::from_row,
        )?;
        Ok(raw)
      })
      .await?;

    raw.into_profile()
  }
}

const INSERT_COLUMNS: &str = "subject_id, email, display_name, avatar_url, roles, providers, \
   created_at, last_authenticated_at";

// ─── ProfileStore impl ───────────────────────────────────────────────────────

impl ProfileStore for SqliteProfileStore {
  type Error = Error;

  async fn find_profile(&self, subject_id: SubjectId) -> Result<Option<Profile>> {
    let raw = self
      .conn
      .call(move |conn| {
        let raw = conn
          .query_row(
            &format!(
              "SELECT {PROFILE_COLUMNS} FROM profiles
               WHERE subject_id = ?1
               ORDER BY created_at IS NULL, created_at, row_id
               LIMIT 1"
            ),
            rusqlite::params![subject_id.as_str()],
            RawProfile::from_row,
          )
          .optional()?;
        Ok(raw)
      })
      .await?;

    raw.map(RawProfile::into_profile).transpose()
  }

  async fn list_profiles(&self, subject_id: SubjectId) -> Result<Vec<Profile>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {PROFILE_COLUMNS} FROM profiles WHERE subject_id = ?1 ORDER BY row_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![subject_id.as_str()], RawProfile::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawProfile::into_profile).collect()
  }

  async fn insert_profile(&self, input: NewProfile) -> Result<Profile> {
    let sql = format!(
      "INSERT INTO profiles ({INSERT_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
       RETURNING {PROFILE_COLUMNS}"
    );
    self.insert_returning(sql, input).await
  }

  async fn update_profile(&self, row_id: i64, patch: ProfilePatch) -> Result<Profile> {
    let at           = encode_dt(patch.last_authenticated_at);
    let display_name = patch.display_name;
    let avatar_url   = patch.avatar_url;
    let roles        = patch.roles.as_ref().map(encode_set).transpose()?;
    let providers    = patch.providers.as_ref().map(encode_set).transpose()?;

    let raw = self
      .conn
      .call(move |conn| {
        let raw = conn
          .query_row(
            &format!(
              "UPDATE profiles SET
                 last_authenticated_at = ?2,
                 display_name          = COALESCE(?3, display_name),
                 avatar_url            = COALESCE(?4, avatar_url),
                 roles                 = COALESCE(?5, roles),
                 providers             = COALESCE(?6, providers)
               WHERE row_id = ?1
               RETURNING {PROFILE_COLUMNS}"
            ),
            rusqlite::params![row_id, at, display_name, avatar_url, roles, providers],
            RawProfile::from_row,
          )
          .optional()?;
        Ok(raw)
      })
      .await?;

    raw.ok_or(Error::RowNotFound(row_id))?.into_profile()
  }

  async fn upsert_profile(&self, input: NewProfile) -> Result<Profile> {
    let sql = format!(
      "INSERT INTO profiles ({INSERT_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
       ON CONFLICT(subject_id) DO UPDATE SET
         last_authenticated_at = excluded.last_authenticated_at
       RETURNING {PROFILE_COLUMNS}"
    );
    self.insert_returning(sql, input).await
  }

  async fn delete_profile(&self, row_id: i64) -> Result<()> {
    let deleted = self
      .conn
      .call(move |conn| {
        let n = conn.execute("DELETE FROM profiles WHERE row_id = ?1", rusqlite::params![row_id])?;
        Ok(n)
      })
      .await?;

    if deleted == 0 {
      return Err(Error::RowNotFound(row_id));
    }
    debug!(row_id, "deleted profile row");
    Ok(())
  }
}
