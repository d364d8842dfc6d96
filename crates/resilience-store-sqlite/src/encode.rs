//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 strings. Role and provider sets are
//! stored as compact, sorted JSON arrays.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use resilience_core::{identity::SubjectId, profile::Profile};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Sets ────────────────────────────────────────────────────────────────────

pub fn encode_set(set: &BTreeSet<String>) -> Result<String> { Ok(serde_json::to_string(set)?) }

pub fn decode_set(s: &str) -> Result<BTreeSet<String>> { Ok(serde_json::from_str(s)?) }

// ─── Row type ────────────────────────────────────────────────────────────────

/// Raw values read directly from a `profiles` row, in
/// [`PROFILE_COLUMNS`](crate::schema::PROFILE_COLUMNS) order.
pub struct RawProfile {
  pub row_id:                i64,
  pub subject_id:            String,
  pub email:                 String,
  pub display_name:          Option<String>,
  pub avatar_url:            Option<String>,
  pub roles:                 String,
  pub providers:             String,
  pub created_at:            Option<String>,
  pub last_authenticated_at: String,
}

impl RawProfile {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      row_id:                row.get(0)?,
      subject_id:            row.get(1)?,
      email:                 row.get(2)?,
      display_name:          row.get(3)?,
      avatar_url:            row.get(4)?,
      roles:                 row.get(5)?,
      providers:             row.get(6)?,
      created_at:            row.get(7)?,
      last_authenticated_at: row.get(8)?,
    })
  }

  pub fn into_profile(self) -> Result<Profile> {
    Ok(Profile {
      row_id:                self.row_id,
      subject_id:            SubjectId::new(self.subject_id),
      email:                 self.email,
      display_name:          self.display_name,
      avatar_url:            self.avatar_url,
      roles:                 decode_set(&self.roles)?,
      providers:             decode_set(&self.providers)?,
      created_at:            self.created_at.as_deref().map(decode_dt).transpose()?,
      last_authenticated_at: decode_dt(&self.last_authenticated_at)?,
    })
  }
}
