//! Profile: the per-subject bookkeeping row kept in the profile store.
//!
//! Roles and providers only ever grow through this crate, and a display name
//! that is already set is never replaced by a provider-derived guess.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::SubjectId;

/// A persisted profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
  /// Store-assigned row identifier. Distinct even between duplicate rows for
  /// the same subject.
  pub row_id:                i64,
  pub subject_id:            SubjectId,
  pub email:                 String,
  pub display_name:          Option<String>,
  pub avatar_url:            Option<String>,
  pub roles:                 BTreeSet<String>,
  pub providers:             BTreeSet<String>,
  /// Creation marker. Legacy rows may not carry one.
  pub created_at:            Option<DateTime<Utc>>,
  pub last_authenticated_at: DateTime<Utc>,
}

impl Profile {
  /// `true` if a non-blank display name is present.
  pub fn has_display_name(&self) -> bool {
    self
      .display_name
      .as_deref()
      .is_some_and(|name| !name.trim().is_empty())
  }

  /// Sort key used to pick the surviving row among duplicates: rows with a
  /// creation marker come first, oldest first, then lowest row id.
  pub fn seniority(&self) -> (bool, Option<DateTime<Utc>>, i64) {
    (self.created_at.is_none(), self.created_at, self.row_id)
  }
}

/// Input for [`ProfileStore::insert_profile`](crate::store::ProfileStore::insert_profile)
/// and [`ProfileStore::upsert_profile`](crate::store::ProfileStore::upsert_profile).
/// The row id is assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProfile {
  pub subject_id:            SubjectId,
  pub email:                 String,
  pub display_name:          Option<String>,
  pub avatar_url:            Option<String>,
  pub roles:                 BTreeSet<String>,
  pub providers:             BTreeSet<String>,
  pub created_at:            Option<DateTime<Utc>>,
  pub last_authenticated_at: DateTime<Utc>,
}

impl NewProfile {
  /// Minimal profile for `subject_id`; every optional field empty.
  pub fn new(subject_id: SubjectId, email: impl Into<String>, at: DateTime<Utc>) -> Self {
    Self {
      subject_id,
      email: email.into(),
      display_name: None,
      avatar_url: None,
      roles: BTreeSet::new(),
      providers: BTreeSet::new(),
      created_at: Some(at),
      last_authenticated_at: at,
    }
  }

  pub fn into_profile(self, row_id: i64) -> Profile {
    Profile {
      row_id,
      subject_id: self.subject_id,
      email: self.email,
      display_name: self.display_name,
      avatar_url: self.avatar_url,
      roles: self.roles,
      providers: self.providers,
      created_at: self.created_at,
      last_authenticated_at: self.last_authenticated_at,
    }
  }
}

/// A targeted update. `None` fields are left untouched by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
  pub last_authenticated_at: DateTime<Utc>,
  pub display_name:          Option<String>,
  pub avatar_url:            Option<String>,
  pub roles:                 Option<BTreeSet<String>>,
  pub providers:             Option<BTreeSet<String>>,
}

impl ProfilePatch {
  pub fn touch(at: DateTime<Utc>) -> Self {
    Self {
      last_authenticated_at: at,
      display_name:          None,
      avatar_url:            None,
      roles:                 None,
      providers:             None,
    }
  }

  /// `true` if the patch only advances `last_authenticated_at`.
  pub fn is_touch_only(&self) -> bool {
    self.display_name.is_none()
      && self.avatar_url.is_none()
      && self.roles.is_none()
      && self.providers.is_none()
  }

  /// Apply to an in-memory row.
  pub fn apply_to(&self, profile: &mut Profile) {
    profile.last_authenticated_at = self.last_authenticated_at;
    if let Some(name) = &self.display_name {
      profile.display_name = Some(name.clone());
    }
    if let Some(avatar) = &self.avatar_url {
      profile.avatar_url = Some(avatar.clone());
    }
    if let Some(roles) = &self.roles {
      profile.roles = roles.clone();
    }
    if let Some(providers) = &self.providers {
      profile.providers = providers.clone();
    }
  }
}
