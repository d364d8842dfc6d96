//! Identity: who the hosted identity provider says is signed in.
//!
//! An identity is read-only from this crate's point of view. The metadata bag
//! is whatever the provider handed us; only a handful of keys are consulted.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata keys that may carry a human-readable name, highest priority first.
const NAME_KEYS: [&str; 6] = [
  "full_name",
  "name",
  "display_name",
  "displayName",
  "preferred_username",
  "user_name",
];

const AVATAR_KEYS: [&str; 2] = ["avatar_url", "picture"];

/// Opaque, stable identifier of an authenticated subject.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }

  /// Blank identifiers are never valid keys.
  pub fn is_empty(&self) -> bool { self.0.trim().is_empty() }
}

impl fmt::Display for SubjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for SubjectId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

impl From<String> for SubjectId {
  fn from(s: String) -> Self { Self(s) }
}

/// An authenticated identity as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
  pub subject_id: SubjectId,
  pub email:      String,
  #[serde(default)]
  pub metadata:   Map<String, Value>,
}

impl Identity {
  pub fn new(subject_id: impl Into<SubjectId>, email: impl Into<String>) -> Self {
    Self {
      subject_id: subject_id.into(),
      email:      email.into(),
      metadata:   Map::new(),
    }
  }

  /// Builder-style helper for attaching a metadata entry.
  pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
    self.metadata.insert(key.to_owned(), value.into());
    self
  }

  /// Best-effort display name: the first non-blank name-like metadata field,
  /// falling back to the local part of the email address.
  pub fn derived_display_name(&self) -> Option<String> {
    NAME_KEYS
      .iter()
      .find_map(|key| self.metadata_str(key))
      .or_else(|| email_local_part(&self.email))
      .map(str::to_owned)
  }

  pub fn avatar_url(&self) -> Option<&str> {
    AVATAR_KEYS.iter().find_map(|key| self.metadata_str(key))
  }

  /// The provider that authenticated this identity, if the metadata says.
  pub fn provider(&self) -> Option<&str> { self.metadata_str("provider") }

  fn metadata_str(&self, key: &str) -> Option<&str> {
    self
      .metadata
      .get(key)?
      .as_str()
      .map(str::trim)
      .filter(|s| !s.is_empty())
  }
}

fn email_local_part(email: &str) -> Option<&str> {
  email
    .split('@')
    .next()
    .map(str::trim)
    .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn full_name_wins_over_other_candidates() {
    let identity = Identity::new("u1", "jane@x.com")
      .with_metadata("name", "jd")
      .with_metadata("full_name", "Jane Doe");
    assert_eq!(identity.derived_display_name().as_deref(), Some("Jane Doe"));
  }

  #[test]
  fn blank_candidates_are_skipped() {
    let identity = Identity::new("u1", "jane@x.com")
      .with_metadata("full_name", "   ")
      .with_metadata("preferred_username", "janed");
    assert_eq!(identity.derived_display_name().as_deref(), Some("janed"));
  }

  #[test]
  fn non_string_metadata_is_ignored() {
    let identity = Identity::new("u1", "bob@x.com").with_metadata("name", 42);
    assert_eq!(identity.derived_display_name().as_deref(), Some("bob"));
  }

  #[test]
  fn falls_back_to_email_local_part() {
    let identity = Identity::new("u1", "bob@x.com");
    assert_eq!(identity.derived_display_name().as_deref(), Some("bob"));
  }

  #[test]
  fn no_name_and_no_email_yields_none() {
    let identity = Identity::new("u1", "");
    assert_eq!(identity.derived_display_name(), None);

    let identity = Identity::new("u1", "@x.com");
    assert_eq!(identity.derived_display_name(), None);
  }

  #[test]
  fn avatar_falls_back_to_picture() {
    let identity = Identity::new("u1", "a@x.com")
      .with_metadata("picture", "https://img.example/a.png");
    assert_eq!(identity.avatar_url(), Some("https://img.example/a.png"));
  }

  #[test]
  fn blank_subject_id_is_empty() {
    assert!(SubjectId::new("  ").is_empty());
    assert!(!SubjectId::new("abc").is_empty());
  }
}
