//! The `ProfileStore` trait.
//!
//! The trait is implemented by storage backends (e.g.
//! `resilience-store-sqlite`, or [`MemoryProfileStore`](crate::memory::MemoryProfileStore)).
//! The reconciler is the only component expected to write through it.

use std::future::Future;

use crate::{
  identity::SubjectId,
  profile::{NewProfile, Profile, ProfilePatch},
};

/// Classification hook for backend errors.
pub trait StoreFailure: std::error::Error + Send + Sync + 'static {
  /// `true` if the store refused a write because of a uniqueness or other
  /// integrity constraint, as opposed to being unreachable.
  fn is_constraint_violation(&self) -> bool { false }
}

/// Abstraction over the remote profile table.
///
/// All methods return `Send` futures so the trait can be used in multi-threaded
/// async runtimes (e.g. tokio with `axum`).
pub trait ProfileStore: Send + Sync {
  type Error: StoreFailure;

  /// Point lookup by subject. If legacy duplicates exist, the most senior row
  /// (see [`Profile::seniority`]) is returned.
  fn find_profile(
    &self,
    subject_id: SubjectId,
  ) -> impl Future<Output = Result<Option<Profile>, Self::Error>> + Send + '_;

  /// Every row stored for `subject_id`, duplicates included.
  fn list_profiles(
    &self,
    subject_id: SubjectId,
  ) -> impl Future<Output = Result<Vec<Profile>, Self::Error>> + Send + '_;

  /// Plain insert. Backends with a uniqueness constraint on `subject_id`
  /// reject a second row for the same subject.
  fn insert_profile(
    &self,
    input: NewProfile,
  ) -> impl Future<Output = Result<Profile, Self::Error>> + Send + '_;

  /// Update only the fields set in `patch` on row `row_id`.
  fn update_profile(
    &self,
    row_id: i64,
    patch: ProfilePatch,
  ) -> impl Future<Output = Result<Profile, Self::Error>> + Send + '_;

  /// Insert keyed on `subject_id`. If a row already exists, only its
  /// `last_authenticated_at` is advanced and the existing row is returned, so
  /// a racer that loses never clobbers the winner's data.
  fn upsert_profile(
    &self,
    input: NewProfile,
  ) -> impl Future<Output = Result<Profile, Self::Error>> + Send + '_;

  /// Remove row `row_id`.
  fn delete_profile(
    &self,
    row_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
