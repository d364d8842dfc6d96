//! [`MemoryProfileStore`], an in-process [`ProfileStore`].
//!
//! The table carries no unique index, so [`ProfileStore::insert_profile`] can
//! reproduce the legacy duplicate rows the reconciler has to collapse.
//! [`ProfileStore::upsert_profile`] is atomic under the table lock, which
//! plays the part of the remote uniqueness constraint.
//!
//! Failures can be injected per operation, and each handle can carry a yield
//! schedule that suspends before every call; tests use both to drive specific
//! interleavings of concurrent reconciliations.

use std::{
  collections::{HashMap, VecDeque},
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

use crate::{
  identity::SubjectId,
  profile::{NewProfile, Profile, ProfilePatch},
  store::{ProfileStore, StoreFailure},
};

/// Store operations, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
  Find,
  List,
  Insert,
  Update,
  Upsert,
  Delete,
}

/// How an injected failure presents itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
  Unavailable,
  Constraint,
}

#[derive(Debug, Error)]
pub enum MemoryStoreError {
  #[error("store unavailable during {0:?}")]
  Unavailable(Op),

  #[error("constraint violated during {0:?}")]
  Constraint(Op),

  #[error("profile row not found: {0}")]
  RowNotFound(i64),
}

impl StoreFailure for MemoryStoreError {
  fn is_constraint_violation(&self) -> bool { matches!(self, Self::Constraint(_)) }
}

#[derive(Debug, Default)]
struct Table {
  rows:        Vec<Profile>,
  next_row_id: i64,
  failures:    HashMap<Op, VecDeque<Failure>>,
  calls:       HashMap<Op, usize>,
}

impl Table {
  fn begin(&mut self, op: Op) -> Result<(), MemoryStoreError> {
    *self.calls.entry(op).or_default() += 1;
    match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
      None => Ok(()),
      Some(Failure::Unavailable) => Err(MemoryStoreError::Unavailable(op)),
      Some(Failure::Constraint) => Err(MemoryStoreError::Constraint(op)),
    }
  }

  fn push(&mut self, input: NewProfile) -> Profile {
    self.next_row_id += 1;
    let profile = input.into_profile(self.next_row_id);
    self.rows.push(profile.clone());
    profile
  }

  fn senior(&mut self, subject_id: &SubjectId) -> Option<&mut Profile> {
    self
      .rows
      .iter_mut()
      .filter(|p| &p.subject_id == subject_id)
      .min_by_key(|p| p.seniority())
  }
}

/// Cloning is cheap and clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryProfileStore {
  table:    Arc<Mutex<Table>>,
  schedule: Arc<Mutex<VecDeque<u8>>>,
}

impl MemoryProfileStore {
  pub fn new() -> Self { Self::default() }

  /// A handle on the same table that yields to the runtime `schedule[n]`
  /// times before its n-th store call (zero once the schedule runs out).
  pub fn with_schedule(&self, schedule: impl IntoIterator<Item = u8>) -> Self {
    Self {
      table:    Arc::clone(&self.table),
      schedule: Arc::new(Mutex::new(schedule.into_iter().collect())),
    }
  }

  /// Make the next call of `op` fail with `failure`. Calls queue up.
  pub fn fail_next(&self, op: Op, failure: Failure) {
    self.lock().failures.entry(op).or_default().push_back(failure);
  }

  /// How many times `op` has been attempted, failed calls included.
  pub fn calls(&self, op: Op) -> usize { self.lock().calls.get(&op).copied().unwrap_or(0) }

  /// Every row, in insertion order.
  pub fn rows(&self) -> Vec<Profile> { self.lock().rows.clone() }

  /// Every row for `subject_id`, in insertion order.
  pub fn rows_for(&self, subject_id: &SubjectId) -> Vec<Profile> {
    self
      .lock()
      .rows
      .iter()
      .filter(|p| &p.subject_id == subject_id)
      .cloned()
      .collect()
  }

  fn lock(&self) -> MutexGuard<'_, Table> {
    self.table.lock().unwrap_or_else(PoisonError::into_inner)
  }

  async fn pause(&self) {
    let turns = self
      .schedule
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .pop_front()
      .unwrap_or(0);
    for _ in 0..turns {
      tokio::task::yield_now().await;
    }
  }
}

impl ProfileStore for MemoryProfileStore {
  type Error = MemoryStoreError;

  async fn find_profile(&self, subject_id: SubjectId) -> Result<Option<Profile>, Self::Error> {
    self.pause().await;
    let mut table = self.lock();
    table.begin(Op::Find)?;
    Ok(table.senior(&subject_id).cloned())
  }

  async fn list_profiles(&self, subject_id: SubjectId) -> Result<Vec<Profile>, Self::Error> {
    self.pause().await;
    let mut table = self.lock();
    table.begin(Op::List)?;
    Ok(
      table
        .rows
        .iter()
        .filter(|p| p.subject_id == subject_id)
        .cloned()
        .collect(),
    )
  }

  async fn insert_profile(&self, input: NewProfile) -> Result<Profile, Self::Error> {
    self.pause().await;
    let mut table = self.lock();
    table.begin(Op::Insert)?;
    Ok(table.push(input))
  }

  async fn update_profile(&self, row_id: i64, patch: ProfilePatch) -> Result<Profile, Self::Error> {
    self.pause().await;
    let mut table = self.lock();
    table.begin(Op::Update)?;
    let row = table
      .rows
      .iter_mut()
      .find(|p| p.row_id == row_id)
      .ok_or(MemoryStoreError::RowNotFound(row_id))?;
    patch.apply_to(row);
    Ok(row.clone())
  }

  async fn upsert_profile(&self, input: NewProfile) -> Result<Profile, Self::Error> {
    self.pause().await;
    let mut table = self.lock();
    table.begin(Op::Upsert)?;
    if let Some(existing) = table.senior(&input.subject_id) {
      existing.last_authenticated_at = input.last_authenticated_at;
      return Ok(existing.clone());
    }
    Ok(table.push(input))
  }

  async fn delete_profile(&self, row_id: i64) -> Result<(), Self::Error> {
    self.pause().await;
    let mut table = self.lock();
    table.begin(Op::Delete)?;
    let before = table.rows.len();
    table.rows.retain(|p| p.row_id != row_id);
    if table.rows.len() == before {
      return Err(MemoryStoreError::RowNotFound(row_id));
    }
    Ok(())
  }
}
