//! Error types for `resilience-core`.
//!
//! These are the only failures the reconciler reports. None of them is
//! retried internally; callers decide using [`Error::is_retryable`].

use std::fmt;

use thiserror::Error;

use crate::store::StoreFailure;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The store call that was in progress when a reconciliation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  /// Multi-row query for the subject.
  Lookup,
  /// Point lookup guarding the create path.
  Recheck,
  /// Deleting surplus rows in the duplicate-collapse branch.
  Collapse,
  /// Upsert of a brand-new profile.
  Create,
  /// Targeted update of the existing (or surviving) profile.
  Update,
}

impl fmt::Display for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Step::Lookup => "lookup",
      Step::Recheck => "recheck",
      Step::Collapse => "collapse",
      Step::Create => "create",
      Step::Update => "update",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("identity has no subject id")]
  MissingIdentity,

  #[error("profile store unavailable during {step}: {source}")]
  StoreUnavailable {
    step:   Step,
    #[source]
    source: BoxError,
  },

  #[error("profile store rejected the write: {source}")]
  ConstraintViolation {
    #[source]
    source: BoxError,
  },
}

impl Error {
  pub(crate) fn unavailable<E: StoreFailure>(step: Step, source: E) -> Self {
    Error::StoreUnavailable { step, source: Box::new(source) }
  }

  /// Like [`Error::unavailable`], but surfaces constraint failures reported by
  /// the store as [`Error::ConstraintViolation`].
  pub(crate) fn rejected<E: StoreFailure>(step: Step, source: E) -> Self {
    if source.is_constraint_violation() {
      Error::ConstraintViolation { source: Box::new(source) }
    } else {
      Error::unavailable(step, source)
    }
  }

  /// Whether re-running the whole reconciliation can succeed without the
  /// caller changing its input.
  pub fn is_retryable(&self) -> bool { !matches!(self, Error::MissingIdentity) }

  /// The failing store step, if the failure came from the store.
  pub fn step(&self) -> Option<Step> {
    match self {
      Error::StoreUnavailable { step, .. } => Some(*step),
      Error::ConstraintViolation { .. } => Some(Step::Create),
      Error::MissingIdentity => None,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
