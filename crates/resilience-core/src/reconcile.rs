//! Profile reconciliation.
//!
//! Given an authenticated [`Identity`], converge the profile store to exactly
//! one row for its subject, with the default role merged in and a display name
//! filled only where none exists.
//!
//! Correctness under concurrent first-time sign-in rests on the store's upsert
//! (unique on `subject_id`). The in-process [`InFlight`] guard only stops one
//! process from starting overlapping runs for the same subject; an identity
//! that arrives mid-run is reconciled by the running call once it finishes.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
  Error, Result, Step,
  identity::{Identity, SubjectId},
  profile::{NewProfile, Profile, ProfilePatch},
  store::ProfileStore,
};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
  /// Role every profile is guaranteed to carry.
  pub default_role:     String,
  /// Provider recorded when the identity metadata names none.
  pub default_provider: String,
}

impl Default for ReconcilerConfig {
  fn default() -> Self {
    Self {
      default_role:     "client".to_owned(),
      default_provider: "email".to_owned(),
    }
  }
}

// ─── In-flight guard ─────────────────────────────────────────────────────────

/// Per-subject run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
  Idle,
  Running,
}

/// Tracks which subjects have a reconciliation in progress, plus the latest
/// identity that arrived for each while it was running.
///
/// `Idle → Running` happens in [`InFlight::try_begin`] under one lock, so two
/// callers can never both observe `Idle`. `Running → Idle` happens in
/// [`RunTicket::next_queued`] once nothing is queued, or when the ticket is
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
  running: Arc<Mutex<HashMap<SubjectId, Option<Identity>>>>,
}

impl InFlight {
  /// Claim the subject of `identity`. If a run already holds it, `identity`
  /// is queued for that run (replacing anything queued before) and `None` is
  /// returned.
  pub fn try_begin(&self, identity: &Identity) -> Option<RunTicket> {
    let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(queued) = running.get_mut(&identity.subject_id) {
      *queued = Some(identity.clone());
      return None;
    }
    running.insert(identity.subject_id.clone(), None);
    Some(RunTicket {
      running:    Arc::clone(&self.running),
      subject_id: identity.subject_id.clone(),
      released:   false,
    })
  }

  pub fn state(&self, subject_id: &SubjectId) -> RunState {
    let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
    if running.contains_key(subject_id) { RunState::Running } else { RunState::Idle }
  }
}

/// Proof that the holder owns the `Running` state for one subject.
#[derive(Debug)]
pub struct RunTicket {
  running:    Arc<Mutex<HashMap<SubjectId, Option<Identity>>>>,
  subject_id: SubjectId,
  released:   bool,
}

impl RunTicket {
  /// Take the identity queued while this run was going, keeping the subject
  /// `Running`. With nothing queued the subject goes back to `Idle` in the
  /// same critical section and `None` is returned.
  pub fn next_queued(&mut self) -> Option<Identity> {
    if self.released {
      return None;
    }
    let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(queued) = running.get_mut(&self.subject_id).and_then(Option::take) {
      return Some(queued);
    }
    running.remove(&self.subject_id);
    self.released = true;
    None
  }
}

impl Drop for RunTicket {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    self
      .running
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&self.subject_id);
  }
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// What a successful reconciliation did.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
  /// No row existed; one was created (or a concurrent creator's row was
  /// touched by the upsert).
  Created(Profile),
  /// Exactly one row existed and was updated.
  Updated(Profile),
  /// Duplicates were removed and the surviving row updated.
  Collapsed { survivor: Profile, removed: usize },
  /// Another run for the same subject was already in progress. This call
  /// read and wrote nothing; its identity was handed to the running one,
  /// which reconciles again before finishing.
  InProgress,
}

impl Reconciled {
  pub fn profile(&self) -> Option<&Profile> {
    match self {
      Reconciled::Created(p) | Reconciled::Updated(p) => Some(p),
      Reconciled::Collapsed { survivor, .. } => Some(survivor),
      Reconciled::InProgress => None,
    }
  }
}

// ─── Reconciler ──────────────────────────────────────────────────────────────

pub struct Reconciler<S> {
  store:     Arc<S>,
  config:    ReconcilerConfig,
  in_flight: InFlight,
}

impl<S: ProfileStore> Reconciler<S> {
  pub fn new(store: Arc<S>, config: ReconcilerConfig) -> Self {
    Self { store, config, in_flight: InFlight::default() }
  }

  pub fn config(&self) -> &ReconcilerConfig { &self.config }

  pub fn in_flight(&self) -> &InFlight { &self.in_flight }

  /// Run one reconciliation for `identity` to completion, then once more for
  /// whatever identity of the same subject arrived in the meantime.
  #[instrument(skip_all, fields(subject = %identity.subject_id))]
  pub async fn reconcile(&self, identity: &Identity) -> Result<Reconciled> {
    if identity.subject_id.is_empty() {
      return Err(Error::MissingIdentity);
    }

    let Some(mut ticket) = self.in_flight.try_begin(identity) else {
      debug!("reconciliation already running; queued behind it");
      return Ok(Reconciled::InProgress);
    };

    let mut outcome = self.run(identity).await;
    while outcome.is_ok() {
      let Some(queued) = ticket.next_queued() else { break };
      debug!("identity changed mid-run; reconciling again");
      outcome = self.run(&queued).await;
    }
    outcome
  }

  async fn run(&self, identity: &Identity) -> Result<Reconciled> {
    let now = Utc::now();
    let mut rows = self
      .store
      .list_profiles(identity.subject_id.clone())
      .await
      .map_err(|e| Error::unavailable(Step::Lookup, e))?;

    if rows.len() > 1 {
      return self.collapse(rows, identity, now).await;
    }

    match rows.pop() {
      Some(existing) => {
        let updated = self.refresh(existing, identity, now).await?;
        Ok(Reconciled::Updated(updated))
      }
      None => self.create_or_adopt(identity, now).await,
    }
  }

  /// Keep the most senior row, delete the rest, then refresh the survivor.
  async fn collapse(
    &self,
    mut rows: Vec<Profile>,
    identity: &Identity,
    now: DateTime<Utc>,
  ) -> Result<Reconciled> {
    rows.sort_by_key(Profile::seniority);
    let extras = rows.split_off(1);
    let Some(survivor) = rows.pop() else {
      return self.create_or_adopt(identity, now).await;
    };

    for extra in &extras {
      debug!(row_id = extra.row_id, "deleting duplicate profile row");
      self
        .store
        .delete_profile(extra.row_id)
        .await
        .map_err(|e| Error::unavailable(Step::Collapse, e))?;
    }

    let survivor = self.refresh(survivor, identity, now).await?;
    info!(row_id = survivor.row_id, removed = extras.len(), "collapsed duplicate profiles");
    Ok(Reconciled::Collapsed { survivor, removed: extras.len() })
  }

  async fn create_or_adopt(&self, identity: &Identity, now: DateTime<Utc>) -> Result<Reconciled> {
    // A concurrent run may have created the row since the first lookup.
    let existing = self
      .store
      .find_profile(identity.subject_id.clone())
      .await
      .map_err(|e| Error::unavailable(Step::Recheck, e))?;

    if let Some(existing) = existing {
      let updated = self.refresh(existing, identity, now).await?;
      return Ok(Reconciled::Updated(updated));
    }

    let created = self
      .store
      .upsert_profile(self.new_profile(identity, now))
      .await
      .map_err(|e| Error::rejected(Step::Create, e))?;
    info!(row_id = created.row_id, "created profile");
    Ok(Reconciled::Created(created))
  }

  async fn refresh(
    &self,
    existing: Profile,
    identity: &Identity,
    now: DateTime<Utc>,
  ) -> Result<Profile> {
    let patch = self.patch_for(&existing, identity, now);
    debug!(row_id = existing.row_id, touch_only = patch.is_touch_only(), "updating profile");
    self
      .store
      .update_profile(existing.row_id, patch)
      .await
      .map_err(|e| Error::unavailable(Step::Update, e))
  }

  fn provider_for<'a>(&'a self, identity: &'a Identity) -> &'a str {
    identity.provider().unwrap_or(&self.config.default_provider)
  }

  /// The profile written when a subject signs in for the first time.
  pub fn new_profile(&self, identity: &Identity, now: DateTime<Utc>) -> NewProfile {
    let mut input = NewProfile::new(identity.subject_id.clone(), identity.email.clone(), now);
    input.display_name = identity.derived_display_name();
    input.avatar_url = identity.avatar_url().map(str::to_owned);
    input.roles.insert(self.config.default_role.clone());
    input.providers.insert(self.provider_for(identity).to_owned());
    input
  }

  /// The targeted update for an existing row. Only ever adds: a present
  /// display name or avatar is kept, and roles/providers are unioned.
  pub fn patch_for(&self, existing: &Profile, identity: &Identity, now: DateTime<Utc>) -> ProfilePatch {
    let mut patch = ProfilePatch::touch(now);

    if !existing.has_display_name() {
      patch.display_name = identity.derived_display_name();
    }

    if existing.avatar_url.is_none() {
      patch.avatar_url = identity.avatar_url().map(str::to_owned);
    }

    if !existing.roles.contains(&self.config.default_role) {
      let mut roles = existing.roles.clone();
      roles.insert(self.config.default_role.clone());
      patch.roles = Some(roles);
    }

    let provider = self.provider_for(identity);
    if !existing.providers.contains(provider) {
      let mut providers = existing.providers.clone();
      providers.insert(provider.to_owned());
      patch.providers = Some(providers);
    }

    patch
  }
}
