//! The identity session monitor.
//!
//! Listens to a provider's [`SessionEvent`]s, publishes the signed-in identity
//! on a `watch` channel, and starts one reconciliation per "now signed in as
//! X" transition: every completed authentication, plus a refresh for a
//! subject not yet known to be signed in. Only the monitor's listener task
//! writes to the channel.
//!
//! One provider may serve many browsers at once, so the monitor tracks every
//! subject it has seen sign in. A sign-out only forgets the subject it names.

use std::sync::Arc;

use tokio::{
  sync::{broadcast, watch},
  task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
  Error,
  identity::{Identity, SubjectId},
  reconcile::{Reconciled, Reconciler},
  session::{SessionEvent, SessionProvider},
  store::ProfileStore,
};

const OUTCOME_CAPACITY: usize = 32;

/// Result of one reconciliation started by the monitor.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
  pub subject_id: SubjectId,
  pub outcome:    Result<Reconciled, Arc<Error>>,
}

/// Owns the listener task. Dropping the monitor (or calling
/// [`SessionMonitor::shutdown`]) stops listening and releases the
/// subscription. Reconciliations already started still run to completion.
pub struct SessionMonitor {
  current:  watch::Receiver<Option<Identity>>,
  outcomes: broadcast::Sender<ReconcileReport>,
  task:     Option<JoinHandle<()>>,
}

impl SessionMonitor {
  /// Subscribe to `provider` and start listening. Must be called inside a
  /// tokio runtime.
  pub fn spawn<P, S>(provider: &P, reconciler: Arc<Reconciler<S>>) -> Self
  where
    P: SessionProvider + ?Sized,
    S: ProfileStore + 'static,
  {
    let events = provider.subscribe();
    let (current_tx, current) = watch::channel(None);
    let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);

    let task = tokio::spawn(listen(events, current_tx, reconciler, outcomes.clone()));

    Self { current, outcomes, task: Some(task) }
  }

  /// The most recently signed-in identity that has not signed out since.
  pub fn current_identity(&self) -> watch::Receiver<Option<Identity>> { self.current.clone() }

  /// Outcomes of reconciliations started after this call.
  pub fn outcomes(&self) -> broadcast::Receiver<ReconcileReport> { self.outcomes.subscribe() }

  /// Stop listening and wait for the listener task to finish.
  pub async fn shutdown(mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
      // A cancelled join error is the expected outcome here.
      let _ = task.await;
    }
  }
}

impl Drop for SessionMonitor {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

// ─── Signed-in subjects ──────────────────────────────────────────────────────

/// Subjects the provider has reported as signed in, most recent last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignedInSubjects {
  recent: Vec<Identity>,
}

impl SignedInSubjects {
  /// The most recently signed-in identity still signed in.
  pub fn current(&self) -> Option<&Identity> { self.recent.last() }

  pub fn contains(&self, subject_id: &SubjectId) -> bool {
    self.recent.iter().any(|i| &i.subject_id == subject_id)
  }

  pub fn len(&self) -> usize { self.recent.len() }

  pub fn is_empty(&self) -> bool { self.recent.is_empty() }

  /// Fold `event` in. Returns the identity to reconcile, if the event is a
  /// transition to "signed in as X".
  pub fn apply(&mut self, event: SessionEvent) -> Option<Identity> {
    match event {
      SessionEvent::SignedIn(identity) => {
        self.forget(&identity.subject_id);
        self.recent.push(identity.clone());
        Some(identity)
      }
      SessionEvent::TokenRefreshed(identity) => {
        let known = self.forget(&identity.subject_id);
        self.recent.push(identity.clone());
        (!known).then_some(identity)
      }
      SessionEvent::SignedOut(Some(subject_id)) => {
        self.forget(&subject_id);
        None
      }
      SessionEvent::SignedOut(None) => {
        self.recent.clear();
        None
      }
    }
  }

  fn forget(&mut self, subject_id: &SubjectId) -> bool {
    let before = self.recent.len();
    self.recent.retain(|i| &i.subject_id != subject_id);
    self.recent.len() != before
  }
}

async fn listen<S>(
  mut events: broadcast::Receiver<SessionEvent>,
  current_tx: watch::Sender<Option<Identity>>,
  reconciler: Arc<Reconciler<S>>,
  outcomes:   broadcast::Sender<ReconcileReport>,
) where
  S: ProfileStore + 'static,
{
  let mut signed_in = SignedInSubjects::default();
  loop {
    let event = match events.recv().await {
      Ok(event) => event,
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        warn!(skipped, "session monitor fell behind; notifications dropped");
        continue;
      }
      Err(broadcast::error::RecvError::Closed) => {
        debug!("session provider closed its notification channel");
        break;
      }
    };

    let to_reconcile = signed_in.apply(event);
    current_tx.send_if_modified(|current| {
      let next = signed_in.current();
      if current.as_ref() == next {
        return false;
      }
      *current = next.cloned();
      true
    });

    if let Some(identity) = to_reconcile {
      debug!(subject = %identity.subject_id, signed_in = signed_in.len(), "now signed in");
      tokio::spawn(run_reconciliation(Arc::clone(&reconciler), identity, outcomes.clone()));
    }
  }
}

async fn run_reconciliation<S>(
  reconciler: Arc<Reconciler<S>>,
  identity:   Identity,
  outcomes:   broadcast::Sender<ReconcileReport>,
) where
  S: ProfileStore + 'static,
{
  let outcome = reconciler.reconcile(&identity).await;
  match &outcome {
    Ok(Reconciled::InProgress) => debug!(subject = %identity.subject_id, "reconciliation skipped"),
    Ok(_) => info!(subject = %identity.subject_id, "profile reconciled"),
    // Sign-in already succeeded at the provider; profile bookkeeping failures
    // are only reported.
    Err(e) => warn!(
      subject = %identity.subject_id,
      step = ?e.step(),
      retryable = e.is_retryable(),
      "profile reconciliation failed: {e}"
    ),
  }

  let report = ReconcileReport {
    subject_id: identity.subject_id,
    outcome:    outcome.map_err(Arc::new),
  };
  // Nobody listening is fine.
  let _ = outcomes.send(report);
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::time::timeout;

  use super::*;
  use crate::{
    memory::MemoryProfileStore,
    reconcile::ReconcilerConfig,
    session::{Session, SessionEvents},
  };

  /// Provider that only supports subscriptions; tests push events directly.
  #[derive(Default)]
  struct ScriptedProvider {
    events: SessionEvents,
  }

  #[derive(Debug, thiserror::Error)]
  #[error("not supported by the scripted provider")]
  struct Unsupported;

  impl SessionProvider for ScriptedProvider {
    type Error = Unsupported;

    async fn get_session(&self, _: String) -> Result<Option<Session>, Self::Error> { Err(Unsupported) }

    async fn refresh_session(&self, _: String) -> Result<Option<Session>, Self::Error> { Err(Unsupported) }

    async fn exchange_code(&self, _: String, _: String) -> Result<Session, Self::Error> { Err(Unsupported) }

    async fn sign_out(&self, _: String) -> Result<(), Self::Error> { Err(Unsupported) }

    fn authorize_url(&self, _: &str, _: &str, _: &str) -> Result<String, Self::Error> { Err(Unsupported) }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> { self.events.subscribe() }
  }

  fn setup() -> (ScriptedProvider, MemoryProfileStore, SessionMonitor) {
    let provider = ScriptedProvider::default();
    let store = MemoryProfileStore::new();
    let reconciler = Arc::new(Reconciler::new(Arc::new(store.clone()), ReconcilerConfig::default()));
    let monitor = SessionMonitor::spawn(&provider, reconciler);
    (provider, store, monitor)
  }

  async fn next_report(rx: &mut broadcast::Receiver<ReconcileReport>) -> ReconcileReport {
    timeout(Duration::from_secs(2), rx.recv())
      .await
      .expect("report in time")
      .expect("channel open")
  }

  #[test]
  fn every_sign_in_is_a_transition_but_refreshes_are_not() {
    let alice = Identity::new("alice", "alice@x.com");
    let bob = Identity::new("bob", "bob@x.com");
    let mut subjects = SignedInSubjects::default();

    assert_eq!(subjects.apply(SessionEvent::SignedIn(alice.clone())), Some(alice.clone()));
    assert_eq!(subjects.apply(SessionEvent::TokenRefreshed(alice.clone())), None);
    // A second authentication (another device, another provider) counts.
    assert_eq!(subjects.apply(SessionEvent::SignedIn(alice.clone())), Some(alice.clone()));
    assert_eq!(subjects.apply(SessionEvent::SignedIn(bob.clone())), Some(bob.clone()));
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects.current(), Some(&bob));

    // A restored session nobody saw sign in is a transition too.
    let carol = Identity::new("carol", "carol@x.com");
    assert_eq!(subjects.apply(SessionEvent::TokenRefreshed(carol.clone())), Some(carol));
  }

  #[test]
  fn sign_out_only_forgets_the_named_subject() {
    let alice = Identity::new("alice", "alice@x.com");
    let bob = Identity::new("bob", "bob@x.com");
    let mut subjects = SignedInSubjects::default();
    subjects.apply(SessionEvent::SignedIn(alice.clone()));
    subjects.apply(SessionEvent::SignedIn(bob.clone()));

    assert_eq!(subjects.apply(SessionEvent::SignedOut(Some(bob.subject_id.clone()))), None);
    assert_eq!(subjects.current(), Some(&alice));
    assert!(!subjects.contains(&bob.subject_id));
    assert_eq!(subjects.apply(SessionEvent::TokenRefreshed(alice.clone())), None);

    assert_eq!(subjects.apply(SessionEvent::SignedOut(None)), None);
    assert!(subjects.is_empty());
    assert_eq!(subjects.current(), None);
    assert_eq!(subjects.apply(SessionEvent::TokenRefreshed(alice.clone())), Some(alice));
  }

  #[tokio::test]
  async fn sign_in_reconciles_once() {
    let (provider, store, monitor) = setup();
    let mut reports = monitor.outcomes();
    let mut current = monitor.current_identity();

    let jane = Identity::new("jane", "jane@x.com").with_metadata("full_name", "Jane Doe");
    provider.events.emit(SessionEvent::SignedIn(jane.clone()));

    let report = next_report(&mut reports).await;
    assert_eq!(report.subject_id.as_str(), "jane");
    assert!(matches!(report.outcome, Ok(Reconciled::Created(_))));

    current.wait_for(|c| c.is_some()).await.unwrap();
    assert_eq!(current.borrow().as_ref().map(|i| i.subject_id.as_str()), Some("jane"));

    // A refresh for the same subject publishes but does not reconcile.
    provider.events.emit(SessionEvent::TokenRefreshed(jane));
    assert!(timeout(Duration::from_millis(100), reports.recv()).await.is_err());
    assert_eq!(store.rows().len(), 1);
  }

  #[tokio::test]
  async fn repeat_sign_in_reconciles_again() {
    let (provider, store, monitor) = setup();
    let mut reports = monitor.outcomes();

    provider.events.emit(SessionEvent::SignedIn(Identity::new("jane", "jane@x.com")));
    assert!(matches!(next_report(&mut reports).await.outcome, Ok(Reconciled::Created(_))));

    let second_device = Identity::new("jane", "jane@x.com").with_metadata("provider", "google");
    provider.events.emit(SessionEvent::SignedIn(second_device));
    let report = next_report(&mut reports).await;
    let Ok(Reconciled::Updated(profile)) = report.outcome else {
      panic!("second sign-in should update the profile");
    };
    assert!(profile.providers.contains("google"));
    assert_eq!(store.rows().len(), 1);
  }

  #[tokio::test]
  async fn sign_out_clears_identity_without_writes() {
    let (provider, store, monitor) = setup();
    let mut reports = monitor.outcomes();
    let mut current = monitor.current_identity();

    provider.events.emit(SessionEvent::SignedIn(Identity::new("u1", "u1@x.com")));
    next_report(&mut reports).await;
    let rows_before = store.rows();

    provider.events.emit(SessionEvent::SignedOut(Some(SubjectId::new("u1"))));
    current.wait_for(Option::is_none).await.unwrap();
    assert_eq!(store.rows(), rows_before);
  }

  #[tokio::test]
  async fn failures_are_reported_not_fatal() {
    let (provider, store, monitor) = setup();
    let mut reports = monitor.outcomes();
    store.fail_next(crate::memory::Op::List, crate::memory::Failure::Unavailable);

    provider.events.emit(SessionEvent::SignedIn(Identity::new("u1", "u1@x.com")));
    let report = next_report(&mut reports).await;
    assert!(matches!(
      &report.outcome,
      Err(e) if matches!(**e, Error::StoreUnavailable { step: crate::Step::Lookup, .. })
    ));

    // The monitor keeps running; the identity is still published.
    assert!(monitor.current_identity().borrow().is_some());
    provider.events.emit(SessionEvent::SignedIn(Identity::new("u2", "u2@x.com")));
    let report = next_report(&mut reports).await;
    assert!(report.outcome.is_ok());
  }

  #[tokio::test]
  async fn shutdown_releases_the_subscription() {
    let (provider, _store, monitor) = setup();
    assert_eq!(provider.events.receiver_count(), 1);
    monitor.shutdown().await;
    assert_eq!(provider.events.receiver_count(), 0);
  }
}
