//! Reconciler tests against the in-memory store.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Duration, TimeZone as _, Utc};
use proptest::prelude::*;

use crate::{
  Error, Step,
  identity::{Identity, SubjectId},
  memory::{Failure, MemoryProfileStore, Op},
  profile::{NewProfile, Profile},
  reconcile::{Reconciled, Reconciler, ReconcilerConfig, RunState},
  store::ProfileStore,
};

fn reconciler(store: &MemoryProfileStore) -> Reconciler<MemoryProfileStore> {
  Reconciler::new(Arc::new(store.clone()), ReconcilerConfig::default())
}

fn at(day: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap() }

fn set(items: &[&str]) -> BTreeSet<String> { items.iter().map(|s| (*s).to_owned()).collect() }

async fn seed(store: &MemoryProfileStore, subject: &str, created_at: Option<DateTime<Utc>>) -> Profile {
  let mut input = NewProfile::new(SubjectId::new(subject), format!("{subject}@x.com"), at(1));
  input.created_at = created_at;
  store.insert_profile(input).await.unwrap()
}

fn jane() -> Identity {
  Identity::new("jane", "jane@x.com").with_metadata("full_name", "Jane Doe")
}

// ─── First-time creation ─────────────────────────────────────────────────────

#[tokio::test]
async fn first_sign_in_creates_one_profile() {
  let store = MemoryProfileStore::new();

  let outcome = reconciler(&store).reconcile(&jane()).await.unwrap();
  assert!(matches!(outcome, Reconciled::Created(_)));

  let rows = store.rows();
  assert_eq!(rows.len(), 1);
  let row = &rows[0];
  assert_eq!(row.subject_id.as_str(), "jane");
  assert_eq!(row.email, "jane@x.com");
  assert_eq!(row.display_name.as_deref(), Some("Jane Doe"));
  assert_eq!(row.roles, set(&["client"]));
  assert_eq!(row.providers, set(&["email"]));
  assert!(row.created_at.is_some());

  // Creation goes through the upsert, never a plain insert.
  assert_eq!(store.calls(Op::Upsert), 1);
  assert_eq!(store.calls(Op::Insert), 0);
}

#[tokio::test]
async fn fallback_name_is_email_local_part() {
  let store = MemoryProfileStore::new();
  let bob = Identity::new("bob", "bob@x.com");

  reconciler(&store).reconcile(&bob).await.unwrap();

  assert_eq!(store.rows()[0].display_name.as_deref(), Some("bob"));
}

#[tokio::test]
async fn provider_and_avatar_come_from_metadata() {
  let store = MemoryProfileStore::new();
  let identity = Identity::new("g1", "g@x.com")
    .with_metadata("provider", "google")
    .with_metadata("avatar_url", "https://img.example/g.png");

  reconciler(&store).reconcile(&identity).await.unwrap();

  let row = &store.rows()[0];
  assert_eq!(row.providers, set(&["google"]));
  assert_eq!(row.avatar_url.as_deref(), Some("https://img.example/g.png"));
}

#[tokio::test]
async fn configured_defaults_are_used() {
  let store = MemoryProfileStore::new();
  let config = ReconcilerConfig {
    default_role:     "trainer".into(),
    default_provider: "magic_link".into(),
  };
  let reconciler = Reconciler::new(Arc::new(store.clone()), config);

  reconciler.reconcile(&jane()).await.unwrap();

  let row = &store.rows()[0];
  assert_eq!(row.roles, set(&["trainer"]));
  assert_eq!(row.providers, set(&["magic_link"]));
}

// ─── Existing profile ────────────────────────────────────────────────────────

#[tokio::test]
async fn human_edited_name_is_kept() {
  let store = MemoryProfileStore::new();
  let seeded = seed(&store, "alex", Some(at(1))).await;
  store
    .update_profile(seeded.row_id, {
      let mut patch = crate::profile::ProfilePatch::touch(at(2));
      patch.display_name = Some("Alex".into());
      patch
    })
    .await
    .unwrap();

  let identity = Identity::new("alex", "alex@x.com").with_metadata("full_name", "Alexandra");
  let outcome = reconciler(&store).reconcile(&identity).await.unwrap();

  assert!(matches!(outcome, Reconciled::Updated(_)));
  assert_eq!(store.rows()[0].display_name.as_deref(), Some("Alex"));
}

#[tokio::test]
async fn missing_name_is_filled_in() {
  let store = MemoryProfileStore::new();
  seed(&store, "jane", Some(at(1))).await;

  reconciler(&store).reconcile(&jane()).await.unwrap();

  assert_eq!(store.rows()[0].display_name.as_deref(), Some("Jane Doe"));
}

#[tokio::test]
async fn default_role_is_added_not_substituted() {
  let store = MemoryProfileStore::new();
  let seeded = seed(&store, "root", Some(at(1))).await;
  store
    .update_profile(seeded.row_id, {
      let mut patch = crate::profile::ProfilePatch::touch(at(2));
      patch.roles = Some(set(&["admin"]));
      patch
    })
    .await
    .unwrap();

  reconciler(&store)
    .reconcile(&Identity::new("root", "root@x.com"))
    .await
    .unwrap();

  assert_eq!(store.rows()[0].roles, set(&["admin", "client"]));
}

#[tokio::test]
async fn new_provider_is_added_to_existing_set() {
  let store = MemoryProfileStore::new();
  let reconciler = reconciler(&store);

  reconciler.reconcile(&jane()).await.unwrap();
  reconciler
    .reconcile(&jane().with_metadata("provider", "github"))
    .await
    .unwrap();

  assert_eq!(store.rows()[0].providers, set(&["email", "github"]));
}

#[tokio::test]
async fn repeated_runs_are_idempotent() {
  let store = MemoryProfileStore::new();
  let reconciler = reconciler(&store);

  reconciler.reconcile(&jane()).await.unwrap();
  let first = store.rows();

  for _ in 0..4 {
    let outcome = reconciler.reconcile(&jane()).await.unwrap();
    assert!(matches!(outcome, Reconciled::Updated(_)));
  }
  let last = store.rows();

  assert_eq!(last.len(), 1);
  assert_eq!(last[0].row_id, first[0].row_id);
  assert_eq!(last[0].display_name, first[0].display_name);
  assert_eq!(last[0].roles, first[0].roles);
  assert_eq!(last[0].providers, first[0].providers);
  assert!(last[0].last_authenticated_at >= first[0].last_authenticated_at);
}

// ─── Duplicate collapse ──────────────────────────────────────────────────────

#[tokio::test]
async fn duplicates_collapse_to_oldest_row() {
  let store = MemoryProfileStore::new();
  // Inserted out of order so row ids do not track creation time.
  let t3 = seed(&store, "dup", Some(at(3))).await;
  let t1 = seed(&store, "dup", Some(at(1))).await;
  let t2 = seed(&store, "dup", Some(at(2))).await;
  seed(&store, "someone-else", Some(at(1))).await;

  let outcome = reconciler(&store)
    .reconcile(&Identity::new("dup", "dup@x.com"))
    .await
    .unwrap();

  let Reconciled::Collapsed { survivor, removed } = outcome else {
    panic!("expected a collapse");
  };
  assert_eq!(removed, 2);
  assert_eq!(survivor.row_id, t1.row_id);
  assert!(survivor.roles.contains("client"));
  assert_eq!(survivor.display_name.as_deref(), Some("dup"));

  let remaining = store.rows_for(&SubjectId::new("dup"));
  assert_eq!(remaining.len(), 1);
  assert_eq!(remaining[0].row_id, t1.row_id);
  assert!(remaining.iter().all(|r| r.row_id != t2.row_id && r.row_id != t3.row_id));
  assert_eq!(store.rows().len(), 2, "other subjects are untouched");
}

#[tokio::test]
async fn rows_without_creation_marker_lose_to_dated_rows() {
  let store = MemoryProfileStore::new();
  seed(&store, "dup", None).await;
  let dated = seed(&store, "dup", Some(at(5))).await;

  let outcome = reconciler(&store)
    .reconcile(&Identity::new("dup", "dup@x.com"))
    .await
    .unwrap();

  assert_eq!(outcome.profile().map(|p| p.row_id), Some(dated.row_id));
}

#[tokio::test]
async fn equal_markers_fall_back_to_lowest_row_id() {
  let store = MemoryProfileStore::new();
  let first = seed(&store, "dup", Some(at(4))).await;
  seed(&store, "dup", Some(at(4))).await;

  let outcome = reconciler(&store)
    .reconcile(&Identity::new("dup", "dup@x.com"))
    .await
    .unwrap();

  assert_eq!(outcome.profile().map(|p| p.row_id), Some(first.row_id));
}

#[tokio::test]
async fn collapse_is_self_healing_after_failed_update() {
  let store = MemoryProfileStore::new();
  let oldest = seed(&store, "dup", Some(at(1))).await;
  seed(&store, "dup", Some(at(2))).await;
  store.fail_next(Op::Update, Failure::Unavailable);

  let reconciler = reconciler(&store);
  let identity = Identity::new("dup", "dup@x.com");
  let err = reconciler.reconcile(&identity).await.unwrap_err();
  assert!(matches!(err, Error::StoreUnavailable { step: Step::Update, .. }));

  // Duplicates are already gone; the merge is still pending.
  let rows = store.rows_for(&SubjectId::new("dup"));
  assert_eq!(rows.len(), 1);
  assert!(rows[0].roles.is_empty());

  let outcome = reconciler.reconcile(&identity).await.unwrap();
  assert!(matches!(outcome, Reconciled::Updated(_)));
  let rows = store.rows_for(&SubjectId::new("dup"));
  assert_eq!(rows[0].row_id, oldest.row_id);
  assert!(rows[0].roles.contains("client"));
}

// ─── Failure modes ───────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_subject_is_rejected_without_store_calls() {
  let store = MemoryProfileStore::new();

  let err = reconciler(&store)
    .reconcile(&Identity::new("  ", "x@x.com"))
    .await
    .unwrap_err();

  assert!(matches!(err, Error::MissingIdentity));
  assert!(!err.is_retryable());
  assert_eq!(store.calls(Op::List), 0);
  assert!(store.rows().is_empty());
}

#[tokio::test]
async fn lookup_failure_writes_nothing() {
  let store = MemoryProfileStore::new();
  store.fail_next(Op::List, Failure::Unavailable);

  let err = reconciler(&store).reconcile(&jane()).await.unwrap_err();

  assert!(matches!(err, Error::StoreUnavailable { step: Step::Lookup, .. }));
  assert!(err.is_retryable());
  assert_eq!(store.calls(Op::Upsert), 0);
  assert!(store.rows().is_empty());
}

#[tokio::test]
async fn recheck_failure_is_reported() {
  let store = MemoryProfileStore::new();
  store.fail_next(Op::Find, Failure::Unavailable);

  let err = reconciler(&store).reconcile(&jane()).await.unwrap_err();

  assert_eq!(err.step(), Some(Step::Recheck));
  assert!(store.rows().is_empty());
}

#[tokio::test]
async fn constraint_failure_on_create_is_distinguished() {
  let store = MemoryProfileStore::new();
  store.fail_next(Op::Upsert, Failure::Constraint);
  let reconciler = reconciler(&store);

  let err = reconciler.reconcile(&jane()).await.unwrap_err();
  assert!(matches!(err, Error::ConstraintViolation { .. }));

  // Retrying once succeeds.
  reconciler.reconcile(&jane()).await.unwrap();
  assert_eq!(store.rows().len(), 1);
}

#[tokio::test]
async fn plain_upsert_failure_is_unavailable() {
  let store = MemoryProfileStore::new();
  store.fail_next(Op::Upsert, Failure::Unavailable);

  let err = reconciler(&store).reconcile(&jane()).await.unwrap_err();

  assert!(matches!(err, Error::StoreUnavailable { step: Step::Create, .. }));
}

#[tokio::test]
async fn delete_failure_during_collapse_is_reported() {
  let store = MemoryProfileStore::new();
  seed(&store, "dup", Some(at(1))).await;
  seed(&store, "dup", Some(at(2))).await;
  store.fail_next(Op::Delete, Failure::Unavailable);

  let err = reconciler(&store)
    .reconcile(&Identity::new("dup", "dup@x.com"))
    .await
    .unwrap_err();

  assert_eq!(err.step(), Some(Step::Collapse));
  assert_eq!(store.calls(Op::Update), 0);
}

// ─── Concurrency ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_run_for_same_subject_is_queued() {
  let store = MemoryProfileStore::new();
  let reconciler = reconciler(&store);

  let mut ticket = reconciler.in_flight().try_begin(&jane()).expect("idle subject");

  let outcome = reconciler.reconcile(&jane()).await.unwrap();
  assert_eq!(outcome, Reconciled::InProgress);
  assert_eq!(store.calls(Op::List), 0);

  assert_eq!(ticket.next_queued(), Some(jane()));
  assert_eq!(ticket.next_queued(), None);
  let outcome = reconciler.reconcile(&jane()).await.unwrap();
  assert!(matches!(outcome, Reconciled::Created(_)));
}

#[tokio::test]
async fn identity_arriving_mid_run_is_reconciled_before_finishing() {
  let store = MemoryProfileStore::new();
  // Yield at the first lookup so the second call lands while the first runs.
  let reconciler = Reconciler::new(Arc::new(store.with_schedule([3])), ReconcilerConfig::default());
  let via_google = jane().with_metadata("provider", "google");
  let via_email = jane().with_metadata("provider", "email");

  let (first, second) = tokio::join!(reconciler.reconcile(&via_google), reconciler.reconcile(&via_email));

  assert_eq!(second.unwrap(), Reconciled::InProgress);
  let Reconciled::Updated(profile) = first.unwrap() else {
    panic!("queued identity should update the row the first run created");
  };
  assert_eq!(profile.providers, set(&["email", "google"]));
  assert_eq!(store.rows().len(), 1);
  assert_eq!(reconciler.in_flight().state(&SubjectId::new("jane")), RunState::Idle);
}

#[tokio::test]
async fn recheck_adopts_row_created_after_lookup() {
  let store = MemoryProfileStore::new();
  // Fast path: list, then pause before the recheck.
  let slow = store.with_schedule([0, 5]);
  let fast = store.with_schedule([]);

  let slow_run = Reconciler::new(Arc::new(slow), ReconcilerConfig::default());
  let fast_run = Reconciler::new(Arc::new(fast), ReconcilerConfig::default());

  let (jane_a, jane_b) = (jane(), jane());
  let (a, b) = tokio::join!(slow_run.reconcile(&jane_a), fast_run.reconcile(&jane_b));
  a.unwrap();
  b.unwrap();

  assert_eq!(store.rows().len(), 1);
}

fn concurrent_first_sign_in(schedule_a: Vec<u8>, schedule_b: Vec<u8>) -> Vec<Profile> {
  let runtime = tokio::runtime::Builder::new_current_thread()
    .build()
    .unwrap();

  runtime.block_on(async {
    let store = MemoryProfileStore::new();
    // Two reconcilers model two devices: separate in-flight guards, shared
    // table.
    let a = Reconciler::new(Arc::new(store.with_schedule(schedule_a)), ReconcilerConfig::default());
    let b = Reconciler::new(Arc::new(store.with_schedule(schedule_b)), ReconcilerConfig::default());
    let identity = jane();

    let (ra, rb) = tokio::join!(a.reconcile(&identity), b.reconcile(&identity));
    ra.unwrap();
    rb.unwrap();
    store.rows()
  })
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(64))]

  /// Any interleaving of two first-time reconciliations leaves one row.
  #[test]
  fn prop_concurrent_first_sign_in_leaves_one_row(
    schedule_a in proptest::collection::vec(0u8..4, 0..4),
    schedule_b in proptest::collection::vec(0u8..4, 0..4),
  ) {
    let rows = concurrent_first_sign_in(schedule_a, schedule_b);
    prop_assert_eq!(rows.len(), 1);
    prop_assert_eq!(rows[0].display_name.as_deref(), Some("Jane Doe"));
    prop_assert_eq!(&rows[0].roles, &set(&["client"]));
  }

  /// Running N times changes nothing but the timestamp.
  #[test]
  fn prop_reconcile_is_idempotent(runs in 1usize..6, has_name in any::<bool>()) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let identity = if has_name { jane() } else { Identity::new("jane", "jane@x.com") };

    let (first, last) = runtime.block_on(async {
      let store = MemoryProfileStore::new();
      let reconciler = reconciler(&store);
      reconciler.reconcile(&identity).await.unwrap();
      let first = store.rows();
      for _ in 1..runs {
        reconciler.reconcile(&identity).await.unwrap();
      }
      (first, store.rows())
    });

    prop_assert_eq!(last.len(), 1);
    prop_assert_eq!(&last[0].display_name, &first[0].display_name);
    prop_assert_eq!(&last[0].roles, &first[0].roles);
    prop_assert_eq!(&last[0].providers, &first[0].providers);
    prop_assert!(last[0].last_authenticated_at - first[0].last_authenticated_at >= Duration::zero());
  }
}
