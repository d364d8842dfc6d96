//! Sessions and the `SessionProvider` trait.
//!
//! The hosted identity provider owns sign-in. This crate only needs to ask it
//! whether a token is valid, hear about sign-in/sign-out transitions, and ask
//! it to sign a session out.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::identity::{Identity, SubjectId};

/// Default capacity of a provider's notification channel.
pub const EVENT_CAPACITY: usize = 64;

/// A valid session issued by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
  pub access_token:  String,
  pub refresh_token: Option<String>,
  pub expires_at:    Option<DateTime<Utc>>,
  pub identity:      Identity,
}

impl Session {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| at <= now)
  }

  pub fn subject_id(&self) -> &SubjectId { &self.identity.subject_id }
}

/// A session transition pushed by the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
  /// A completed authentication (password, OAuth code exchange, ...).
  SignedIn(Identity),
  /// An existing session was renewed; no new authentication happened.
  TokenRefreshed(Identity),
  /// A session ended. `None` when the provider cannot tell whose it was,
  /// which ends every session it has reported.
  SignedOut(Option<SubjectId>),
}

impl SessionEvent {
  /// The identity now signed in, if any.
  pub fn identity(&self) -> Option<&Identity> {
    match self {
      SessionEvent::SignedIn(identity) | SessionEvent::TokenRefreshed(identity) => {
        Some(identity)
      }
      SessionEvent::SignedOut(_) => None,
    }
  }
}

/// Fan-out for [`SessionEvent`]s, owned by a provider implementation.
#[derive(Debug, Clone)]
pub struct SessionEvents {
  tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionEvents {
  fn default() -> Self { Self::new(EVENT_CAPACITY) }
}

impl SessionEvents {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Deliver `event` to every current subscriber. Having no subscribers is
  /// not an error.
  pub fn emit(&self, event: SessionEvent) {
    let delivered = self.tx.send(event).unwrap_or(0);
    tracing::trace!(delivered, "session event emitted");
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> { self.tx.subscribe() }

  pub fn receiver_count(&self) -> usize { self.tx.receiver_count() }
}

/// Abstraction over the hosted identity/session provider.
pub trait SessionProvider: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Resolve an access token to its session. `Ok(None)` means the token is
  /// not (or no longer) valid.
  fn get_session(
    &self,
    access_token: String,
  ) -> impl Future<Output = Result<Option<Session>, Self::Error>> + Send + '_;

  /// Trade a refresh token for a fresh session. `Ok(None)` means the refresh
  /// token was rejected. Emits [`SessionEvent::TokenRefreshed`] on success.
  fn refresh_session(
    &self,
    refresh_token: String,
  ) -> impl Future<Output = Result<Option<Session>, Self::Error>> + Send + '_;

  /// Complete an OAuth authorization-code (PKCE) flow. Emits
  /// [`SessionEvent::SignedIn`] on success.
  fn exchange_code(
    &self,
    code: String,
    code_verifier: String,
  ) -> impl Future<Output = Result<Session, Self::Error>> + Send + '_;

  /// Revoke the session behind `access_token`. Emits
  /// [`SessionEvent::SignedOut`].
  fn sign_out(
    &self,
    access_token: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// URL that starts an OAuth sign-in with `provider`.
  fn authorize_url(
    &self,
    provider: &str,
    code_challenge: &str,
    redirect_to: &str,
  ) -> Result<String, Self::Error>;

  /// Subscribe to session transitions. Dropping the receiver unsubscribes.
  fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}
