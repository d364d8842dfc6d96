//! HTTP surface for ResiliencePro.
//!
//! Exposes an axum [`Router`] with OAuth sign-in pages, the session-gated
//! route guard, and a JSON view of the caller's profile, backed by any
//! [`ProfileStore`] and [`SessionProvider`].

pub mod cookies;
pub mod error;
pub mod guard;
pub mod handlers;

pub use error::Error;

use std::{path::PathBuf, sync::Arc};

use axum::{
  Router,
  middleware::from_fn_with_state,
  routing::{get, post},
};
use resilience_core::{
  reconcile::ReconcilerConfig, route::RoutePolicy, session::SessionProvider,
  store::ProfileStore,
};
use resilience_gotrue::GoTrueConfig;
use serde::Deserialize;
use tower_http::{services::ServeDir, trace::TraceLayer};

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml` and
/// `RESILIENCE_*` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:             String,
  #[serde(default = "default_port")]
  pub port:             u16,
  #[serde(default = "default_store_path")]
  pub store_path:       PathBuf,
  /// Base URL of the hosted auth service.
  pub auth_url:         String,
  /// Public API key for the hosted auth service.
  pub auth_api_key:     String,
  /// Externally visible origin of this server; OAuth redirects come back here.
  #[serde(default = "default_public_url")]
  pub public_url:       String,
  #[serde(default = "default_role")]
  pub default_role:     String,
  #[serde(default = "default_provider")]
  pub default_provider: String,
  /// OAuth providers offered on the login page.
  #[serde(default = "default_oauth_providers")]
  pub oauth_providers:  Vec<String>,
  /// Mark cookies `Secure`. Enable whenever served over HTTPS.
  #[serde(default)]
  pub secure_cookies:   bool,
  #[serde(default = "default_login_path")]
  pub login_path:       String,
  #[serde(default = "default_home_path")]
  pub home_path:        String,
  #[serde(default = "default_callback_path")]
  pub callback_path:    String,
  /// Directory served under `/static/`. Nothing is served when unset.
  #[serde(default)]
  pub static_dir:       Option<PathBuf>,
}

fn default_host() -> String { "127.0.0.1".to_owned() }
fn default_port() -> u16 { 8080 }
fn default_store_path() -> PathBuf { PathBuf::from("resilience.db") }
fn default_public_url() -> String { "http://localhost:8080".to_owned() }
fn default_role() -> String { ReconcilerConfig::default().default_role }
fn default_provider() -> String { ReconcilerConfig::default().default_provider }
fn default_oauth_providers() -> Vec<String> { vec!["google".to_owned()] }
fn default_login_path() -> String { RoutePolicy::default().login_path }
fn default_home_path() -> String { RoutePolicy::default().home_path }
fn default_callback_path() -> String { RoutePolicy::default().callback_path }

impl ServerConfig {
  pub fn route_policy(&self) -> RoutePolicy {
    RoutePolicy {
      login_path: self.login_path.clone(),
      home_path: self.home_path.clone(),
      callback_path: self.callback_path.clone(),
      ..RoutePolicy::default()
    }
  }

  pub fn reconciler_config(&self) -> ReconcilerConfig {
    ReconcilerConfig {
      default_role:     self.default_role.clone(),
      default_provider: self.default_provider.clone(),
    }
  }

  pub fn gotrue_config(&self) -> GoTrueConfig {
    GoTrueConfig {
      base_url: self.auth_url.clone(),
      api_key:  self.auth_api_key.clone(),
    }
  }

  /// Absolute URL the auth service redirects back to after sign-in.
  pub fn callback_url(&self) -> String {
    format!("{}{}", self.public_url.trim_end_matches('/'), self.callback_path)
  }
}

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<S, P> {
  pub store:    Arc<S>,
  pub provider: Arc<P>,
  pub config:   Arc<ServerConfig>,
  pub policy:   Arc<RoutePolicy>,
}

impl<S, P> AppState<S, P> {
  pub fn new(store: Arc<S>, provider: Arc<P>, config: ServerConfig) -> Self {
    let policy = Arc::new(config.route_policy());
    Self { store, provider, config: Arc::new(config), policy }
  }
}

// Manual impl: the derive would demand `S: Clone, P: Clone`.
impl<S, P> Clone for AppState<S, P> {
  fn clone(&self) -> Self {
    Self {
      store:    Arc::clone(&self.store),
      provider: Arc::clone(&self.provider),
      config:   Arc::clone(&self.config),
      policy:   Arc::clone(&self.policy),
    }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the application [`Router`]. Every route, the fallback included,
/// passes through [`guard::session_guard`].
pub fn router<S, P>(state: AppState<S, P>) -> Router
where
  S: ProfileStore + 'static,
  P: SessionProvider + 'static,
{
  let config = Arc::clone(&state.config);

  let mut app = Router::new()
    .route(&config.login_path,    get(handlers::login::<S, P>))
    .route(&config.callback_path, get(handlers::callback::<S, P>))
    .route(&config.home_path,     get(handlers::home))
    .route("/logout",             post(handlers::logout::<S, P>))
    .route("/api/profile",        get(handlers::profile::<S, P>));

  if let Some(dir) = &config.static_dir {
    app = app.nest_service("/static", ServeDir::new(dir));
  }

  app
    .fallback(handlers::not_found)
    .layer(from_fn_with_state(state.clone(), guard::session_guard::<S, P>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
