//! Session-gated routing decisions.
//!
//! Pure policy: given a request path and whether the caller holds a valid
//! session, decide what to do. The HTTP layer supplies both facts.

use serde::{Deserialize, Serialize};

/// What the guard wants done with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
  Serve,
  RedirectToLogin,
  RedirectToHome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutePolicy {
  pub login_path:        String,
  pub home_path:         String,
  /// OAuth callback; always reachable so a sign-in can complete.
  pub callback_path:     String,
  /// Path prefixes served as static assets.
  pub static_prefixes:   Vec<String>,
  /// File extensions (without the dot) treated as static assets when the
  /// file sits at the root, like `/favicon.ico`. Deeper assets belong under
  /// one of `static_prefixes`.
  pub static_extensions: Vec<String>,
}

impl Default for RoutePolicy {
  fn default() -> Self {
    Self {
      login_path:        "/login".to_owned(),
      home_path:         "/".to_owned(),
      callback_path:     "/auth/callback".to_owned(),
      static_prefixes:   vec!["/static/".to_owned()],
      static_extensions: ["css", "gif", "ico", "jpeg", "jpg", "js", "png", "svg", "webp"]
        .into_iter()
        .map(str::to_owned)
        .collect(),
    }
  }
}

impl RoutePolicy {
  /// Requests that skip the session check entirely.
  pub fn bypasses(&self, path: &str) -> bool {
    same_path(path, &self.callback_path) || self.is_static(path)
  }

  pub fn is_login(&self, path: &str) -> bool { same_path(path, &self.login_path) }

  /// | session valid | login route | decision |
  /// |---|---|---|
  /// | no  | no  | redirect to login |
  /// | no  | yes | serve |
  /// | yes | no  | serve |
  /// | yes | yes | redirect to home |
  pub fn decide(&self, path: &str, session_valid: bool) -> RouteDecision {
    match (session_valid, self.is_login(path)) {
      (false, false) => RouteDecision::RedirectToLogin,
      (false, true) | (true, false) => RouteDecision::Serve,
      (true, true) => RouteDecision::RedirectToHome,
    }
  }

  fn is_static(&self, path: &str) -> bool {
    if self
      .static_prefixes
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
    {
      return true;
    }

    let Some(file) = path.strip_prefix('/').filter(|rest| !rest.contains('/')) else {
      return false;
    };
    file
      .rsplit_once('.')
      .is_some_and(|(stem, ext)| {
        !stem.is_empty()
          && self
            .static_extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext))
      })
  }
}

/// Equal up to a single trailing slash.
fn same_path(path: &str, route: &str) -> bool {
  path == route || path.strip_suffix('/') == Some(route)
}
