//! Session-gated route guard middleware.
//!
//! Resolves the caller's session from cookies, refreshing an expired access
//! token when a refresh cookie is present, then applies
//! [`RoutePolicy::decide`](resilience_core::route::RoutePolicy::decide).
//! Never touches the profile store.

use axum::{
  extract::{Request, State},
  http::{HeaderMap, HeaderValue, header},
  middleware::Next,
  response::{IntoResponse, Redirect, Response},
};
use resilience_core::{
  route::RouteDecision,
  session::{Session, SessionProvider},
  store::ProfileStore,
};
use tracing::{debug, warn};

use crate::{AppState, cookies};

/// The validated session, inserted into request extensions for handlers.
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Session);

/// What cookie inspection found.
#[derive(Default)]
struct Resolved {
  session:     Option<Session>,
  /// Cookies to rewrite on the response.
  set_cookies: Vec<HeaderValue>,
}

pub async fn session_guard<S, P>(
  State(state): State<AppState<S, P>>,
  mut req: Request,
  next: Next,
) -> Response
where
  S: ProfileStore + 'static,
  P: SessionProvider + 'static,
{
  let path = req.uri().path().to_owned();
  if state.policy.bypasses(&path) {
    return next.run(req).await;
  }

  let resolved = resolve(&state, req.headers()).await;
  let decision = state.policy.decide(&path, resolved.session.is_some());
  debug!(path = %path, ?decision, "route guard");

  let mut resp = match decision {
    RouteDecision::RedirectToLogin => Redirect::to(&state.policy.login_path).into_response(),
    RouteDecision::RedirectToHome => Redirect::to(&state.policy.home_path).into_response(),
    RouteDecision::Serve => {
      if let Some(session) = resolved.session {
        req.extensions_mut().insert(CurrentSession(session));
      }
      next.run(req).await
    }
  };

  for cookie in resolved.set_cookies {
    resp.headers_mut().append(header::SET_COOKIE, cookie);
  }
  resp
}

async fn resolve<S, P>(state: &AppState<S, P>, headers: &HeaderMap) -> Resolved
where
  S: ProfileStore + 'static,
  P: SessionProvider + 'static,
{
  let secure = state.config.secure_cookies;
  let access = cookies::get(headers, cookies::ACCESS_COOKIE);
  let refresh = cookies::get(headers, cookies::REFRESH_COOKIE);

  if let Some(token) = access {
    match state.provider.get_session(token.to_owned()).await {
      Ok(Some(session)) => return Resolved { session: Some(session), set_cookies: Vec::new() },
      Ok(None) => debug!("access token no longer valid"),
      Err(e) => {
        warn!("session lookup failed: {e}");
        return Resolved::default();
      }
    }
  }

  let Some(refresh) = refresh else {
    // A dead access cookie with nothing to refresh it is just noise.
    return if access.is_some() { forget(secure) } else { Resolved::default() };
  };

  match state.provider.refresh_session(refresh.to_owned()).await {
    Ok(Some(session)) => match cookies::for_session(&session, secure) {
      Ok(set_cookies) => {
        debug!(subject = %session.subject_id(), "session refreshed");
        Resolved { session: Some(session), set_cookies }
      }
      Err(e) => {
        warn!("refreshed session cannot be stored in cookies: {e}");
        Resolved::default()
      }
    },
    Ok(None) => forget(secure),
    Err(e) => {
      warn!("session refresh failed: {e}");
      Resolved::default()
    }
  }
}

fn forget(secure: bool) -> Resolved {
  Resolved {
    session:     None,
    set_cookies: cookies::cleared(secure).unwrap_or_default(),
  }
}
