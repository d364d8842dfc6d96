//! Route handlers.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | login path | Login page; `?provider=<name>` starts OAuth |
//! | `GET`  | callback path | Completes OAuth, sets session cookies |
//! | `POST` | `/logout` | Signs out, clears cookies |
//! | `GET`  | home path | Signed-in landing page |
//! | `GET`  | `/api/profile` | 404 until reconciliation has run |

use axum::{
  Extension, Json,
  extract::{Query, State},
  http::{HeaderMap, HeaderValue, header},
  response::{Html, IntoResponse, Redirect, Response},
};
use resilience_core::{
  profile::Profile,
  session::SessionProvider,
  store::ProfileStore,
};
use resilience_gotrue::PkcePair;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{AppState, Error, cookies, guard::CurrentSession};

// ─── Login ────────────────────────────────────────────────────────────────────

/// Why the caller was sent back to the login page. Travels as a short code in
/// the `error` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginError {
  UnknownProvider,
  MissingCode,
  ExchangeFailed,
}

impl LoginError {
  pub fn code(self) -> &'static str {
    match self {
      LoginError::UnknownProvider => "unknown_provider",
      LoginError::MissingCode => "missing_code",
      LoginError::ExchangeFailed => "exchange_failed",
    }
  }

  pub fn from_code(code: &str) -> Option<Self> {
    [LoginError::UnknownProvider, LoginError::MissingCode, LoginError::ExchangeFailed]
      .into_iter()
      .find(|e| e.code() == code)
  }

  fn message(self) -> &'static str {
    match self {
      LoginError::UnknownProvider => "That sign-in provider is not available.",
      LoginError::MissingCode => "Sign-in was cancelled or did not complete.",
      LoginError::ExchangeFailed => "Sign-in failed. Please try again.",
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct LoginParams {
  pub provider: Option<String>,
  pub error:    Option<String>,
}

/// `GET /login[?provider=<name>]`
pub async fn login<S, P>(
  State(state): State<AppState<S, P>>,
  Query(params): Query<LoginParams>,
) -> Result<Response, Error>
where
  S: ProfileStore + 'static,
  P: SessionProvider + 'static,
{
  let Some(provider) = params.provider.filter(|p| !p.is_empty()) else {
    let error = params.error.as_deref().and_then(LoginError::from_code);
    return Ok(Html(login_page(&state.config.oauth_providers, error)).into_response());
  };

  if !state.config.oauth_providers.contains(&provider) {
    return back_to_login(&state, LoginError::UnknownProvider);
  }

  let pkce = PkcePair::generate();
  let url = state
    .provider
    .authorize_url(&provider, &pkce.challenge, &state.config.callback_url())
    .map_err(Error::provider)?;

  let mut resp = Redirect::to(&url).into_response();
  resp.headers_mut().append(
    header::SET_COOKIE,
    cookies::set(
      cookies::VERIFIER_COOKIE,
      &pkce.verifier,
      Some(cookies::VERIFIER_MAX_AGE),
      state.config.secure_cookies,
    )?,
  );
  Ok(resp)
}

// ─── Callback ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
  pub code:              Option<String>,
  pub error:             Option<String>,
  pub error_description: Option<String>,
}

/// `GET /auth/callback?code=<code>`
///
/// Profile reconciliation is driven by the provider's sign-in event, not by
/// this handler, so a reconciliation failure cannot block sign-in.
pub async fn callback<S, P>(
  State(state): State<AppState<S, P>>,
  Query(params): Query<CallbackParams>,
  headers: HeaderMap,
) -> Result<Response, Error>
where
  S: ProfileStore + 'static,
  P: SessionProvider + 'static,
{
  let code = params.code.filter(|c| !c.is_empty());
  let verifier = cookies::get(&headers, cookies::VERIFIER_COOKIE);

  let (Some(code), Some(verifier)) = (code, verifier) else {
    let reason = params
      .error_description
      .or(params.error)
      .unwrap_or_else(|| "no code or verifier".to_owned());
    warn!(%reason, "oauth callback without a usable code");
    return back_to_login(&state, LoginError::MissingCode);
  };

  let session = match state.provider.exchange_code(code, verifier.to_owned()).await {
    Ok(session) => session,
    Err(e) => {
      warn!("code exchange failed: {e}");
      return back_to_login(&state, LoginError::ExchangeFailed);
    }
  };
  info!(subject = %session.subject_id(), "signed in");

  let secure = state.config.secure_cookies;
  let mut set_cookies = cookies::for_session(&session, secure)?;
  set_cookies.push(cookies::clear(cookies::VERIFIER_COOKIE, secure)?);
  Ok(with_cookies(Redirect::to(&state.config.home_path), set_cookies))
}

// ─── Logout ───────────────────────────────────────────────────────────────────

/// `POST /logout`
pub async fn logout<S, P>(
  State(state): State<AppState<S, P>>,
  Extension(CurrentSession(session)): Extension<CurrentSession>,
) -> Result<Response, Error>
where
  S: ProfileStore + 'static,
  P: SessionProvider + 'static,
{
  // Local cookies are cleared regardless; the token expires on its own.
  if let Err(e) = state.provider.sign_out(session.access_token.clone()).await {
    warn!(subject = %session.subject_id(), "remote sign-out failed: {e}");
  }

  let set_cookies = cookies::cleared(state.config.secure_cookies)?;
  Ok(with_cookies(Redirect::to(&state.config.login_path), set_cookies))
}

// ─── Home ─────────────────────────────────────────────────────────────────────

/// `GET /`
pub async fn home(Extension(CurrentSession(session)): Extension<CurrentSession>) -> Html<String> {
  Html(format!(
    "<!doctype html>\n<title>ResiliencePro</title>\n\
     <p>Signed in as {}.</p>\n\
     <p><a href=\"/api/profile\">Your profile</a></p>\n\
     <form method=\"post\" action=\"/logout\"><button>Sign out</button></form>\n",
    escape_html(&session.identity.email),
  ))
}

// ─── Profile ──────────────────────────────────────────────────────────────────

/// `GET /api/profile`
pub async fn profile<S, P>(
  State(state): State<AppState<S, P>>,
  Extension(CurrentSession(session)): Extension<CurrentSession>,
) -> Result<Json<Profile>, Error>
where
  S: ProfileStore + 'static,
  P: SessionProvider + 'static,
{
  let subject_id = session.subject_id().clone();
  state
    .store
    .find_profile(subject_id.clone())
    .await
    .map_err(Error::store)?
    .map(Json)
    .ok_or_else(|| Error::NotFound(format!("no profile yet for {subject_id}")))
}

pub async fn not_found() -> Error { Error::NotFound("no such route".to_owned()) }

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn back_to_login<S, P>(state: &AppState<S, P>, error: LoginError) -> Result<Response, Error> {
  let location = format!("{}?error={}", state.config.login_path, error.code());
  let clear = cookies::clear(cookies::VERIFIER_COOKIE, state.config.secure_cookies)?;
  Ok(with_cookies(Redirect::to(&location), vec![clear]))
}

fn with_cookies(resp: impl IntoResponse, set_cookies: Vec<HeaderValue>) -> Response {
  let mut resp = resp.into_response();
  for cookie in set_cookies {
    resp.headers_mut().append(header::SET_COOKIE, cookie);
  }
  resp
}

fn login_page(providers: &[String], error: Option<LoginError>) -> String {
  let mut page = String::from("<!doctype html>\n<title>Sign in · ResiliencePro</title>\n<h1>Sign in</h1>\n");
  if let Some(error) = error {
    page.push_str(&format!("<p class=\"error\">{}</p>\n", error.message()));
  }
  page.push_str("<ul>\n");
  for provider in providers {
    let provider = escape_html(provider);
    page.push_str(&format!("<li><a href=\"?provider={provider}\">Continue with {provider}</a></li>\n"));
  }
  page.push_str("</ul>\n");
  page
}

fn escape_html(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    match c {
      '&' => out.push_str("&amp;"),
      '<' => out.push_str("&lt;"),
      '>' => out.push_str("&gt;"),
      '"' => out.push_str("&quot;"),
      '\'' => out.push_str("&#39;"),
      c => out.push(c),
    }
  }
  out
}
