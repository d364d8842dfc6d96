//! Minimal cookie handling for the session tokens.

use axum::http::{HeaderMap, HeaderValue, header};
use chrono::Utc;
use resilience_core::session::Session;

use crate::Error;

pub const ACCESS_COOKIE: &str = "rp_access_token";
pub const REFRESH_COOKIE: &str = "rp_refresh_token";
/// PKCE verifier held between the login redirect and the callback.
pub const VERIFIER_COOKIE: &str = "rp_code_verifier";

/// Lifetime of the refresh-token cookie, in seconds.
pub const REFRESH_MAX_AGE: i64 = 30 * 24 * 60 * 60;
/// Lifetime of the verifier cookie, in seconds.
pub const VERIFIER_MAX_AGE: i64 = 10 * 60;

/// First value of cookie `name` across all `Cookie` headers.
pub fn get<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
  headers
    .get_all(header::COOKIE)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(';'))
    .filter_map(|pair| pair.trim().split_once('='))
    .find(|(key, value)| *key == name && !value.is_empty())
    .map(|(_, value)| value)
}

/// `Set-Cookie` value for an HTTP-only, same-site cookie scoped to `/`.
pub fn set(name: &str, value: &str, max_age: Option<i64>, secure: bool) -> Result<HeaderValue, Error> {
  let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax");
  if let Some(max_age) = max_age {
    cookie.push_str(&format!("; Max-Age={}", max_age.max(0)));
  }
  if secure {
    cookie.push_str("; Secure");
  }
  Ok(HeaderValue::from_str(&cookie)?)
}

/// `Set-Cookie` value that expires cookie `name` immediately.
pub fn clear(name: &str, secure: bool) -> Result<HeaderValue, Error> { set(name, "", Some(0), secure) }

/// Cookies carrying `session`'s tokens. The access cookie lives as long as the
/// token does.
pub fn for_session(session: &Session, secure: bool) -> Result<Vec<HeaderValue>, Error> {
  let access_max_age = session
    .expires_at
    .map(|at| (at - Utc::now()).num_seconds());

  let mut cookies = vec![set(ACCESS_COOKIE, &session.access_token, access_max_age, secure)?];
  if let Some(refresh) = &session.refresh_token {
    cookies.push(set(REFRESH_COOKIE, refresh, Some(REFRESH_MAX_AGE), secure)?);
  }
  Ok(cookies)
}

/// Cookies that forget the session entirely.
pub fn cleared(secure: bool) -> Result<Vec<HeaderValue>, Error> {
  Ok(vec![clear(ACCESS_COOKIE, secure)?, clear(REFRESH_COOKIE, secure)?])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reads_named_cookie_among_many() {
    let mut headers = HeaderMap::new();
    headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; rp_access_token=abc.def"));
    headers.append(header::COOKIE, HeaderValue::from_static("rp_refresh_token=r1"));

    assert_eq!(get(&headers, ACCESS_COOKIE), Some("abc.def"));
    assert_eq!(get(&headers, REFRESH_COOKIE), Some("r1"));
    assert_eq!(get(&headers, VERIFIER_COOKIE), None);
  }

  #[test]
  fn empty_value_counts_as_absent() {
    let mut headers = HeaderMap::new();
    headers.insert(header::COOKIE, HeaderValue::from_static("rp_access_token="));
    assert_eq!(get(&headers, ACCESS_COOKIE), None);
  }

  #[test]
  fn set_and_clear_attributes() {
    let value = set(ACCESS_COOKIE, "tok", Some(60), true).unwrap();
    assert_eq!(
      value.to_str().unwrap(),
      "rp_access_token=tok; Path=/; HttpOnly; SameSite=Lax; Max-Age=60; Secure"
    );

    let value = clear(REFRESH_COOKIE, false).unwrap();
    assert_eq!(value.to_str().unwrap(), "rp_refresh_token=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
  }

  #[test]
  fn control_characters_are_rejected() {
    assert!(set(ACCESS_COOKIE, "bad\nvalue", None, false).is_err());
  }
}
