//! JSON bodies exchanged with the auth server.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use resilience_core::{
  identity::{Identity, SubjectId},
  session::Session,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PkceGrant<'a> {
  pub auth_code:     &'a str,
  pub code_verifier: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RefreshGrant<'a> {
  pub refresh_token: &'a str,
}

// ─── Responses ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
  pub access_token:  String,
  #[serde(default)]
  pub refresh_token: Option<String>,
  /// Seconds from issue.
  #[serde(default)]
  pub expires_in:    Option<i64>,
  /// Unix timestamp; preferred over `expires_in` when present.
  #[serde(default)]
  pub expires_at:    Option<i64>,
  pub user:          UserResponse,
}

impl TokenResponse {
  pub fn into_session(self, now: DateTime<Utc>) -> Session {
    let expires_at = self
      .expires_at
      .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
      .or_else(|| self.expires_in.map(|secs| now + Duration::seconds(secs)));

    Session {
      access_token: self.access_token,
      refresh_token: self.refresh_token,
      expires_at,
      identity: self.user.into_identity(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct UserResponse {
  pub id:            String,
  #[serde(default)]
  pub email:         Option<String>,
  #[serde(default)]
  pub user_metadata: Option<Map<String, Value>>,
  #[serde(default)]
  pub app_metadata:  Option<Map<String, Value>>,
}

impl UserResponse {
  /// User metadata becomes the identity's metadata bag. The signing-in
  /// provider lives in app metadata and is copied over unless user metadata
  /// already names one.
  pub fn into_identity(self) -> Identity {
    let mut metadata = self.user_metadata.unwrap_or_default();
    let provider = self
      .app_metadata
      .as_ref()
      .and_then(|app| app.get("provider"))
      .filter(|p| p.is_string());
    if let Some(provider) = provider {
      metadata
        .entry("provider")
        .or_insert_with(|| provider.clone());
    }

    Identity {
      subject_id: self.id.into(),
      email: self.email.unwrap_or_default(),
      metadata,
    }
  }
}

/// The auth server is not consistent about which field carries the message.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
  #[serde(default)]
  pub msg:               Option<String>,
  #[serde(default)]
  pub message:           Option<String>,
  #[serde(default)]
  pub error_description: Option<String>,
  #[serde(default)]
  pub error:             Option<String>,
}

impl ErrorBody {
  pub fn message(self) -> Option<String> {
    self
      .msg
      .or(self.message)
      .or(self.error_description)
      .or(self.error)
  }
}

// ─── Access tokens ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Claims {
  sub: String,
}

/// The `sub` claim of a JWT access token, read without verifying the
/// signature. Only used to label events; never for authorization.
pub fn token_subject(access_token: &str) -> Option<SubjectId> {
  let payload = access_token.split('.').nth(1)?;
  let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
  let claims: Claims = serde_json::from_slice(&bytes).ok()?;
  Some(claims.sub).filter(|s| !s.trim().is_empty()).map(SubjectId::new)
}
