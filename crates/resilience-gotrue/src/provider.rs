//! [`GoTrueProvider`], the hosted-auth implementation of [`SessionProvider`].

use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use resilience_core::session::{Session, SessionEvent, SessionEvents, SessionProvider};

use crate::{
  Error, Result,
  pkce::CHALLENGE_METHOD,
  wire::{ErrorBody, PkceGrant, RefreshGrant, TokenResponse, UserResponse, token_subject},
};

/// Connection settings for the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoTrueConfig {
  /// Project URL; `/auth/v1` is appended.
  pub base_url: String,
  /// Public (anon) API key sent as `apikey` on every request.
  pub api_key:  String,
}

/// Cheap to clone: the inner [`reqwest::Client`] and event channel are
/// shared.
#[derive(Clone)]
pub struct GoTrueProvider {
  client: Client,
  config: GoTrueConfig,
  events: SessionEvents,
}

impl GoTrueProvider {
  pub fn new(config: GoTrueConfig) -> Result<Self> {
    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
    Ok(Self { client, config, events: SessionEvents::default() })
  }

  pub fn config(&self) -> &GoTrueConfig { &self.config }

  fn url(&self, path: &str) -> String {
    format!("{}/auth/v1{}", self.config.base_url.trim_end_matches('/'), path)
  }

  fn request(&self, method: Method, path: &str) -> RequestBuilder {
    self
      .client
      .request(method, self.url(path))
      .header("apikey", &self.config.api_key)
  }

  /// A rejected code or refresh token comes back as an [`Error::Status`]
  /// carrying the server's message; see [`Error::is_rejection`].
  async fn token<B: Serialize>(&self, grant_type: &str, body: &B) -> Result<Session> {
    let resp = self
      .request(Method::POST, "/token")
      .query(&[("grant_type", grant_type)])
      .json(body)
      .send()
      .await?;

    let token: TokenResponse = checked(resp).await?.json().await?;
    Ok(token.into_session(Utc::now()))
  }
}

/// Turn a non-success response into [`Error::Status`].
async fn checked(resp: Response) -> Result<Response> {
  let status = resp.status();
  if status.is_success() {
    return Ok(resp);
  }

  let text = resp.text().await.unwrap_or_default();
  let message = serde_json::from_str::<ErrorBody>(&text)
    .ok()
    .and_then(ErrorBody::message)
    .unwrap_or(text);
  Err(Error::Status { status, message })
}

// ─── SessionProvider impl ────────────────────────────────────────────────────

impl SessionProvider for GoTrueProvider {
  type Error = Error;

  #[instrument(skip_all)]
  async fn get_session(&self, access_token: String) -> Result<Option<Session>> {
    let resp = self
      .request(Method::GET, "/user")
      .bearer_auth(&access_token)
      .send()
      .await?;

    if matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
      return Ok(None);
    }

    let user: UserResponse = checked(resp).await?.json().await?;
    Ok(Some(Session {
      access_token,
      refresh_token: None,
      expires_at: None,
      identity: user.into_identity(),
    }))
  }

  #[instrument(skip_all)]
  async fn refresh_session(&self, refresh_token: String) -> Result<Option<Session>> {
    let session = match self
      .token("refresh_token", &RefreshGrant { refresh_token: &refresh_token })
      .await
    {
      Ok(session) => session,
      // An unknown or spent refresh token is a rejection, not an outage.
      Err(e) if e.is_rejection() => {
        debug!("refresh rejected: {e}");
        return Ok(None);
      }
      Err(e) => return Err(e),
    };

    self
      .events
      .emit(SessionEvent::TokenRefreshed(session.identity.clone()));
    Ok(Some(session))
  }

  #[instrument(skip_all)]
  async fn exchange_code(&self, code: String, code_verifier: String) -> Result<Session> {
    let grant = PkceGrant { auth_code: &code, code_verifier: &code_verifier };
    let session = self.token("pkce", &grant).await?;

    debug!(subject = %session.identity.subject_id, "code exchanged");
    self
      .events
      .emit(SessionEvent::SignedIn(session.identity.clone()));
    Ok(session)
  }

  #[instrument(skip_all)]
  async fn sign_out(&self, access_token: String) -> Result<()> {
    let subject = token_subject(&access_token);
    let resp = self
      .request(Method::POST, "/logout")
      .bearer_auth(&access_token)
      .send()
      .await?;

    // An already-invalid token is as signed out as it gets.
    if !matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
      checked(resp).await?;
    }

    self.events.emit(SessionEvent::SignedOut(subject));
    Ok(())
  }

  fn authorize_url(&self, provider: &str, code_challenge: &str, redirect_to: &str) -> Result<String> {
    let mut url = Url::parse(&self.url("/authorize")).map_err(|e| Error::InvalidUrl(e.to_string()))?;
    url
      .query_pairs_mut()
      .append_pair("provider", provider)
      .append_pair("redirect_to", redirect_to)
      .append_pair("code_challenge", code_challenge)
      .append_pair("code_challenge_method", CHALLENGE_METHOD);
    Ok(url.to_string())
  }

  fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> { self.events.subscribe() }
}
