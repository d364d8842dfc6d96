//! Error type for `resilience-gotrue`.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("invalid auth url: {0}")]
  InvalidUrl(String),

  #[error("auth server returned {status}: {message}")]
  Status { status: StatusCode, message: String },
}

impl Error {
  /// The server refused a code or refresh token, as opposed to failing.
  pub fn is_rejection(&self) -> bool {
    matches!(
      self,
      Error::Status { status: StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED, .. }
    )
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
