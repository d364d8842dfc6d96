//! Handler error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::{StatusCode, header::InvalidHeaderValue},
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("auth provider error: {0}")]
  Provider(#[source] BoxError),

  #[error("store error: {0}")]
  Store(#[source] BoxError),

  #[error("invalid header value: {0}")]
  Header(#[from] InvalidHeaderValue),
}

impl Error {
  pub fn provider(e: impl std::error::Error + Send + Sync + 'static) -> Self { Error::Provider(Box::new(e)) }

  pub fn store(e: impl std::error::Error + Send + Sync + 'static) -> Self { Error::Store(Box::new(e)) }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = match &self {
      Error::NotFound(_) => StatusCode::NOT_FOUND,
      Error::Provider(_) => StatusCode::BAD_GATEWAY,
      Error::Store(_) | Error::Header(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
      tracing::error!(error = %self, "request failed");
    }
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}
