//! `SessionProvider` backed by a GoTrue-compatible hosted auth service.
//!
//! Talks to `{base_url}/auth/v1/...` over HTTPS with the project's public API
//! key. Sign-in uses the OAuth authorization-code flow with PKCE.

mod provider;
mod wire;

pub mod error;
pub mod pkce;

pub use error::{Error, Result};
pub use pkce::PkcePair;
pub use provider::{GoTrueConfig, GoTrueProvider};
