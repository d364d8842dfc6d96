//! PKCE (RFC 7636) verifier/challenge pairs.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand_core::{OsRng, RngCore as _};
use sha2::{Digest as _, Sha256};

/// The only challenge method this crate issues.
pub const CHALLENGE_METHOD: &str = "s256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
  /// Kept by the client until the code exchange.
  pub verifier:  String,
  /// Sent with the authorization request.
  pub challenge: String,
}

impl PkcePair {
  /// Fresh pair from 32 bytes of OS randomness (a 43-character verifier).
  pub fn generate() -> Self {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = Self::challenge_for(&verifier);
    Self { verifier, challenge }
  }

  /// `BASE64URL(SHA256(verifier))`, unpadded.
  pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rfc7636_appendix_b_vector() {
    assert_eq!(
      PkcePair::challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
      "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
    );
  }

  #[test]
  fn generated_pairs_are_url_safe_and_distinct() {
    let a = PkcePair::generate();
    let b = PkcePair::generate();

    assert_eq!(a.verifier.len(), 43);
    assert!(a.verifier.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    assert_eq!(a.challenge, PkcePair::challenge_for(&a.verifier));
    assert_ne!(a.verifier, b.verifier);
  }
}
