#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use buzzed_domain::Username;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::SecretString;
use crate::util::time::unix_secs_now;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
	/// Case-folded account name.
	pub sub: String,
	pub exp: u64,
}

/// Issues and verifies the signed session tokens handed out on register and
/// login. Format: `v1.<b64url claims>.<b64url hmac-sha256>`.
#[derive(Debug, Clone)]
pub struct SessionTokens {
	secret: SecretString,
	ttl: Duration,
}

impl SessionTokens {
	pub fn new(secret: SecretString, ttl: Duration) -> Self {
		Self { secret, ttl }
	}

	/// Tokens signed with a per-process random secret. They stop verifying
	/// after a restart.
	pub fn ephemeral(ttl: Duration) -> Self {
		let bytes: [u8; 32] = rand::random();
		Self::new(SecretString::new(URL_SAFE_NO_PAD.encode(bytes)), ttl)
	}

	pub fn issue(&self, account: &Username) -> anyhow::Result<String> {
		let claims = TokenClaims {
			sub: account.folded(),
			exp: unix_secs_now().saturating_add(self.ttl.as_secs()),
		};
		self.issue_claims(&claims)
	}

	fn issue_claims(&self, claims: &TokenClaims) -> anyhow::Result<String> {
		let payload = serde_json::to_vec(claims).context("encode token claims")?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes())?;
		Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
	}

	pub fn verify(&self, token: &str) -> anyhow::Result<TokenClaims> {
		let parts = token.split('.').collect::<Vec<_>>();
		if parts.len() != 3 || parts[0] != "v1" {
			return Err(anyhow!("invalid token format"));
		}

		let payload_b64 = parts[1];
		let sig_b64 = parts[2];

		let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
		let expected_sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes())?;
		let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(anyhow!("invalid token signature"));
		}

		let claims: TokenClaims = serde_json::from_slice(&payload).context("parse token claims")?;
		if claims.exp <= unix_secs_now() {
			return Err(anyhow!("token expired"));
		}

		Ok(claims)
	}

	/// True when `token` verifies and was issued for `account`.
	pub fn authorizes(&self, token: &str, account: &Username) -> bool {
		self.verify(token).is_ok_and(|claims| claims.sub == account.folded())
	}
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tokens(secret: &str) -> SessionTokens {
		SessionTokens::new(SecretString::new(secret), Duration::from_secs(3600))
	}

	fn user(s: &str) -> Username {
		Username::new(s).expect("username")
	}

	#[test]
	fn issued_token_verifies_for_its_account_only() {
		let t = tokens("s3cret");
		let token = t.issue(&user("Alice")).expect("issue");

		let claims = t.verify(&token).expect("verify");
		assert_eq!(claims.sub, "alice");
		assert!(t.authorizes(&token, &user("alice")));
		assert!(t.authorizes(&token, &user("ALICE")));
		assert!(!t.authorizes(&token, &user("bob")));
	}

	#[test]
	fn other_secret_rejects() {
		let token = tokens("one").issue(&user("alice")).expect("issue");
		assert!(tokens("two").verify(&token).is_err());
	}

	#[test]
	fn tampered_payload_rejects() {
		let t = tokens("s3cret");
		let token = t.issue(&user("alice")).expect("issue");
		let forged_payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"admin","exp":99999999999}"#);
		let sig = token.rsplit('.').next().expect("sig");
		let forged = format!("v1.{forged_payload}.{sig}");
		assert!(t.verify(&forged).is_err());
	}

	#[test]
	fn expired_token_rejects() {
		let t = tokens("s3cret");
		let token = t
			.issue_claims(&TokenClaims {
				sub: "alice".into(),
				exp: unix_secs_now().saturating_sub(1),
			})
			.expect("issue");
		let err = t.verify(&token).expect_err("expired");
		assert!(err.to_string().contains("expired"), "got: {err}");
	}

	#[test]
	fn malformed_tokens_reject() {
		let t = tokens("s3cret");
		for bad in ["", "v1", "v2.a.b", "v1.!!.??", "v1.a.b.c"] {
			assert!(t.verify(bad).is_err(), "accepted {bad:?}");
		}
	}
}
