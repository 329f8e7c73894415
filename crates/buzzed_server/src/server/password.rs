#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::server::auth::constant_time_eq;

const SCHEME: &str = "pbkdf2-sha512";
const KEY_LEN: usize = 64;

/// PBKDF2-HMAC-SHA512 with a per-account random salt.
///
/// Stored hashes look like `pbkdf2-sha512$<iterations>$<hex key>`, so the
/// iteration count can be raised without invalidating existing accounts.
#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
	iterations: u32,
}

impl PasswordHasher {
	pub fn new(iterations: u32) -> Self {
		Self {
			iterations: iterations.max(1),
		}
	}

	/// Returns `(stored_hash, salt)`.
	pub async fn hash(&self, password: &str) -> anyhow::Result<(String, String)> {
		let salt = hex::encode(rand::random::<[u8; 16]>());
		let password = password.to_string();
		let iterations = self.iterations;
		let salt_for_task = salt.clone();

		let key = tokio::task::spawn_blocking(move || derive(password.as_bytes(), salt_for_task.as_bytes(), iterations))
			.await
			.context("password hashing task")??;

		Ok((format!("{SCHEME}${iterations}${}", hex::encode(key)), salt))
	}

	pub async fn verify(&self, password: &str, stored: &str, salt: &str) -> anyhow::Result<bool> {
		let mut parts = stored.split('$');
		let (Some(SCHEME), Some(iterations), Some(expected_hex), None) = (parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(anyhow!("unrecognized password hash format"));
		};
		let iterations: u32 = iterations.parse().context("password hash iterations")?;
		let expected_hex = expected_hex.to_string();
		let password = password.to_string();
		let salt = salt.to_string();

		let key = tokio::task::spawn_blocking(move || derive(password.as_bytes(), salt.as_bytes(), iterations))
			.await
			.context("password hashing task")??;

		Ok(constant_time_eq(hex::encode(key).as_bytes(), expected_hex.as_bytes()))
	}
}

fn derive(password: &[u8], salt: &[u8], iterations: u32) -> anyhow::Result<[u8; KEY_LEN]> {
	let prf = Hmac::<Sha512>::new_from_slice(password).map_err(|e| anyhow!("hmac key: {e}"))?;

	// A 64-byte key is exactly one SHA-512 block: T1 = U1 ^ U2 ^ ... ^ Uc.
	let mut mac = prf.clone();
	mac.update(salt);
	mac.update(&1u32.to_be_bytes());
	let mut u = [0u8; KEY_LEN];
	u.copy_from_slice(&mac.finalize().into_bytes());
	let mut out = u;

	for _ in 1..iterations {
		let mut mac = prf.clone();
		mac.update(&u);
		u.copy_from_slice(&mac.finalize().into_bytes());
		for (o, x) in out.iter_mut().zip(u.iter()) {
			*o ^= x;
		}
	}

	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn derive_matches_reference_vector() {
		let key = derive(b"password", b"salt", 1).expect("derive");
		assert_eq!(
			hex::encode(key),
			"867f70cf1ade02cff3752599a3a53dc4af34c7a669815ae5d513554e1c8cf252c02d470a285a0501bad999bfe943c08f050235d7d68b1da55e63f73b60a57fce"
		);
	}

	#[tokio::test]
	async fn hash_then_verify() {
		let hasher = PasswordHasher::new(1000);
		let (stored, salt) = hasher.hash("hunter2").await.expect("hash");

		assert!(stored.starts_with("pbkdf2-sha512$1000$"));
		assert_eq!(salt.len(), 32);
		assert!(hasher.verify("hunter2", &stored, &salt).await.expect("verify"));
		assert!(!hasher.verify("hunter3", &stored, &salt).await.expect("verify"));
	}

	#[tokio::test]
	async fn verify_uses_stored_iteration_count() {
		let (stored, salt) = PasswordHasher::new(10).hash("pw").await.expect("hash");
		assert!(PasswordHasher::new(5000).verify("pw", &stored, &salt).await.expect("verify"));
	}

	#[tokio::test]
	async fn salts_differ_per_hash() {
		let hasher = PasswordHasher::new(10);
		let (a, salt_a) = hasher.hash("same").await.expect("hash");
		let (b, salt_b) = hasher.hash("same").await.expect("hash");
		assert_ne!(salt_a, salt_b);
		assert_ne!(a, b);
	}

	#[tokio::test]
	async fn unknown_format_is_an_error() {
		let hasher = PasswordHasher::new(10);
		assert!(hasher.verify("pw", "plaintext", "salt").await.is_err());
	}
}
