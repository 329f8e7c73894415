#![forbid(unsafe_code)]

use buzzed_domain::{ConnectionId, Role, UserAccount};
use buzzed_protocol::ServerEvent;
use buzzed_protocol::events::{
	AuthSuccess, ChangeUsername, Credentials, ResumeIdentity, UserRef, UsernameAssigned, UsernameChanged,
};
use tracing::info;

use super::{Dispatcher, parse_username};
use crate::server::error::{CommandError, StoreContext as _};
use crate::server::hub::Delivery;
use crate::store::StoreError;
use crate::util::time::unix_ms_now;

impl Dispatcher {
	/// Adopt a name the client remembered. Registered names need the session
	/// token issued for that account; a valid token also authenticates.
	pub(super) async fn use_existing_username(&self, conn: ConnectionId, resume: ResumeIdentity) -> Result<(), CommandError> {
		let mut name = parse_username(resume.username())?;

		let account = self
			.store
			.find_account(name.as_str())
			.await
			.or_fail("Failed to restore username")?;

		let authenticated = match account {
			Some(account) => {
				let Some(token) = resume.token() else {
					return Err(CommandError::Unauthorized(format!(
						"Username \"{}\" is registered. Please log in.",
						account.username
					)));
				};
				if !self.tokens.authorizes(token, &account.username) {
					return Err(CommandError::Unauthorized("Session expired. Please log in again.".into()));
				}
				name = account.username.clone();
				Some(Some(account.username))
			}
			None => None,
		};

		self.apply_rename(conn, name.clone(), authenticated, |old| {
			vec![Delivery::to(
				conn,
				ServerEvent::UsernameChanged(UsernameChanged {
					old_username: old.clone(),
					new_username: name.clone(),
				}),
			)]
		})
		.await?;
		Ok(())
	}

	/// Rename the connection. Registered names are only available to the
	/// connection authenticated as that account; ephemeral duplicates are
	/// fine.
	pub(super) async fn change_username(&self, conn: ConnectionId, change: ChangeUsername) -> Result<(), CommandError> {
		let mut name = parse_username(&change.new_username)?;
		let caller = self.caller(conn).await?;

		let account = self
			.store
			.find_account(name.as_str())
			.await
			.or_fail("Failed to change username")?;

		if let Some(account) = account {
			let entitled = caller
				.authenticated_as
				.as_ref()
				.is_some_and(|a| a.eq_folded(&account.username));
			if !entitled {
				return Err(CommandError::Conflict(format!(
					"Username \"{}\" is already registered by another user.",
					name
				)));
			}
			name = account.username;
		}

		self.apply_rename(conn, name.clone(), None, |old| {
			vec![Delivery::to(
				conn,
				ServerEvent::UsernameChanged(UsernameChanged {
					old_username: old.clone(),
					new_username: name.clone(),
				}),
			)]
		})
		.await?;
		Ok(())
	}

	pub(super) async fn register_username(&self, conn: ConnectionId, creds: Credentials) -> Result<(), CommandError> {
		if creds.username.trim().is_empty() || creds.password.is_empty() {
			return Err(CommandError::Validation("Username and password are required.".into()));
		}
		let name = parse_username(&creds.username)?;
		let taken = || CommandError::Conflict(format!("Username \"{name}\" is already registered."));

		let existing = self
			.store
			.find_account(name.as_str())
			.await
			.or_fail("Failed to register username")?;
		if existing.is_some() {
			return Err(taken());
		}

		let (password_hash, salt) = self.passwords.hash(&creds.password).await.or_fail("Failed to register username")?;

		let account = UserAccount {
			username: name.clone(),
			password_hash,
			salt,
			role: if self.is_configured_admin(&name) {
				Role::Admin
			} else {
				Role::Member
			},
			created_at: unix_ms_now(),
		};
		let role = account.role;
		match self.store.insert_account(account).await {
			Ok(()) => {}
			Err(StoreError::Conflict(_)) => return Err(taken()),
			Err(source) => {
				return Err(CommandError::Store {
					message: "Failed to register username".into(),
					source,
				});
			}
		}

		let token = self.tokens.issue(&name).or_fail("Failed to register username")?;
		let success = AuthSuccess {
			username: name.clone(),
			token,
		};
		let legacy = self.settings.legacy_event_aliases;

		self.apply_rename(conn, name.clone(), Some(Some(name.clone())), |_| {
			let mut out = vec![Delivery::to(conn, ServerEvent::RegisterSuccess(success.clone()))];
			if legacy {
				out.push(Delivery::to(conn, ServerEvent::UsernameRegistered(success)));
			}
			out
		})
		.await?;

		info!(conn_id = %conn, username = %name, ?role, "session: account registered");
		Ok(())
	}

	pub(super) async fn login_username(&self, conn: ConnectionId, creds: Credentials) -> Result<(), CommandError> {
		let requested = creds.username.trim();
		if requested.is_empty() || creds.password.is_empty() {
			return Err(CommandError::Validation("Username and password are required.".into()));
		}

		let Some(account) = self.store.find_account(requested).await.or_fail("Failed to log in")? else {
			return Err(CommandError::NotFound(format!("Username \"{requested}\" is not registered.")));
		};

		let valid = self
			.passwords
			.verify(&creds.password, &account.password_hash, &account.salt)
			.await
			.or_fail("Failed to log in")?;
		if !valid {
			return Err(CommandError::Unauthorized("Invalid password.".into()));
		}

		let name = account.username;
		let token = self.tokens.issue(&name).or_fail("Failed to log in")?;
		let success = AuthSuccess {
			username: name.clone(),
			token,
		};
		let legacy = self.settings.legacy_event_aliases;

		self.apply_rename(conn, name.clone(), Some(Some(name.clone())), |_| {
			let mut out = vec![Delivery::to(conn, ServerEvent::LoginSuccess(success.clone()))];
			if legacy {
				out.push(Delivery::to(conn, ServerEvent::LoginSuccessful(success)));
			}
			out
		})
		.await?;

		info!(conn_id = %conn, username = %name, "session: logged in");
		Ok(())
	}

	/// Back to a fresh ephemeral name without authentication.
	pub(super) async fn logout(&self, conn: ConnectionId) -> Result<(), CommandError> {
		let fresh = self.names.generate().map_err(|e| CommandError::Internal {
			message: "Failed to assign a username".into(),
			source: anyhow::anyhow!(e),
		})?;

		self.apply_rename(conn, fresh.clone(), Some(None), |old| {
			vec![
				Delivery::to(
					conn,
					ServerEvent::UsernameAssigned(UsernameAssigned {
						username: fresh.clone(),
						session_id: conn,
					}),
				),
				Delivery::to(conn, ServerEvent::LogoutSuccess(UserRef { username: old.clone() })),
			]
		})
		.await?;
		Ok(())
	}
}
