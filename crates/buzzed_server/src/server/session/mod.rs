#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use buzzed_domain::{ConnectionId, RoomId, Username};
use buzzed_protocol::{ClientEvent, ServerEvent};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::server::auth::SessionTokens;
use crate::server::error::{CommandError, StoreContext as _};
use crate::server::hub::{Delivery, Hub};
use crate::server::names::EphemeralNames;
use crate::server::password::PasswordHasher;
use crate::server::registry::ConnectionEntry;
use crate::server::state::SessionState;
use crate::store::Store;

mod buddies;
mod identity;
mod rooms;

/// Tunables of the command handlers.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// How long a disconnected identity can be resumed.
	pub grace_period: Duration,
	/// Messages sent on `join_room`.
	pub room_history_limit: usize,
	pub chat_history_default: usize,
	pub chat_history_max: usize,
	/// Also emit `username_registered` / `login_successful`.
	pub legacy_event_aliases: bool,
	/// Names that get the admin role when they register.
	pub admin_usernames: Vec<String>,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			grace_period: Duration::from_secs(30 * 60),
			room_history_limit: 50,
			chat_history_default: 50,
			chat_history_max: 200,
			legacy_event_aliases: false,
			admin_usernames: Vec::new(),
		}
	}
}

/// Runs client commands against the session state and the store and fans
/// the results out through the hub.
///
/// Lock order is state, then hub. Store calls never happen while the state
/// lock is held.
pub struct Dispatcher {
	state: Mutex<SessionState>,
	store: Arc<dyn Store>,
	hub: Hub,
	tokens: SessionTokens,
	passwords: PasswordHasher,
	names: EphemeralNames,
	settings: SessionSettings,
}

impl Dispatcher {
	pub fn new(
		store: Arc<dyn Store>,
		hub: Hub,
		tokens: SessionTokens,
		passwords: PasswordHasher,
		settings: SessionSettings,
	) -> Self {
		Self {
			state: Mutex::new(SessionState::new(settings.grace_period)),
			store,
			hub,
			tokens,
			passwords,
			names: EphemeralNames,
			settings,
		}
	}

	/// Register a new connection, resuming `requested` when it is still
	/// retained. Returns the connection id and its outbound queue; the
	/// `username_assigned` event is already queued.
	pub async fn connect(
		&self,
		requested: Option<ConnectionId>,
	) -> Result<(ConnectionId, mpsc::Receiver<ServerEvent>), CommandError> {
		let mut state = self.state.lock().await;
		let (connected, deliveries) = state
			.connect(requested, Instant::now(), || self.names.generate())
			.map_err(|e| CommandError::Internal {
				message: "Failed to assign a username".into(),
				source: anyhow!(e),
			})?;

		let rx = self.hub.attach(connected.id).await;
		self.hub.deliver(deliveries).await;
		drop(state);

		info!(
			conn_id = %connected.id,
			username = %connected.username,
			resumed = connected.resumed,
			"session: connected"
		);

		Ok((connected.id, rx))
	}

	pub async fn disconnect(&self, conn: ConnectionId) {
		let mut state = self.state.lock().await;
		let deliveries = state.disconnect(&conn, Instant::now());
		self.hub.detach(&conn).await;
		self.hub.deliver(deliveries).await;
		drop(state);

		let attached = self.hub.attached_count().await;
		debug!(conn_id = %conn, attached, "session: disconnected");
	}

	/// Drop identities whose grace period is over.
	pub async fn purge_expired(&self) -> usize {
		let mut state = self.state.lock().await;
		let purged = state.purge_expired(Instant::now());
		let (live, retained, rooms) = state.counts();
		drop(state);

		metrics::gauge!("buzzed_server_live_identities").set(live as f64);
		metrics::gauge!("buzzed_server_retained_identities").set(retained as f64);
		metrics::gauge!("buzzed_server_occupied_rooms").set(rooms as f64);
		if purged > 0 {
			debug!(purged, live, retained, "session: purged expired identities");
		}
		purged
	}

	/// Handle one command. Failures are answered to the sender and never
	/// end the connection.
	pub async fn dispatch(&self, conn: ConnectionId, event: ClientEvent) {
		let name = event.name();
		metrics::counter!("buzzed_server_events_in_total", "event" => name).increment(1);

		if let Err(err) = self.handle(conn, event).await {
			self.reject(conn, name, err).await;
		}
	}

	/// Answer a refused command.
	pub async fn reject(&self, conn: ConnectionId, event: &str, err: CommandError) {
		metrics::counter!("buzzed_server_command_errors_total", "kind" => err.kind()).increment(1);

		match &err {
			CommandError::Store { source, .. } => {
				warn!(conn_id = %conn, event, error = %source, "session: store failure");
			}
			CommandError::Internal { source, .. } => {
				warn!(conn_id = %conn, event, error = %source, "session: internal failure");
			}
			other => {
				debug!(conn_id = %conn, event, kind = other.kind(), error = %other, "session: command rejected");
			}
		}

		self.hub.send_to(conn, err.into_event()).await;
	}

	async fn handle(&self, conn: ConnectionId, event: ClientEvent) -> Result<(), CommandError> {
		match event {
			ClientEvent::UseExistingUsername(resume) => self.use_existing_username(conn, resume).await,
			ClientEvent::ChangeUsername(change) => self.change_username(conn, change).await,
			ClientEvent::RegisterUsername(creds) => self.register_username(conn, creds).await,
			ClientEvent::LoginUsername(creds) => self.login_username(conn, creds).await,
			ClientEvent::Logout => self.logout(conn).await,

			ClientEvent::GetRooms => self.get_rooms(conn).await,
			ClientEvent::CreateRoom(name) => self.create_room(conn, name).await,
			ClientEvent::GetRoomData(room) => self.get_room_data(conn, room).await,
			ClientEvent::GetRoomMembers(room) => self.get_room_members(conn, room).await,
			ClientEvent::JoinRoom(room) => self.join_room(conn, room).await,
			ClientEvent::SendMessage(msg) => self.send_message(conn, msg).await,
			ClientEvent::DeleteMessage(del) => self.delete_message(conn, del).await,
			ClientEvent::DeleteRoom(room) => self.delete_room(conn, room).await,
			ClientEvent::UpdateRoomCustomization(update) => self.update_room_customization(conn, update).await,

			ClientEvent::SendBuddyRequest(target) => self.send_buddy_request(conn, target).await,
			ClientEvent::BuddyRequestResponse(resp) => self.buddy_request_response(conn, resp).await,
			ClientEvent::LoadBuddyData => self.load_buddy_data(conn).await,
			ClientEvent::SendDirectMessage(dm) => self.send_direct_message(conn, dm).await,
			ClientEvent::LoadChatHistory(req) => self.load_chat_history(conn, req).await,
			ClientEvent::BuddyTypingStart(target) => self.buddy_typing(conn, target, true).await,
			ClientEvent::BuddyTypingStop(target) => self.buddy_typing(conn, target, false).await,

			ClientEvent::GetActiveUsers(_) => self.get_active_users(conn).await,
		}
	}

	/// Snapshot of the caller's identity.
	async fn caller(&self, conn: ConnectionId) -> Result<ConnectionEntry, CommandError> {
		self.state
			.lock()
			.await
			.entry(&conn)
			.cloned()
			.ok_or_else(|| CommandError::Validation("Connection is not active.".into()))
	}

	/// Admin rights need the admin role on the account the caller is
	/// authenticated as, and the caller must currently use that name.
	async fn is_admin(&self, caller: &ConnectionEntry) -> Result<bool, CommandError> {
		if !caller.is_authenticated_as_current() {
			return Ok(false);
		}

		let account = self
			.store
			.find_account(caller.username.as_str())
			.await
			.or_fail("Failed to check permissions")?;
		Ok(account.is_some_and(|a| a.is_admin()))
	}

	/// The registered spelling of `name` when an account exists, else `name`.
	async fn canonical_name(&self, name: Username, failure: &str) -> Result<Username, CommandError> {
		let account = self.store.find_account(name.as_str()).await.or_fail(failure)?;
		Ok(account.map_or(name, |a| a.username))
	}

	fn is_configured_admin(&self, name: &Username) -> bool {
		let folded = name.folded();
		self.settings
			.admin_usernames
			.iter()
			.any(|admin| buzzed_domain::fold_name(admin) == folded)
	}

	async fn get_active_users(&self, conn: ConnectionId) -> Result<(), CommandError> {
		let state = self.state.lock().await;
		let online = state.presence().online();
		self.hub.send_to(conn, ServerEvent::ActiveUsers(online)).await;
		Ok(())
	}

	/// Rename under the state lock and queue the resulting events plus `extra`.
	async fn apply_rename(
		&self,
		conn: ConnectionId,
		new_name: Username,
		authenticated_as: Option<Option<Username>>,
		extra: impl FnOnce(&Username) -> Vec<Delivery>,
	) -> Result<Username, CommandError> {
		let mut state = self.state.lock().await;
		let Some((old_name, mut deliveries)) = state.rename(&conn, new_name) else {
			return Err(CommandError::Validation("Connection is not active.".into()));
		};
		if let Some(account) = authenticated_as {
			state.set_authenticated(&conn, account);
		}

		deliveries.extend(extra(&old_name));
		self.hub.deliver(deliveries).await;
		Ok(old_name)
	}
}

pub(crate) fn parse_room_id(raw: &str) -> Result<RoomId, CommandError> {
	RoomId::new(raw.trim()).map_err(|_| CommandError::Validation("Room id is required.".into()))
}

pub(crate) fn parse_username(raw: &str) -> Result<Username, CommandError> {
	Username::new(raw).map_err(|e| CommandError::Validation(format!("Invalid username: {e}.")))
}
