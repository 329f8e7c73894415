#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use buzzed_domain::{ConnectionId, RoomId, Username};
use tokio::time::Instant;

/// Identity bound to one connection id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
	pub username: Username,
	pub room: Option<RoomId>,
	/// Registered account this connection proved it owns (register, login or
	/// token resumption).
	pub authenticated_as: Option<Username>,
}

impl ConnectionEntry {
	pub fn new(username: Username) -> Self {
		Self {
			username,
			room: None,
			authenticated_as: None,
		}
	}

	/// True when the current name is the account the connection authenticated as.
	pub fn is_authenticated_as_current(&self) -> bool {
		self.authenticated_as
			.as_ref()
			.is_some_and(|account| account.eq_folded(&self.username))
	}
}

#[derive(Debug)]
struct Retained {
	entry: ConnectionEntry,
	since: Instant,
}

/// Result of [`ConnectionRegistry::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
	pub id: ConnectionId,
	pub username: Username,
	pub resumed: bool,
}

/// Connection id -> identity, including identities of disconnected clients
/// that are kept for a grace period so a reconnect can pick them up again.
#[derive(Debug)]
pub struct ConnectionRegistry {
	live: HashMap<ConnectionId, ConnectionEntry>,
	retained: HashMap<ConnectionId, Retained>,
	grace: Duration,
}

impl ConnectionRegistry {
	pub fn new(grace: Duration) -> Self {
		Self {
			live: HashMap::new(),
			retained: HashMap::new(),
			grace,
		}
	}

	/// Register a new live connection. A `requested` id that is retained and
	/// not yet expired is reused together with its identity; anything else
	/// gets a fresh id and the name produced by `fresh_name`.
	pub fn connect<E>(
		&mut self,
		requested: Option<ConnectionId>,
		now: Instant,
		fresh_name: impl FnOnce() -> Result<Username, E>,
	) -> Result<Connected, E> {
		if let Some(id) = requested
			&& !self.live.contains_key(&id)
			&& let Some(retained) = self.retained.remove(&id)
		{
			if now.saturating_duration_since(retained.since) < self.grace {
				let username = retained.entry.username.clone();
				self.live.insert(id, retained.entry);
				return Ok(Connected {
					id,
					username,
					resumed: true,
				});
			}
		}

		let username = fresh_name()?;
		let mut id = ConnectionId::new_v4();
		while self.live.contains_key(&id) || self.retained.contains_key(&id) {
			id = ConnectionId::new_v4();
		}
		self.live.insert(id, ConnectionEntry::new(username.clone()));

		Ok(Connected {
			id,
			username,
			resumed: false,
		})
	}

	pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionEntry> {
		self.live.get(id)
	}

	pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut ConnectionEntry> {
		self.live.get_mut(id)
	}

	/// Move a live connection into the retained set. The room is cleared; the
	/// returned entry still carries it so the caller can leave the room.
	pub fn disconnect(&mut self, id: &ConnectionId, now: Instant) -> Option<ConnectionEntry> {
		let entry = self.live.remove(id)?;
		let mut kept = entry.clone();
		kept.room = None;
		self.retained.insert(*id, Retained { entry: kept, since: now });
		Some(entry)
	}

	/// Drop retained identities whose grace period has elapsed.
	pub fn purge_expired(&mut self, now: Instant) -> usize {
		let before = self.retained.len();
		let grace = self.grace;
		self.retained
			.retain(|_, r| now.saturating_duration_since(r.since) < grace);
		before - self.retained.len()
	}

	/// Live connections currently using `name`, excluding `except`.
	pub fn live_with_name(&self, name: &Username, except: Option<&ConnectionId>) -> Vec<ConnectionId> {
		let mut ids = self
			.live
			.iter()
			.filter(|(id, e)| &e.username == name && Some(*id) != except)
			.map(|(id, _)| *id)
			.collect::<Vec<_>>();
		ids.sort();
		ids
	}

	#[cfg(test)]
	pub fn live_ids(&self) -> Vec<ConnectionId> {
		self.live.keys().copied().collect()
	}

	/// Clear the current room of every live connection sitting in `room`.
	pub fn clear_room(&mut self, room: &RoomId) -> usize {
		let mut cleared = 0;
		for entry in self.live.values_mut() {
			if entry.room.as_ref() == Some(room) {
				entry.room = None;
				cleared += 1;
			}
		}
		cleared
	}

	pub fn live_count(&self) -> usize {
		self.live.len()
	}

	pub fn retained_count(&self) -> usize {
		self.retained.len()
	}
}
