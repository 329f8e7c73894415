#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};

use buzzed_domain::{ConnectionId, RoomId, Username};

/// Room -> username -> connections of that user sitting in the room.
///
/// A username is present in a room while at least one of its connections
/// is, so a second tab leaving does not announce the user as gone.
#[derive(Debug, Default)]
pub struct RoomMembership {
	rooms: HashMap<RoomId, BTreeMap<Username, HashSet<ConnectionId>>>,
}

impl RoomMembership {
	/// Returns `true` when `name` became present in `room`.
	pub fn enter(&mut self, room: &RoomId, name: &Username, conn: ConnectionId) -> bool {
		let members = self.rooms.entry(room.clone()).or_default();
		let conns = members.entry(name.clone()).or_default();
		let newly_present = conns.is_empty();
		conns.insert(conn);
		newly_present
	}

	/// Returns `true` when `name` is no longer present in `room`.
	pub fn exit(&mut self, room: &RoomId, name: &Username, conn: ConnectionId) -> bool {
		let Some(members) = self.rooms.get_mut(room) else {
			return false;
		};
		let Some(conns) = members.get_mut(name) else {
			return false;
		};
		if !conns.remove(&conn) {
			return false;
		}

		let gone = conns.is_empty();
		if gone {
			members.remove(name);
		}
		if members.is_empty() {
			self.rooms.remove(room);
		}
		gone
	}

	/// Usernames present in `room`, sorted.
	pub fn members(&self, room: &RoomId) -> Vec<Username> {
		self.rooms
			.get(room)
			.map(|m| m.keys().cloned().collect())
			.unwrap_or_default()
	}

	#[cfg(test)]
	pub fn contains(&self, room: &RoomId, name: &Username) -> bool {
		self.rooms.get(room).is_some_and(|m| m.contains_key(name))
	}

	/// Every connection sitting in `room`.
	pub fn audience(&self, room: &RoomId) -> Vec<ConnectionId> {
		let mut conns = self
			.rooms
			.get(room)
			.map(|m| m.values().flatten().copied().collect::<Vec<_>>())
			.unwrap_or_default();
		conns.sort();
		conns
	}

	/// Forget `room` and return the connections that were in it.
	pub fn remove_room(&mut self, room: &RoomId) -> Vec<ConnectionId> {
		self.rooms
			.remove(room)
			.map(|m| m.into_values().flatten().collect())
			.unwrap_or_default()
	}

	pub fn room_count(&self) -> usize {
		self.rooms.len()
	}
}
