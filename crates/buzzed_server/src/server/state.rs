#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use buzzed_domain::{ConnectionId, RoomId, Username};
use buzzed_protocol::ServerEvent;
use buzzed_protocol::events::{RoomMember, RoomMembers, RoomPresence, UserRef, UsernameAssigned};
use tokio::time::Instant;

use crate::server::hub::Delivery;
use crate::server::membership::RoomMembership;
use crate::server::presence::PresenceTracker;
use crate::server::registry::{Connected, ConnectionEntry, ConnectionRegistry};

/// Ephemeral session state: who is connected under which name, who is
/// online, and who sits in which room.
///
/// Every transition returns the events it causes; the caller queues them
/// while still holding the state lock so fan-out order matches state order.
#[derive(Debug)]
pub struct SessionState {
	registry: ConnectionRegistry,
	presence: PresenceTracker,
	membership: RoomMembership,
	deleted_rooms: VecDeque<RoomId>,
}

/// Recently deleted rooms remembered so a join that read the room before the
/// delete landed is refused.
const DELETED_ROOMS_REMEMBERED: usize = 256;

impl SessionState {
	pub fn new(grace: Duration) -> Self {
		Self {
			registry: ConnectionRegistry::new(grace),
			presence: PresenceTracker::default(),
			membership: RoomMembership::default(),
			deleted_rooms: VecDeque::new(),
		}
	}

	pub fn presence(&self) -> &PresenceTracker {
		&self.presence
	}

	#[cfg(test)]
	pub fn membership(&self) -> &RoomMembership {
		&self.membership
	}

	pub fn entry(&self, conn: &ConnectionId) -> Option<&ConnectionEntry> {
		self.registry.get(conn)
	}

	/// Register a connection and bring its name online.
	pub fn connect<E>(
		&mut self,
		requested: Option<ConnectionId>,
		now: Instant,
		fresh_name: impl FnOnce() -> Result<Username, E>,
	) -> Result<(Connected, Vec<Delivery>), E> {
		let connected = self.registry.connect(requested, now, fresh_name)?;

		let mut out = vec![Delivery::to(
			connected.id,
			ServerEvent::UsernameAssigned(UsernameAssigned {
				username: connected.username.clone(),
				session_id: connected.id,
			}),
		)];

		if self.presence.adopt(&connected.username, connected.id) {
			out.push(Delivery::everyone(ServerEvent::UserOnline(UserRef {
				username: connected.username.clone(),
			})));
		}

		Ok((connected, out))
	}

	/// Leave the current room and release the name. The identity itself is
	/// retained by the registry for the grace period.
	pub fn disconnect(&mut self, conn: &ConnectionId, now: Instant) -> Vec<Delivery> {
		let Some(entry) = self.registry.disconnect(conn, now) else {
			return Vec::new();
		};

		let mut out = Vec::new();
		if let Some(room) = &entry.room {
			self.leave_room(*conn, &entry.username, room, &mut out);
		}
		self.release_name(*conn, &entry.username, &mut out);
		out
	}

	/// Switch the name of a live connection, moving its presence and room
	/// membership along. Returns the previous name.
	pub fn rename(&mut self, conn: &ConnectionId, new_name: Username) -> Option<(Username, Vec<Delivery>)> {
		let entry = self.registry.get_mut(conn)?;
		let old_name = std::mem::replace(&mut entry.username, new_name.clone());
		let room = entry.room.clone();

		let mut out = Vec::new();
		if old_name == new_name {
			return Some((old_name, out));
		}

		if let Some(room) = room {
			if self.membership.exit(&room, &old_name, *conn) {
				self.push_to_room(
					&room,
					None,
					ServerEvent::UserLeft(RoomPresence {
						username: old_name.clone(),
						room_id: room.clone(),
					}),
					&mut out,
				);
			}
			if self.membership.enter(&room, &new_name, *conn) {
				self.push_to_room(
					&room,
					Some(*conn),
					ServerEvent::UserJoined(RoomPresence {
						username: new_name.clone(),
						room_id: room.clone(),
					}),
					&mut out,
				);
			}
			let members = self.room_members_event(&room);
			self.push_to_room(&room, None, members, &mut out);
		}

		self.release_name(*conn, &old_name, &mut out);
		if self.presence.adopt(&new_name, *conn) {
			out.push(Delivery::everyone(ServerEvent::UserOnline(UserRef {
				username: new_name.clone(),
			})));
		}

		Some((old_name, out))
	}

	/// Record which registered account the connection proved it owns.
	pub fn set_authenticated(&mut self, conn: &ConnectionId, account: Option<Username>) {
		if let Some(entry) = self.registry.get_mut(conn) {
			entry.authenticated_as = account;
		}
	}

	/// Move a connection into `room`, leaving its previous room first.
	pub fn join(&mut self, conn: &ConnectionId, room: &RoomId) -> Vec<Delivery> {
		let mut out = Vec::new();
		let Some(entry) = self.registry.get_mut(conn) else {
			return out;
		};
		let name = entry.username.clone();
		let previous = entry.room.replace(room.clone());

		if previous.as_ref() == Some(room) {
			out.push(Delivery::to(*conn, self.room_members_event(room)));
			return out;
		}

		if let Some(previous) = previous {
			self.leave_room(*conn, &name, &previous, &mut out);
		}

		if self.membership.enter(room, &name, *conn) {
			self.push_to_room(
				room,
				Some(*conn),
				ServerEvent::UserJoined(RoomPresence {
					username: name.clone(),
					room_id: room.clone(),
				}),
				&mut out,
			);
		}
		let members = self.room_members_event(room);
		self.push_to_room(room, None, members, &mut out);

		out
	}

	/// Forget a deleted room. Returns the connections that were in it.
	pub fn remove_room(&mut self, room: &RoomId) -> Vec<ConnectionId> {
		if self.deleted_rooms.len() == DELETED_ROOMS_REMEMBERED {
			self.deleted_rooms.pop_front();
		}
		self.deleted_rooms.push_back(room.clone());
		self.registry.clear_room(room);
		self.membership.remove_room(room)
	}

	pub fn is_deleted(&self, room: &RoomId) -> bool {
		self.deleted_rooms.contains(room)
	}

	/// Connections currently sitting in `room`.
	pub fn room_audience(&self, room: &RoomId) -> Vec<ConnectionId> {
		self.membership.audience(room)
	}

	pub fn room_members_event(&self, room: &RoomId) -> ServerEvent {
		let members = self
			.membership
			.members(room)
			.into_iter()
			.map(|username| RoomMember {
				is_active: self.presence.is_online(&username),
				username,
			})
			.collect();

		ServerEvent::RoomMembers(RoomMembers {
			room_id: room.clone(),
			members,
		})
	}

	pub fn purge_expired(&mut self, now: Instant) -> usize {
		self.registry.purge_expired(now)
	}

	/// Live connections, retained identities and occupied rooms.
	pub fn counts(&self) -> (usize, usize, usize) {
		(
			self.registry.live_count(),
			self.registry.retained_count(),
			self.membership.room_count(),
		)
	}

	fn leave_room(&mut self, conn: ConnectionId, name: &Username, room: &RoomId, out: &mut Vec<Delivery>) {
		if self.membership.exit(room, name, conn) {
			self.push_to_room(
				room,
				None,
				ServerEvent::UserLeft(RoomPresence {
					username: name.clone(),
					room_id: room.clone(),
				}),
				out,
			);
		}
		let members = self.room_members_event(room);
		self.push_to_room(room, None, members, out);
	}

	fn release_name(&mut self, conn: ConnectionId, name: &Username, out: &mut Vec<Delivery>) {
		let fallback = self.registry.live_with_name(name, Some(&conn)).first().copied();
		if self.presence.release(name, conn, fallback) {
			out.push(Delivery::everyone(ServerEvent::UserOffline(UserRef {
				username: name.clone(),
			})));
		}
	}

	fn push_to_room(&self, room: &RoomId, except: Option<ConnectionId>, event: ServerEvent, out: &mut Vec<Delivery>) {
		let audience = self
			.membership
			.audience(room)
			.into_iter()
			.filter(|c| Some(*c) != except)
			.collect::<Vec<_>>();
		if !audience.is_empty() {
			out.push(Delivery::to_all(audience, event));
		}
	}
}

#[cfg(test)]
mod tests {
	use std::convert::Infallible;

	use super::*;
	use crate::server::hub::Audience;

	fn user(s: &str) -> Username {
		Username::new(s).expect("username")
	}

	fn room(s: &str) -> RoomId {
		RoomId::new(s).expect("room id")
	}

	fn connect(state: &mut SessionState, name: &str) -> ConnectionId {
		let name = user(name);
		let (connected, _) = state
			.connect(None, Instant::now(), || Ok::<_, Infallible>(name))
			.expect("connect");
		connected.id
	}

	fn events_for(out: &[Delivery], conn: ConnectionId) -> Vec<&ServerEvent> {
		out.iter()
			.filter(|d| match &d.audience {
				Audience::Connection(c) => *c == conn,
				Audience::Connections(cs) => cs.contains(&conn),
				Audience::Everyone => true,
			})
			.map(|d| &d.event)
			.collect()
	}

	#[test]
	fn connect_announces_new_names_only() {
		let mut state = SessionState::new(Duration::from_secs(60));
		let (first, out) = state
			.connect(None, Instant::now(), || Ok::<_, Infallible>(user("amy")))
			.expect("connect");
		assert!(matches!(&out[0].event, ServerEvent::UsernameAssigned(a) if a.session_id == first.id));
		assert!(out.iter().any(|d| matches!(d.event, ServerEvent::UserOnline(_))));

		let (_, out) = state
			.connect(None, Instant::now(), || Ok::<_, Infallible>(user("amy")))
			.expect("connect");
		assert!(!out.iter().any(|d| matches!(d.event, ServerEvent::UserOnline(_))));
	}

	#[test]
	fn switching_rooms_notifies_each_room_once() {
		let mut state = SessionState::new(Duration::from_secs(60));
		let amy = connect(&mut state, "amy");
		let bob = connect(&mut state, "bob");
		let cat = connect(&mut state, "cat");

		state.join(&bob, &room("a"));
		state.join(&cat, &room("b"));
		state.join(&amy, &room("a"));

		let out = state.join(&amy, &room("b"));
		let to_bob = events_for(&out, bob);
		let to_cat = events_for(&out, cat);

		assert_eq!(to_bob.iter().filter(|e| matches!(e, ServerEvent::UserLeft(_))).count(), 1);
		assert!(!to_bob.iter().any(|e| matches!(e, ServerEvent::UserJoined(_))));
		assert_eq!(to_cat.iter().filter(|e| matches!(e, ServerEvent::UserJoined(_))).count(), 1);
		assert!(!to_cat.iter().any(|e| matches!(e, ServerEvent::UserLeft(_))));

		assert!(state.membership().contains(&room("b"), &user("amy")));
		assert!(!state.membership().contains(&room("a"), &user("amy")));
	}

	#[test]
	fn rename_moves_membership_and_presence() {
		let mut state = SessionState::new(Duration::from_secs(60));
		let amy = connect(&mut state, "amy");
		let bob = connect(&mut state, "bob");
		state.join(&amy, &room("a"));
		state.join(&bob, &room("a"));

		let (old, out) = state.rename(&amy, user("amelia")).expect("live");
		assert_eq!(old, user("amy"));

		let to_bob = events_for(&out, bob);
		assert!(to_bob.iter().any(|e| matches!(e, ServerEvent::UserLeft(p) if p.username == user("amy"))));
		assert!(to_bob.iter().any(|e| matches!(e, ServerEvent::UserJoined(p) if p.username == user("amelia"))));
		assert!(to_bob.iter().any(|e| matches!(e, ServerEvent::UserOffline(u) if u.username == user("amy"))));
		assert!(to_bob.iter().any(|e| matches!(e, ServerEvent::UserOnline(u) if u.username == user("amelia"))));

		assert!(state.membership().contains(&room("a"), &user("amelia")));
		assert!(!state.membership().contains(&room("a"), &user("amy")));
		assert_eq!(state.presence().resolve(&user("amelia")), Some(amy));
		assert!(!state.presence().is_online(&user("amy")));
	}

	#[test]
	fn disconnect_moves_delivery_to_remaining_connection() {
		let mut state = SessionState::new(Duration::from_secs(60));
		let first = connect(&mut state, "amy");
		let second = connect(&mut state, "amy");
		assert_eq!(state.presence().resolve(&user("amy")), Some(second));

		let out = state.disconnect(&second, Instant::now());
		assert!(!out.iter().any(|d| matches!(d.event, ServerEvent::UserOffline(_))));
		assert_eq!(state.presence().resolve(&user("amy")), Some(first));

		let out = state.disconnect(&first, Instant::now());
		assert!(out.iter().any(|d| matches!(d.event, ServerEvent::UserOffline(_))));
		assert!(state.disconnect(&first, Instant::now()).is_empty());
	}

	#[test]
	fn remove_room_clears_current_rooms() {
		let mut state = SessionState::new(Duration::from_secs(60));
		let amy = connect(&mut state, "amy");
		state.join(&amy, &room("a"));

		assert_eq!(state.remove_room(&room("a")), vec![amy]);
		assert_eq!(state.entry(&amy).expect("live").room, None);
		assert!(state.room_audience(&room("a")).is_empty());
		assert!(state.is_deleted(&room("a")));
		assert!(!state.is_deleted(&room("b")));
	}

	#[test]
	fn deleted_rooms_are_remembered_up_to_a_bound() {
		let mut state = SessionState::new(Duration::from_secs(60));
		for i in 0..=DELETED_ROOMS_REMEMBERED {
			state.remove_room(&room(&format!("r{i}")));
		}
		assert!(!state.is_deleted(&room("r0")));
		assert!(state.is_deleted(&room("r1")));
		assert!(state.is_deleted(&room(&format!("r{DELETED_ROOMS_REMEMBERED}"))));
	}
}
