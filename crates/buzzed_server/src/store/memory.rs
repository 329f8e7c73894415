#![forbid(unsafe_code)]

use std::collections::HashMap;

use buzzed_domain::{
	BuddyRelation, BuddyStatus, DirectMessage, MessageId, Role, Room, RoomCustomization, RoomId, RoomMessage,
	UserAccount, Username, fold_name,
};
use tokio::sync::Mutex;

use crate::store::{Store, StoreError, StoreResult};

/// Process-local store. Used by tests and when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryData>,
}

#[derive(Debug, Default)]
struct MemoryData {
	/// Keyed by folded username.
	accounts: HashMap<String, UserAccount>,
	/// Insertion order.
	rooms: Vec<Room>,
	/// Insertion order across all rooms.
	messages: Vec<RoomMessage>,
	direct_messages: Vec<DirectMessage>,
	relations: HashMap<(Username, Username), BuddyRelation>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl Store for MemoryStore {
	async fn find_account(&self, username: &str) -> StoreResult<Option<UserAccount>> {
		let guard = self.inner.lock().await;
		Ok(guard.accounts.get(&fold_name(username)).cloned())
	}

	async fn insert_account(&self, account: UserAccount) -> StoreResult<()> {
		let mut guard = self.inner.lock().await;
		let key = account.username.folded();
		if guard.accounts.contains_key(&key) {
			return Err(StoreError::Conflict(format!("account {}", account.username)));
		}
		guard.accounts.insert(key, account);
		Ok(())
	}

	async fn set_role(&self, username: &str, role: Role) -> StoreResult<bool> {
		let mut guard = self.inner.lock().await;
		match guard.accounts.get_mut(&fold_name(username)) {
			Some(account) => {
				account.role = role;
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn list_rooms(&self) -> StoreResult<Vec<Room>> {
		let guard = self.inner.lock().await;
		Ok(guard.rooms.clone())
	}

	async fn find_room(&self, id: &RoomId) -> StoreResult<Option<Room>> {
		let guard = self.inner.lock().await;
		Ok(guard.rooms.iter().find(|r| &r.id == id).cloned())
	}

	async fn insert_room(&self, room: Room) -> StoreResult<()> {
		let mut guard = self.inner.lock().await;
		let key = fold_name(&room.name);
		if guard.rooms.iter().any(|r| fold_name(&r.name) == key || r.id == room.id) {
			return Err(StoreError::Conflict(format!("room {}", room.name)));
		}
		guard.rooms.push(room);
		Ok(())
	}

	async fn update_customization(&self, id: &RoomId, customization: &RoomCustomization) -> StoreResult<bool> {
		let mut guard = self.inner.lock().await;
		match guard.rooms.iter_mut().find(|r| &r.id == id) {
			Some(room) => {
				room.customization = customization.clone();
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn delete_room(&self, id: &RoomId) -> StoreResult<bool> {
		let mut guard = self.inner.lock().await;
		let before = guard.rooms.len();
		guard.rooms.retain(|r| &r.id != id);
		if guard.rooms.len() == before {
			return Ok(false);
		}
		guard.messages.retain(|m| &m.room_id != id);
		Ok(true)
	}

	async fn insert_message(&self, message: RoomMessage) -> StoreResult<()> {
		let mut guard = self.inner.lock().await;
		if !guard.rooms.iter().any(|r| r.id == message.room_id) {
			return Err(StoreError::NotFound(format!("room {}", message.room_id)));
		}
		guard.messages.push(message);
		Ok(())
	}

	async fn recent_messages(&self, room: &RoomId, limit: usize) -> StoreResult<Vec<RoomMessage>> {
		let guard = self.inner.lock().await;
		let mut out = guard
			.messages
			.iter()
			.rev()
			.filter(|m| &m.room_id == room)
			.take(limit)
			.cloned()
			.collect::<Vec<_>>();
		out.reverse();
		Ok(out)
	}

	async fn find_message(&self, id: &MessageId) -> StoreResult<Option<RoomMessage>> {
		let guard = self.inner.lock().await;
		Ok(guard.messages.iter().find(|m| &m.id == id).cloned())
	}

	async fn delete_message(&self, id: &MessageId) -> StoreResult<bool> {
		let mut guard = self.inner.lock().await;
		let before = guard.messages.len();
		guard.messages.retain(|m| &m.id != id);
		Ok(guard.messages.len() != before)
	}

	async fn insert_direct_message(&self, message: DirectMessage) -> StoreResult<()> {
		let mut guard = self.inner.lock().await;
		guard.direct_messages.push(message);
		Ok(())
	}

	async fn direct_history(&self, a: &Username, b: &Username, limit: usize) -> StoreResult<Vec<DirectMessage>> {
		let guard = self.inner.lock().await;
		let mut out = guard
			.direct_messages
			.iter()
			.rev()
			.filter(|m| m.is_between(a, b))
			.take(limit)
			.cloned()
			.collect::<Vec<_>>();
		out.reverse();
		Ok(out)
	}

	async fn find_relation(&self, a: &Username, b: &Username) -> StoreResult<Option<BuddyRelation>> {
		let guard = self.inner.lock().await;
		Ok(guard.relations.get(&BuddyRelation::normalized_pair(a, b)).cloned())
	}

	async fn insert_relation(&self, relation: BuddyRelation) -> StoreResult<()> {
		let mut guard = self.inner.lock().await;
		let key = BuddyRelation::normalized_pair(&relation.user_a, &relation.user_b);
		if guard.relations.contains_key(&key) {
			return Err(StoreError::Conflict(format!("relation {} / {}", key.0, key.1)));
		}
		let relation = BuddyRelation {
			user_a: key.0.clone(),
			user_b: key.1.clone(),
			..relation
		};
		guard.relations.insert(key, relation);
		Ok(())
	}

	async fn accept_pending(&self, a: &Username, b: &Username, requested_by: &Username) -> StoreResult<bool> {
		let mut guard = self.inner.lock().await;
		match guard.relations.get_mut(&BuddyRelation::normalized_pair(a, b)) {
			Some(rel) if rel.status == BuddyStatus::Pending && &rel.requested_by == requested_by => {
				rel.status = BuddyStatus::Accepted;
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn delete_pending(&self, a: &Username, b: &Username, requested_by: &Username) -> StoreResult<bool> {
		let mut guard = self.inner.lock().await;
		let key = BuddyRelation::normalized_pair(a, b);
		let applies = matches!(
			guard.relations.get(&key),
			Some(rel) if rel.status == BuddyStatus::Pending && &rel.requested_by == requested_by
		);
		if applies {
			guard.relations.remove(&key);
		}
		Ok(applies)
	}

	async fn relations_for(&self, user: &Username) -> StoreResult<Vec<BuddyRelation>> {
		let guard = self.inner.lock().await;
		let mut out = guard
			.relations
			.values()
			.filter(|r| r.involves(user))
			.cloned()
			.collect::<Vec<_>>();
		out.sort_by_key(|r| r.created_at);
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use buzzed_domain::{DEFAULT_TEXT_COLOR, MessageId};

	use super::*;

	fn user(s: &str) -> Username {
		Username::new(s).expect("valid username")
	}

	fn room(name: &str) -> Room {
		Room {
			id: RoomId::new_v4(),
			name: name.to_string(),
			owner: user("amy"),
			created_at: 1,
			customization: RoomCustomization::default(),
		}
	}

	fn message(room: &RoomId, content: &str) -> RoomMessage {
		RoomMessage {
			id: MessageId::new_v4(),
			room_id: room.clone(),
			username: user("amy"),
			content: content.to_string(),
			text_color: DEFAULT_TEXT_COLOR.to_string(),
			reply_to: None,
			created_at: 1,
		}
	}

	#[tokio::test]
	async fn room_names_are_unique_case_insensitively() {
		let store = MemoryStore::new();
		store.insert_room(room("Lobby")).await.expect("first insert");

		let err = store.insert_room(room("lobby")).await.unwrap_err();
		assert!(matches!(err, StoreError::Conflict(_)), "got: {err:?}");
		assert_eq!(store.list_rooms().await.expect("list").len(), 1);
	}

	#[tokio::test]
	async fn recent_messages_are_capped_and_oldest_first() {
		let store = MemoryStore::new();
		let r = room("Lobby");
		let id = r.id.clone();
		store.insert_room(r).await.expect("room");

		for i in 0..5 {
			store.insert_message(message(&id, &format!("m{i}"))).await.expect("insert");
		}

		let got = store.recent_messages(&id, 3).await.expect("recent");
		let contents = got.iter().map(|m| m.content.as_str()).collect::<Vec<_>>();
		assert_eq!(contents, vec!["m2", "m3", "m4"]);
	}

	#[tokio::test]
	async fn deleting_a_room_cascades_messages() {
		let store = MemoryStore::new();
		let r = room("Lobby");
		let id = r.id.clone();
		store.insert_room(r).await.expect("room");
		let m = message(&id, "hello");
		let mid = m.id.clone();
		store.insert_message(m).await.expect("message");

		assert!(store.delete_room(&id).await.expect("delete"));
		assert!(store.find_message(&mid).await.expect("find").is_none());
		assert!(!store.delete_room(&id).await.expect("second delete"));
	}

	#[tokio::test]
	async fn pending_transitions_apply_once() {
		let store = MemoryStore::new();
		let (amy, bob) = (user("amy"), user("bob"));
		store
			.insert_relation(BuddyRelation {
				user_a: bob.clone(),
				user_b: amy.clone(),
				status: BuddyStatus::Pending,
				requested_by: bob.clone(),
				created_at: 1,
			})
			.await
			.expect("insert");

		assert!(!store.accept_pending(&amy, &bob, &amy).await.expect("wrong requester"));
		assert!(store.accept_pending(&amy, &bob, &bob).await.expect("accept"));
		assert!(!store.accept_pending(&amy, &bob, &bob).await.expect("second accept"));
		assert!(!store.delete_pending(&amy, &bob, &bob).await.expect("decline after accept"));

		let rel = store.find_relation(&bob, &amy).await.expect("find").expect("exists");
		assert_eq!(rel.status, BuddyStatus::Accepted);
		assert_eq!(rel.user_a, amy);
	}
}
