#![forbid(unsafe_code)]

use buzzed_domain::{
	BuddyRelation, DirectMessage, MessageId, Role, Room, RoomCustomization, RoomId, RoomMessage, UserAccount, Username,
};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
	/// A uniqueness constraint rejected the write.
	#[error("conflict: {0}")]
	Conflict(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable records behind the chat server.
///
/// Account and room names are unique case-insensitively; buddy relations are
/// unique per normalized pair. Implementations report violations as
/// [`StoreError::Conflict`] so concurrent writers lose cleanly.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
	/// Case-insensitive lookup.
	async fn find_account(&self, username: &str) -> StoreResult<Option<UserAccount>>;

	async fn insert_account(&self, account: UserAccount) -> StoreResult<()>;

	/// Returns `false` when no such account exists.
	async fn set_role(&self, username: &str, role: Role) -> StoreResult<bool>;

	/// All rooms, oldest first.
	async fn list_rooms(&self) -> StoreResult<Vec<Room>>;

	async fn find_room(&self, id: &RoomId) -> StoreResult<Option<Room>>;

	async fn insert_room(&self, room: Room) -> StoreResult<()>;

	async fn update_customization(&self, id: &RoomId, customization: &RoomCustomization) -> StoreResult<bool>;

	/// Deletes the room and all of its messages.
	async fn delete_room(&self, id: &RoomId) -> StoreResult<bool>;

	async fn insert_message(&self, message: RoomMessage) -> StoreResult<()>;

	/// Up to `limit` most recent messages of a room, returned oldest first.
	async fn recent_messages(&self, room: &RoomId, limit: usize) -> StoreResult<Vec<RoomMessage>>;

	async fn find_message(&self, id: &MessageId) -> StoreResult<Option<RoomMessage>>;

	async fn delete_message(&self, id: &MessageId) -> StoreResult<bool>;

	async fn insert_direct_message(&self, message: DirectMessage) -> StoreResult<()>;

	/// Up to `limit` most recent messages between `a` and `b`, oldest first.
	async fn direct_history(&self, a: &Username, b: &Username, limit: usize) -> StoreResult<Vec<DirectMessage>>;

	async fn find_relation(&self, a: &Username, b: &Username) -> StoreResult<Option<BuddyRelation>>;

	async fn insert_relation(&self, relation: BuddyRelation) -> StoreResult<()>;

	/// `pending -> accepted` when the pending request was made by
	/// `requested_by`. Returns whether the transition applied.
	async fn accept_pending(&self, a: &Username, b: &Username, requested_by: &Username) -> StoreResult<bool>;

	/// Deletes a pending request made by `requested_by`. Returns whether a
	/// row was removed.
	async fn delete_pending(&self, a: &Username, b: &Username, requested_by: &Username) -> StoreResult<bool>;

	async fn relations_for(&self, user: &Username) -> StoreResult<Vec<BuddyRelation>>;
}
