#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context as _, anyhow};
use buzzed_domain::{
	BuddyRelation, BuddyStatus, DirectMessage, MessageId, ParseIdError, ReplyRef, Role, Room, RoomCustomization, RoomId,
	RoomMessage, TextFormatting, UserAccount, Username, fold_name,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};

use crate::store::{Store, StoreError, StoreResult};

const ROOM_COLUMNS: &str = "id, name, owner, created_at, background_url, cursor_url, chat_background_url";
const MESSAGE_COLUMNS: &str =
	"seq, id, room_id, username, content, text_color, reply_id, reply_username, reply_content, created_at";
const DIRECT_COLUMNS: &str = "seq, id, from_user, to_user, content, text_color, bold, italic, underline, created_at";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

impl SqliteStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (expected sqlite:...)"));
		}

		let options = SqliteConnectOptions::from_str(database_url)
			.context("parse sqlite database_url")?
			.create_if_missing(true);

		// Every connection to `:memory:` is its own database.
		let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
		let pool_options = if in_memory {
			SqlitePoolOptions::new()
				.max_connections(1)
				.min_connections(1)
				.idle_timeout(None)
				.max_lifetime(None)
		} else {
			SqlitePoolOptions::new().max_connections(8)
		};

		let pool = pool_options.connect_with(options).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		Ok(Self { pool })
	}
}

fn db_err(e: sqlx::Error, what: &'static str) -> StoreError {
	if let sqlx::Error::Database(db) = &e
		&& db.is_unique_violation()
	{
		return StoreError::Conflict(what.to_string());
	}
	StoreError::Backend(anyhow!(e).context(what))
}

fn invalid(e: ParseIdError, column: &str) -> StoreError {
	StoreError::Backend(anyhow!(e).context(format!("invalid value in column {column}")))
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> StoreResult<T>
where
	T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
	row.try_get(column)
		.map_err(|e| StoreError::Backend(anyhow!(e).context(format!("read column {column}"))))
}

fn username(row: &SqliteRow, column: &str) -> StoreResult<Username> {
	Username::new(get::<String>(row, column)?).map_err(|e| invalid(e, column))
}

fn account_from_row(row: &SqliteRow) -> StoreResult<UserAccount> {
	let role: String = get(row, "role")?;
	Ok(UserAccount {
		username: username(row, "username")?,
		password_hash: get(row, "password_hash")?,
		salt: get(row, "salt")?,
		role: Role::parse(&role).unwrap_or_default(),
		created_at: get(row, "created_at")?,
	})
}

fn room_from_row(row: &SqliteRow) -> StoreResult<Room> {
	Ok(Room {
		id: RoomId::new(get::<String>(row, "id")?).map_err(|e| invalid(e, "id"))?,
		name: get(row, "name")?,
		owner: username(row, "owner")?,
		created_at: get(row, "created_at")?,
		customization: RoomCustomization {
			background_url: get(row, "background_url")?,
			cursor_url: get(row, "cursor_url")?,
			chat_background_url: get(row, "chat_background_url")?,
		},
	})
}

fn message_from_row(row: &SqliteRow) -> StoreResult<RoomMessage> {
	let reply_id: Option<String> = get(row, "reply_id")?;
	let reply_to = match reply_id {
		Some(id) => Some(ReplyRef {
			id: MessageId::new(id).map_err(|e| invalid(e, "reply_id"))?,
			username: get::<Option<String>>(row, "reply_username")?.unwrap_or_default(),
			content: get::<Option<String>>(row, "reply_content")?.unwrap_or_default(),
		}),
		None => None,
	};

	Ok(RoomMessage {
		id: MessageId::new(get::<String>(row, "id")?).map_err(|e| invalid(e, "id"))?,
		room_id: RoomId::new(get::<String>(row, "room_id")?).map_err(|e| invalid(e, "room_id"))?,
		username: username(row, "username")?,
		content: get(row, "content")?,
		text_color: get(row, "text_color")?,
		reply_to,
		created_at: get(row, "created_at")?,
	})
}

fn direct_from_row(row: &SqliteRow) -> StoreResult<DirectMessage> {
	Ok(DirectMessage {
		id: MessageId::new(get::<String>(row, "id")?).map_err(|e| invalid(e, "id"))?,
		from: username(row, "from_user")?,
		to: username(row, "to_user")?,
		content: get(row, "content")?,
		text_color: get(row, "text_color")?,
		formatting: TextFormatting {
			bold: get(row, "bold")?,
			italic: get(row, "italic")?,
			underline: get(row, "underline")?,
		},
		created_at: get(row, "created_at")?,
	})
}

fn relation_from_row(row: &SqliteRow) -> StoreResult<BuddyRelation> {
	let status: String = get(row, "status")?;
	Ok(BuddyRelation {
		user_a: username(row, "user_a")?,
		user_b: username(row, "user_b")?,
		status: BuddyStatus::parse(&status)
			.ok_or_else(|| StoreError::Backend(anyhow!("unknown buddy status: {status}")))?,
		requested_by: username(row, "requested_by")?,
		created_at: get(row, "created_at")?,
	})
}

#[async_trait::async_trait]
impl Store for SqliteStore {
	async fn find_account(&self, username: &str) -> StoreResult<Option<UserAccount>> {
		let row = sqlx::query(
			"SELECT username, password_hash, salt, role, created_at FROM accounts WHERE username_lower = ?",
		)
		.bind(fold_name(username))
		.fetch_optional(&self.pool)
		.await
		.map_err(|e| db_err(e, "select account"))?;

		row.as_ref().map(account_from_row).transpose()
	}

	async fn insert_account(&self, account: UserAccount) -> StoreResult<()> {
		sqlx::query(
			"INSERT INTO accounts (username_lower, username, password_hash, salt, role, created_at) \
			VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(account.username.folded())
		.bind(account.username.as_str())
		.bind(&account.password_hash)
		.bind(&account.salt)
		.bind(account.role.as_str())
		.bind(account.created_at)
		.execute(&self.pool)
		.await
		.map_err(|e| db_err(e, "insert account"))?;
		Ok(())
	}

	async fn set_role(&self, username: &str, role: Role) -> StoreResult<bool> {
		let res = sqlx::query("UPDATE accounts SET role = ? WHERE username_lower = ?")
			.bind(role.as_str())
			.bind(fold_name(username))
			.execute(&self.pool)
			.await
			.map_err(|e| db_err(e, "update account role"))?;
		Ok(res.rows_affected() > 0)
	}

	async fn list_rooms(&self) -> StoreResult<Vec<Room>> {
		let rows = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM rooms ORDER BY seq ASC"))
			.fetch_all(&self.pool)
			.await
			.map_err(|e| db_err(e, "select rooms"))?;
		rows.iter().map(room_from_row).collect()
	}

	async fn find_room(&self, id: &RoomId) -> StoreResult<Option<Room>> {
		let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?"))
			.bind(id.as_str())
			.fetch_optional(&self.pool)
			.await
			.map_err(|e| db_err(e, "select room"))?;
		row.as_ref().map(room_from_row).transpose()
	}

	async fn insert_room(&self, room: Room) -> StoreResult<()> {
		sqlx::query(
			"INSERT INTO rooms (id, name, name_lower, owner, created_at, background_url, cursor_url, chat_background_url) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(room.id.as_str())
		.bind(&room.name)
		.bind(fold_name(&room.name))
		.bind(room.owner.as_str())
		.bind(room.created_at)
		.bind(&room.customization.background_url)
		.bind(&room.customization.cursor_url)
		.bind(&room.customization.chat_background_url)
		.execute(&self.pool)
		.await
		.map_err(|e| db_err(e, "insert room"))?;
		Ok(())
	}

	async fn update_customization(&self, id: &RoomId, customization: &RoomCustomization) -> StoreResult<bool> {
		let res = sqlx::query(
			"UPDATE rooms SET background_url = ?, cursor_url = ?, chat_background_url = ? WHERE id = ?",
		)
		.bind(&customization.background_url)
		.bind(&customization.cursor_url)
		.bind(&customization.chat_background_url)
		.bind(id.as_str())
		.execute(&self.pool)
		.await
		.map_err(|e| db_err(e, "update room customization"))?;
		Ok(res.rows_affected() > 0)
	}

	async fn delete_room(&self, id: &RoomId) -> StoreResult<bool> {
		let mut tx = self.pool.begin().await.map_err(|e| db_err(e, "begin delete room"))?;

		sqlx::query("DELETE FROM messages WHERE room_id = ?")
			.bind(id.as_str())
			.execute(&mut *tx)
			.await
			.map_err(|e| db_err(e, "delete room messages"))?;

		let res = sqlx::query("DELETE FROM rooms WHERE id = ?")
			.bind(id.as_str())
			.execute(&mut *tx)
			.await
			.map_err(|e| db_err(e, "delete room"))?;

		tx.commit().await.map_err(|e| db_err(e, "commit delete room"))?;
		Ok(res.rows_affected() > 0)
	}

	async fn insert_message(&self, message: RoomMessage) -> StoreResult<()> {
		let reply = message.reply_to.as_ref();
		let res = sqlx::query(
			"INSERT INTO messages (id, room_id, username, content, text_color, reply_id, reply_username, reply_content, created_at) \
			SELECT ?, ?, ?, ?, ?, ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM rooms WHERE id = ?)",
		)
		.bind(message.id.as_str())
		.bind(message.room_id.as_str())
		.bind(message.username.as_str())
		.bind(&message.content)
		.bind(&message.text_color)
		.bind(reply.map(|r| r.id.as_str()))
		.bind(reply.map(|r| r.username.as_str()))
		.bind(reply.map(|r| r.content.as_str()))
		.bind(message.created_at)
		.bind(message.room_id.as_str())
		.execute(&self.pool)
		.await
		.map_err(|e| db_err(e, "insert message"))?;

		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound(format!("room {}", message.room_id)));
		}
		Ok(())
	}

	async fn recent_messages(&self, room: &RoomId, limit: usize) -> StoreResult<Vec<RoomMessage>> {
		let rows = sqlx::query(&format!(
			"SELECT * FROM (SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? ORDER BY seq DESC LIMIT ?) \
			ORDER BY seq ASC"
		))
		.bind(room.as_str())
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.map_err(|e| db_err(e, "select recent messages"))?;
		rows.iter().map(message_from_row).collect()
	}

	async fn find_message(&self, id: &MessageId) -> StoreResult<Option<RoomMessage>> {
		let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
			.bind(id.as_str())
			.fetch_optional(&self.pool)
			.await
			.map_err(|e| db_err(e, "select message"))?;
		row.as_ref().map(message_from_row).transpose()
	}

	async fn delete_message(&self, id: &MessageId) -> StoreResult<bool> {
		let res = sqlx::query("DELETE FROM messages WHERE id = ?")
			.bind(id.as_str())
			.execute(&self.pool)
			.await
			.map_err(|e| db_err(e, "delete message"))?;
		Ok(res.rows_affected() > 0)
	}

	async fn insert_direct_message(&self, message: DirectMessage) -> StoreResult<()> {
		sqlx::query(
			"INSERT INTO direct_messages (id, from_user, to_user, content, text_color, bold, italic, underline, created_at) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(message.id.as_str())
		.bind(message.from.as_str())
		.bind(message.to.as_str())
		.bind(&message.content)
		.bind(&message.text_color)
		.bind(message.formatting.bold)
		.bind(message.formatting.italic)
		.bind(message.formatting.underline)
		.bind(message.created_at)
		.execute(&self.pool)
		.await
		.map_err(|e| db_err(e, "insert direct message"))?;
		Ok(())
	}

	async fn direct_history(&self, a: &Username, b: &Username, limit: usize) -> StoreResult<Vec<DirectMessage>> {
		let rows = sqlx::query(&format!(
			"SELECT * FROM (SELECT {DIRECT_COLUMNS} FROM direct_messages \
			WHERE (from_user = ? AND to_user = ?) OR (from_user = ? AND to_user = ?) \
			ORDER BY seq DESC LIMIT ?) ORDER BY seq ASC"
		))
		.bind(a.as_str())
		.bind(b.as_str())
		.bind(b.as_str())
		.bind(a.as_str())
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.map_err(|e| db_err(e, "select direct history"))?;
		rows.iter().map(direct_from_row).collect()
	}

	async fn find_relation(&self, a: &Username, b: &Username) -> StoreResult<Option<BuddyRelation>> {
		let (ua, ub) = BuddyRelation::normalized_pair(a, b);
		let row = sqlx::query(
			"SELECT user_a, user_b, status, requested_by, created_at FROM buddy_relations WHERE user_a = ? AND user_b = ?",
		)
		.bind(ua.as_str())
		.bind(ub.as_str())
		.fetch_optional(&self.pool)
		.await
		.map_err(|e| db_err(e, "select buddy relation"))?;
		row.as_ref().map(relation_from_row).transpose()
	}

	async fn insert_relation(&self, relation: BuddyRelation) -> StoreResult<()> {
		let (ua, ub) = BuddyRelation::normalized_pair(&relation.user_a, &relation.user_b);
		sqlx::query(
			"INSERT INTO buddy_relations (user_a, user_b, status, requested_by, created_at) VALUES (?, ?, ?, ?, ?)",
		)
		.bind(ua.as_str())
		.bind(ub.as_str())
		.bind(relation.status.as_str())
		.bind(relation.requested_by.as_str())
		.bind(relation.created_at)
		.execute(&self.pool)
		.await
		.map_err(|e| db_err(e, "insert buddy relation"))?;
		Ok(())
	}

	async fn accept_pending(&self, a: &Username, b: &Username, requested_by: &Username) -> StoreResult<bool> {
		let (ua, ub) = BuddyRelation::normalized_pair(a, b);
		let res = sqlx::query(
			"UPDATE buddy_relations SET status = 'accepted' \
			WHERE user_a = ? AND user_b = ? AND status = 'pending' AND requested_by = ?",
		)
		.bind(ua.as_str())
		.bind(ub.as_str())
		.bind(requested_by.as_str())
		.execute(&self.pool)
		.await
		.map_err(|e| db_err(e, "accept buddy request"))?;
		Ok(res.rows_affected() > 0)
	}

	async fn delete_pending(&self, a: &Username, b: &Username, requested_by: &Username) -> StoreResult<bool> {
		let (ua, ub) = BuddyRelation::normalized_pair(a, b);
		let res = sqlx::query(
			"DELETE FROM buddy_relations WHERE user_a = ? AND user_b = ? AND status = 'pending' AND requested_by = ?",
		)
		.bind(ua.as_str())
		.bind(ub.as_str())
		.bind(requested_by.as_str())
		.execute(&self.pool)
		.await
		.map_err(|e| db_err(e, "decline buddy request"))?;
		Ok(res.rows_affected() > 0)
	}

	async fn relations_for(&self, user: &Username) -> StoreResult<Vec<BuddyRelation>> {
		let rows = sqlx::query(
			"SELECT user_a, user_b, status, requested_by, created_at FROM buddy_relations \
			WHERE user_a = ? OR user_b = ? ORDER BY created_at ASC",
		)
		.bind(user.as_str())
		.bind(user.as_str())
		.fetch_all(&self.pool)
		.await
		.map_err(|e| db_err(e, "select buddy relations"))?;
		rows.iter().map(relation_from_row).collect()
	}
}

#[cfg(test)]
mod tests {
	use buzzed_domain::DEFAULT_TEXT_COLOR;

	use super::*;

	async fn store() -> SqliteStore {
		SqliteStore::connect("sqlite::memory:").await.expect("in-memory sqlite")
	}

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

	#[tokio::test]
	async fn rejects_non_sqlite_urls() {
		assert!(SqliteStore::connect("postgres://localhost/db").await.is_err());
	}

	#[tokio::test]
	async fn accounts_are_unique_case_insensitively() {
		let store = store().await;
		let account = UserAccount {
			username: user("Bob"),
			password_hash: "h".into(),
			salt: "s".into(),
			role: Role::Member,
			created_at: 1,
		};
		store.insert_account(account.clone()).await.expect("first");

		let dup = UserAccount {
			username: user("BOB"),
			..account
		};
		let err = store.insert_account(dup).await.unwrap_err();
		assert!(matches!(err, StoreError::Conflict(_)), "got: {err:?}");

		let found = store.find_account("bob").await.expect("find").expect("exists");
		assert_eq!(found.username.as_str(), "Bob");

		assert!(store.set_role("BOB", Role::Admin).await.expect("set role"));
		let found = store.find_account("Bob").await.expect("find").expect("exists");
		assert!(found.is_admin());
	}

	#[tokio::test]
	async fn room_lifecycle_round_trips_customization_and_cascades() {
		let store = store().await;
		let r = room("Lobby");
		let id = r.id.clone();
		store.insert_room(r).await.expect("insert");
		assert!(matches!(
			store.insert_room(room("LOBBY")).await,
			Err(StoreError::Conflict(_))
		));

		let custom = RoomCustomization {
			background_url: "bg.png".into(),
			cursor_url: String::new(),
			chat_background_url: "chat.png".into(),
		};
		assert!(store.update_customization(&id, &custom).await.expect("update"));
		let found = store.find_room(&id).await.expect("find").expect("exists");
		assert_eq!(found.customization, custom);

		for i in 0..3 {
			store
				.insert_message(RoomMessage {
					id: MessageId::new_v4(),
					room_id: id.clone(),
					username: user("amy"),
					content: format!("m{i}"),
					text_color: DEFAULT_TEXT_COLOR.into(),
					reply_to: None,
					created_at: i,
				})
				.await
				.expect("insert message");
		}
		let recent = store.recent_messages(&id, 2).await.expect("recent");
		assert_eq!(
			recent.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
			vec!["m1", "m2"]
		);

		assert!(store.delete_room(&id).await.expect("delete"));
		assert!(store.recent_messages(&id, 50).await.expect("recent").is_empty());
	}

	#[tokio::test]
	async fn message_for_missing_room_is_not_found() {
		let store = store().await;
		let err = store
			.insert_message(RoomMessage {
				id: MessageId::new_v4(),
				room_id: RoomId::new_v4(),
				username: user("amy"),
				content: "hi".into(),
				text_color: DEFAULT_TEXT_COLOR.into(),
				reply_to: None,
				created_at: 1,
			})
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::NotFound(_)), "got: {err:?}");
	}

	#[tokio::test]
	async fn direct_history_covers_both_directions() {
		let store = store().await;
		let (amy, bob, cid) = (user("amy"), user("bob"), user("cid"));

		for (i, (from, to)) in [(&amy, &bob), (&bob, &amy), (&amy, &cid), (&amy, &bob)].into_iter().enumerate() {
			store
				.insert_direct_message(DirectMessage {
					id: MessageId::new_v4(),
					from: from.clone(),
					to: to.clone(),
					content: format!("d{i}"),
					text_color: DEFAULT_TEXT_COLOR.into(),
					formatting: TextFormatting {
						bold: i == 0,
						..TextFormatting::default()
					},
					created_at: i as i64,
				})
				.await
				.expect("insert dm");
		}

		let history = store.direct_history(&bob, &amy, 50).await.expect("history");
		assert_eq!(
			history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
			vec!["d0", "d1", "d3"]
		);
		assert!(history[0].formatting.bold);
	}

	#[tokio::test]
	async fn buddy_pairs_are_unique_regardless_of_order() {
		let store = store().await;
		let (amy, bob) = (user("amy"), user("bob"));
		let rel = BuddyRelation {
			user_a: bob.clone(),
			user_b: amy.clone(),
			status: BuddyStatus::Pending,
			requested_by: bob.clone(),
			created_at: 1,
		};
		store.insert_relation(rel.clone()).await.expect("insert");

		let reversed = BuddyRelation {
			user_a: amy.clone(),
			user_b: bob.clone(),
			requested_by: amy.clone(),
			..rel
		};
		assert!(matches!(
			store.insert_relation(reversed).await,
			Err(StoreError::Conflict(_))
		));

		assert!(store.accept_pending(&amy, &bob, &bob).await.expect("accept"));
		assert!(!store.accept_pending(&amy, &bob, &bob).await.expect("again"));
		assert_eq!(store.relations_for(&amy).await.expect("relations").len(), 1);
	}
}
