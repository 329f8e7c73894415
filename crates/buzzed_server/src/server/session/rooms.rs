#![forbid(unsafe_code)]

use buzzed_domain::{ConnectionId, DEFAULT_TEXT_COLOR, MessageId, ReplyRef, Room, RoomId, RoomMessage, validate_room_name};
use buzzed_protocol::ServerEvent;
use buzzed_protocol::events::{
	DeleteMessage, DeleteMessageResponse, DeleteRoomResponse, LoadMessages, MessageDeleted, RoomCustomized, RoomDeleted,
	SendMessage, UpdateRoomCustomization,
};
use tracing::info;

use super::{Dispatcher, parse_room_id};
use crate::server::error::{CommandError, StoreContext as _};
use crate::server::hub::Delivery;
use crate::server::sanitize::sanitize_text;
use crate::store::StoreError;
use crate::util::time::unix_ms_now;

fn room_not_found() -> CommandError {
	CommandError::NotFound("Room not found".into())
}

/// Trimmed color or the default.
fn text_color(color: Option<String>) -> String {
	color
		.map(|c| sanitize_text(&c))
		.filter(|c| !c.is_empty())
		.unwrap_or_else(|| DEFAULT_TEXT_COLOR.to_string())
}

/// Sanitized copy of a quoted message; dropped when nothing readable is left.
fn reply_snapshot(reply: ReplyRef) -> Option<ReplyRef> {
	let username = sanitize_text(&reply.username);
	let content = sanitize_text(&reply.content);
	if username.is_empty() || content.is_empty() {
		return None;
	}
	Some(ReplyRef {
		id: reply.id,
		username,
		content,
	})
}

impl Dispatcher {
	pub(super) async fn get_rooms(&self, conn: ConnectionId) -> Result<(), CommandError> {
		let rooms = self.store.list_rooms().await.or_fail("Failed to load rooms")?;
		self.hub.send_to(conn, ServerEvent::RoomsList(rooms)).await;
		Ok(())
	}

	pub(super) async fn create_room(&self, conn: ConnectionId, raw_name: String) -> Result<(), CommandError> {
		let name = validate_room_name(&sanitize_text(&raw_name))
			.map_err(|e| CommandError::Validation(format!("Invalid room name: {e}.")))?;
		let caller = self.caller(conn).await?;

		let room = Room {
			id: RoomId::new_v4(),
			name: name.clone(),
			owner: caller.username.clone(),
			created_at: unix_ms_now(),
			customization: Default::default(),
		};

		match self.store.insert_room(room.clone()).await {
			Ok(()) => {}
			Err(StoreError::Conflict(_)) => {
				return Err(CommandError::Conflict(format!("A room named \"{name}\" already exists.")));
			}
			Err(source) => {
				return Err(CommandError::Store {
					message: "Failed to create room".into(),
					source,
				});
			}
		}

		let rooms = self.store.list_rooms().await.or_fail("Failed to load rooms")?;

		info!(conn_id = %conn, room = %room.id, name = %room.name, owner = %room.owner, "session: room created");

		self.hub
			.deliver(vec![
				Delivery::everyone(ServerEvent::RoomCreated(room)),
				Delivery::everyone(ServerEvent::RoomsList(rooms)),
			])
			.await;
		Ok(())
	}

	pub(super) async fn get_room_data(&self, conn: ConnectionId, raw_room: String) -> Result<(), CommandError> {
		let room_id = parse_room_id(&raw_room)?;
		let room = self
			.store
			.find_room(&room_id)
			.await
			.or_fail("Failed to load room")?
			.ok_or_else(room_not_found)?;

		self.hub.send_to(conn, ServerEvent::RoomData(room)).await;
		Ok(())
	}

	pub(super) async fn get_room_members(&self, conn: ConnectionId, raw_room: String) -> Result<(), CommandError> {
		let room_id = parse_room_id(&raw_room)?;
		let state = self.state.lock().await;
		let members = state.room_members_event(&room_id);
		self.hub.send_to(conn, members).await;
		Ok(())
	}

	/// Enter a room (leaving the current one) and send its recent history.
	pub(super) async fn join_room(&self, conn: ConnectionId, raw_room: String) -> Result<(), CommandError> {
		let room_id = parse_room_id(&raw_room)?;
		let room = self
			.store
			.find_room(&room_id)
			.await
			.or_fail("Failed to join room")?
			.ok_or_else(room_not_found)?;

		let messages = self
			.store
			.recent_messages(&room.id, self.settings.room_history_limit)
			.await
			.or_fail("Failed to load messages")?;

		let mut state = self.state.lock().await;
		if state.is_deleted(&room.id) {
			return Err(room_not_found());
		}
		let mut deliveries = state.join(&conn, &room.id);
		deliveries.push(Delivery::to(
			conn,
			ServerEvent::LoadMessages(LoadMessages {
				room_id: room.id.clone(),
				messages,
			}),
		));
		self.hub.deliver(deliveries).await;
		Ok(())
	}

	pub(super) async fn send_message(&self, conn: ConnectionId, msg: SendMessage) -> Result<(), CommandError> {
		let room_id = parse_room_id(&msg.room_id)?;
		let content = sanitize_text(&msg.content);
		if content.is_empty() {
			return Err(CommandError::Validation("Message content cannot be empty.".into()));
		}
		let caller = self.caller(conn).await?;

		let message = RoomMessage {
			id: MessageId::new_v4(),
			room_id: room_id.clone(),
			username: caller.username,
			content,
			text_color: text_color(msg.text_color),
			reply_to: msg.reply_to.and_then(reply_snapshot),
			created_at: unix_ms_now(),
		};

		match self.store.insert_message(message.clone()).await {
			Ok(()) => {}
			Err(StoreError::NotFound(_)) => return Err(room_not_found()),
			Err(source) => {
				return Err(CommandError::Store {
					message: "Failed to send message".into(),
					source,
				});
			}
		}

		let state = self.state.lock().await;
		let mut audience = state.room_audience(&room_id);
		if !audience.contains(&conn) {
			audience.push(conn);
		}
		self.hub
			.deliver(vec![Delivery::to_all(audience, ServerEvent::ReceiveMessage(message))])
			.await;
		Ok(())
	}

	/// Hard delete by the room owner or an admin.
	pub(super) async fn delete_message(&self, conn: ConnectionId, del: DeleteMessage) -> Result<(), CommandError> {
		let room_id = parse_room_id(&del.room_id)?;
		let message_id =
			MessageId::new(del.message_id.trim()).map_err(|_| CommandError::Validation("Message id is required.".into()))?;
		let caller = self.caller(conn).await?;

		let room = self
			.store
			.find_room(&room_id)
			.await
			.or_fail("Failed to delete message")?
			.ok_or_else(room_not_found)?;

		let message = self
			.store
			.find_message(&message_id)
			.await
			.or_fail("Failed to delete message")?;
		if message.is_none_or(|m| m.room_id != room.id) {
			return Err(CommandError::NotFound("Message not found".into()));
		}

		let is_admin = self.is_admin(&caller).await?;
		if room.owner != caller.username && !is_admin {
			return Err(CommandError::Unauthorized(
				"Only the room owner or an admin can delete messages.".into(),
			));
		}

		if !self
			.store
			.delete_message(&message_id)
			.await
			.or_fail("Failed to delete message")?
		{
			return Err(CommandError::NotFound("Message not found".into()));
		}

		info!(conn_id = %conn, room = %room.id, message = %message_id, by = %caller.username, is_admin, "session: message deleted");

		let state = self.state.lock().await;
		let audience = state.room_audience(&room.id);
		self.hub
			.deliver(vec![
				Delivery::to_all(
					audience,
					ServerEvent::MessageDeleted(MessageDeleted {
						message_id: message_id.clone(),
						room_id: room.id.clone(),
						deleted_by: caller.username.clone(),
					}),
				),
				Delivery::to(
					conn,
					ServerEvent::DeleteMessageResponse(DeleteMessageResponse {
						success: true,
						message_id,
						is_admin,
					}),
				),
			])
			.await;
		Ok(())
	}

	/// Delete a room with its messages and empty it.
	pub(super) async fn delete_room(&self, conn: ConnectionId, raw_room: String) -> Result<(), CommandError> {
		let room_id = parse_room_id(&raw_room)?;
		let caller = self.caller(conn).await?;

		let room = self
			.store
			.find_room(&room_id)
			.await
			.or_fail("Failed to delete room")?
			.ok_or_else(room_not_found)?;

		let is_admin = self.is_admin(&caller).await?;
		if room.owner != caller.username && !is_admin {
			return Err(CommandError::Unauthorized(
				"Only the room owner or an admin can delete this room.".into(),
			));
		}

		if !self.store.delete_room(&room.id).await.or_fail("Failed to delete room")? {
			return Err(room_not_found());
		}

		let mut state = self.state.lock().await;
		let evicted = state.remove_room(&room.id);

		info!(
			conn_id = %conn,
			room = %room.id,
			by = %caller.username,
			is_admin,
			evicted = evicted.len(),
			"session: room deleted"
		);

		self.hub
			.deliver(vec![
				Delivery::everyone(ServerEvent::RoomDeleted(RoomDeleted {
					room_id: room.id.clone(),
					deleted_by: caller.username.clone(),
				})),
				Delivery::to(
					conn,
					ServerEvent::DeleteRoomResponse(DeleteRoomResponse {
						success: true,
						room_id: room.id,
						is_admin,
					}),
				),
			])
			.await;
		Ok(())
	}

	/// Owner-only; provided non-empty fields replace the stored ones.
	pub(super) async fn update_room_customization(
		&self,
		conn: ConnectionId,
		update: UpdateRoomCustomization,
	) -> Result<(), CommandError> {
		let room_id = parse_room_id(&update.room_id)?;
		let caller = self.caller(conn).await?;

		let room = self
			.store
			.find_room(&room_id)
			.await
			.or_fail("Failed to update room")?
			.ok_or_else(room_not_found)?;

		if room.owner != caller.username {
			return Err(CommandError::Unauthorized(
				"Only the room owner can customize this room.".into(),
			));
		}

		let customization = room.customization.merged(
			update.background_url.as_deref(),
			update.cursor_url.as_deref(),
			update.chat_background_url.as_deref(),
		);

		if !self
			.store
			.update_customization(&room.id, &customization)
			.await
			.or_fail("Failed to update room")?
		{
			return Err(room_not_found());
		}

		let state = self.state.lock().await;
		let mut audience = state.room_audience(&room.id);
		if !audience.contains(&conn) {
			audience.push(conn);
		}
		self.hub
			.deliver(vec![Delivery::to_all(
				audience,
				ServerEvent::RoomCustomized(RoomCustomized {
					room_id: room.id,
					customization,
				}),
			)])
			.await;
		Ok(())
	}
}
