#![forbid(unsafe_code)]

use buzzed_domain::{BuddyRelation, BuddyStatus, ConnectionId, DEFAULT_TEXT_COLOR, DirectMessage, MessageId, Username};
use buzzed_protocol::ServerEvent;
use buzzed_protocol::events::{
	Buddy, BuddyData, BuddyRequestNotice, BuddyRequestResponse, BuddyResponseNotice, BuddyTarget, BuddyTyping, ChatHistory,
	DirectMessageDelivery, LoadChatHistory, OpenChatWindow, SendDirectMessage,
};
use tracing::debug;

use super::{Dispatcher, parse_username};
use crate::server::error::{CommandError, StoreContext as _};
use crate::server::hub::Delivery;
use crate::server::sanitize::sanitize_text;
use crate::store::StoreError;
use crate::util::time::unix_ms_now;

fn already_related(status: BuddyStatus, other: &Username) -> CommandError {
	match status {
		BuddyStatus::Accepted => CommandError::Conflict(format!("You are already buddies with {other}.")),
		BuddyStatus::Pending => CommandError::Conflict(format!("A buddy request with {other} is already pending.")),
	}
}

impl Dispatcher {
	pub(super) async fn send_buddy_request(&self, conn: ConnectionId, target: BuddyTarget) -> Result<(), CommandError> {
		let to = self
			.canonical_name(parse_username(&target.to)?, "Failed to send buddy request")
			.await?;
		let me = self.caller(conn).await?.username;
		if to.eq_folded(&me) {
			return Err(CommandError::Validation("You cannot send a buddy request to yourself.".into()));
		}

		if let Some(existing) = self
			.store
			.find_relation(&me, &to)
			.await
			.or_fail("Failed to send buddy request")?
		{
			return Err(already_related(existing.status, &to));
		}

		let (user_a, user_b) = BuddyRelation::normalized_pair(&me, &to);
		let relation = BuddyRelation {
			user_a,
			user_b,
			status: BuddyStatus::Pending,
			requested_by: me.clone(),
			created_at: unix_ms_now(),
		};
		let timestamp = relation.created_at;

		match self.store.insert_relation(relation).await {
			Ok(()) => {}
			Err(StoreError::Conflict(_)) => return Err(already_related(BuddyStatus::Pending, &to)),
			Err(source) => {
				return Err(CommandError::Store {
					message: "Failed to send buddy request".into(),
					source,
				});
			}
		}

		debug!(conn_id = %conn, from = %me, to = %to, "session: buddy request");

		let state = self.state.lock().await;
		if let Some(recipient) = state.presence().resolve(&to) {
			self.hub
				.send_to(recipient, ServerEvent::BuddyRequest(BuddyRequestNotice { from: me, timestamp }))
				.await;
		}
		Ok(())
	}

	/// Accept or decline a pending request that `resp.to` sent to the caller.
	pub(super) async fn buddy_request_response(
		&self,
		conn: ConnectionId,
		resp: BuddyRequestResponse,
	) -> Result<(), CommandError> {
		let requester = self
			.canonical_name(parse_username(&resp.to)?, "Failed to respond to buddy request")
			.await?;
		let me = self.caller(conn).await?.username;

		let applied = if resp.accepted {
			self.store.accept_pending(&me, &requester, &requester).await
		} else {
			self.store.delete_pending(&me, &requester, &requester).await
		}
		.or_fail("Failed to respond to buddy request")?;

		if !applied {
			return Err(CommandError::NotFound(format!("No pending buddy request from {requester}.")));
		}

		debug!(conn_id = %conn, from = %requester, to = %me, accepted = resp.accepted, "session: buddy request answered");

		let state = self.state.lock().await;
		if let Some(recipient) = state.presence().resolve(&requester) {
			self.hub
				.send_to(
					recipient,
					ServerEvent::BuddyRequestResponse(BuddyResponseNotice {
						from: me,
						accepted: resp.accepted,
					}),
				)
				.await;
		}
		Ok(())
	}

	/// Accepted buddies with their online flag plus requests awaiting the caller.
	pub(super) async fn load_buddy_data(&self, conn: ConnectionId) -> Result<(), CommandError> {
		let me = self.caller(conn).await?.username;
		let relations = self.store.relations_for(&me).await.or_fail("Failed to load buddy data")?;

		let state = self.state.lock().await;
		let mut buddies = Vec::new();
		let mut requests = Vec::new();
		for rel in relations {
			match rel.status {
				BuddyStatus::Accepted => {
					let other = rel.other(&me).clone();
					buddies.push(Buddy {
						online: state.presence().is_online(&other),
						username: other,
					});
				}
				BuddyStatus::Pending if rel.requested_by != me => requests.push(BuddyRequestNotice {
					from: rel.requested_by,
					timestamp: rel.created_at,
				}),
				BuddyStatus::Pending => {}
			}
		}
		buddies.sort_by(|a, b| a.username.cmp(&b.username));

		self.hub
			.send_to(conn, ServerEvent::BuddyDataLoaded(BuddyData { buddies, requests }))
			.await;
		Ok(())
	}

	/// Persist, echo to the sender and deliver to the recipient when online.
	pub(super) async fn send_direct_message(&self, conn: ConnectionId, dm: SendDirectMessage) -> Result<(), CommandError> {
		let to = self
			.canonical_name(parse_username(&dm.to)?, "Failed to send direct message")
			.await?;
		let content = sanitize_text(&dm.content);
		if content.is_empty() {
			return Err(CommandError::Validation("Message content cannot be empty.".into()));
		}
		let me = self.caller(conn).await?.username;

		let message = DirectMessage {
			id: MessageId::new_v4(),
			from: me.clone(),
			to: to.clone(),
			content,
			text_color: dm
				.text_color
				.map(|c| sanitize_text(&c))
				.filter(|c| !c.is_empty())
				.unwrap_or_else(|| DEFAULT_TEXT_COLOR.to_string()),
			formatting: dm.formatting.unwrap_or_default(),
			created_at: unix_ms_now(),
		};

		self.store
			.insert_direct_message(message.clone())
			.await
			.or_fail("Failed to send direct message")?;

		let state = self.state.lock().await;
		let recipient = if to == me { None } else { state.presence().resolve(&to) };

		let mut deliveries = vec![Delivery::to(
			conn,
			ServerEvent::ReceiveDirectMessage(DirectMessageDelivery {
				message: message.clone(),
				recipient_offline: recipient.is_none() && to != me,
			}),
		)];
		if let Some(recipient) = recipient
			&& recipient != conn
		{
			deliveries.push(Delivery::to(
				recipient,
				ServerEvent::ReceiveDirectMessage(DirectMessageDelivery {
					message,
					recipient_offline: false,
				}),
			));
			deliveries.push(Delivery::to(recipient, ServerEvent::OpenChatWindow(OpenChatWindow { from: me })));
		}
		self.hub.deliver(deliveries).await;
		Ok(())
	}

	pub(super) async fn load_chat_history(&self, conn: ConnectionId, req: LoadChatHistory) -> Result<(), CommandError> {
		let buddy = self
			.canonical_name(parse_username(&req.buddy)?, "Failed to load chat history")
			.await?;
		let me = self.caller(conn).await?.username;
		let limit = req
			.limit
			.map(|l| l as usize)
			.unwrap_or(self.settings.chat_history_default)
			.clamp(1, self.settings.chat_history_max);

		let messages = self
			.store
			.direct_history(&me, &buddy, limit)
			.await
			.or_fail("Failed to load chat history")?;

		self.hub
			.send_to(conn, ServerEvent::ChatHistoryLoaded(ChatHistory { buddy, messages }))
			.await;
		Ok(())
	}

	/// Typing indicators are best effort: unknown or offline recipients are
	/// ignored without an error.
	pub(super) async fn buddy_typing(&self, conn: ConnectionId, target: BuddyTarget, is_typing: bool) -> Result<(), CommandError> {
		let Ok(to) = Username::new(target.to) else {
			return Ok(());
		};

		let state = self.state.lock().await;
		let Some(me) = state.entry(&conn).map(|e| e.username.clone()) else {
			return Ok(());
		};
		if let Some(recipient) = state.presence().resolve(&to)
			&& recipient != conn
		{
			self.hub
				.send_to(recipient, ServerEvent::BuddyTyping(BuddyTyping { username: me, is_typing }))
				.await;
		}
		Ok(())
	}
}
