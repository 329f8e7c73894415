#![forbid(unsafe_code)]

use core::fmt;

use buzzed_domain::{
	ConnectionId, DirectMessage, MessageId, ReplyRef, Room, RoomCustomization, RoomId, RoomMessage, TextFormatting,
	Username,
};
use serde::{Deserialize, Serialize};

/// Events sent by clients. On the wire: `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
	UseExistingUsername(ResumeIdentity),
	ChangeUsername(ChangeUsername),
	RegisterUsername(Credentials),
	LoginUsername(Credentials),
	Logout,

	GetRooms,
	/// Room name.
	CreateRoom(String),
	/// Room id.
	GetRoomData(String),
	/// Room id.
	GetRoomMembers(String),
	/// Room id.
	JoinRoom(String),
	SendMessage(SendMessage),
	DeleteMessage(DeleteMessage),
	/// Room id.
	DeleteRoom(String),
	UpdateRoomCustomization(UpdateRoomCustomization),

	SendBuddyRequest(BuddyTarget),
	BuddyRequestResponse(BuddyRequestResponse),
	LoadBuddyData,
	SendDirectMessage(SendDirectMessage),
	LoadChatHistory(LoadChatHistory),
	BuddyTypingStart(BuddyTarget),
	BuddyTypingStop(BuddyTarget),

	/// Older clients send the current room id; it is ignored.
	GetActiveUsers(Option<String>),
}

impl ClientEvent {
	/// Wire name of the event.
	pub fn name(&self) -> &'static str {
		match self {
			ClientEvent::UseExistingUsername(_) => "use_existing_username",
			ClientEvent::ChangeUsername(_) => "change_username",
			ClientEvent::RegisterUsername(_) => "register_username",
			ClientEvent::LoginUsername(_) => "login_username",
			ClientEvent::Logout => "logout",
			ClientEvent::GetRooms => "get_rooms",
			ClientEvent::CreateRoom(_) => "create_room",
			ClientEvent::GetRoomData(_) => "get_room_data",
			ClientEvent::GetRoomMembers(_) => "get_room_members",
			ClientEvent::JoinRoom(_) => "join_room",
			ClientEvent::SendMessage(_) => "send_message",
			ClientEvent::DeleteMessage(_) => "delete_message",
			ClientEvent::DeleteRoom(_) => "delete_room",
			ClientEvent::UpdateRoomCustomization(_) => "update_room_customization",
			ClientEvent::SendBuddyRequest(_) => "send_buddy_request",
			ClientEvent::BuddyRequestResponse(_) => "buddy_request_response",
			ClientEvent::LoadBuddyData => "load_buddy_data",
			ClientEvent::SendDirectMessage(_) => "send_direct_message",
			ClientEvent::LoadChatHistory(_) => "load_chat_history",
			ClientEvent::BuddyTypingStart(_) => "buddy_typing_start",
			ClientEvent::BuddyTypingStop(_) => "buddy_typing_stop",
			ClientEvent::GetActiveUsers(_) => "get_active_users",
		}
	}
}

/// Identity a client remembered from an earlier session. Accepts a bare
/// username string or `{username, token}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumeIdentity {
	Plain(String),
	WithToken {
		username: String,
		#[serde(default)]
		token: Option<String>,
	},
}

impl ResumeIdentity {
	pub fn username(&self) -> &str {
		match self {
			ResumeIdentity::Plain(u) => u,
			ResumeIdentity::WithToken { username, .. } => username,
		}
	}

	pub fn token(&self) -> Option<&str> {
		match self {
			ResumeIdentity::Plain(_) => None,
			ResumeIdentity::WithToken { token, .. } => token.as_deref().filter(|t| !t.trim().is_empty()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeUsername {
	pub new_username: String,
	#[serde(default)]
	pub is_registered: bool,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
	pub username: String,
	pub password: String,
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("username", &self.username)
			.field("password", &"<redacted>")
			.finish()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
	pub room_id: String,
	pub content: String,
	#[serde(default)]
	pub text_color: Option<String>,
	#[serde(default)]
	pub reply_to: Option<ReplyRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
	pub room_id: String,
	pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoomCustomization {
	pub room_id: String,
	#[serde(default)]
	pub background_url: Option<String>,
	#[serde(default)]
	pub cursor_url: Option<String>,
	#[serde(default)]
	pub chat_background_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyTarget {
	pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyRequestResponse {
	pub to: String,
	pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDirectMessage {
	pub to: String,
	pub content: String,
	#[serde(default)]
	pub text_color: Option<String>,
	#[serde(default)]
	pub formatting: Option<TextFormatting>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadChatHistory {
	pub buddy: String,
	#[serde(default)]
	pub limit: Option<u32>,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
	UsernameAssigned(UsernameAssigned),
	UsernameChanged(UsernameChanged),
	RegisterSuccess(AuthSuccess),
	/// Legacy alias of `register_success`.
	UsernameRegistered(AuthSuccess),
	LoginSuccess(AuthSuccess),
	/// Legacy alias of `login_success`.
	LoginSuccessful(AuthSuccess),
	LogoutSuccess(UserRef),

	RoomsList(Vec<Room>),
	RoomCreated(Room),
	RoomData(Room),
	RoomMembers(RoomMembers),
	ActiveUsers(Vec<Username>),
	UserJoined(RoomPresence),
	UserLeft(RoomPresence),
	UserOnline(UserRef),
	UserOffline(UserRef),

	LoadMessages(LoadMessages),
	ReceiveMessage(RoomMessage),
	MessageDeleted(MessageDeleted),
	DeleteMessageResponse(DeleteMessageResponse),
	RoomDeleted(RoomDeleted),
	DeleteRoomResponse(DeleteRoomResponse),
	RoomCustomized(RoomCustomized),

	BuddyRequest(BuddyRequestNotice),
	BuddyRequestResponse(BuddyResponseNotice),
	BuddyDataLoaded(BuddyData),
	ReceiveDirectMessage(DirectMessageDelivery),
	OpenChatWindow(OpenChatWindow),
	ChatHistoryLoaded(ChatHistory),
	BuddyTyping(BuddyTyping),

	/// Validation, authorization, conflict and not-found failures.
	CommandError(ErrorBody),
	/// Infrastructure failures.
	Error(ErrorBody),
}

impl ServerEvent {
	pub fn command_error(message: impl Into<String>) -> Self {
		ServerEvent::CommandError(ErrorBody {
			message: message.into(),
		})
	}

	pub fn error(message: impl Into<String>) -> Self {
		ServerEvent::Error(ErrorBody {
			message: message.into(),
		})
	}

	/// Wire name of the event.
	pub fn name(&self) -> &'static str {
		match self {
			ServerEvent::UsernameAssigned(_) => "username_assigned",
			ServerEvent::UsernameChanged(_) => "username_changed",
			ServerEvent::RegisterSuccess(_) => "register_success",
			ServerEvent::UsernameRegistered(_) => "username_registered",
			ServerEvent::LoginSuccess(_) => "login_success",
			ServerEvent::LoginSuccessful(_) => "login_successful",
			ServerEvent::LogoutSuccess(_) => "logout_success",
			ServerEvent::RoomsList(_) => "rooms_list",
			ServerEvent::RoomCreated(_) => "room_created",
			ServerEvent::RoomData(_) => "room_data",
			ServerEvent::RoomMembers(_) => "room_members",
			ServerEvent::ActiveUsers(_) => "active_users",
			ServerEvent::UserJoined(_) => "user_joined",
			ServerEvent::UserLeft(_) => "user_left",
			ServerEvent::UserOnline(_) => "user_online",
			ServerEvent::UserOffline(_) => "user_offline",
			ServerEvent::LoadMessages(_) => "load_messages",
			ServerEvent::ReceiveMessage(_) => "receive_message",
			ServerEvent::MessageDeleted(_) => "message_deleted",
			ServerEvent::DeleteMessageResponse(_) => "delete_message_response",
			ServerEvent::RoomDeleted(_) => "room_deleted",
			ServerEvent::DeleteRoomResponse(_) => "delete_room_response",
			ServerEvent::RoomCustomized(_) => "room_customized",
			ServerEvent::BuddyRequest(_) => "buddy_request",
			ServerEvent::BuddyRequestResponse(_) => "buddy_request_response",
			ServerEvent::BuddyDataLoaded(_) => "buddy_data_loaded",
			ServerEvent::ReceiveDirectMessage(_) => "receive_direct_message",
			ServerEvent::OpenChatWindow(_) => "open_chat_window",
			ServerEvent::ChatHistoryLoaded(_) => "chat_history_loaded",
			ServerEvent::BuddyTyping(_) => "buddy_typing",
			ServerEvent::CommandError(_) => "command_error",
			ServerEvent::Error(_) => "error",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsernameAssigned {
	pub username: Username,
	/// Present this as `?sid=` when reconnecting to keep the identity.
	pub session_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsernameChanged {
	pub old_username: Username,
	pub new_username: Username,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSuccess {
	pub username: Username,
	/// Session token for `use_existing_username`.
	pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
	pub username: Username,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
	pub username: Username,
	pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMembers {
	pub room_id: RoomId,
	pub members: Vec<RoomMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPresence {
	pub username: Username,
	pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadMessages {
	pub room_id: RoomId,
	pub messages: Vec<RoomMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
	pub message_id: MessageId,
	pub room_id: RoomId,
	pub deleted_by: Username,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessageResponse {
	pub success: bool,
	pub message_id: MessageId,
	pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDeleted {
	pub room_id: RoomId,
	pub deleted_by: Username,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRoomResponse {
	pub success: bool,
	pub room_id: RoomId,
	pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCustomized {
	pub room_id: RoomId,
	pub customization: RoomCustomization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyRequestNotice {
	pub from: Username,
	pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyResponseNotice {
	pub from: Username,
	pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buddy {
	pub username: Username,
	pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyData {
	pub buddies: Vec<Buddy>,
	/// Pending requests addressed to the caller.
	pub requests: Vec<BuddyRequestNotice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageDelivery {
	#[serde(flatten)]
	pub message: DirectMessage,
	/// Set on the sender's copy when the recipient could not be reached.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub recipient_offline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChatWindow {
	pub from: Username,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHistory {
	pub buddy: Username,
	pub messages: Vec<DirectMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuddyTyping {
	pub username: Username,
	pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
	pub message: String,
}
