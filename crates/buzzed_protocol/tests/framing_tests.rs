use buzzed_protocol::events::{BuddyRequestResponse, SendMessage};
use buzzed_protocol::{
	ClientEvent, DEFAULT_MAX_FRAME_SIZE, FramingError, ServerEvent, decode_client_event, decode_frame, encode_frame,
	encode_server_event,
};
use proptest::prelude::*;

#[test]
fn decodes_send_message_with_defaults() {
	let text = r#"{"event":"send_message","data":{"roomId":"r1","content":"hello"}}"#;
	let ev = decode_client_event(text, DEFAULT_MAX_FRAME_SIZE).expect("decode");

	assert_eq!(
		ev,
		ClientEvent::SendMessage(SendMessage {
			room_id: "r1".into(),
			content: "hello".into(),
			text_color: None,
			reply_to: None,
		})
	);
}

#[test]
fn decodes_reply_reference_with_legacy_id_key() {
	let text = r#"{"event":"send_message","data":{"roomId":"r1","content":"yes","replyTo":{"_id":"m9","username":"amy","content":"q?"}}}"#;
	let ev = decode_client_event(text, DEFAULT_MAX_FRAME_SIZE).expect("decode");

	match ev {
		ClientEvent::SendMessage(m) => {
			let reply = m.reply_to.expect("reply");
			assert_eq!(reply.id.as_str(), "m9");
			assert_eq!(reply.username, "amy");
		}
		other => panic!("expected SendMessage, got: {other:?}"),
	}
}

#[test]
fn unknown_event_is_a_decode_error() {
	let err = decode_client_event(r#"{"event":"dance","data":{}}"#, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::Decode(_) => {}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn missing_required_field_is_a_decode_error() {
	let err = decode_client_event(
		r#"{"event":"buddy_request_response","data":{"to":"amy"}}"#,
		DEFAULT_MAX_FRAME_SIZE,
	)
	.unwrap_err();
	assert!(matches!(err, FramingError::Decode(_)));

	let ok = decode_client_event(
		r#"{"event":"buddy_request_response","data":{"to":"amy","accepted":false}}"#,
		DEFAULT_MAX_FRAME_SIZE,
	)
	.expect("decode");
	assert_eq!(
		ok,
		ClientEvent::BuddyRequestResponse(BuddyRequestResponse {
			to: "amy".into(),
			accepted: false,
		})
	);
}

#[test]
fn encode_rejects_too_large() {
	let ev = ServerEvent::command_error("a".repeat(10_000));

	let err = encode_frame(&ev, 32).unwrap_err();
	match err {
		FramingError::FrameTooLarge { len, max } => {
			assert!(len > max);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn server_events_decode_back_for_clients() {
	let text = encode_server_event(&ServerEvent::error("Failed to send message")).expect("encode");
	let back: ServerEvent = decode_frame(&text, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(back, ServerEvent::error("Failed to send message"));
}

proptest! {
	#[test]
	fn decoding_arbitrary_text_never_panics(s in ".{0,256}") {
		let _ = decode_client_event(&s, DEFAULT_MAX_FRAME_SIZE);
	}

	#[test]
	fn room_names_survive_the_envelope(name in "\\PC{1,30}") {
		let text = encode_frame(&ClientEvent::CreateRoom(name.clone()), DEFAULT_MAX_FRAME_SIZE).expect("encode");
		let back = decode_client_event(&text, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		prop_assert_eq!(back, ClientEvent::CreateRoom(name));
	}
}
