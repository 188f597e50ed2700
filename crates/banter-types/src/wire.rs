//! Frame vocabulary for the relay's TCP wire protocol.
//!
//! Every frame is one UTF-8 JSON object followed by a single `\n`. The
//! object's `type` field selects the variant; unknown types fail to decode
//! and are answered with an `error` frame by the connection handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The one frame a client may send before it is authenticated. It carries no
/// `type` tag, only the bearer token issued by the auth service.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthReply {
    pub token: Option<String>,
}

/// Frames accepted from an authenticated client.
///
/// Field-level validation (empty messages, missing recipients, size caps)
/// happens in the connection handler so the error strings match what clients
/// already expect; here a field is optional whenever a client could legally
/// omit it from the JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Group {
        #[serde(default)]
        message: String,
        encrypted_data: Option<Value>,
        timestamp: Option<Value>,
    },
    Dm {
        to: Option<String>,
        #[serde(default)]
        message: String,
        encrypted_data: Option<Value>,
        timestamp: Option<Value>,
    },
    FileTransferStart {
        file_id: Option<String>,
        file_name: Option<String>,
        file_size: Option<u64>,
        receiver: Option<String>,
    },
    FileTransferEnd {
        file_id: Option<String>,
        status: Option<String>,
    },
    RequestUsers,
    RequestHistory {
        chat_with: Option<String>,
    },
    RequestChats,
    Typing {
        to: Option<String>,
    },
}

/// Frames emitted by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    RequestAuth,
    Error {
        message: String,
    },
    System {
        message: String,
    },
    UserList {
        users: Vec<String>,
    },
    Group {
        from: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        encrypted_data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
    Dm {
        from: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sent: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        encrypted_data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
    History {
        chat_with: String,
        messages: Vec<Value>,
    },
    ChatList {
        chats: Vec<Value>,
    },
    Typing {
        from: String,
        to: String,
    },
}

impl ServerFrame {
    /// Serialize to the single-line wire form, without the trailing newline.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_dm_with_optional_fields_missing() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"dm","to":"bob","message":"hi"}"#).unwrap();
        match frame {
            ClientFrame::Dm { to, message, encrypted_data, timestamp } => {
                assert_eq!(to.as_deref(), Some("bob"));
                assert_eq!(message, "hi");
                assert!(encrypted_data.is_none());
                assert!(timestamp.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_dm_with_missing_message_as_empty() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"dm","to":"bob"}"#).unwrap();
        match frame {
            ClientFrame::Dm { message, .. } => assert!(message.is_empty()),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_unit_request_frames() {
        assert!(matches!(
            serde_json::from_str(r#"{"type":"request_users"}"#).unwrap(),
            ClientFrame::RequestUsers
        ));
        assert!(matches!(
            serde_json::from_str(r#"{"type":"request_chats"}"#).unwrap(),
            ClientFrame::RequestChats
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"shrug"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"message":"untagged"}"#).is_err());
    }

    #[test]
    fn file_transfer_start_keeps_declared_size() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"file_transfer_start","file_id":"F1","file_name":"x.bin","file_size":5,"receiver":"bob"}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::FileTransferStart { file_id, file_size, receiver, .. } => {
                assert_eq!(file_id.as_deref(), Some("F1"));
                assert_eq!(file_size, Some(5));
                assert_eq!(receiver.as_deref(), Some("bob"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn negative_file_size_is_malformed() {
        assert!(serde_json::from_str::<ClientFrame>(
            r#"{"type":"file_transfer_start","file_id":"F1","file_size":-3,"receiver":"bob"}"#
        )
        .is_err());
    }

    #[test]
    fn dm_confirmation_shape_matches_wire_contract() {
        let frame = ServerFrame::Dm {
            from: "alice".into(),
            to: Some("bob".into()),
            message: "hi".into(),
            sent: Some(true),
            encrypted_data: None,
            timestamp: None,
        };
        assert_eq!(
            frame.to_line(),
            r#"{"type":"dm","from":"alice","to":"bob","message":"hi","sent":true}"#
        );
    }

    #[test]
    fn delivered_dm_omits_confirmation_fields() {
        let frame = ServerFrame::Dm {
            from: "alice".into(),
            to: None,
            message: "hi".into(),
            sent: None,
            encrypted_data: None,
            timestamp: None,
        };
        assert_eq!(frame.to_line(), r#"{"type":"dm","from":"alice","message":"hi"}"#);
    }

    #[test]
    fn auth_reply_token_is_optional() {
        let reply: AuthReply = serde_json::from_str(r#"{}"#).unwrap();
        assert!(reply.token.is_none());
        let reply: AuthReply = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        assert_eq!(reply.token.as_deref(), Some("abc"));
    }

    #[test]
    fn user_list_round_trips() {
        let frame = ServerFrame::UserList { users: vec!["alice".into(), "bob".into()] };
        let line = frame.to_line();
        assert_eq!(line, r#"{"type":"user_list","users":["alice","bob"]}"#);
        assert!(matches!(
            serde_json::from_str(&line).unwrap(),
            ServerFrame::UserList { users } if users == ["alice", "bob"]
        ));
    }
}
