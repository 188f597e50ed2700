//! Types shared with the external HTTP services: the JWT claims issued by
//! the auth service and the request/response bodies of the history service.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Claims carried by tokens from the auth service. The relay and the issuer
/// must agree on the signing secret; the subject is the username.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Body of `POST /api/messages/save`.
///
/// One canonical shape: `message` always present (empty for E2EE traffic),
/// the `ciphertext`/`nonce`/`mac` envelope attached when the client supplied
/// one. `recipient` is a username or the literal `group`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveMessageRequest {
    pub sender: String,
    pub recipient: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl SaveMessageRequest {
    /// Build a save body stamped with the current UTC time, lifting the E2EE
    /// envelope fields out of the frame's `encrypted_data` object when present.
    pub fn new(
        sender: &str,
        recipient: &str,
        message: &str,
        kind: &str,
        encrypted_data: Option<&Value>,
    ) -> Self {
        let field = |name: &str| {
            encrypted_data
                .and_then(|data| data.get(name))
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        Self {
            sender: sender.to_owned(),
            recipient: recipient.to_owned(),
            message: message.to_owned(),
            kind: kind.to_owned(),
            timestamp: Utc::now().to_rfc3339(),
            ciphertext: field("ciphertext"),
            nonce: field("nonce"),
            mac: field("mac"),
        }
    }
}

/// Body of `GET /api/messages/history`. Stored messages are forwarded to
/// clients opaquely, so they stay untyped here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Body of `GET /api/chats/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatListResponse {
    #[serde(default)]
    pub chats: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_body_lifts_encryption_envelope() {
        let envelope = json!({"ciphertext": "c1", "nonce": "n1", "mac": "m1"});
        let body = SaveMessageRequest::new("alice", "bob", "", "dm", Some(&envelope));
        assert_eq!(body.ciphertext.as_deref(), Some("c1"));
        assert_eq!(body.nonce.as_deref(), Some("n1"));
        assert_eq!(body.mac.as_deref(), Some("m1"));

        let encoded = serde_json::to_value(&body).unwrap();
        assert_eq!(encoded["type"], "dm");
        assert_eq!(encoded["recipient"], "bob");
    }

    #[test]
    fn plaintext_save_body_omits_envelope_fields() {
        let body = SaveMessageRequest::new("alice", "group", "hello", "group", None);
        let encoded = serde_json::to_value(&body).unwrap();
        assert_eq!(encoded["message"], "hello");
        assert!(encoded.get("ciphertext").is_none());
        assert!(encoded.get("nonce").is_none());
        assert!(encoded.get("mac").is_none());
    }

    #[test]
    fn history_response_tolerates_missing_messages() {
        let body: HistoryResponse = serde_json::from_str("{}").unwrap();
        assert!(body.messages.is_empty());
    }
}
