//! Body payloads carried inside `LogicPkt`.

use serde::{Deserialize, Serialize};

/// First packet an end user sends on a fresh gateway connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginReq {
    pub token: String,
    pub account: String,
    #[serde(default)]
    pub app: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResp {
    pub channel_id: String,
    pub account: String,
}

/// Everything the login service knows about a live end-user connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub channel_id: String,
    /// Id of the gateway holding the connection.
    pub gate_id: String,
    pub account: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub remote_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub isp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Sent by a dialing service as the first frame of an inter-service link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerHandshakeReq {
    pub service_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResp {
    pub message: String,
}

/// Pushed to a connection that lost its account to a newer login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickoutNotify {
    pub channel_id: String,
}

/// Single-chat message sent by a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReq {
    #[serde(rename = "type")]
    pub kind: i32,
    pub body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extra: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResp {
    pub message_id: i64,
    pub send_time: i64,
}

/// Message delivered to the receiving user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePush {
    pub message_id: i64,
    #[serde(rename = "type")]
    pub kind: i32,
    pub body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extra: String,
    pub sender: String,
    pub send_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_req_uses_type_field() {
        let req = MessageReq {
            kind: 1,
            body: "hello".into(),
            extra: String::new(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], 1);
        assert!(json.get("extra").is_none());
    }

    #[test]
    fn test_session_tolerates_missing_optional_fields() {
        let s: Session =
            serde_json::from_str(r#"{"channel_id":"c1","gate_id":"g1","account":"a"}"#).unwrap();
        assert_eq!(s.gate_id, "g1");
        assert!(s.tags.is_empty());
    }
}
