//! DDP envelopes and the JSON codec.
//!
//! Every frame carries one JSON object discriminated by its `msg` field.
//! The one exception is the greeting sent right after accept, which is a
//! bare `{"server_id": ...}` object.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ConnectionError, DdpError};

/// Document fields, keyed by field name.
pub type Fields = serde_json::Map<String, Value>;

/// Message kinds a client may send.
pub const CLIENT_KINDS: &[&str] = &["connect", "ping", "pong", "method", "sub", "unsub"];

// ==================== Client -> Server ====================

/// Envelopes sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    Connect {
        version: String,
        #[serde(default, deserialize_with = "null_as_default")]
        support: Vec<String>,
        /// Session to resume. Accepted for compatibility, never honoured.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Method {
        id: String,
        method: String,
        #[serde(default, deserialize_with = "null_as_default")]
        params: Vec<Value>,
        #[serde(
            default,
            rename = "randomSeed",
            skip_serializing_if = "Option::is_none"
        )]
        random_seed: Option<Value>,
    },
    Sub {
        id: String,
        name: String,
        #[serde(default, deserialize_with = "null_as_default")]
        params: Vec<Value>,
    },
    Unsub {
        id: String,
    },
}

impl ClientMessage {
    /// The `msg` value of this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Connect { .. } => "connect",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Pong { .. } => "pong",
            ClientMessage::Method { .. } => "method",
            ClientMessage::Sub { .. } => "sub",
            ClientMessage::Unsub { .. } => "unsub",
        }
    }
}

// ==================== Server -> Client ====================

/// Envelopes sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected {
        session: String,
    },
    Failed {
        version: String,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename = "result")]
    MethodResult {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<DdpError>,
    },
    Updated {
        methods: Vec<String>,
    },
    #[serde(rename = "nosub")]
    NoSub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<DdpError>,
    },
    Ready {
        subs: Vec<String>,
    },
    Added {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Fields::is_empty")]
        fields: Fields,
    },
    Changed {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Fields::is_empty")]
        fields: Fields,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cleared: Vec<String>,
    },
    Removed {
        collection: String,
        id: String,
    },
    Error {
        reason: String,
        #[serde(
            default,
            rename = "offendingMessage",
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<Value>,
    },
}

/// Greeting sent immediately after accept, before the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_id: String,
}

// ==================== Codec ====================

/// Decode one inbound frame.
///
/// Malformed JSON, a missing `msg` field, and kinds outside [`CLIENT_KINDS`]
/// are distinguished so the connection can log precisely before closing.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ConnectionError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("msg")
        .and_then(Value::as_str)
        .ok_or(ConnectionError::MissingKind)?;
    if !CLIENT_KINDS.contains(&kind) {
        return Err(ConnectionError::UnknownKind(kind.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

pub fn encode_server_message(message: &ServerMessage) -> Result<String, ConnectionError> {
    Ok(serde_json::to_string(message)?)
}

pub fn encode_server_hello(server_id: &str) -> Result<String, ConnectionError> {
    Ok(serde_json::to_string(&ServerHello {
        server_id: server_id.to_string(),
    })?)
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_connect() {
        let msg =
            decode_client_message(r#"{"msg":"connect","version":"1","support":["1","pre2"]}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Connect {
                version: "1".to_string(),
                support: vec!["1".to_string(), "pre2".to_string()],
                session: None,
            }
        );
    }

    #[test]
    fn test_decode_method_defaults_params() {
        let msg = decode_client_message(r#"{"msg":"method","id":"2","method":"hello"}"#).unwrap();
        match msg {
            ClientMessage::Method { params, .. } => assert!(params.is_empty()),
            other => panic!("unexpected {:?}", other),
        }

        let msg = decode_client_message(r#"{"msg":"sub","id":"3","name":"x","params":null}"#)
            .unwrap();
        assert_eq!(msg.kind(), "sub");
    }

    #[test]
    fn test_decode_method_random_seed() {
        let msg = decode_client_message(
            r#"{"msg":"method","id":"7","method":"m","params":[1],"randomSeed":"abc"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Method {
                random_seed,
                params,
                ..
            } => {
                assert_eq!(random_seed, Some(json!("abc")));
                assert_eq!(params, vec![json!(1)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_kind() {
        let err = decode_client_message(r#"{"msg":"teleport"}"#).unwrap_err();
        assert!(matches!(err, ConnectionError::UnknownKind(kind) if kind == "teleport"));
    }

    #[test]
    fn test_decode_missing_kind_and_garbage() {
        assert!(matches!(
            decode_client_message(r#"{"id":"1"}"#),
            Err(ConnectionError::MissingKind)
        ));
        assert!(matches!(
            decode_client_message("not json"),
            Err(ConnectionError::Decode(_))
        ));
        // Known kind with a missing required field
        assert!(matches!(
            decode_client_message(r#"{"msg":"unsub"}"#),
            Err(ConnectionError::Decode(_))
        ));
    }

    #[test]
    fn test_encode_result_omits_absent_fields() {
        let text = encode_server_message(&ServerMessage::MethodResult {
            id: "2".to_string(),
            result: Some(json!("Hello Miguel")),
            error: None,
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"msg": "result", "id": "2", "result": "Hello Miguel"}));
    }

    #[test]
    fn test_encode_nosub_and_changed() {
        let value: Value = serde_json::from_str(
            &encode_server_message(&ServerMessage::NoSub {
                id: "3".to_string(),
                error: None,
            })
            .unwrap(),
        )
        .unwrap();
        assert_eq!(value, json!({"msg": "nosub", "id": "3"}));

        let mut fields = Fields::new();
        fields.insert("a".to_string(), json!(1));
        let value: Value = serde_json::from_str(
            &encode_server_message(&ServerMessage::Changed {
                collection: "c".to_string(),
                id: "d".to_string(),
                fields,
                cleared: vec!["b".to_string()],
            })
            .unwrap(),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({"msg": "changed", "collection": "c", "id": "d", "fields": {"a": 1}, "cleared": ["b"]})
        );
    }

    #[test]
    fn test_encode_server_hello() {
        assert_eq!(encode_server_hello("0").unwrap(), r#"{"server_id":"0"}"#);
    }

    #[test]
    fn test_encode_pong_echoes_id() {
        let text = encode_server_message(&ServerMessage::Pong {
            id: Some("1".to_string()),
        })
        .unwrap();
        assert_eq!(text, r#"{"msg":"pong","id":"1"}"#);
        let text = encode_server_message(&ServerMessage::Pong { id: None }).unwrap();
        assert_eq!(text, r#"{"msg":"pong"}"#);
    }
}
