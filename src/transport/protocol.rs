//! Bridge protocol message types.
//!
//! JSON envelopes tagged by `action`. An `execute` request is followed by a
//! second frame holding the keyword mapping (`{}` when empty).

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Extra keyword arguments passed along with an `execute` request.
pub type Keywords = serde_json::Map<String, Value>;

const ACTIONS: [&str; 3] = ["upload", "download", "execute"];

/// Request sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Store `size` raw bytes, sent right after this frame, as `filename`.
    Upload {
        filename: String,
        #[serde(deserialize_with = "number_or_text")]
        size: u64,
    },
    /// Send back the file at `filename` on the server.
    Download { filename: String },
    /// Run `command` in the executor. A keyword frame always follows.
    Execute {
        command: String,
        #[serde(default, deserialize_with = "flag")]
        is_function: bool,
    },
}

impl Request {
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Upload { .. } => "upload",
            Self::Download { .. } => "download",
            Self::Execute { .. } => "execute",
        }
    }
}

/// Response sent from server to client. Exactly one per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Response {
    /// `filename` is the stored absolute path, or `None` on failure.
    Upload {
        filename: Option<String>,
        #[serde(default)]
        error: String,
    },
    /// `size` raw bytes follow this frame when `size > 0`.
    Download {
        filename: String,
        #[serde(deserialize_with = "number_or_text")]
        size: u64,
        #[serde(default)]
        error: String,
    },
    Execute {
        #[serde(default)]
        result: String,
        #[serde(default)]
        error: String,
    },
    /// Request could not be dispatched at all. The server closes afterwards.
    Error { error: String },
}

/// Serialize any envelope to its JSON payload.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a request, separating unknown actions from malformed payloads.
pub fn decode_request(payload: &[u8]) -> Result<Request> {
    let value: Value = serde_json::from_slice(payload)?;
    let action = value
        .as_object()
        .ok_or_else(|| Error::Malformed("expected a JSON object".into()))?
        .get("action")
        .ok_or_else(|| Error::Malformed("missing `action` field".into()))?;

    let action = match action {
        Value::String(s) => s.as_str(),
        other => return Err(Error::UnsupportedAction(other.to_string())),
    };
    if !ACTIONS.contains(&action) {
        return Err(Error::UnsupportedAction(action.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

pub fn decode_response(payload: &[u8]) -> Result<Response> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decode the keyword frame that follows an `execute` request.
///
/// `null` is read as an empty mapping.
pub fn decode_keywords(payload: &[u8]) -> Result<Keywords> {
    match serde_json::from_slice(payload)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Keywords::new()),
        other => Err(Error::Malformed(format!(
            "keyword frame must be an object, got {other}"
        ))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Int(i64),
    Unsigned(u64),
    Text(String),
}

/// Byte counts arrive as numbers, or as decimal strings from older clients.
fn number_or_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    match Loose::deserialize(deserializer)? {
        Loose::Unsigned(n) => Ok(n),
        Loose::Int(n) => u64::try_from(n).map_err(|_| de::Error::custom(format!("negative size {n}"))),
        Loose::Text(s) => s.trim().parse().map_err(de::Error::custom),
        Loose::Bool(_) => Err(de::Error::custom("size must be a number")),
    }
}

/// `is_function` arrives as a bool, as 0/1, or as "0"/"1".
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    match Loose::deserialize(deserializer)? {
        Loose::Bool(b) => Ok(b),
        Loose::Int(n) => Ok(n != 0),
        Loose::Unsigned(n) => Ok(n != 0),
        Loose::Text(s) => Ok(matches!(s.trim(), "1" | "true" | "True")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_execute_request() {
        let req = Request::Execute {
            command: "result=1+1".to_string(),
            is_function: true,
        };
        let json = String::from_utf8(encode(&req).unwrap()).unwrap();
        assert!(json.contains("\"action\":\"execute\""));
        assert!(json.contains("\"is_function\":true"));
    }

    #[test]
    fn decode_upload_with_text_size() {
        let req = decode_request(br#"{"action":"upload","filename":"a.bin","size":"10"}"#).unwrap();
        assert_eq!(
            req,
            Request::Upload {
                filename: "a.bin".to_string(),
                size: 10
            }
        );
    }

    #[test]
    fn decode_execute_with_integer_flag() {
        let req = decode_request(br#"{"action":"execute","command":"x","is_function":1}"#).unwrap();
        assert!(matches!(req, Request::Execute { is_function: true, .. }));

        let req = decode_request(br#"{"action":"execute","command":"x","is_function":0}"#).unwrap();
        assert!(matches!(req, Request::Execute { is_function: false, .. }));
    }

    #[test]
    fn decode_rejects_non_json() {
        let err = decode_request(b"not json").unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn decode_rejects_missing_action() {
        let err = decode_request(br#"{"filename":"a"}"#).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn decode_rejects_missing_field() {
        let err = decode_request(br#"{"action":"download"}"#).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn decode_reports_unknown_action() {
        let err = decode_request(br#"{"action":"delete","filename":"a"}"#).unwrap_err();
        match err {
            Error::UnsupportedAction(name) => assert_eq!(name, "delete"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn upload_failure_response_has_null_filename() {
        let resp = Response::Upload {
            filename: None,
            error: "Error writing a.bin".to_string(),
        };
        let json = String::from_utf8(encode(&resp).unwrap()).unwrap();
        assert!(json.contains("\"filename\":null"));
        assert_eq!(decode_response(json.as_bytes()).unwrap(), resp);
    }

    #[test]
    fn keywords_frame() {
        assert!(decode_keywords(b"{}").unwrap().is_empty());
        assert!(decode_keywords(b"null").unwrap().is_empty());
        let kw = decode_keywords(br#"{"verbose":1,"name":"x"}"#).unwrap();
        assert_eq!(kw.len(), 2);
        assert!(matches!(decode_keywords(b"[1,2]"), Err(Error::Malformed(_))));
    }
}
