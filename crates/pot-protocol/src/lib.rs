// pot-protocol: wire types and (de)serialization for the POT telemetry
// broker proxy.
//
// Two wire grammars are defined here:
//   - the external client <-> proxy grammar (`ClientFrame`, `ResponseMessage`,
//     `BulkFrame`), carried as text/binary WebSocket messages
//   - the proxy <-> worker grammar (`WorkerRequestMessage`, `ResponseMessage`,
//     `BulkFrame`), carried as length-delimited frames over a Unix socket
//
// `ResponseMessage` and `BulkFrame` are shared between both grammars: a
// worker's REP and a client's REP have the same JSON shape, only the
// transport differs.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod error_codes {
    pub const KEY_ERROR: &str = "KeyError";
    pub const VALUE_ERROR: &str = "ValueError";
    pub const TYPE_ERROR: &str = "TypeError";
    pub const RUNTIME_ERROR: &str = "RuntimeError";
}

// ---------------------------------------------------------------------------
// Transaction id
// ---------------------------------------------------------------------------

/// A 32-bit transaction id, always rendered on the wire as eight lowercase
/// hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u32);

impl TransactionId {
    pub fn parse_hex(s: &str) -> Result<Self, CodecError> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CodecError::BadFrame(format!(
                "transaction id must be 8 hex digits, got {s:?}"
            )));
        }
        u32::from_str_radix(s, 16)
            .map(TransactionId)
            .map_err(|e| CodecError::BadFrame(format!("invalid transaction id {s:?}: {e}")))
    }

    pub fn to_hex(self) -> String {
        format!("{:08x}", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for TransactionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TransactionId::parse_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    BadFrame(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// Specifically a WRITE argument that failed to parse as JSON — kept
    /// distinct from `BadFrame` so callers can map it to the wire's
    /// `TypeError` rather than `ValueError`.
    #[error("WRITE argument is not JSON: {0}")]
    InvalidWriteArgument(String),
}

// ---------------------------------------------------------------------------
// Request kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestKind {
    Read,
    Write,
    Id,
    Config,
    /// Undocumented synonym for `Id`.
    Hash,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Read => "READ",
            RequestKind::Write => "WRITE",
            RequestKind::Id => "ID",
            RequestKind::Config => "CONFIG",
            RequestKind::Hash => "HASH",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "READ" => Some(RequestKind::Read),
            "WRITE" => Some(RequestKind::Write),
            "ID" => Some(RequestKind::Id),
            "CONFIG" => Some(RequestKind::Config),
            "HASH" => Some(RequestKind::Hash),
            _ => None,
        }
    }

    /// Treat `HASH` as a synonym for `ID`.
    pub fn normalize(self) -> Self {
        match self {
            RequestKind::Hash => RequestKind::Id,
            other => other,
        }
    }
}

/// A parsed client command, independent of which grammar (raw command line
/// or JSON envelope) it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub kind: RequestKind,
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Decode a raw command-line request: `READ <name>`, `WRITE <json>`,
/// `ID [store]`, `CONFIG <store>`, `HASH [store]`.
pub fn decode_command_line(body: &str) -> Result<ParsedRequest, CodecError> {
    let body = body.trim_end_matches(['\r', '\n']);
    let (kind_str, rest) = match body.split_once(' ') {
        Some((k, r)) => (k, r.trim_start()),
        None => (body, ""),
    };
    let kind = RequestKind::from_str(kind_str)
        .ok_or_else(|| CodecError::BadFrame(format!("unknown request kind {kind_str:?}")))?;

    match kind {
        RequestKind::Read => {
            if rest.is_empty() {
                return Err(CodecError::BadFrame("READ requires a name argument".into()));
            }
            Ok(ParsedRequest {
                kind,
                name: Some(rest.to_owned()),
                data: None,
            })
        }
        RequestKind::Write => {
            let value: serde_json::Value = serde_json::from_str(rest)
                .map_err(|e| CodecError::InvalidWriteArgument(e.to_string()))?;
            let name = value
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_owned);
            Ok(ParsedRequest {
                kind,
                name,
                data: value.get("data").cloned(),
            })
        }
        RequestKind::Config => {
            if rest.is_empty() {
                return Err(CodecError::BadFrame(
                    "CONFIG requires a store argument".into(),
                ));
            }
            Ok(ParsedRequest {
                kind,
                name: Some(rest.to_owned()),
                data: None,
            })
        }
        RequestKind::Id | RequestKind::Hash => Ok(ParsedRequest {
            kind,
            name: if rest.is_empty() {
                None
            } else {
                Some(rest.to_owned())
            },
            data: None,
        }),
    }
}

/// The JSON envelope accepted on the proxy<->worker socket:
/// `{"request": KIND, "name": ..., "id": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequestMessage {
    pub request: RequestKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub id: TransactionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Client <-> proxy transport envelope
// ---------------------------------------------------------------------------

/// The envelope carried on the external request WebSocket. `id` rides
/// alongside the command the way the underlying router-socket layer would
/// attach a correlation id; `body` is the raw command-line bytes, as UTF-8
/// text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: String,
}

// ---------------------------------------------------------------------------
// Response / ACK / REP messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Ack,
    Rep,
    #[serde(rename = "REP+B")]
    RepBulk,
    Pub,
    #[serde(rename = "PUB+B")]
    PubBulk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub error_type: String,
    pub text: String,
    /// Opaque pass-through, undocumented on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(error_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            text: text.into(),
            debug: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub message: MessageKind,
    pub id: TransactionId,
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Current time as epoch seconds, for the `time` field of a `ResponseMessage`.
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn encode_response(msg: &ResponseMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<ResponseMessage, CodecError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| CodecError::BadFrame(format!("non-UTF-8 response: {e}")))?;
    Ok(serde_json::from_str(text)?)
}

// ---------------------------------------------------------------------------
// Bulk second frame: `<name>;bulk <id-hex> <raw bytes>`
// ---------------------------------------------------------------------------

pub const BULK_SUFFIX: &str = ";bulk";
pub const BUNDLE_SUFFIX: &str = ";bundle";

#[derive(Debug, Clone, PartialEq)]
pub struct BulkFrame {
    /// The element name, without the `;bulk` suffix.
    pub name: String,
    pub id: TransactionId,
    pub payload: Vec<u8>,
}

impl BulkFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(self.name.len() + BULK_SUFFIX.len() + 10 + self.payload.len());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(BULK_SUFFIX.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.id.to_hex().as_bytes());
        out.push(b' ');
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let first_space = find_byte(bytes, b' ')
            .ok_or_else(|| CodecError::BadFrame("bulk frame missing topic separator".into()))?;
        let topic = std::str::from_utf8(&bytes[..first_space])
            .map_err(|e| CodecError::BadFrame(format!("non-UTF-8 bulk topic: {e}")))?;
        let name = topic.strip_suffix(BULK_SUFFIX).ok_or_else(|| {
            CodecError::BadFrame(format!("bulk topic missing ';bulk' suffix: {topic:?}"))
        })?;

        let rest = &bytes[first_space + 1..];
        let second_space = find_byte(rest, b' ')
            .ok_or_else(|| CodecError::BadFrame("bulk frame missing id separator".into()))?;
        let id_str = std::str::from_utf8(&rest[..second_space])
            .map_err(|e| CodecError::BadFrame(format!("non-UTF-8 bulk id: {e}")))?;
        let id = TransactionId::parse_hex(id_str)?;
        let payload = rest[second_space + 1..].to_vec();

        Ok(BulkFrame {
            name: name.to_owned(),
            id,
            payload,
        })
    }

    /// Rewrite only the id component, preserving the `;bulk` suffix and the
    /// raw payload byte-exact. Used by the request relay to restore a
    /// client's original id on the way out.
    pub fn with_id(&self, id: TransactionId) -> Self {
        BulkFrame {
            name: self.name.clone(),
            id,
            payload: self.payload.clone(),
        }
    }
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

// ---------------------------------------------------------------------------
// Broadcast frames (descriptive only — the Publish Relay forwards these
// byte-exact without parsing; these helpers exist for tests that verify
// bundle/bulk coherence).
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastTopic {
    Plain { name: String },
    Bulk { name: String },
    Bundle { prefix: String },
}

pub fn classify_broadcast_topic(topic: &str) -> BroadcastTopic {
    if let Some(name) = topic.strip_suffix(BULK_SUFFIX) {
        BroadcastTopic::Bulk {
            name: name.to_owned(),
        }
    } else if let Some(prefix) = topic.strip_suffix(BUNDLE_SUFFIX) {
        BroadcastTopic::Bundle {
            prefix: prefix.to_owned(),
        }
    } else {
        BroadcastTopic::Plain {
            name: topic.to_owned(),
        }
    }
}

/// Split a `<topic> <json>` broadcast frame into its parts.
pub fn split_broadcast_frame(bytes: &[u8]) -> Result<(&str, &[u8]), CodecError> {
    let space = find_byte(bytes, b' ')
        .ok_or_else(|| CodecError::BadFrame("broadcast frame missing topic separator".into()))?;
    let topic = std::str::from_utf8(&bytes[..space])
        .map_err(|e| CodecError::BadFrame(format!("non-UTF-8 broadcast topic: {e}")))?;
    Ok((topic, &bytes[space + 1..]))
}

/// Every element of a bundle payload shares one transaction id.
pub fn validate_bundle_coherence(payload: &[u8]) -> Result<TransactionId, CodecError> {
    let entries: Vec<ResponseMessage> = serde_json::from_slice(payload)?;
    let mut ids = entries.iter().map(|e| e.id);
    let first = ids
        .next()
        .ok_or_else(|| CodecError::BadFrame("bundle payload is empty".into()))?;
    if ids.all(|id| id == first) {
        Ok(first)
    } else {
        Err(CodecError::BadFrame(
            "bundle entries do not share one transaction id".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Configuration block
// ---------------------------------------------------------------------------

/// `{name, id, elements: [...]}`. `elements` is kept opaque
/// (`serde_json::Value`) — only the top-level `id` is read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigBlock {
    pub name: String,
    pub id: TransactionId,
    pub elements: Vec<serde_json::Value>,
}
