#![forbid(unsafe_code)]

use core::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;

use crate::codec::CodecError;
use crate::time::unix_ms_now;

/// Discriminator for the envelope payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
	Text,
	SetName,
	Chat,
	Direct,
	Command,
	Ping,
	Pong,
	Ack,
	FileMeta,
	FileChunk,
	Heartbeat,
}

impl MessageKind {
	/// Stable wire identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::SetName => "set_name",
			MessageKind::Chat => "chat",
			MessageKind::Direct => "direct",
			MessageKind::Command => "command",
			MessageKind::Ping => "ping",
			MessageKind::Pong => "pong",
			MessageKind::Ack => "ack",
			MessageKind::FileMeta => "file_meta",
			MessageKind::FileChunk => "file_chunk",
			MessageKind::Heartbeat => "heartbeat",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"text" => Some(MessageKind::Text),
			"set_name" => Some(MessageKind::SetName),
			"chat" => Some(MessageKind::Chat),
			"direct" => Some(MessageKind::Direct),
			"command" => Some(MessageKind::Command),
			"ping" => Some(MessageKind::Ping),
			"pong" => Some(MessageKind::Pong),
			"ack" => Some(MessageKind::Ack),
			"file_meta" => Some(MessageKind::FileMeta),
			"file_chunk" => Some(MessageKind::FileChunk),
			"heartbeat" => Some(MessageKind::Heartbeat),
			_ => None,
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One framed unit of the wire protocol.
///
/// The header carries routing, reliability and timing; business data lives in
/// exactly one of `payload` (structured JSON) or `data` (opaque bytes, base64
/// in the JSON encoding).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub version: String,

	/// Payload discriminator; must be non-empty after decode.
	#[serde(rename = "type")]
	pub kind: String,

	/// Payload encoding tag: `json`, `protobuf` or `binary`.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub encoding: String,

	/// Message id, the idempotency key.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub mid: String,

	/// References the `mid` of the triggering message (ack, pong).
	#[serde(default, rename = "correlation_id", skip_serializing_if = "String::is_empty")]
	pub correlation: String,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub from: String,

	/// Recipients; a bare string on the wire is accepted as a one-element list.
	#[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
	pub to: Vec<String>,

	/// Unix milliseconds, server-filled on outbound messages.
	#[serde(default, skip_serializing_if = "ts_is_zero")]
	pub ts: i64,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub payload: Option<serde_json::Value>,

	#[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
	pub data: Option<Vec<u8>>,
}

fn ts_is_zero(ts: &i64) -> bool {
	*ts == 0
}

fn one_or_many<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum OneOrMany {
		One(String),
		Many(Vec<String>),
	}

	Ok(match OneOrMany::deserialize(de)? {
		OneOrMany::One(s) => vec![s],
		OneOrMany::Many(v) => v,
	})
}

/// Base64 (standard alphabet) representation for optional binary payloads.
mod base64_opt {
	use base64::Engine as _;
	use base64::engine::general_purpose::STANDARD;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
		match v {
			Some(bytes) => ser.serialize_str(&STANDARD.encode(bytes)),
			None => ser.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
		let s = Option::<String>::deserialize(de)?;
		match s {
			Some(s) => STANDARD.decode(s.as_bytes()).map(Some).map_err(serde::de::Error::custom),
			None => Ok(None),
		}
	}
}

/// Base64 representation for required binary fields inside payloads.
pub(crate) mod base64_vec {
	use base64::Engine as _;
	use base64::engine::general_purpose::STANDARD;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(v: &[u8], ser: S) -> Result<S::Ok, S::Error> {
		ser.serialize_str(&STANDARD.encode(v))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(de)?;
		STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
	}
}

impl Envelope {
	/// New envelope of the given kind with a fresh server timestamp.
	pub fn new(kind: MessageKind) -> Self {
		Self {
			version: crate::PROTOCOL_VERSION.to_string(),
			kind: kind.as_str().to_string(),
			ts: unix_ms_now(),
			..Self::default()
		}
	}

	/// Plain text notice.
	pub fn text(text: impl Into<String>) -> Self {
		let mut env = Self::new(MessageKind::Text);
		env.payload = Some(json!({ "text": text.into() }));
		env
	}

	/// Acknowledgement referencing the triggering message id.
	pub fn ack(status: AckStatus, correlation: impl Into<String>) -> Self {
		let mut env = Self::new(MessageKind::Ack);
		env.correlation = correlation.into();
		env.payload = Some(json!({ "status": status.as_str() }));
		env
	}

	/// Pong reply carrying the ping's sequence and a fresh server timestamp.
	pub fn pong(seq: i64, correlation: impl Into<String>) -> Self {
		let mut env = Self::new(MessageKind::Pong);
		env.correlation = correlation.into();
		env.payload = Some(json!({ "seq": seq, "timestamp": env.ts }));
		env
	}

	/// Attach a typed payload.
	pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, CodecError> {
		self.payload = Some(serde_json::to_value(payload).map_err(|e| CodecError::BadPayload(e.to_string()))?);
		Ok(self)
	}

	/// Parsed kind, `None` for foreign type tags.
	pub fn message_kind(&self) -> Option<MessageKind> {
		MessageKind::parse(&self.kind)
	}

	/// Extract the structured payload as `T`.
	pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
		let value = self.payload.clone().ok_or_else(|| CodecError::BadPayload("missing payload".to_string()))?;
		serde_json::from_value(value).map_err(|e| CodecError::BadPayload(e.to_string()))
	}

	/// Header invariants shared by every codec.
	pub fn validate(&self) -> Result<(), CodecError> {
		if self.kind.is_empty() {
			return Err(CodecError::MissingType);
		}
		if self.payload.is_some() && self.data.is_some() {
			return Err(CodecError::BadPayload("payload and data are mutually exclusive".to_string()));
		}
		Ok(())
	}
}

/// Acknowledgement outcome for a rejected or accepted intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
	Ok,
	Unauthorized,
	AlreadyNamed,
	InvalidName,
	BadPayload,
	UnknownType,
}

impl AckStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			AckStatus::Ok => "ok",
			AckStatus::Unauthorized => "unauthorized",
			AckStatus::AlreadyNamed => "already_named",
			AckStatus::InvalidName => "invalid_name",
			AckStatus::BadPayload => "bad_payload",
			AckStatus::UnknownType => "unknown_type",
		}
	}
}

// ---- Typed payloads, one per message kind ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
	pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetNamePayload {
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
	pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectPayload {
	#[serde(default)]
	pub to: Vec<String>,
	pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
	pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
	pub status: AckStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
	#[serde(default)]
	pub seq: i64,
	#[serde(default)]
	pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
	#[serde(default)]
	pub seq: i64,
	#[serde(default)]
	pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetaPayload {
	pub name: String,
	pub size: i64,
	#[serde(default)]
	pub mime: String,
	#[serde(default)]
	pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunkPayload {
	pub file_id: String,
	pub chunk_id: i64,
	#[serde(with = "base64_vec")]
	pub data: Vec<u8>,
	#[serde(default)]
	pub is_last: bool,
	#[serde(default)]
	pub checksum: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn to_accepts_string_or_list() {
		let single: Envelope = serde_json::from_str(r#"{"type":"direct","to":"bob"}"#).expect("decode");
		assert_eq!(single.to, vec!["bob".to_string()]);

		let many: Envelope = serde_json::from_str(r#"{"type":"direct","to":["bob","eve"]}"#).expect("decode");
		assert_eq!(many.to, vec!["bob".to_string(), "eve".to_string()]);
	}

	#[test]
	fn data_is_base64_in_json() {
		let mut env = Envelope::new(MessageKind::FileChunk);
		env.data = Some(vec![0xde, 0xad, 0xbe, 0xef]);
		let s = serde_json::to_string(&env).expect("encode");
		assert!(s.contains(r#""data":"3q2+7w==""#), "unexpected json: {s}");

		let back: Envelope = serde_json::from_str(&s).expect("decode");
		assert_eq!(back.data.as_deref(), Some([0xde, 0xad, 0xbe, 0xef].as_slice()));
	}

	#[test]
	fn ack_references_trigger_mid() {
		let env = Envelope::ack(AckStatus::Ok, "m1");
		assert_eq!(env.correlation, "m1");
		let p: AckPayload = env.payload_as().expect("payload");
		assert_eq!(p.status, AckStatus::Ok);
	}

	#[test]
	fn pong_carries_seq_and_fresh_timestamp() {
		let env = Envelope::pong(7, "m4");
		let p: PongPayload = env.payload_as().expect("payload");
		assert_eq!(p.seq, 7);
		assert!(p.timestamp > 0);
	}

	#[test]
	fn validate_rejects_dual_payload() {
		let mut env = Envelope::text("hi");
		env.data = Some(vec![1]);
		assert!(env.validate().is_err());
	}
}
