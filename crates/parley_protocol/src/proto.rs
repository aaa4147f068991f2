#![forbid(unsafe_code)]

use prost::Message;

use crate::codec::{CodecError, CodecKind, EnvelopeCodec};
use crate::envelope::Envelope;
use crate::framing::effective_max;

/// Protobuf form of [`Envelope`]; the logical fields match the JSON schema,
/// with the type and encoding tags encoded as enums.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvelopeProto {
	#[prost(string, tag = "1")]
	pub version: String,

	#[prost(enumeration = "KindProto", tag = "2")]
	pub kind: i32,

	#[prost(enumeration = "EncodingProto", tag = "3")]
	pub encoding: i32,

	#[prost(string, tag = "4")]
	pub mid: String,

	#[prost(string, tag = "5")]
	pub correlation_id: String,

	#[prost(string, tag = "6")]
	pub from: String,

	#[prost(string, repeated, tag = "7")]
	pub to: Vec<String>,

	#[prost(int64, tag = "8")]
	pub ts: i64,

	/// Structured payload serialized as JSON bytes; empty means absent.
	#[prost(bytes = "vec", tag = "9")]
	pub payload: Vec<u8>,

	/// Opaque binary payload; empty means absent.
	#[prost(bytes = "vec", tag = "10")]
	pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum KindProto {
	Unspecified = 0,
	Text = 1,
	SetName = 2,
	Chat = 3,
	Direct = 4,
	Command = 5,
	Ping = 6,
	Pong = 7,
	Ack = 8,
	FileMeta = 9,
	FileChunk = 10,
	Heartbeat = 11,
}

impl KindProto {
	fn from_tag(tag: &str) -> Self {
		match tag {
			"text" => KindProto::Text,
			"set_name" => KindProto::SetName,
			"chat" => KindProto::Chat,
			"direct" => KindProto::Direct,
			"command" => KindProto::Command,
			"ping" => KindProto::Ping,
			"pong" => KindProto::Pong,
			"ack" => KindProto::Ack,
			"file_meta" => KindProto::FileMeta,
			"file_chunk" => KindProto::FileChunk,
			"heartbeat" => KindProto::Heartbeat,
			_ => KindProto::Unspecified,
		}
	}

	/// Total reverse mapping; unknown values become the empty string and are
	/// surfaced as a missing type by the validator.
	const fn tag(self) -> &'static str {
		match self {
			KindProto::Unspecified => "",
			KindProto::Text => "text",
			KindProto::SetName => "set_name",
			KindProto::Chat => "chat",
			KindProto::Direct => "direct",
			KindProto::Command => "command",
			KindProto::Ping => "ping",
			KindProto::Pong => "pong",
			KindProto::Ack => "ack",
			KindProto::FileMeta => "file_meta",
			KindProto::FileChunk => "file_chunk",
			KindProto::Heartbeat => "heartbeat",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EncodingProto {
	Unspecified = 0,
	Json = 1,
	Protobuf = 2,
	Binary = 3,
}

impl EncodingProto {
	fn from_tag(tag: &str) -> Self {
		match tag {
			"json" => EncodingProto::Json,
			"protobuf" => EncodingProto::Protobuf,
			"binary" => EncodingProto::Binary,
			_ => EncodingProto::Unspecified,
		}
	}

	const fn tag(self) -> &'static str {
		match self {
			EncodingProto::Unspecified => "",
			EncodingProto::Json => "json",
			EncodingProto::Protobuf => "protobuf",
			EncodingProto::Binary => "binary",
		}
	}
}

/// Protobuf implementation of the envelope codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtobufCodec;

impl EnvelopeCodec for ProtobufCodec {
	fn kind(&self) -> CodecKind {
		CodecKind::Protobuf
	}

	fn encode(&self, env: &Envelope) -> Result<Vec<u8>, CodecError> {
		let payload = match &env.payload {
			Some(value) => serde_json::to_vec(value).map_err(|e| CodecError::BadPayload(e.to_string()))?,
			None => Vec::new(),
		};

		let msg = EnvelopeProto {
			version: env.version.clone(),
			kind: KindProto::from_tag(&env.kind) as i32,
			encoding: EncodingProto::from_tag(&env.encoding) as i32,
			mid: env.mid.clone(),
			correlation_id: env.correlation.clone(),
			from: env.from.clone(),
			to: env.to.clone(),
			ts: env.ts,
			payload,
			data: env.data.clone().unwrap_or_default(),
		};

		Ok(msg.encode_to_vec())
	}

	fn decode(&self, bytes: &[u8], max_size: usize) -> Result<Envelope, CodecError> {
		let max = effective_max(max_size);
		if bytes.len() > max {
			return Err(CodecError::FrameTooLarge {
				len: bytes.len(),
				max,
			});
		}

		let msg = EnvelopeProto::decode(bytes).map_err(|e| CodecError::BadPayload(e.to_string()))?;

		let kind = KindProto::try_from(msg.kind).unwrap_or(KindProto::Unspecified).tag();
		let encoding = EncodingProto::try_from(msg.encoding).unwrap_or(EncodingProto::Unspecified).tag();

		let payload = if msg.payload.is_empty() {
			None
		} else {
			Some(serde_json::from_slice(&msg.payload).map_err(|e| CodecError::BadPayload(e.to_string()))?)
		};

		let env = Envelope {
			version: msg.version,
			kind: kind.to_string(),
			encoding: encoding.to_string(),
			mid: msg.mid,
			correlation: msg.correlation_id,
			from: msg.from,
			to: msg.to,
			ts: msg.ts,
			payload,
			data: if msg.data.is_empty() { None } else { Some(msg.data) },
		};

		env.validate()?;
		Ok(env)
	}
}
