#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::envelope::Envelope;
use crate::framing::effective_max;
use crate::proto::ProtobufCodec;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("missing field: type")]
	MissingType,

	#[error("bad payload: {0}")]
	BadPayload(String),

	#[error("unsupported codec: {0}")]
	UnsupportedCodec(String),
}

/// Wire encodings selectable per listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
	Json,
	Protobuf,
}

impl CodecKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			CodecKind::Json => "json",
			CodecKind::Protobuf => "protobuf",
		}
	}

	pub const fn content_type(self) -> &'static str {
		match self {
			CodecKind::Json => "application/json",
			CodecKind::Protobuf => "application/x-protobuf",
		}
	}
}

impl fmt::Display for CodecKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CodecKind {
	type Err = CodecError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"json" => Ok(CodecKind::Json),
			"protobuf" | "proto" => Ok(CodecKind::Protobuf),
			other => Err(CodecError::UnsupportedCodec(other.to_string())),
		}
	}
}

/// Bidirectional conversion between an [`Envelope`] and frame payload bytes.
///
/// Implementations must roundtrip: `decode(encode(e)) == e` for every field
/// defined on the envelope.
pub trait EnvelopeCodec: Send + Sync {
	fn kind(&self) -> CodecKind;

	fn encode(&self, env: &Envelope) -> Result<Vec<u8>, CodecError>;

	/// Decode one envelope from `bytes`, rejecting inputs larger than `max_size`.
	fn decode(&self, bytes: &[u8], max_size: usize) -> Result<Envelope, CodecError>;
}

/// Construct the codec for a listener configuration.
pub fn codec_for(kind: CodecKind) -> Arc<dyn EnvelopeCodec> {
	match kind {
		CodecKind::Json => Arc::new(JsonCodec),
		CodecKind::Protobuf => Arc::new(ProtobufCodec),
	}
}

/// One JSON object per frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
	fn kind(&self) -> CodecKind {
		CodecKind::Json
	}

	fn encode(&self, env: &Envelope) -> Result<Vec<u8>, CodecError> {
		serde_json::to_vec(env).map_err(|e| CodecError::BadPayload(e.to_string()))
	}

	fn decode(&self, bytes: &[u8], max_size: usize) -> Result<Envelope, CodecError> {
		let max = effective_max(max_size);
		if bytes.len() > max {
			return Err(CodecError::FrameTooLarge {
				len: bytes.len(),
				max,
			});
		}

		let first = bytes.iter().copied().find(|b| !b.is_ascii_whitespace());
		if first != Some(b'{') {
			return Err(CodecError::BadPayload("payload not object".to_string()));
		}

		let env: Envelope = serde_json::from_slice(bytes).map_err(|e| CodecError::BadPayload(e.to_string()))?;
		env.validate()?;
		Ok(env)
	}
}
