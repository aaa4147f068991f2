#![forbid(unsafe_code)]

pub mod codec;
pub mod envelope;
pub mod framing;
pub mod proto;
pub mod time;

pub use codec::{CodecError, CodecKind, EnvelopeCodec, JsonCodec, codec_for};
pub use proto::ProtobufCodec;
pub use envelope::{
	AckPayload, AckStatus, ChatPayload, CommandPayload, DirectPayload, Envelope, FileChunkPayload, FileMetaPayload,
	MessageKind, PingPayload, PongPayload, SetNamePayload, TextPayload,
};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FRAME_SIZE_CEILING, FramingError, decode_frame, encode_frame, encode_frame_into,
	try_decode_frame_from_buffer,
};

/// Protocol version written into `Envelope.version` by this node.
pub const PROTOCOL_VERSION: &str = "1";
