#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

/// Hard ceiling no configuration may exceed.
pub const FRAME_SIZE_CEILING: usize = 16 * 1024 * 1024; // 16 MiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("zero-length frame")]
	EmptyFrame,

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},
}

/// Effective limit: configured maximum clamped to the hard ceiling, 0 meaning "default".
#[inline]
pub fn effective_max(max_frame_size: usize) -> usize {
	if max_frame_size == 0 {
		DEFAULT_MAX_FRAME_SIZE
	} else {
		max_frame_size.min(FRAME_SIZE_CEILING)
	}
}

/// Encode a payload into a length-prefixed frame: `[len u32 BE][payload]`.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let max = effective_max(max_frame_size);
	if payload.is_empty() {
		return Err(FramingError::EmptyFrame);
	}
	if payload.len() > max {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max,
		});
	}

	let mut out = Vec::with_capacity(4 + payload.len());
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(payload);
	Ok(out)
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into(buf: &mut BytesMut, payload: &[u8], max_frame_size: usize) -> Result<(), FramingError> {
	let max = effective_max(max_frame_size);
	if payload.is_empty() {
		return Err(FramingError::EmptyFrame);
	}
	if payload.len() > max {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max,
		});
	}

	buf.reserve(4 + payload.len());
	buf.put_u32(payload.len() as u32);
	buf.put_slice(payload);
	Ok(())
}

/// Decode a single frame from the start of `src`, returning the payload and bytes consumed.
pub fn decode_frame(src: &[u8], max_frame_size: usize) -> Result<(Bytes, usize), FramingError> {
	let max = effective_max(max_frame_size);
	if src.len() < 4 {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len == 0 {
		return Err(FramingError::EmptyFrame);
	}
	if len > max {
		return Err(FramingError::FrameTooLarge { len, max });
	}

	let need = 4 + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	Ok((Bytes::copy_from_slice(&src[4..need]), need))
}

/// Try to decode a single frame from a growable buffer.
///
/// Returns `Ok(None)` until a whole frame is buffered. An out-of-range length
/// prefix is rejected before any payload bytes are retained or allocated.
pub fn try_decode_frame_from_buffer(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>, FramingError> {
	let max = effective_max(max_frame_size);
	if buf.len() < 4 {
		return Ok(None);
	}

	let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
	if len == 0 {
		return Err(FramingError::EmptyFrame);
	}
	if len > max {
		return Err(FramingError::FrameTooLarge { len, max });
	}

	let need = 4 + len;
	if buf.len() < need {
		return Ok(None);
	}

	let mut frame = buf.split_to(need);
	frame.advance(4);
	Ok(Some(frame.freeze()))
}
