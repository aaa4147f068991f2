#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use parley_hub::Client;
use parley_protocol::framing::encode_frame;
use parley_protocol::time::unix_ms_now;
use parley_protocol::{CodecError, CodecKind, Envelope, EnvelopeCodec, FramingError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("session closed")]
	Closed,

	#[error("write timeout")]
	WriteTimeout,

	#[error("codec error: {0}")]
	Codec(#[from] CodecError),

	#[error("framing error: {0}")]
	Framing(#[from] FramingError),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("websocket error: {0}")]
	Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Active,
	Closed,
}

const STATE_ACTIVE: u8 = 0;
const STATE_CLOSED: u8 = 1;

/// Write end of a live connection.
enum SessionSink {
	Tcp(OwnedWriteHalf),
	Ws(SplitSink<WebSocketStream<TcpStream>, Message>),
}

/// One live connection: identity, serialized writes, close-once semantics and
/// an activity clock for the idle supervisor.
///
/// The bounded outbound queue lives on the [`Client`]; the session only ever
/// performs the actual wire write, under its single writer mutex.
pub struct Session {
	id: String,
	remote_addr: String,
	state: AtomicU8,
	client: Arc<Client>,
	codec: Arc<dyn EnvelopeCodec>,
	sink: Mutex<SessionSink>,
	write_timeout: Duration,
	max_frame_size: usize,
	last_activity: AtomicI64,
	closed_tx: watch::Sender<bool>,
}

impl Session {
	pub fn new_tcp(
		id: impl Into<String>,
		remote_addr: impl Into<String>,
		client: Arc<Client>,
		codec: Arc<dyn EnvelopeCodec>,
		write_half: OwnedWriteHalf,
		write_timeout: Duration,
		max_frame_size: usize,
	) -> Arc<Self> {
		Self::new(
			id,
			remote_addr,
			client,
			codec,
			SessionSink::Tcp(write_half),
			write_timeout,
			max_frame_size,
		)
	}

	pub fn new_ws(
		id: impl Into<String>,
		remote_addr: impl Into<String>,
		client: Arc<Client>,
		codec: Arc<dyn EnvelopeCodec>,
		sink: SplitSink<WebSocketStream<TcpStream>, Message>,
		write_timeout: Duration,
		max_frame_size: usize,
	) -> Arc<Self> {
		Self::new(id, remote_addr, client, codec, SessionSink::Ws(sink), write_timeout, max_frame_size)
	}

	fn new(
		id: impl Into<String>,
		remote_addr: impl Into<String>,
		client: Arc<Client>,
		codec: Arc<dyn EnvelopeCodec>,
		sink: SessionSink,
		write_timeout: Duration,
		max_frame_size: usize,
	) -> Arc<Self> {
		let (closed_tx, _) = watch::channel(false);
		Arc::new(Self {
			id: id.into(),
			remote_addr: remote_addr.into(),
			state: AtomicU8::new(STATE_ACTIVE),
			client,
			codec,
			sink: Mutex::new(sink),
			write_timeout,
			max_frame_size,
			last_activity: AtomicI64::new(unix_ms_now()),
			closed_tx,
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn remote_addr(&self) -> &str {
		&self.remote_addr
	}

	pub fn state(&self) -> SessionState {
		if self.state.load(Ordering::Acquire) == STATE_CLOSED {
			SessionState::Closed
		} else {
			SessionState::Active
		}
	}

	pub fn client(&self) -> &Arc<Client> {
		&self.client
	}

	pub fn codec(&self) -> &Arc<dyn EnvelopeCodec> {
		&self.codec
	}

	pub fn max_frame_size(&self) -> usize {
		self.max_frame_size
	}

	/// Refresh the activity clock (called on every successful inbound decode).
	pub fn touch(&self) {
		self.last_activity.store(unix_ms_now(), Ordering::Relaxed);
	}

	/// Unix ms of the last successful inbound envelope.
	pub fn last_activity(&self) -> i64 {
		self.last_activity.load(Ordering::Relaxed)
	}

	/// Observes the closed transition; used by reader loops to cancel reads.
	pub fn closed_signal(&self) -> watch::Receiver<bool> {
		self.closed_tx.subscribe()
	}

	/// Encode and write one envelope, serialized against concurrent senders.
	///
	/// A deadline overrun or I/O failure transitions the session to Closed
	/// before the error is returned; writes against a closed session fail
	/// fast without touching the wire.
	pub async fn send(&self, env: &Envelope) -> Result<(), SessionError> {
		if self.state() == SessionState::Closed {
			return Err(SessionError::Closed);
		}

		let bytes = self.codec.encode(env)?;

		let mut sink = self.sink.lock().await;
		if self.state() == SessionState::Closed {
			return Err(SessionError::Closed);
		}

		let result = if self.write_timeout.is_zero() {
			write_payload(&mut sink, &bytes, self.codec.kind(), self.max_frame_size).await
		} else {
			match timeout(self.write_timeout, write_payload(&mut sink, &bytes, self.codec.kind(), self.max_frame_size)).await
			{
				Ok(r) => r,
				Err(_) => Err(SessionError::WriteTimeout),
			}
		};

		if let Err(e) = result {
			if self.mark_closed() {
				self.shutdown_sink(&mut sink).await;
			}
			return Err(e);
		}

		Ok(())
	}

	/// WebSocket control ping; a no-op on framed transports.
	pub async fn send_ws_ping(&self) -> Result<(), SessionError> {
		self.send_ws_control(Message::Ping(b"ping".to_vec().into())).await
	}

	/// WebSocket pong reply echoing the peer's ping payload.
	pub async fn send_ws_pong(&self, payload: Vec<u8>) -> Result<(), SessionError> {
		self.send_ws_control(Message::Pong(payload.into())).await
	}

	async fn send_ws_control(&self, msg: Message) -> Result<(), SessionError> {
		if self.state() == SessionState::Closed {
			return Err(SessionError::Closed);
		}

		let mut sink = self.sink.lock().await;
		if let SessionSink::Ws(ws) = &mut *sink {
			ws.send(msg).await?;
		}
		Ok(())
	}

	/// Idempotent close: single state transition, wakes the reader and the
	/// writer, then shuts the underlying stream down.
	pub async fn close(&self) {
		if !self.mark_closed() {
			return;
		}

		let mut sink = self.sink.lock().await;
		self.shutdown_sink(&mut sink).await;
	}

	/// Flip Active -> Closed exactly once; returns whether this call won.
	fn mark_closed(&self) -> bool {
		let transitioned = self
			.state
			.compare_exchange(STATE_ACTIVE, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
			.is_ok();

		if transitioned {
			self.client.close();
			let _ = self.closed_tx.send(true);
		}
		transitioned
	}

	async fn shutdown_sink(&self, sink: &mut SessionSink) {
		match sink {
			SessionSink::Tcp(write_half) => {
				let _ = write_half.shutdown().await;
			}
			SessionSink::Ws(ws) => {
				let _ = ws.send(Message::Close(None)).await;
				let _ = ws.close().await;
			}
		}
	}
}

async fn write_payload(
	sink: &mut SessionSink,
	bytes: &[u8],
	codec_kind: CodecKind,
	max_frame_size: usize,
) -> Result<(), SessionError> {
	match sink {
		SessionSink::Tcp(write_half) => {
			let frame = encode_frame(bytes, max_frame_size)?;
			write_half.write_all(&frame).await?;
			write_half.flush().await?;
			Ok(())
		}
		SessionSink::Ws(ws) => {
			let msg = match codec_kind {
				// JSON envelopes are valid UTF-8 by construction.
				CodecKind::Json => match String::from_utf8(bytes.to_vec()) {
					Ok(text) => Message::Text(text.into()),
					Err(_) => Message::Binary(bytes.to_vec().into()),
				},
				CodecKind::Protobuf => Message::Binary(bytes.to_vec().into()),
			};
			ws.send(msg).await?;
			Ok(())
		}
	}
}
