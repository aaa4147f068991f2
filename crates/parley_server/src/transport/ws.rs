#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parley_hub::Client;
use parley_protocol::{ChatPayload, CommandPayload, Envelope, EnvelopeCodec, MessageKind, SetNamePayload};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::gateway::Gateway;
use crate::session::{Session, SessionState};
use crate::transport::tcp::spawn_outbound_writer;
use crate::transport::{SessionRegistry, TransportOptions};

/// Server-initiated control ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Accept WebSocket connections at `path` until shutdown, then drain.
pub async fn serve_ws(
	listener: TcpListener,
	path: String,
	gateway: Arc<Gateway>,
	codec: Arc<dyn EnvelopeCodec>,
	registry: Arc<SessionRegistry>,
	opts: TransportOptions,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let addr = listener.local_addr()?;
	info!(%addr, %path, codec = %codec.kind(), "websocket listener ready");

	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						metrics::counter!("parley_connections_total", "transport" => "ws").increment(1);

						let path = path.clone();
						let gateway = Arc::clone(&gateway);
						let codec = Arc::clone(&codec);
						let registry = Arc::clone(&registry);
						let opts = opts.clone();
						let shutdown = shutdown.clone();
						tokio::spawn(async move {
							serve_conn(stream, peer.to_string(), path, gateway, codec, registry, opts, shutdown).await;
						});
					}
					Err(e) => {
						warn!(error = %e, "websocket accept failed");
					}
				}
			}
		}
	}

	info!(%addr, "websocket listener shutting down");
	registry.close_all().await;
	registry.drain(opts.drain_window).await;
	Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn serve_conn(
	stream: TcpStream,
	peer: String,
	path: String,
	gateway: Arc<Gateway>,
	codec: Arc<dyn EnvelopeCodec>,
	registry: Arc<SessionRegistry>,
	opts: TransportOptions,
	mut shutdown: watch::Receiver<bool>,
) {
	let expected_path = path;
	let check_path = |req: &Request, resp: Response| {
		if req.uri().path() == expected_path {
			Ok(resp)
		} else {
			let mut not_found = ErrorResponse::new(None);
			*not_found.status_mut() = StatusCode::NOT_FOUND;
			Err(not_found)
		}
	};

	let ws = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(remote = %peer, error = %e, "websocket upgrade rejected");
			return;
		}
	};

	let (sink, stream) = ws.split();

	let id = uuid::Uuid::new_v4().to_string();
	let client = Arc::new(Client::new(id.clone(), opts.out_buffer));
	client.meta_set("level", "0");

	let session = Session::new_ws(
		id,
		peer,
		Arc::clone(&client),
		codec.clone(),
		sink,
		opts.write_timeout,
		opts.max_frame_size,
	);

	registry.add(&session);
	debug!(session = %session.id(), remote = %session.remote_addr(), "websocket connection accepted");

	gateway.on_session_open(&session).await;

	let writer = spawn_outbound_writer(Arc::clone(&session), &client);
	let pinger = spawn_pinger(Arc::clone(&session), shutdown.clone());

	run_reader(stream, &session, &gateway, &codec, &opts, &mut shutdown).await;

	gateway.on_session_close(&session).await;
	session.close().await;
	registry.remove(session.id());
	pinger.abort();
	let _ = writer.await;
	debug!(session = %session.id(), "websocket connection finished");
}

fn spawn_pinger(session: Arc<Session>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut closed = session.closed_signal();
		let mut ticker = tokio::time::interval(PING_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		// The interval fires immediately once; skip that tick.
		ticker.tick().await;

		loop {
			tokio::select! {
				_ = closed.changed() => return,
				_ = shutdown.changed() => return,
				_ = ticker.tick() => {
					if session.send_ws_ping().await.is_err() {
						return;
					}
				}
			}
		}
	})
}

async fn run_reader(
	mut stream: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
	session: &Arc<Session>,
	gateway: &Arc<Gateway>,
	codec: &Arc<dyn EnvelopeCodec>,
	opts: &TransportOptions,
	shutdown: &mut watch::Receiver<bool>,
) {
	let mut closed_rx = session.closed_signal();

	// Covers a session that already failed its greeting: the subscription
	// above would never observe that transition.
	while session.state() == SessionState::Active {
		let msg = tokio::select! {
			_ = closed_rx.changed() => return,
			_ = shutdown.changed() => return,
			msg = next_with_deadline(&mut stream, opts.read_timeout) => msg,
		};

		let msg = match msg {
			Some(Ok(msg)) => msg,
			Some(Err(e)) => {
				debug!(session = %session.id(), error = %e, "websocket read failed");
				return;
			}
			None => return,
		};

		// Any inbound frame counts as activity.
		session.touch();

		match msg {
			Message::Text(text) => {
				handle_payload(session, gateway, codec, opts, text.as_bytes(), Some(text.as_str())).await;
			}
			Message::Binary(data) => {
				handle_payload(session, gateway, codec, opts, &data, None).await;
			}
			Message::Ping(payload) => {
				let _ = session.send_ws_pong(payload.to_vec()).await;
			}
			Message::Pong(_) => {}
			Message::Close(_) => return,
			Message::Frame(_) => {}
		}
	}
}

/// Deadline-bounded read; `None` closes the connection, matching EOF.
async fn next_with_deadline(
	stream: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
	deadline: Duration,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
	if deadline.is_zero() {
		stream.next().await
	} else {
		match timeout(deadline, stream.next()).await {
			Ok(msg) => msg,
			Err(_) => None,
		}
	}
}

/// Decode one message as an envelope, falling back to the legacy plain-text
/// mapping for text frames that are not envelopes.
async fn handle_payload(
	session: &Arc<Session>,
	gateway: &Arc<Gateway>,
	codec: &Arc<dyn EnvelopeCodec>,
	opts: &TransportOptions,
	bytes: &[u8],
	legacy_text: Option<&str>,
) {
	metrics::counter!("parley_envelopes_in_total", "transport" => "ws").increment(1);

	match codec.decode(bytes, opts.max_frame_size) {
		Ok(env) => {
			gateway.on_envelope(session, env).await;
			return;
		}
		Err(e) => {
			let Some(text) = legacy_text else {
				metrics::counter!("parley_decode_errors_total", "transport" => "ws").increment(1);
				warn!(session = %session.id(), error = %e, "websocket envelope decode failed");
				return;
			};

			let text = text.trim();
			if text.is_empty() {
				return;
			}

			if let Some(env) = legacy_envelope(session, text) {
				gateway.on_envelope(session, env).await;
			}
		}
	}
}

/// Compatibility mapping for envelope-less clients: first frame names the
/// session, `/`-prefixed frames are commands, everything else is chat.
fn legacy_envelope(session: &Arc<Session>, text: &str) -> Option<Envelope> {
	let name = session.client().name();

	if name.is_empty() {
		return Envelope::new(MessageKind::SetName)
			.with_payload(&SetNamePayload { name: text.to_string() })
			.ok();
	}

	if text.starts_with('/') {
		return Envelope::new(MessageKind::Command)
			.with_payload(&CommandPayload { raw: text.to_string() })
			.ok();
	}

	let mut env = Envelope::new(MessageKind::Chat)
		.with_payload(&ChatPayload {
			content: text.to_string(),
		})
		.ok()?;
	env.from = name;
	Some(env)
}
