#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parley_hub::Client;
use parley_protocol::EnvelopeCodec;
use parley_protocol::framing::try_decode_frame_from_buffer;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::gateway::Gateway;
use crate::session::{Session, SessionState};
use crate::transport::{SessionRegistry, TransportOptions};

/// Accept framed-envelope TCP connections until shutdown, then drain.
pub async fn serve_tcp(
	listener: TcpListener,
	gateway: Arc<Gateway>,
	codec: Arc<dyn EnvelopeCodec>,
	registry: Arc<SessionRegistry>,
	opts: TransportOptions,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let addr = listener.local_addr()?;
	info!(%addr, codec = %codec.kind(), "tcp listener ready");

	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						metrics::counter!("parley_connections_total", "transport" => "tcp").increment(1);

						let gateway = Arc::clone(&gateway);
						let codec = Arc::clone(&codec);
						let registry = Arc::clone(&registry);
						let opts = opts.clone();
						let shutdown = shutdown.clone();
						tokio::spawn(async move {
							serve_conn(stream, peer.to_string(), gateway, codec, registry, opts, shutdown).await;
						});
					}
					Err(e) => {
						warn!(error = %e, "tcp accept failed");
					}
				}
			}
		}
	}

	info!(%addr, "tcp listener shutting down");
	registry.close_all().await;
	registry.drain(opts.drain_window).await;
	Ok(())
}

async fn serve_conn(
	stream: TcpStream,
	peer: String,
	gateway: Arc<Gateway>,
	codec: Arc<dyn EnvelopeCodec>,
	registry: Arc<SessionRegistry>,
	opts: TransportOptions,
	mut shutdown: watch::Receiver<bool>,
) {
	let (mut read_half, write_half) = stream.into_split();

	let id = uuid::Uuid::new_v4().to_string();
	let client = Arc::new(Client::new(id.clone(), opts.out_buffer));
	client.meta_set("level", "0");

	let session = Session::new_tcp(
		id,
		peer,
		Arc::clone(&client),
		codec.clone(),
		write_half,
		opts.write_timeout,
		opts.max_frame_size,
	);

	registry.add(&session);
	debug!(session = %session.id(), remote = %session.remote_addr(), "tcp connection accepted");

	gateway.on_session_open(&session).await;

	let writer = spawn_outbound_writer(Arc::clone(&session), &client);

	let mut closed_rx = session.closed_signal();
	let mut buf = BytesMut::with_capacity(16 * 1024);
	let mut tmp = [0u8; 8192];

	// The greeting may already have failed and closed the session; the
	// subscription above would then never observe the transition.
	'read: while session.state() == SessionState::Active {
		let n = tokio::select! {
			_ = closed_rx.changed() => break 'read,
			_ = shutdown.changed() => break 'read,
			read = read_with_deadline(&mut read_half, &mut tmp, opts.read_timeout) => match read {
				Ok(0) => break 'read,
				Ok(n) => n,
				Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
					debug!(session = %session.id(), "read deadline elapsed");
					break 'read;
				}
				Err(e) => {
					debug!(session = %session.id(), error = %e, "tcp read failed");
					break 'read;
				}
			},
		};

		buf.extend_from_slice(&tmp[..n]);

		loop {
			match try_decode_frame_from_buffer(&mut buf, opts.max_frame_size) {
				Ok(Some(frame)) => {
					metrics::counter!("parley_envelopes_in_total", "transport" => "tcp").increment(1);
					match codec.decode(&frame, opts.max_frame_size) {
						Ok(env) => {
							session.touch();
							gateway.on_envelope(&session, env).await;
						}
						Err(e) => {
							// One malformed envelope does not kill the session.
							metrics::counter!("parley_decode_errors_total", "transport" => "tcp").increment(1);
							warn!(session = %session.id(), error = %e, "envelope decode failed");
						}
					}
				}
				Ok(None) => break,
				Err(e) => {
					warn!(session = %session.id(), error = %e, "framing error, closing connection");
					break 'read;
				}
			}
		}
	}

	gateway.on_session_close(&session).await;
	session.close().await;
	registry.remove(session.id());
	let _ = writer.await;
	debug!(session = %session.id(), "tcp connection finished");
}

/// Drain the client's outbound queue through the session's serialized writer.
///
/// When the client closes (kick, `/quit`, unregister) the writer pulls the
/// whole session down with it, which cancels the reader.
pub(crate) fn spawn_outbound_writer(session: Arc<Session>, client: &Arc<Client>) -> tokio::task::JoinHandle<()> {
	let mut out_rx = client.take_outgoing();
	let mut client_closed = client.closed_signal();

	tokio::spawn(async move {
		let Some(out_rx) = out_rx.as_mut() else {
			return;
		};

		loop {
			tokio::select! {
				_ = client_closed.changed() => {
					// Flush whatever was queued before the close (farewells).
					while let Ok(env) = out_rx.try_recv() {
						if session.send(&env).await.is_err() {
							break;
						}
					}
					break;
				}
				env = out_rx.recv() => {
					let Some(env) = env else { break };
					if let Err(e) = session.send(&env).await {
						debug!(session = %session.id(), error = %e, "outbound write failed");
						break;
					}
				}
			}
		}

		session.close().await;
	})
}

async fn read_with_deadline(
	read_half: &mut OwnedReadHalf,
	tmp: &mut [u8],
	deadline: Duration,
) -> std::io::Result<usize> {
	if deadline.is_zero() {
		read_half.read(tmp).await
	} else {
		match timeout(deadline, read_half.read(tmp)).await {
			Ok(r) => r,
			Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read deadline elapsed")),
		}
	}
}
