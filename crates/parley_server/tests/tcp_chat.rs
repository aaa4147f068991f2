#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parley_hub::Hub;
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use parley_protocol::time::unix_ms_now;
use parley_protocol::{
	AckPayload, AckStatus, ChatPayload, CodecKind, CommandPayload, DirectPayload, Envelope, EnvelopeCodec, MessageKind,
	PingPayload, PongPayload, SetNamePayload, TextPayload, codec_for,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use parley_server::command::{CommandRegistry, register_builtins};
use parley_server::gateway::Gateway;
use parley_server::subscriber;
use parley_server::transport::{SessionRegistry, TransportOptions, spawn_idle_supervisor, tcp};

struct TestServer {
	addr: SocketAddr,
	hub: Arc<Hub>,
	registry: Arc<SessionRegistry>,
	shutdown_tx: watch::Sender<bool>,
}

async fn start_server_with(codec: CodecKind) -> TestServer {
	let hub = Hub::new();
	let commands = CommandRegistry::new();
	register_builtins(&commands).expect("builtins");
	subscriber::register_all(&hub);

	let gateway = Gateway::new(Arc::clone(&hub), commands);
	let registry = SessionRegistry::new();

	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let opts = TransportOptions {
		out_buffer: 64,
		read_timeout: Duration::ZERO,
		write_timeout: Duration::from_secs(5),
		drain_window: Duration::from_secs(1),
		..TransportOptions::default()
	};

	tokio::spawn(tcp::serve_tcp(
		listener,
		gateway,
		codec_for(codec),
		Arc::clone(&registry),
		opts,
		shutdown_rx,
	));

	TestServer {
		addr,
		hub,
		registry,
		shutdown_tx,
	}
}

async fn start_server() -> TestServer {
	start_server_with(CodecKind::Json).await
}

struct TestClient {
	stream: TcpStream,
	buf: BytesMut,
	codec: Arc<dyn EnvelopeCodec>,
	/// Frames received while waiting for something else; later matchers scan
	/// this first, so assertion order does not depend on fan-out timing.
	backlog: std::collections::VecDeque<Envelope>,
}

impl TestClient {
	async fn connect(addr: SocketAddr) -> Self {
		Self::connect_with(addr, CodecKind::Json).await
	}

	async fn connect_with(addr: SocketAddr, codec: CodecKind) -> Self {
		let stream = timeout(Duration::from_secs(2), TcpStream::connect(addr))
			.await
			.expect("connect timeout")
			.expect("connect");
		Self {
			stream,
			buf: BytesMut::with_capacity(16 * 1024),
			codec: codec_for(codec),
			backlog: std::collections::VecDeque::new(),
		}
	}

	async fn send(&mut self, env: &Envelope) {
		let bytes = self.codec.encode(env).expect("encode");
		let frame = encode_frame(&bytes, DEFAULT_MAX_FRAME_SIZE).expect("frame");
		self.stream.write_all(&frame).await.expect("write");
	}

	async fn recv_raw(&mut self) -> Envelope {
		loop {
			if let Some(frame) = try_decode_frame_from_buffer(&mut self.buf, DEFAULT_MAX_FRAME_SIZE).expect("framing") {
				return self.codec.decode(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
			}

			let mut tmp = [0u8; 4096];
			let n = timeout(Duration::from_secs(3), self.stream.read(&mut tmp))
				.await
				.expect("read timeout")
				.expect("read");
			assert!(n > 0, "peer closed while waiting for an envelope");
			self.buf.extend_from_slice(&tmp[..n]);
		}
	}

	async fn recv_matching(&mut self, pred: impl Fn(&Envelope) -> bool) -> Envelope {
		if let Some(pos) = self.backlog.iter().position(|e| pred(e)) {
			return self.backlog.remove(pos).expect("indexed");
		}

		for _ in 0..32 {
			let env = self.recv_raw().await;
			if pred(&env) {
				return env;
			}
			self.backlog.push_back(env);
		}
		panic!("no matching envelope within 32 frames");
	}

	/// Next text envelope whose payload contains `needle`.
	async fn text_containing(&mut self, needle: &str) -> (Envelope, String) {
		let needle = needle.to_string();
		let env = self
			.recv_matching(|e| {
				e.kind == "text"
					&& e.payload_as::<TextPayload>()
						.map(|p| p.text.contains(&needle))
						.unwrap_or(false)
			})
			.await;
		let text = env.payload_as::<TextPayload>().expect("text payload").text;
		(env, text)
	}

	/// Complete the nickname handshake.
	async fn handshake(&mut self, name: &str, mid: &str) {
		let (_, greeting) = self.text_containing("请输入昵称并回车：").await;
		assert!(greeting.contains("请输入昵称并回车："));

		let mut env = Envelope::new(MessageKind::SetName);
		env.mid = mid.to_string();
		let env = env
			.with_payload(&SetNamePayload { name: name.to_string() })
			.expect("payload");
		self.send(&env).await;

		let ack = self.recv_matching(|e| e.kind == "ack").await;
		assert_eq!(ack.correlation, mid);
		let status = ack.payload_as::<AckPayload>().expect("ack payload").status;
		assert_eq!(status, AckStatus::Ok);
	}
}

#[tokio::test]
async fn name_handshake_greets_acks_and_joins() {
	let server = start_server().await;
	let mut alice = TestClient::connect(server.addr).await;

	alice.handshake("alice", "m1").await;

	assert_eq!(server.hub.list_names(), vec!["alice".to_string()]);

	// The join notice fans out to the newly registered client as well.
	let (_, joined) = alice.text_containing("加入").await;
	assert!(joined.contains("alice"), "got: {joined}");

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn empty_name_is_rejected() {
	let server = start_server().await;
	let mut client = TestClient::connect(server.addr).await;

	let mut env = Envelope::new(MessageKind::SetName);
	env.mid = "m1".to_string();
	let env = env
		.with_payload(&SetNamePayload {
			name: "   ".to_string(),
		})
		.expect("payload");
	client.send(&env).await;

	let ack = client.recv_matching(|e| e.kind == "ack").await;
	let status = ack.payload_as::<AckPayload>().expect("payload").status;
	assert_eq!(status, AckStatus::InvalidName);

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn second_set_name_is_already_named() {
	let server = start_server().await;
	let mut alice = TestClient::connect(server.addr).await;
	alice.handshake("alice", "m1").await;

	let mut env = Envelope::new(MessageKind::SetName);
	env.mid = "m2".to_string();
	let env = env
		.with_payload(&SetNamePayload {
			name: "alice2".to_string(),
		})
		.expect("payload");
	alice.send(&env).await;

	let ack = alice
		.recv_matching(|e| e.kind == "ack" && e.correlation == "m2")
		.await;
	let status = ack.payload_as::<AckPayload>().expect("payload").status;
	assert_eq!(status, AckStatus::AlreadyNamed);

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn chat_broadcasts_to_everyone_with_fresh_timestamp() {
	let server = start_server().await;
	let mut alice = TestClient::connect(server.addr).await;
	alice.handshake("alice", "m1").await;
	let mut bob = TestClient::connect(server.addr).await;
	bob.handshake("bob", "m2").await;

	let mut env = Envelope::new(MessageKind::Chat);
	env.mid = "m3".to_string();
	let env = env
		.with_payload(&ChatPayload {
			content: "hi".to_string(),
		})
		.expect("payload");
	let sent_at = unix_ms_now();
	alice.send(&env).await;

	let (env_a, text_a) = alice.text_containing("alice: hi").await;
	let (_, text_b) = bob.text_containing("alice: hi").await;
	assert_eq!(text_a, text_b);
	assert!(
		(env_a.ts - sent_at).abs() <= 1000,
		"broadcast ts {} should be within 1s of send {}",
		env_a.ts,
		sent_at
	);

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn direct_reaches_target_only_and_misses_bounce() {
	let server = start_server().await;
	let mut alice = TestClient::connect(server.addr).await;
	alice.handshake("alice", "m1").await;
	let mut bob = TestClient::connect(server.addr).await;
	bob.handshake("bob", "m2").await;

	let mut env = Envelope::new(MessageKind::Direct);
	env.mid = "m3".to_string();
	let env = env
		.with_payload(&DirectPayload {
			to: vec!["bob".to_string()],
			content: "psst".to_string(),
		})
		.expect("payload");
	alice.send(&env).await;

	let (_, direct) = bob.text_containing("psst").await;
	assert_eq!(direct, "[私信] alice: psst");

	// The sender gets no copy; an offline target bounces instead.
	let mut ghost = Envelope::new(MessageKind::Direct);
	ghost.mid = "m4".to_string();
	let ghost = ghost
		.with_payload(&DirectPayload {
			to: vec!["ghost".to_string()],
			content: "anyone?".to_string(),
		})
		.expect("payload");
	alice.send(&ghost).await;

	let (_, bounce) = alice.text_containing("用户不在线或不存在: ghost").await;
	assert!(!bounce.contains("psst"));

	// Everything alice received along the way must exclude the direct copy.
	for env in &alice.backlog {
		if let Ok(p) = env.payload_as::<TextPayload>() {
			assert!(!p.text.contains("psst"), "sender must not see the direct: {}", p.text);
		}
	}

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn ping_pongs_with_correlation_and_later_timestamp() {
	let server = start_server().await;
	let mut alice = TestClient::connect(server.addr).await;
	alice.handshake("alice", "m1").await;

	let mut env = Envelope::new(MessageKind::Ping);
	env.mid = "m4".to_string();
	let env = env
		.with_payload(&PingPayload { seq: 7, timestamp: 1000 })
		.expect("payload");
	alice.send(&env).await;

	let pong = alice
		.recv_matching(|e| e.kind == "pong" && e.correlation == "m4")
		.await;
	let payload = pong.payload_as::<PongPayload>().expect("payload");
	assert_eq!(payload.seq, 7);
	assert!(payload.timestamp > 1000);

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn unknown_type_gets_acked() {
	let server = start_server().await;
	let mut alice = TestClient::connect(server.addr).await;
	alice.handshake("alice", "m1").await;

	let mut env = Envelope::new(MessageKind::Text);
	env.kind = "telepathy".to_string();
	env.mid = "m9".to_string();
	alice.send(&env).await;

	let ack = alice
		.recv_matching(|e| e.kind == "ack" && e.correlation == "m9")
		.await;
	let status = ack.payload_as::<AckPayload>().expect("payload").status;
	assert_eq!(status, AckStatus::UnknownType);

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn malformed_frame_does_not_kill_the_session() {
	let server = start_server().await;
	let mut alice = TestClient::connect(server.addr).await;
	alice.handshake("alice", "m1").await;

	// Valid frame, invalid envelope (not a JSON object).
	let frame = encode_frame(b"not json at all", DEFAULT_MAX_FRAME_SIZE).expect("frame");
	alice.stream.write_all(&frame).await.expect("write");

	// The session survives: ping still answers.
	let mut env = Envelope::new(MessageKind::Ping);
	env.mid = "m5".to_string();
	let env = env.with_payload(&PingPayload { seq: 1, timestamp: 0 }).expect("payload");
	alice.send(&env).await;

	let pong = alice
		.recv_matching(|e| e.kind == "pong" && e.correlation == "m5")
		.await;
	assert_eq!(pong.payload_as::<PongPayload>().expect("payload").seq, 1);

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn admin_kick_closes_the_target_session() {
	let server = start_server().await;
	let mut alice = TestClient::connect(server.addr).await;
	alice.handshake("alice", "m1").await;
	let mut admin = TestClient::connect(server.addr).await;
	admin.handshake("root", "m2").await;

	let auth = Envelope::new(MessageKind::Command)
		.with_payload(&CommandPayload {
			raw: "/auth 1".to_string(),
		})
		.expect("payload");
	admin.send(&auth).await;
	admin.text_containing("权限已更新").await;

	let kick = Envelope::new(MessageKind::Command)
		.with_payload(&CommandPayload {
			raw: "/kick alice".to_string(),
		})
		.expect("payload");
	admin.send(&kick).await;
	admin.text_containing("已踢出: alice").await;

	// Alice's socket reaches EOF once her session is torn down.
	let mut saw_eof = false;
	for _ in 0..64 {
		let mut tmp = [0u8; 4096];
		match timeout(Duration::from_secs(3), alice.stream.read(&mut tmp)).await {
			Ok(Ok(0)) | Ok(Err(_)) => {
				saw_eof = true;
				break;
			}
			Ok(Ok(_)) => continue,
			Err(_) => break,
		}
	}
	assert!(saw_eof, "kicked session should be closed");
	assert!(!server.hub.list_names().contains(&"alice".to_string()));

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn who_command_lists_names() {
	let server = start_server().await;
	let mut alice = TestClient::connect(server.addr).await;
	alice.handshake("alice", "m1").await;

	let who = Envelope::new(MessageKind::Command)
		.with_payload(&CommandPayload { raw: "/who".to_string() })
		.expect("payload");
	alice.send(&who).await;

	let (_, listing) = alice.text_containing("在线用户").await;
	assert!(listing.contains("alice"), "got: {listing}");

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn unknown_command_reports_an_error() {
	let server = start_server().await;
	let mut alice = TestClient::connect(server.addr).await;
	alice.handshake("alice", "m1").await;

	let cmd = Envelope::new(MessageKind::Command)
		.with_payload(&CommandPayload {
			raw: "/frobnicate".to_string(),
		})
		.expect("payload");
	alice.send(&cmd).await;

	let (_, err) = alice.text_containing("命令错误").await;
	assert!(err.contains("not found"), "got: {err}");

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn protobuf_codec_serves_the_same_protocol() {
	let server = start_server_with(CodecKind::Protobuf).await;
	let mut alice = TestClient::connect_with(server.addr, CodecKind::Protobuf).await;

	alice.handshake("alice", "m1").await;

	let mut env = Envelope::new(MessageKind::Ping);
	env.mid = "m2".to_string();
	let env = env.with_payload(&PingPayload { seq: 9, timestamp: 1 }).expect("payload");
	alice.send(&env).await;

	let pong = alice
		.recv_matching(|e| e.kind == "pong" && e.correlation == "m2")
		.await;
	assert_eq!(pong.payload_as::<PongPayload>().expect("payload").seq, 9);

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn idle_sessions_are_closed_by_the_supervisor() {
	let server = start_server().await;
	let (_sup_shutdown_tx, sup_shutdown_rx) = watch::channel(false);
	let _supervisor = spawn_idle_supervisor(
		Arc::clone(&server.registry),
		Duration::from_millis(50),
		Duration::from_millis(200),
		sup_shutdown_rx,
	);

	let mut idler = TestClient::connect(server.addr).await;
	idler.text_containing("请输入昵称并回车：").await;

	// Stay silent; the supervisor closes the session and the socket drains to
	// EOF.
	let mut saw_eof = false;
	for _ in 0..64 {
		let mut tmp = [0u8; 4096];
		match timeout(Duration::from_secs(3), idler.stream.read(&mut tmp)).await {
			Ok(Ok(0)) | Ok(Err(_)) => {
				saw_eof = true;
				break;
			}
			Ok(Ok(_)) => continue,
			Err(_) => break,
		}
	}
	assert!(saw_eof, "idle session should be closed by the supervisor");

	let _ = server.shutdown_tx.send(true);
}

#[tokio::test]
async fn chat_before_handshake_is_unauthorized() {
	let server = start_server().await;
	let mut client = TestClient::connect(server.addr).await;

	let mut env = Envelope::new(MessageKind::Chat);
	env.mid = "m1".to_string();
	let env = env
		.with_payload(&ChatPayload {
			content: "sneaky".to_string(),
		})
		.expect("payload");
	client.send(&env).await;

	let ack = client
		.recv_matching(|e| e.kind == "ack" && e.correlation == "m1")
		.await;
	let status = ack.payload_as::<AckPayload>().expect("payload").status;
	assert_eq!(status, AckStatus::Unauthorized);

	let _ = server.shutdown_tx.send(true);
}
