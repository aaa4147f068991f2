#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_hub::{ChatEvent, Hub};
use parley_protocol::time::unix_ms_now;
use parley_protocol::{
	AckStatus, ChatPayload, CommandPayload, DirectPayload, Envelope, FileMetaPayload, MessageKind, PingPayload,
	SetNamePayload, TextPayload,
};
use tracing::{debug, warn};

use crate::command::CommandRegistry;
use crate::session::Session;

/// Protocol-agnostic intent processor.
///
/// Decodes envelope intent into hub operations or command execution and
/// drives the per-session NEW -> NAMED -> CLOSED handshake. One gateway is
/// shared by every listener; per-session state is the client's name.
pub struct Gateway {
	hub: Arc<Hub>,
	commands: Arc<CommandRegistry>,
}

impl Gateway {
	pub fn new(hub: Arc<Hub>, commands: Arc<CommandRegistry>) -> Arc<Self> {
		Arc::new(Self { hub, commands })
	}

	pub fn hub(&self) -> &Arc<Hub> {
		&self.hub
	}

	pub async fn on_session_open(&self, session: &Arc<Session>) {
		if let Err(e) = session.send(&Envelope::text("请输入昵称并回车：")).await {
			debug!(session = %session.id(), error = %e, "greeting failed");
		}
	}

	pub async fn on_envelope(&self, session: &Arc<Session>, env: Envelope) {
		match env.message_kind() {
			Some(MessageKind::Text) => self.handle_text(session, &env).await,
			Some(MessageKind::SetName) => self.handle_set_name(session, &env).await,
			Some(MessageKind::Chat) => self.handle_chat(session, &env).await,
			Some(MessageKind::Direct) => self.handle_direct(session, &env).await,
			Some(MessageKind::Command) => self.handle_command(session, &env).await,
			Some(MessageKind::Ping) => self.handle_ping(session, &env).await,
			Some(MessageKind::FileMeta) => self.handle_file_meta(session, &env).await,
			Some(MessageKind::Heartbeat) => self.handle_heartbeat(session, &env).await,
			// Client-initiated pong/ack carry no intent beyond the activity
			// refresh already applied by the reader.
			Some(MessageKind::Pong) | Some(MessageKind::Ack) => {}
			// file_chunk is protocol-defined but carries payload bytes, which
			// this server does not accept; foreign tags land here too.
			Some(MessageKind::FileChunk) | None => self.ack(session, &env, AckStatus::UnknownType).await,
		}
	}

	pub async fn on_session_close(&self, session: &Arc<Session>) {
		// Fires user.leave only if the handshake ever registered the client.
		self.hub.unregister_client(session.client());
	}

	async fn ack(&self, session: &Arc<Session>, env: &Envelope, status: AckStatus) {
		if let Err(e) = session.send(&Envelope::ack(status, env.mid.clone())).await {
			debug!(session = %session.id(), error = %e, "ack send failed");
		}
	}

	async fn send_text(&self, session: &Arc<Session>, text: String) {
		if let Err(e) = session.send(&Envelope::text(text)).await {
			debug!(session = %session.id(), error = %e, "text send failed");
		}
	}

	/// Register the trimmed candidate name, or answer why not.
	async fn try_register(&self, session: &Arc<Session>, env: &Envelope, candidate: &str) -> bool {
		let name = candidate.trim();
		if name.is_empty() {
			self.ack(session, env, AckStatus::InvalidName).await;
			return false;
		}

		if self.hub.is_banned(name) {
			self.send_text(session, "该用户已被封禁".to_string()).await;
			self.hub.unregister_client(session.client());
			session.close().await;
			return false;
		}

		session.client().set_name(name);
		self.hub.register_client(Arc::clone(session.client()));
		true
	}

	async fn handle_text(&self, session: &Arc<Session>, env: &Envelope) {
		let Ok(payload) = env.payload_as::<TextPayload>() else {
			self.ack(session, env, AckStatus::BadPayload).await;
			return;
		};

		let name = session.client().name();
		if name.is_empty() {
			// First text doubles as the nickname handshake.
			if self.try_register(session, env, &payload.text).await {
				let name = session.client().name();
				self.send_text(session, format!("昵称设置成功：{name}")).await;
			}
			return;
		}

		self.hub.broadcast_local(name, payload.text);
	}

	async fn handle_set_name(&self, session: &Arc<Session>, env: &Envelope) {
		if !session.client().name().is_empty() {
			self.ack(session, env, AckStatus::AlreadyNamed).await;
			return;
		}

		let Ok(payload) = env.payload_as::<SetNamePayload>() else {
			self.ack(session, env, AckStatus::BadPayload).await;
			return;
		};

		if self.try_register(session, env, &payload.name).await {
			self.ack(session, env, AckStatus::Ok).await;
		}
	}

	async fn handle_chat(&self, session: &Arc<Session>, env: &Envelope) {
		let name = session.client().name();
		if name.is_empty() {
			self.ack(session, env, AckStatus::Unauthorized).await;
			return;
		}

		let Ok(payload) = env.payload_as::<ChatPayload>() else {
			self.ack(session, env, AckStatus::BadPayload).await;
			return;
		};

		self.hub.broadcast_local(name, payload.content);
	}

	async fn handle_direct(&self, session: &Arc<Session>, env: &Envelope) {
		let name = session.client().name();
		if name.is_empty() {
			self.ack(session, env, AckStatus::Unauthorized).await;
			return;
		}

		let Ok(payload) = env.payload_as::<DirectPayload>() else {
			self.ack(session, env, AckStatus::BadPayload).await;
			return;
		};

		// First recipient wins; the envelope header is the fallback route.
		let to = payload
			.to
			.first()
			.or(env.to.first())
			.cloned()
			.unwrap_or_default();

		self.hub.emit(ChatEvent::MessageDirect {
			when: unix_ms_now(),
			from: name,
			to,
			content: payload.content,
		});
	}

	async fn handle_command(&self, session: &Arc<Session>, env: &Envelope) {
		let name = session.client().name();
		if name.is_empty() {
			self.ack(session, env, AckStatus::Unauthorized).await;
			return;
		}

		let Ok(payload) = env.payload_as::<CommandPayload>() else {
			self.ack(session, env, AckStatus::BadPayload).await;
			return;
		};

		let (handled, result) = self.commands.execute(&payload.raw, &self.hub, session.client());
		if let (true, Err(e)) = (handled, result) {
			warn!(session = %session.id(), raw = %payload.raw, error = %e, "command failed");
			self.send_text(session, format!("命令错误: {e}")).await;
		}
	}

	async fn handle_ping(&self, session: &Arc<Session>, env: &Envelope) {
		let payload = env.payload_as::<PingPayload>().unwrap_or_default();
		if let Err(e) = session.send(&Envelope::pong(payload.seq, env.mid.clone())).await {
			debug!(session = %session.id(), error = %e, "pong send failed");
		}
	}

	async fn handle_file_meta(&self, session: &Arc<Session>, env: &Envelope) {
		let name = session.client().name();
		if name.is_empty() {
			self.ack(session, env, AckStatus::Unauthorized).await;
			return;
		}

		let Ok(payload) = env.payload_as::<FileMetaPayload>() else {
			self.ack(session, env, AckStatus::BadPayload).await;
			return;
		};

		let to = env.to.first().cloned().unwrap_or_default();
		self.hub.emit(ChatEvent::FileTransfer {
			when: unix_ms_now(),
			from: name,
			to,
			name: payload.name,
			size: payload.size,
			mime: payload.mime,
		});
	}

	async fn handle_heartbeat(&self, session: &Arc<Session>, env: &Envelope) {
		if session.client().name().is_empty() {
			self.ack(session, env, AckStatus::Unauthorized).await;
			return;
		}

		let detail = env
			.payload
			.as_ref()
			.and_then(|p| p.get("detail"))
			.and_then(|d| d.as_str())
			.unwrap_or_default()
			.to_string();

		self.hub.emit(ChatEvent::Heartbeat {
			when: unix_ms_now(),
			from_id: session.client().id().to_string(),
			detail,
		});
	}
}
