#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{Local, TimeZone};
use parley_hub::{ChatEvent, EventKind, Hub};
use parley_protocol::Envelope;

/// Render a unix-ms timestamp the way chat lines display it.
fn format_ts(ms: i64) -> String {
	match Local.timestamp_millis_opt(ms) {
		chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
		_ => ms.to_string(),
	}
}

/// Register the standard subscriber set that turns hub events into client
/// traffic and metrics.
pub fn register_all(hub: &Arc<Hub>) {
	register_message(hub);
	register_user_lifecycle(hub);
	register_system(hub);
	register_file(hub);
	register_heartbeat(hub);
	register_direct(hub);
}

fn register_message(hub: &Arc<Hub>) {
	let local_hub = Arc::clone(hub);
	hub.subscribe(EventKind::MessageLocal, move |e| {
		if let ChatEvent::MessageLocal { when, from, content } = e {
			let text = format!("[{}] {}: {}", format_ts(when), from, content);
			local_hub.send_to_all(&Envelope::text(text));
		}
	});

	// Remote messages render with the origin timestamp, not the replay time.
	let remote_hub = Arc::clone(hub);
	hub.subscribe(EventKind::MessageRemote, move |e| {
		if let ChatEvent::MessageRemote { when, from, content } = e {
			let text = format!("[{}] {}: {}", format_ts(when), from, content);
			remote_hub.send_to_all(&Envelope::text(text));
		}
	});
}

fn register_user_lifecycle(hub: &Arc<Hub>) {
	let joined_hub = Arc::clone(hub);
	hub.subscribe(EventKind::UserJoined, move |e| {
		if let ChatEvent::UserJoined { user, .. } = e {
			metrics::gauge!("parley_online_users").increment(1.0);
			joined_hub.send_to_all(&Envelope::text(format!("[系统] {} 加入", user.name())));
		}
	});

	let leave_hub = Arc::clone(hub);
	hub.subscribe(EventKind::UserLeave, move |e| {
		if let ChatEvent::UserLeave { user, .. } = e {
			metrics::gauge!("parley_online_users").decrement(1.0);
			leave_hub.send_to_all(&Envelope::text(format!("[系统] {} 离开", user.name())));
		}
	});
}

fn register_system(hub: &Arc<Hub>) {
	let notice_hub = Arc::clone(hub);
	hub.subscribe(EventKind::SystemNotice, move |e| {
		if let ChatEvent::SystemNotice { level, content, .. } = e {
			notice_hub.send_to_all(&Envelope::text(format!("[系统通知][{level}] {content}")));
		}
	});
}

fn register_file(hub: &Arc<Hub>) {
	let file_hub = Arc::clone(hub);
	hub.subscribe(EventKind::FileTransfer, move |e| {
		if let ChatEvent::FileTransfer { from, to, name, .. } = e {
			let text = if to.is_empty() || to == "*" {
				format!("[文件] {from} -> 所有人: {name}")
			} else {
				format!("[文件] {from} -> {to}: {name}")
			};
			file_hub.send_to_all(&Envelope::text(text));
		}
	});
}

fn register_heartbeat(hub: &Arc<Hub>) {
	hub.subscribe(EventKind::Heartbeat, |_| {
		metrics::counter!("parley_heartbeats_total").increment(1);
	});
}

fn register_direct(hub: &Arc<Hub>) {
	let direct_hub = Arc::clone(hub);
	hub.subscribe(EventKind::MessageDirect, move |e| {
		if let ChatEvent::MessageDirect { from, to, content, .. } = e {
			metrics::counter!("parley_direct_messages_total").increment(1);

			let delivered = direct_hub.send_to_user(&to, &Envelope::text(format!("[私信] {from}: {content}")));
			if !delivered {
				direct_hub.send_to_user(&from, &Envelope::text(format!("[系统] 用户不在线或不存在: {to}")));
			}
		}
	});
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use parley_hub::Client;
	use parley_protocol::TextPayload;
	use tokio::time::timeout;

	use super::*;

	fn named(hub: &Arc<Hub>, id: &str, name: &str) -> Arc<Client> {
		let c = Arc::new(Client::new(id, 32));
		c.set_name(name);
		hub.register_client(Arc::clone(&c));
		c
	}

	async fn next_text(rx: &mut tokio::sync::mpsc::Receiver<Envelope>) -> String {
		let env = timeout(Duration::from_secs(2), rx.recv())
			.await
			.expect("timeout")
			.expect("open");
		env.payload_as::<TextPayload>().expect("text").text
	}

	async fn next_text_matching(rx: &mut tokio::sync::mpsc::Receiver<Envelope>, needle: &str) -> String {
		for _ in 0..16 {
			let text = next_text(rx).await;
			if text.contains(needle) {
				return text;
			}
		}
		panic!("no envelope containing {needle:?}");
	}

	#[tokio::test]
	async fn local_broadcast_is_formatted_and_fanned_out() {
		let hub = Hub::new();
		register_all(&hub);

		let alice = named(&hub, "a", "alice");
		let bob = named(&hub, "b", "bob");
		let mut rx_a = alice.take_outgoing().expect("rx");
		let mut rx_b = bob.take_outgoing().expect("rx");

		hub.broadcast_local("alice", "hi");

		let a = next_text_matching(&mut rx_a, "alice: hi").await;
		let b = next_text_matching(&mut rx_b, "alice: hi").await;
		assert!(a.starts_with('['), "timestamp prefix expected: {a}");
		assert_eq!(a, b);
	}

	#[tokio::test]
	async fn direct_misses_bounce_back_to_the_sender() {
		let hub = Hub::new();
		register_all(&hub);

		let alice = named(&hub, "a", "alice");
		let mut rx_a = alice.take_outgoing().expect("rx");

		hub.emit(ChatEvent::MessageDirect {
			when: 1,
			from: "alice".to_string(),
			to: "ghost".to_string(),
			content: "psst".to_string(),
		});

		let bounce = next_text_matching(&mut rx_a, "用户不在线或不存在: ghost").await;
		assert!(bounce.contains("[系统]"), "got: {bounce}");
	}

	#[tokio::test]
	async fn direct_reaches_the_target_not_the_sender() {
		let hub = Hub::new();
		register_all(&hub);

		let alice = named(&hub, "a", "alice");
		let bob = named(&hub, "b", "bob");
		let mut rx_a = alice.take_outgoing().expect("rx");
		let mut rx_b = bob.take_outgoing().expect("rx");

		hub.emit(ChatEvent::MessageDirect {
			when: 1,
			from: "alice".to_string(),
			to: "bob".to_string(),
			content: "psst".to_string(),
		});

		let got = next_text_matching(&mut rx_b, "psst").await;
		assert_eq!(got, "[私信] alice: psst");

		// Drain whatever join notices alice already has, then confirm no
		// direct copy arrives for her.
		tokio::time::sleep(Duration::from_millis(100)).await;
		while let Ok(env) = rx_a.try_recv() {
			let text = env.payload_as::<TextPayload>().expect("text").text;
			assert!(!text.contains("psst"), "sender must not receive the direct copy: {text}");
		}
	}
}
