#![forbid(unsafe_code)]

mod memory;

pub use memory::MemoryBus;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parley_hub::{ChatEvent, EventKind, Hub, SubscriptionHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One record on the shared ordered stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusRecord {
	/// `message` for broadcasts, `direct` for point-to-point.
	#[serde(rename = "type")]
	pub kind: String,

	/// Origin timestamp, unix ms.
	pub when: i64,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub from: String,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub to: String,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub text: String,

	/// Emitting node id; consumers skip their own records.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub origin: String,
}

/// Stream entry id used for acknowledgement.
pub type RecordId = String;

#[derive(Debug, Error)]
pub enum BusError {
	#[error("bus unavailable: {0}")]
	Unavailable(String),

	#[error("record decode failed: {0}")]
	Decode(String),
}

/// Publish/consume contract of the shared append-only stream.
///
/// Delivery is at-least-once: a fetched record stays pending for its
/// consumer until explicitly acknowledged and may be delivered again after a
/// crash. Every consumer name sees the whole stream (one group per node in a
/// networked deployment). The concrete networked client lives outside this
/// crate; tests and single-process deployments use [`MemoryBus`].
pub trait StreamBus: Send + Sync + 'static {
	fn publish(&self, record: BusRecord) -> impl Future<Output = Result<(), BusError>> + Send;

	/// Fetch up to `max` unseen records for `consumer`, waiting up to `block`
	/// when the stream is empty.
	fn fetch(
		&self,
		consumer: &str,
		max: usize,
		block: Duration,
	) -> impl Future<Output = Result<Vec<(RecordId, BusRecord)>, BusError>> + Send;

	fn ack(&self, consumer: &str, id: &RecordId) -> impl Future<Output = Result<(), BusError>> + Send;
}

/// Remote sync bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
	/// This node's identity, stamped on outbound records.
	pub node_id: String,
	/// Unique consumer name within the group.
	pub consumer: String,
	/// Capacity of the handler-to-publisher channel.
	pub publish_buffer: usize,
	/// Consumer poll block duration.
	pub poll_block: Duration,
	/// Backoff after a transient bus error.
	pub retry_delay: Duration,
}

impl BridgeConfig {
	pub fn for_node(node_id: impl Into<String>) -> Self {
		let node_id = node_id.into();
		Self {
			consumer: format!("consumer-{node_id}"),
			node_id,
			publish_buffer: 256,
			poll_block: Duration::from_secs(5),
			retry_delay: Duration::from_secs(1),
		}
	}
}

/// Keeps the bridge's subscriptions and loops alive.
pub struct BridgeHandles {
	pub publisher: JoinHandle<()>,
	pub consumer: JoinHandle<()>,
	_subscriptions: Vec<SubscriptionHandle>,
}

/// Mirror local broadcast/direct traffic onto the stream and replay foreign
/// records into the hub.
///
/// Hub handlers never block: they enqueue records onto a bounded channel the
/// publisher task drains. Bus errors are transient; both loops retry while
/// the shutdown signal is clear.
pub fn start_bridge<B: StreamBus>(
	hub: &Arc<Hub>,
	bus: Arc<B>,
	cfg: BridgeConfig,
	shutdown: watch::Receiver<bool>,
) -> BridgeHandles {
	let (publish_tx, publish_rx) = mpsc::channel::<BusRecord>(cfg.publish_buffer);

	let local_tx = publish_tx.clone();
	let local_node = cfg.node_id.clone();
	let sub_local = hub.subscribe(EventKind::MessageLocal, move |e| {
		if let ChatEvent::MessageLocal { when, from, content } = e {
			let record = BusRecord {
				kind: "message".to_string(),
				when,
				from,
				to: String::new(),
				text: content,
				origin: local_node.clone(),
			};
			if local_tx.try_send(record).is_err() {
				metrics::counter!("parley_bridge_publish_dropped_total").increment(1);
			}
		}
	});

	let direct_tx = publish_tx;
	let direct_node = cfg.node_id.clone();
	let sub_direct = hub.subscribe(EventKind::MessageDirect, move |e| {
		if let ChatEvent::MessageDirect { when, from, to, content } = e {
			let record = BusRecord {
				kind: "direct".to_string(),
				when,
				from,
				to,
				text: content,
				origin: direct_node.clone(),
			};
			if direct_tx.try_send(record).is_err() {
				metrics::counter!("parley_bridge_publish_dropped_total").increment(1);
			}
		}
	});

	let publisher = tokio::spawn(run_publisher(
		Arc::clone(&bus),
		publish_rx,
		cfg.retry_delay,
		shutdown.clone(),
	));
	let consumer = tokio::spawn(run_consumer(Arc::clone(hub), bus, cfg, shutdown));

	BridgeHandles {
		publisher,
		consumer,
		_subscriptions: vec![sub_local, sub_direct],
	}
}

async fn run_publisher<B: StreamBus>(
	bus: Arc<B>,
	mut publish_rx: mpsc::Receiver<BusRecord>,
	retry_delay: Duration,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		let record = tokio::select! {
			_ = shutdown.changed() => return,
			record = publish_rx.recv() => match record {
				Some(record) => record,
				None => return,
			},
		};

		loop {
			match bus.publish(record.clone()).await {
				Ok(()) => break,
				Err(e) => {
					warn!(error = %e, "bridge publish failed; retrying");
					tokio::select! {
						_ = shutdown.changed() => return,
						_ = tokio::time::sleep(retry_delay) => {}
					}
				}
			}
		}
	}
}

async fn run_consumer<B: StreamBus>(
	hub: Arc<Hub>,
	bus: Arc<B>,
	cfg: BridgeConfig,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		let batch = tokio::select! {
			_ = shutdown.changed() => return,
			batch = bus.fetch(&cfg.consumer, 100, cfg.poll_block) => batch,
		};

		let batch = match batch {
			Ok(batch) => batch,
			Err(e) => {
				warn!(error = %e, "bridge fetch failed; retrying");
				tokio::select! {
					_ = shutdown.changed() => return,
					_ = tokio::time::sleep(cfg.retry_delay) => {}
				}
				continue;
			}
		};

		for (id, record) in batch {
			if record.origin == cfg.node_id {
				// Our own record coming back around.
				let _ = bus.ack(&cfg.consumer, &id).await;
				continue;
			}

			match record.kind.as_str() {
				"message" => {
					hub.broadcast_remote(record.from, record.text, record.when);
				}
				"direct" => {
					hub.emit(ChatEvent::MessageDirect {
						when: record.when,
						from: record.from,
						to: record.to,
						content: record.text,
					});
				}
				other => {
					debug!(kind = other, "ignoring unknown bridge record kind");
				}
			}

			// Duplicate delivery after a failed ack is tolerated downstream.
			let _ = bus.ack(&cfg.consumer, &id).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use parley_hub::Client;
	use parley_protocol::{Envelope, TextPayload};
	use tokio::time::timeout;

	use super::*;
	use crate::subscriber;

	async fn next_text_matching(rx: &mut mpsc::Receiver<Envelope>, needle: &str) -> String {
		for _ in 0..16 {
			let env = timeout(Duration::from_secs(2), rx.recv())
				.await
				.expect("timeout")
				.expect("open");
			if let Ok(p) = env.payload_as::<TextPayload>()
				&& p.text.contains(needle)
			{
				return p.text;
			}
		}
		panic!("no envelope containing {needle:?}");
	}

	#[tokio::test]
	async fn local_broadcast_replays_on_the_peer_node() {
		let bus = Arc::new(MemoryBus::new());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		// Node A publishes, node B consumes the same stream.
		let hub_a = Hub::new();
		let hub_b = Hub::new();
		subscriber::register_all(&hub_b);

		let _bridge_a = start_bridge(&hub_a, Arc::clone(&bus), BridgeConfig::for_node("node-a"), shutdown_rx.clone());
		let mut cfg_b = BridgeConfig::for_node("node-b");
		cfg_b.poll_block = Duration::from_millis(50);
		let _bridge_b = start_bridge(&hub_b, Arc::clone(&bus), cfg_b, shutdown_rx);

		let bob = Arc::new(Client::new("b", 32));
		bob.set_name("bob");
		hub_b.register_client(Arc::clone(&bob));
		let mut rx_b = bob.take_outgoing().expect("rx");

		hub_a.broadcast_local("alice", "hello from afar");

		let text = next_text_matching(&mut rx_b, "alice: hello from afar").await;
		assert!(text.starts_with('['), "remote replay keeps timestamp formatting: {text}");

		let _ = shutdown_tx.send(true);
	}

	#[tokio::test]
	async fn direct_records_become_direct_events() {
		let bus = Arc::new(MemoryBus::new());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let hub_b = Hub::new();
		subscriber::register_all(&hub_b);

		let mut cfg_b = BridgeConfig::for_node("node-b");
		cfg_b.poll_block = Duration::from_millis(50);
		let _bridge_b = start_bridge(&hub_b, Arc::clone(&bus), cfg_b, shutdown_rx);

		let bob = Arc::new(Client::new("b", 32));
		bob.set_name("bob");
		hub_b.register_client(Arc::clone(&bob));
		let mut rx_b = bob.take_outgoing().expect("rx");

		bus.publish(BusRecord {
			kind: "direct".to_string(),
			when: 1000,
			from: "alice".to_string(),
			to: "bob".to_string(),
			text: "psst".to_string(),
			origin: "node-a".to_string(),
		})
		.await
		.expect("publish");

		let text = next_text_matching(&mut rx_b, "psst").await;
		assert_eq!(text, "[私信] alice: psst");

		let _ = shutdown_tx.send(true);
	}

	#[tokio::test]
	async fn own_records_are_filtered_out() {
		let bus = Arc::new(MemoryBus::new());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let hub = Hub::new();
		let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let seen_count = Arc::clone(&seen);
		let _sub = hub.subscribe(EventKind::MessageRemote, move |_| {
			seen_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
		});

		let mut cfg = BridgeConfig::for_node("node-a");
		cfg.poll_block = Duration::from_millis(50);
		let _bridge = start_bridge(&hub, Arc::clone(&bus), cfg, shutdown_rx);

		hub.broadcast_local("alice", "echo?");

		tokio::time::sleep(Duration::from_millis(300)).await;
		assert_eq!(
			seen.load(std::sync::atomic::Ordering::SeqCst),
			0,
			"a node must not replay its own records"
		);

		let _ = shutdown_tx.send(true);
	}
}
