#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use parley_protocol::Envelope;
use tokio::sync::{mpsc, watch};

/// Default outbound queue capacity per client.
pub const DEFAULT_OUT_BUFFER: usize = 256;

/// One connected chat participant.
///
/// The hub owns the registered `Client`; sessions hold a non-owning clone of
/// the `Arc`. The outbound queue is bounded and multi-producer (hub fan-out)
/// single-consumer (the session writer).
#[derive(Debug)]
pub struct Client {
	id: String,
	name: RwLock<String>,
	meta: RwLock<HashMap<String, String>>,

	out_tx: mpsc::Sender<Envelope>,
	out_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,

	closed_tx: watch::Sender<bool>,
	dropped: AtomicU64,
}

impl Client {
	pub fn new(id: impl Into<String>, buffer: usize) -> Self {
		let buffer = if buffer == 0 { DEFAULT_OUT_BUFFER } else { buffer };
		let (out_tx, out_rx) = mpsc::channel(buffer);
		let (closed_tx, _) = watch::channel(false);

		Self {
			id: id.into(),
			name: RwLock::new(String::new()),
			meta: RwLock::new(HashMap::new()),
			out_tx,
			out_rx: Mutex::new(Some(out_rx)),
			closed_tx,
			dropped: AtomicU64::new(0),
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	/// Registered nickname; empty until the handshake completes.
	pub fn name(&self) -> String {
		self.name.read().map(|n| n.clone()).unwrap_or_default()
	}

	pub fn set_name(&self, name: impl Into<String>) {
		if let Ok(mut n) = self.name.write() {
			*n = name.into();
		}
	}

	pub fn meta_get(&self, key: &str) -> Option<String> {
		self.meta.read().ok().and_then(|m| m.get(key).cloned())
	}

	pub fn meta_set(&self, key: impl Into<String>, value: impl Into<String>) {
		if let Ok(mut m) = self.meta.write() {
			m.insert(key.into(), value.into());
		}
	}

	/// Permission level from metadata; 0 (user) when absent or malformed.
	pub fn level(&self) -> i32 {
		self.meta_get("level").and_then(|s| s.parse().ok()).unwrap_or(0)
	}

	/// Non-blocking enqueue onto the outbound queue.
	///
	/// A full queue drops the message and advances the dropped counter; a
	/// closed client swallows the message silently.
	pub fn send(&self, env: Envelope) {
		if self.is_closed() {
			return;
		}

		match self.out_tx.try_send(env) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(_)) => {
				self.dropped.fetch_add(1, Ordering::Relaxed);
				metrics::counter!("parley_dropped_messages_total").increment(1);
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {}
		}
	}

	/// Hand the single consumer end to the session writer. Returns `None`
	/// after the first call.
	pub fn take_outgoing(&self) -> Option<mpsc::Receiver<Envelope>> {
		self.out_rx.lock().ok().and_then(|mut rx| rx.take())
	}

	/// Idempotent close: wakes the writer and releases the queue.
	pub fn close(&self) {
		self.closed_tx.send_if_modified(|closed| {
			if *closed {
				false
			} else {
				*closed = true;
				true
			}
		});
	}

	pub fn is_closed(&self) -> bool {
		*self.closed_tx.borrow()
	}

	/// Watch endpoint observing the closed transition.
	pub fn closed_signal(&self) -> watch::Receiver<bool> {
		self.closed_tx.subscribe()
	}

	/// Messages dropped under backpressure for this client.
	pub fn dropped_count(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}
