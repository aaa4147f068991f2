#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use super::{BusError, BusRecord, RecordId, StreamBus};

/// In-process [`StreamBus`]: an append-only record log with per-consumer
/// delivery cursors and pending-until-ack bookkeeping.
///
/// Backs tests and single-process deployments; a networked backend replaces
/// it behind the same trait without touching the bridge.
#[derive(Default)]
pub struct MemoryBus {
	state: Mutex<State>,
	notify: Notify,
}

#[derive(Default)]
struct State {
	entries: Vec<(u64, BusRecord)>,
	next_id: u64,
	consumers: HashMap<String, ConsumerState>,
}

#[derive(Default)]
struct ConsumerState {
	/// Next log index this consumer has not yet seen.
	cursor: usize,
	/// Delivered but unacknowledged records, re-delivered on the next fetch.
	pending: HashMap<u64, BusRecord>,
}

impl MemoryBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records appended so far.
	pub async fn len(&self) -> usize {
		self.state.lock().await.entries.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}
}

impl StreamBus for MemoryBus {
	async fn publish(&self, record: BusRecord) -> Result<(), BusError> {
		let mut state = self.state.lock().await;
		let id = state.next_id;
		state.next_id += 1;
		state.entries.push((id, record));
		drop(state);

		self.notify.notify_waiters();
		Ok(())
	}

	async fn fetch(&self, consumer: &str, max: usize, block: Duration) -> Result<Vec<(RecordId, BusRecord)>, BusError> {
		let deadline = tokio::time::Instant::now() + block;

		loop {
			let notified = self.notify.notified();

			{
				let mut state = self.state.lock().await;

				let mut batch: Vec<(u64, BusRecord)> = state
					.consumers
					.get(consumer)
					.map(|c| c.pending.iter().map(|(id, record)| (*id, record.clone())).collect())
					.unwrap_or_default();
				batch.sort_by_key(|(id, _)| *id);

				let mut cursor = state.consumers.get(consumer).map(|c| c.cursor).unwrap_or(0);
				let mut fresh: Vec<(u64, BusRecord)> = Vec::new();
				while cursor < state.entries.len() && batch.len() + fresh.len() < max {
					fresh.push(state.entries[cursor].clone());
					cursor += 1;
				}

				let consumer_state = state.consumers.entry(consumer.to_string()).or_default();
				consumer_state.cursor = cursor;
				for (id, record) in fresh {
					consumer_state.pending.insert(id, record.clone());
					batch.push((id, record));
				}

				if !batch.is_empty() {
					return Ok(batch.into_iter().map(|(id, record)| (id.to_string(), record)).collect());
				}
			}

			if block.is_zero() || tokio::time::Instant::now() >= deadline {
				return Ok(Vec::new());
			}

			tokio::select! {
				_ = notified => {}
				_ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
			}
		}
	}

	async fn ack(&self, consumer: &str, id: &RecordId) -> Result<(), BusError> {
		let id: u64 = id.parse().map_err(|_| BusError::Decode(format!("bad record id: {id}")))?;

		let mut state = self.state.lock().await;
		if let Some(consumer_state) = state.consumers.get_mut(consumer) {
			consumer_state.pending.remove(&id);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(text: &str) -> BusRecord {
		BusRecord {
			kind: "message".to_string(),
			when: 1,
			from: "alice".to_string(),
			to: String::new(),
			text: text.to_string(),
			origin: "node-a".to_string(),
		}
	}

	#[tokio::test]
	async fn every_consumer_sees_the_whole_stream() {
		let bus = MemoryBus::new();
		bus.publish(record("one")).await.expect("publish");
		bus.publish(record("two")).await.expect("publish");

		let a = bus.fetch("a", 10, Duration::ZERO).await.expect("fetch");
		let b = bus.fetch("b", 10, Duration::ZERO).await.expect("fetch");
		assert_eq!(a.len(), 2);
		assert_eq!(b.len(), 2);
		assert_eq!(a[0].1.text, "one");
		assert_eq!(b[1].1.text, "two");
	}

	#[tokio::test]
	async fn unacked_records_are_redelivered() {
		let bus = MemoryBus::new();
		bus.publish(record("one")).await.expect("publish");

		let first = bus.fetch("a", 10, Duration::ZERO).await.expect("fetch");
		assert_eq!(first.len(), 1);

		// No ack: the record comes back.
		let again = bus.fetch("a", 10, Duration::ZERO).await.expect("fetch");
		assert_eq!(again.len(), 1);
		assert_eq!(again[0].1.text, "one");

		bus.ack("a", &again[0].0).await.expect("ack");
		let empty = bus.fetch("a", 10, Duration::ZERO).await.expect("fetch");
		assert!(empty.is_empty());
	}

	#[tokio::test]
	async fn blocking_fetch_wakes_on_publish() {
		let bus = std::sync::Arc::new(MemoryBus::new());

		let waiter = {
			let bus = std::sync::Arc::clone(&bus);
			tokio::spawn(async move { bus.fetch("a", 10, Duration::from_secs(5)).await })
		};

		tokio::time::sleep(Duration::from_millis(50)).await;
		bus.publish(record("wake")).await.expect("publish");

		let batch = waiter.await.expect("join").expect("fetch");
		assert_eq!(batch.len(), 1);
		assert_eq!(batch[0].1.text, "wake");
	}
}
