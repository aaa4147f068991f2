#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use parley_protocol::time::unix_ms_now;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::Session;

/// Live sessions across all listeners, keyed by session id.
///
/// Listeners add on accept and remove when the reader exits; the idle
/// supervisor and the shutdown drain walk the same registry.
#[derive(Default)]
pub struct SessionRegistry {
	sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn add(&self, session: &Arc<Session>) {
		if let Ok(mut sessions) = self.sessions.write() {
			sessions.insert(session.id().to_string(), Arc::clone(session));
		}
	}

	pub fn remove(&self, id: &str) {
		if let Ok(mut sessions) = self.sessions.write() {
			sessions.remove(id);
		}
	}

	pub fn len(&self) -> usize {
		self.sessions.read().map(|s| s.len()).unwrap_or(0)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn snapshot(&self) -> Vec<Arc<Session>> {
		self.sessions
			.read()
			.map(|s| s.values().map(Arc::clone).collect())
			.unwrap_or_default()
	}

	/// Close every session; used by the shutdown path.
	pub async fn close_all(&self) {
		for session in self.snapshot() {
			session.close().await;
		}
	}

	/// Bounded wait for readers to unwind after `close_all`.
	pub async fn drain(&self, window: Duration) {
		let deadline = tokio::time::Instant::now() + window;
		while !self.is_empty() {
			if tokio::time::Instant::now() >= deadline {
				info!(remaining = self.len(), "drain window elapsed with sessions still open");
				return;
			}
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
	}
}

/// Periodically close sessions idle beyond `idle_timeout`.
pub fn spawn_idle_supervisor(
	registry: Arc<SessionRegistry>,
	interval: Duration,
	idle_timeout: Duration,
	mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		if interval.is_zero() || idle_timeout.is_zero() {
			return;
		}

		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				_ = shutdown.changed() => return,
				_ = ticker.tick() => {}
			}

			let now = unix_ms_now();
			let cutoff = idle_timeout.as_millis() as i64;
			for session in registry.snapshot() {
				let idle = now - session.last_activity();
				if idle > cutoff {
					debug!(session = %session.id(), idle_ms = idle, "closing idle session");
					session.close().await;
				}
			}
		}
	})
}
