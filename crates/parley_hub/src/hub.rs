#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use parley_protocol::Envelope;
use parley_protocol::time::unix_ms_now;
use tracing::debug;

use crate::client::Client;
use crate::event::{ChatEvent, EventKind};

type Handler = Arc<dyn Fn(ChatEvent) + Send + Sync + 'static>;

struct HandlerEntry {
	id: u64,
	handler: Handler,
}

/// Process-local event bus and presence registry.
///
/// The hub is constructed once at startup and injected into transports and
/// the command registry; there are no module-level singletons.
pub struct Hub {
	/// Back-reference handed to subscription handles for cancel-by-id.
	self_weak: Weak<Hub>,

	clients: RwLock<HashMap<String, Arc<Client>>>,
	handlers: RwLock<HashMap<EventKind, Vec<HandlerEntry>>>,
	next_handler_id: AtomicU64,

	/// name -> expiry; `None` means permanent. Expired entries are removed
	/// lazily on lookup.
	bans: RwLock<HashMap<String, Option<Instant>>>,
}

impl Hub {
	pub fn new() -> Arc<Self> {
		Arc::new_cyclic(|weak| Self {
			self_weak: weak.clone(),
			clients: RwLock::new(HashMap::new()),
			handlers: RwLock::new(HashMap::new()),
			next_handler_id: AtomicU64::new(1),
			bans: RwLock::new(HashMap::new()),
		})
	}

	/// Register a handler for one event kind.
	///
	/// The returned handle cancels exactly this registration; handlers for a
	/// kind run in registration order per emission, each on its own task.
	pub fn subscribe(&self, kind: EventKind, handler: impl Fn(ChatEvent) + Send + Sync + 'static) -> SubscriptionHandle {
		let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
		if let Ok(mut handlers) = self.handlers.write() {
			handlers.entry(kind).or_default().push(HandlerEntry {
				id,
				handler: Arc::new(handler),
			});
		}

		SubscriptionHandle {
			hub: self.self_weak.clone(),
			kind,
			id,
		}
	}

	/// Dispatch an event to every subscribed handler without blocking the
	/// caller.
	///
	/// The handler list is snapshotted under the read lock and released
	/// before dispatch; every handler runs on its own task, so one panicking
	/// handler neither unwinds into the caller nor starves its siblings.
	pub fn emit(&self, event: ChatEvent) {
		let snapshot: Vec<Handler> = match self.handlers.read() {
			Ok(handlers) => handlers
				.get(&event.kind())
				.map(|entries| entries.iter().map(|e| Arc::clone(&e.handler)).collect())
				.unwrap_or_default(),
			Err(_) => Vec::new(),
		};

		for handler in snapshot {
			let event = event.clone();
			tokio::spawn(async move {
				handler(event);
			});
		}
	}

	/// Register a client and emit `user.joined`.
	pub fn register_client(&self, client: Arc<Client>) {
		if let Ok(mut clients) = self.clients.write() {
			clients.insert(client.id().to_string(), Arc::clone(&client));
		}
		debug!(id = %client.id(), name = %client.name(), "client registered");

		self.emit(ChatEvent::UserJoined {
			when: unix_ms_now(),
			user: client,
		});
	}

	/// Unregister a client and emit `user.leave` once per real transition.
	///
	/// A client that was never registered is still closed, without an event.
	pub fn unregister_client(&self, client: &Arc<Client>) {
		let removed = self
			.clients
			.write()
			.ok()
			.and_then(|mut clients| clients.remove(client.id()));

		client.close();

		if removed.is_some() {
			debug!(id = %client.id(), name = %client.name(), "client unregistered");
			self.emit(ChatEvent::UserLeave {
				when: unix_ms_now(),
				user: Arc::clone(client),
			});
		}
	}

	/// Emit a locally originated chat message event.
	pub fn broadcast_local(&self, from: impl Into<String>, content: impl Into<String>) {
		metrics::counter!("parley_messages_total", "kind" => "local").increment(1);
		self.emit(ChatEvent::MessageLocal {
			when: unix_ms_now(),
			from: from.into(),
			content: content.into(),
		});
	}

	/// Emit a chat message replayed from another node, keeping its origin
	/// timestamp.
	pub fn broadcast_remote(&self, from: impl Into<String>, content: impl Into<String>, origin_ts: i64) {
		metrics::counter!("parley_messages_total", "kind" => "remote").increment(1);
		self.emit(ChatEvent::MessageRemote {
			when: origin_ts,
			from: from.into(),
			content: content.into(),
		});
	}

	/// Snapshot of registered client names, unspecified order.
	pub fn list_names(&self) -> Vec<String> {
		self.clients
			.read()
			.map(|clients| clients.values().map(|c| c.name()).collect())
			.unwrap_or_default()
	}

	fn clients_snapshot(&self) -> Vec<Arc<Client>> {
		self.clients
			.read()
			.map(|clients| clients.values().map(Arc::clone).collect())
			.unwrap_or_default()
	}

	/// Non-blocking enqueue to every registered client.
	pub fn send_to_all(&self, env: &Envelope) {
		for client in self.clients_snapshot() {
			client.send(env.clone());
		}
	}

	/// Non-blocking enqueue to every registered client with this name.
	/// Returns true when at least one matched.
	pub fn send_to_user(&self, name: &str, env: &Envelope) -> bool {
		let mut delivered = false;
		for client in self.clients_snapshot() {
			if client.name() == name {
				client.send(env.clone());
				delivered = true;
			}
		}
		delivered
	}

	/// Unregister every client bearing this name. Returns true when any
	/// matched.
	pub fn kick_by_name(&self, name: &str) -> bool {
		let victims: Vec<Arc<Client>> = self
			.clients_snapshot()
			.into_iter()
			.filter(|c| c.name() == name)
			.collect();

		for client in &victims {
			self.unregister_client(client);
		}
		!victims.is_empty()
	}

	/// Ban a name; `None` bans permanently.
	pub fn ban_for(&self, name: impl Into<String>, duration: Option<Duration>) {
		let expiry = duration.map(|d| Instant::now() + d);
		if let Ok(mut bans) = self.bans.write() {
			bans.insert(name.into(), expiry);
		}
	}

	/// Ban check with lazy expiry cleanup.
	pub fn is_banned(&self, name: &str) -> bool {
		let expired = match self.bans.read() {
			Ok(bans) => match bans.get(name) {
				None => return false,
				Some(None) => return true,
				Some(Some(expiry)) => Instant::now() >= *expiry,
			},
			Err(_) => return false,
		};

		if expired {
			if let Ok(mut bans) = self.bans.write() {
				// Re-check under the write lock: the ban may have been renewed.
				match bans.get(name) {
					Some(Some(expiry)) if Instant::now() >= *expiry => {
						bans.remove(name);
					}
					Some(None) => return true,
					Some(Some(_)) => return true,
					None => {}
				}
			}
			return false;
		}

		true
	}

	/// Number of registered clients.
	pub fn online_count(&self) -> usize {
		self.clients.read().map(|c| c.len()).unwrap_or(0)
	}
}

/// Cancels one handler registration by its assigned id.
pub struct SubscriptionHandle {
	hub: Weak<Hub>,
	kind: EventKind,
	id: u64,
}

impl SubscriptionHandle {
	/// Remove exactly the handler this subscription registered.
	pub fn cancel(self) {
		let Some(hub) = self.hub.upgrade() else {
			return;
		};

		if let Ok(mut handlers) = hub.handlers.write()
			&& let Some(entries) = handlers.get_mut(&self.kind)
		{
			entries.retain(|e| e.id != self.id);
			if entries.is_empty() {
				handlers.remove(&self.kind);
			}
		}
	}
}
