#![forbid(unsafe_code)]

pub mod tcp;
pub mod ws;

mod registry;

pub use registry::{SessionRegistry, spawn_idle_supervisor};

use std::time::Duration;

use parley_protocol::framing::DEFAULT_MAX_FRAME_SIZE;

/// Options shared by the TCP and WebSocket listeners.
#[derive(Debug, Clone)]
pub struct TransportOptions {
	/// Per-session outbound queue capacity.
	pub out_buffer: usize,
	/// Per-read deadline; zero disables.
	pub read_timeout: Duration,
	/// Per-write deadline; zero disables.
	pub write_timeout: Duration,
	/// Frame payload ceiling in bytes.
	pub max_frame_size: usize,
	/// How long a shutting-down listener waits for sessions to finish.
	pub drain_window: Duration,
}

impl Default for TransportOptions {
	fn default() -> Self {
		Self {
			out_buffer: 256,
			read_timeout: Duration::from_secs(60),
			write_timeout: Duration::from_secs(15),
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
			drain_window: Duration::from_secs(5),
		}
	}
}
