#![forbid(unsafe_code)]

use core::fmt;
use std::sync::Arc;

use crate::client::Client;

/// Event type identifier used for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	UserJoined,
	UserLeave,
	MessageLocal,
	MessageRemote,
	MessageDirect,
	SystemNotice,
	FileTransfer,
	Heartbeat,
}

impl EventKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::UserJoined => "user.joined",
			EventKind::UserLeave => "user.leave",
			EventKind::MessageLocal => "message.local",
			EventKind::MessageRemote => "message.remote",
			EventKind::MessageDirect => "message.direct",
			EventKind::SystemNotice => "system.notice",
			EventKind::FileTransfer => "file.transfer",
			EventKind::Heartbeat => "heartbeat",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Tagged event variant dispatched through the hub.
///
/// Subscribers receive the whole event and switch on its kind; message events
/// carry sender and content, remote events keep the origin timestamp rather
/// than the local receive time.
#[derive(Debug, Clone)]
pub enum ChatEvent {
	UserJoined {
		when: i64,
		user: Arc<Client>,
	},
	UserLeave {
		when: i64,
		user: Arc<Client>,
	},
	MessageLocal {
		when: i64,
		from: String,
		content: String,
	},
	MessageRemote {
		/// Origin timestamp from the emitting node.
		when: i64,
		from: String,
		content: String,
	},
	MessageDirect {
		when: i64,
		from: String,
		to: String,
		content: String,
	},
	SystemNotice {
		when: i64,
		level: String,
		content: String,
	},
	FileTransfer {
		when: i64,
		from: String,
		/// Empty or `*` means everyone.
		to: String,
		name: String,
		size: i64,
		mime: String,
	},
	Heartbeat {
		when: i64,
		from_id: String,
		detail: String,
	},
}

impl ChatEvent {
	pub fn kind(&self) -> EventKind {
		match self {
			ChatEvent::UserJoined { .. } => EventKind::UserJoined,
			ChatEvent::UserLeave { .. } => EventKind::UserLeave,
			ChatEvent::MessageLocal { .. } => EventKind::MessageLocal,
			ChatEvent::MessageRemote { .. } => EventKind::MessageRemote,
			ChatEvent::MessageDirect { .. } => EventKind::MessageDirect,
			ChatEvent::SystemNotice { .. } => EventKind::SystemNotice,
			ChatEvent::FileTransfer { .. } => EventKind::FileTransfer,
			ChatEvent::Heartbeat { .. } => EventKind::Heartbeat,
		}
	}

	/// Wall-clock timestamp carried by the event (unix ms).
	pub fn when(&self) -> i64 {
		match self {
			ChatEvent::UserJoined { when, .. }
			| ChatEvent::UserLeave { when, .. }
			| ChatEvent::MessageLocal { when, .. }
			| ChatEvent::MessageRemote { when, .. }
			| ChatEvent::MessageDirect { when, .. }
			| ChatEvent::SystemNotice { when, .. }
			| ChatEvent::FileTransfer { when, .. }
			| ChatEvent::Heartbeat { when, .. } => *when,
		}
	}
}
