#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use parley_hub::{Client, Hub};
use thiserror::Error;

/// Permission level: 0 for every user, 1 for admins.
pub const LEVEL_USER: i32 = 0;
pub const LEVEL_ADMIN: i32 = 1;

#[derive(Debug, Error)]
pub enum CommandError {
	#[error("command {0} not found")]
	NotFound(String),

	#[error("permission denied")]
	PermissionDenied,

	/// Malformed arguments; the message is the usage line.
	#[error("{0}")]
	Usage(String),

	#[error("{0}")]
	Handler(String),
}

impl CommandError {
	/// Metric label for `parley_command_errors_total`.
	pub fn reason(&self) -> &'static str {
		match self {
			CommandError::NotFound(_) => "not_found",
			CommandError::PermissionDenied => "permission",
			CommandError::Usage(_) => "parse",
			CommandError::Handler(_) => "handler",
		}
	}
}

#[derive(Debug, Error)]
pub enum RegisterError {
	#[error("command name is empty")]
	EmptyName,

	#[error("command name must not contain '/': {0}")]
	InvalidName(String),

	#[error("command {0} already registered")]
	Duplicate(String),
}

/// Everything a handler may touch; the hub and client are injected per
/// invocation, so handlers hold no state of their own.
pub struct CommandContext<'a> {
	pub hub: &'a Arc<Hub>,
	pub client: &'a Arc<Client>,
	pub args: Vec<String>,
}

type Handler = Arc<dyn Fn(&CommandContext<'_>) -> Result<(), CommandError> + Send + Sync>;

pub struct CommandSpec {
	pub name: String,
	pub aliases: Vec<String>,
	pub help: String,
	pub min_level: i32,
	handler: Handler,
}

impl CommandSpec {
	pub fn new(
		name: impl Into<String>,
		help: impl Into<String>,
		min_level: i32,
		handler: impl Fn(&CommandContext<'_>) -> Result<(), CommandError> + Send + Sync + 'static,
	) -> Self {
		Self {
			name: name.into(),
			aliases: Vec::new(),
			help: help.into(),
			min_level,
			handler: Arc::new(handler),
		}
	}

	pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
		self.aliases = aliases.iter().map(|s| s.to_string()).collect();
		self
	}
}

#[derive(Default)]
struct Inner {
	by_name: HashMap<String, Arc<CommandSpec>>,
	list: Vec<Arc<CommandSpec>>,
}

/// Case-insensitive command registry with aliases and permission levels.
#[derive(Default)]
pub struct CommandRegistry {
	inner: RwLock<Inner>,
}

impl CommandRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn register(&self, spec: CommandSpec) -> Result<(), RegisterError> {
		let name = spec.name.trim().to_ascii_lowercase();
		if name.is_empty() {
			return Err(RegisterError::EmptyName);
		}
		if name.contains('/') {
			return Err(RegisterError::InvalidName(name));
		}

		let spec = Arc::new(CommandSpec { name: name.clone(), ..spec });

		let Ok(mut inner) = self.inner.write() else {
			return Ok(());
		};

		if inner.by_name.contains_key(&name) {
			return Err(RegisterError::Duplicate(name));
		}
		for alias in &spec.aliases {
			let alias = alias.trim().to_ascii_lowercase();
			if !alias.is_empty() && inner.by_name.contains_key(&alias) {
				return Err(RegisterError::Duplicate(alias));
			}
		}

		inner.by_name.insert(name, Arc::clone(&spec));
		for alias in &spec.aliases {
			let alias = alias.trim().to_ascii_lowercase();
			if !alias.is_empty() {
				inner.by_name.insert(alias, Arc::clone(&spec));
			}
		}
		inner.list.push(spec);
		Ok(())
	}

	/// Lookup by name or alias; a leading `/` is tolerated.
	pub fn get(&self, name: &str) -> Option<Arc<CommandSpec>> {
		let key = name.trim().trim_start_matches('/').to_ascii_lowercase();
		self.inner.read().ok().and_then(|inner| inner.by_name.get(&key).cloned())
	}

	/// Registered commands in registration order (aliases excluded).
	pub fn list(&self) -> Vec<Arc<CommandSpec>> {
		self.inner.read().map(|inner| inner.list.clone()).unwrap_or_default()
	}

	/// Run a raw command line.
	///
	/// `handled == false` means the line is not a command at all and the
	/// caller should treat it as ordinary input. Errors are returned for
	/// user-visible reporting and already counted by reason.
	pub fn execute(&self, raw: &str, hub: &Arc<Hub>, client: &Arc<Client>) -> (bool, Result<(), CommandError>) {
		let raw = raw.trim();
		if raw.is_empty() || !raw.starts_with('/') {
			return (false, Ok(()));
		}

		let parts: Vec<&str> = raw.split_whitespace().collect();
		let Some(first) = parts.first() else {
			return (true, Ok(()));
		};
		let cmd_name = first.trim_start_matches('/');

		let Some(spec) = self.get(cmd_name) else {
			metrics::counter!("parley_command_errors_total", "reason" => "not_found").increment(1);
			return (true, Err(CommandError::NotFound(cmd_name.to_string())));
		};

		if spec.min_level > LEVEL_USER && client.level() < spec.min_level {
			metrics::counter!("parley_command_errors_total", "reason" => "permission").increment(1);
			return (true, Err(CommandError::PermissionDenied));
		}

		let ctx = CommandContext {
			hub,
			client,
			args: parts[1..].iter().map(|s| s.to_string()).collect(),
		};

		metrics::counter!("parley_commands_total", "name" => spec.name.clone()).increment(1);

		if let Err(e) = (spec.handler)(&ctx) {
			metrics::counter!("parley_command_errors_total", "reason" => e.reason()).increment(1);
			return (true, Err(e));
		}

		(true, Ok(()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn noop_spec(name: &str, level: i32) -> CommandSpec {
		CommandSpec::new(name, "test command", level, |_| Ok(()))
	}

	fn test_client(level: i32) -> Arc<Client> {
		let c = Arc::new(Client::new("c1", 8));
		c.meta_set("level", level.to_string());
		c
	}

	#[tokio::test]
	async fn non_commands_are_not_handled() {
		let reg = CommandRegistry::new();
		let hub = Hub::new();
		let client = test_client(0);

		let (handled, result) = reg.execute("hello world", &hub, &client);
		assert!(!handled);
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn unknown_command_is_handled_with_not_found() {
		let reg = CommandRegistry::new();
		let hub = Hub::new();
		let client = test_client(0);

		let (handled, result) = reg.execute("/nope", &hub, &client);
		assert!(handled);
		assert!(matches!(result, Err(CommandError::NotFound(_))));
	}

	#[tokio::test]
	async fn lookup_is_case_insensitive_and_alias_aware() {
		let reg = CommandRegistry::new();
		reg.register(noop_spec("who", 0).with_aliases(&["w"])).expect("register");
		let hub = Hub::new();
		let client = test_client(0);

		assert!(reg.execute("/WHO", &hub, &client).1.is_ok());
		assert!(reg.execute("/w", &hub, &client).1.is_ok());
	}

	#[tokio::test]
	async fn admin_commands_require_level() {
		let reg = CommandRegistry::new();
		reg.register(noop_spec("kick", LEVEL_ADMIN)).expect("register");
		let hub = Hub::new();

		let user = test_client(0);
		let (handled, result) = reg.execute("/kick bob", &hub, &user);
		assert!(handled);
		assert!(matches!(result, Err(CommandError::PermissionDenied)));

		let admin = test_client(1);
		assert!(reg.execute("/kick bob", &hub, &admin).1.is_ok());
	}

	#[test]
	fn duplicate_registration_is_rejected() {
		let reg = CommandRegistry::new();
		reg.register(noop_spec("help", 0)).expect("register");
		assert!(matches!(reg.register(noop_spec("help", 0)), Err(RegisterError::Duplicate(_))));
		assert!(matches!(
			reg.register(noop_spec("x", 0).with_aliases(&["help"])),
			Err(RegisterError::Duplicate(_))
		));
	}
}
