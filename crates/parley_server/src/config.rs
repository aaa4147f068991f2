#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_protocol::CodecKind;
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FRAME_SIZE_CEILING};
use serde::Deserialize;
use tracing::{info, warn};

/// Server config resolved from the TOML file plus `PARLEY_*` env overrides.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// TCP listen address (framed envelopes).
	pub tcp_addr: String,
	/// WebSocket listen address.
	pub ws_addr: String,
	/// Health endpoint bind address.
	pub http_addr: String,
	/// Optional Prometheus exporter bind address.
	pub metrics_addr: Option<String>,

	/// Per-session outbound queue capacity.
	pub out_buffer: usize,
	/// Per-read deadline; zero disables.
	pub read_timeout: Duration,
	/// Per-write deadline; zero disables.
	pub write_timeout: Duration,
	/// Frame payload ceiling in bytes.
	pub max_frame_size: usize,

	pub tcp_codec: CodecKind,
	pub ws_codec: CodecKind,
	pub ws_path: String,

	/// Idle-session supervisor cadence; zero disables the supervisor.
	pub heartbeat_interval: Duration,
	/// Idleness threshold before the supervisor closes a session.
	pub heartbeat_timeout: Duration,

	pub log_level: String,

	pub remote: RemoteSettings,
}

/// Remote sync bridge settings.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
	pub enable: bool,
	pub addr: String,
	pub db: i64,
	pub stream: String,
	pub group: String,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			tcp_addr: "127.0.0.1:9600".to_string(),
			ws_addr: "127.0.0.1:9601".to_string(),
			http_addr: "127.0.0.1:9602".to_string(),
			metrics_addr: None,
			out_buffer: 256,
			read_timeout: Duration::from_secs(60),
			write_timeout: Duration::from_secs(15),
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
			tcp_codec: CodecKind::Json,
			ws_codec: CodecKind::Json,
			ws_path: "/ws".to_string(),
			heartbeat_interval: Duration::from_secs(30),
			heartbeat_timeout: Duration::from_secs(120),
			log_level: "info".to_string(),
			remote: RemoteSettings {
				enable: false,
				addr: "localhost:6379".to_string(),
				db: 0,
				stream: "parley_stream".to_string(),
				group: "parley_group".to_string(),
			},
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	remote: FileRemoteSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tcp_addr: Option<String>,
	ws_addr: Option<String>,
	http_addr: Option<String>,
	metrics_addr: Option<String>,
	out_buffer: Option<usize>,
	read_timeout_secs: Option<u64>,
	write_timeout_secs: Option<u64>,
	max_frame_size: Option<usize>,
	tcp_codec: Option<String>,
	ws_codec: Option<String>,
	ws_path: Option<String>,
	heartbeat_interval_secs: Option<u64>,
	heartbeat_timeout_secs: Option<u64>,
	log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRemoteSettings {
	enable: Option<bool>,
	addr: Option<String>,
	db: Option<i64>,
	stream: Option<String>,
	group: Option<String>,
}

/// Load the config from TOML (missing file means defaults) and apply env
/// overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = apply_file_config(ServerConfig::default(), file_cfg)?;
	apply_env_overrides(&mut cfg)?;

	if cfg.max_frame_size > FRAME_SIZE_CEILING {
		warn!(
			configured = cfg.max_frame_size,
			ceiling = FRAME_SIZE_CEILING,
			"max_frame_size above hard ceiling; clamping"
		);
		cfg.max_frame_size = FRAME_SIZE_CEILING;
	}

	Ok(cfg)
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_file_config(mut cfg: ServerConfig, file: FileConfig) -> anyhow::Result<ServerConfig> {
	let s = file.server;

	if let Some(v) = s.tcp_addr.filter(|v| !v.trim().is_empty()) {
		cfg.tcp_addr = v;
	}
	if let Some(v) = s.ws_addr.filter(|v| !v.trim().is_empty()) {
		cfg.ws_addr = v;
	}
	if let Some(v) = s.http_addr.filter(|v| !v.trim().is_empty()) {
		cfg.http_addr = v;
	}
	if let Some(v) = s.metrics_addr.filter(|v| !v.trim().is_empty()) {
		cfg.metrics_addr = Some(v);
	}
	if let Some(v) = s.out_buffer.filter(|v| *v > 0) {
		cfg.out_buffer = v;
	}
	if let Some(v) = s.read_timeout_secs {
		cfg.read_timeout = Duration::from_secs(v);
	}
	if let Some(v) = s.write_timeout_secs {
		cfg.write_timeout = Duration::from_secs(v);
	}
	if let Some(v) = s.max_frame_size.filter(|v| *v > 0) {
		cfg.max_frame_size = v;
	}
	if let Some(v) = s.tcp_codec.filter(|v| !v.trim().is_empty()) {
		cfg.tcp_codec = v.parse().map_err(|e| anyhow!("tcp_codec: {e}"))?;
	}
	if let Some(v) = s.ws_codec.filter(|v| !v.trim().is_empty()) {
		cfg.ws_codec = v.parse().map_err(|e| anyhow!("ws_codec: {e}"))?;
	}
	if let Some(v) = s.ws_path.filter(|v| v.starts_with('/')) {
		cfg.ws_path = v;
	}
	if let Some(v) = s.heartbeat_interval_secs {
		cfg.heartbeat_interval = Duration::from_secs(v);
	}
	if let Some(v) = s.heartbeat_timeout_secs {
		cfg.heartbeat_timeout = Duration::from_secs(v);
	}
	if let Some(v) = s.log_level.filter(|v| !v.trim().is_empty()) {
		cfg.log_level = v;
	}

	let r = file.remote;
	if let Some(v) = r.enable {
		cfg.remote.enable = v;
	}
	if let Some(v) = r.addr.filter(|v| !v.trim().is_empty()) {
		cfg.remote.addr = v;
	}
	if let Some(v) = r.db {
		cfg.remote.db = v;
	}
	if let Some(v) = r.stream.filter(|v| !v.trim().is_empty()) {
		cfg.remote.stream = v;
	}
	if let Some(v) = r.group.filter(|v| !v.trim().is_empty()) {
		cfg.remote.group = v;
	}

	Ok(cfg)
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) -> anyhow::Result<()> {
	if let Some(v) = env_string("PARLEY_TCP_ADDR") {
		cfg.tcp_addr = v;
		info!("config: tcp_addr overridden by env");
	}
	if let Some(v) = env_string("PARLEY_WS_ADDR") {
		cfg.ws_addr = v;
		info!("config: ws_addr overridden by env");
	}
	if let Some(v) = env_string("PARLEY_HTTP_ADDR") {
		cfg.http_addr = v;
		info!("config: http_addr overridden by env");
	}
	if let Some(v) = env_string("PARLEY_METRICS_ADDR") {
		cfg.metrics_addr = Some(v);
		info!("config: metrics_addr overridden by env");
	}
	if let Some(v) = env_string("PARLEY_OUT_BUFFER")
		&& let Ok(n) = v.parse::<usize>()
		&& n > 0
	{
		cfg.out_buffer = n;
		info!(out_buffer = n, "config: out_buffer overridden by env");
	}
	if let Some(v) = env_string("PARLEY_READ_TIMEOUT")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.read_timeout = Duration::from_secs(secs);
		info!(secs, "config: read_timeout overridden by env");
	}
	if let Some(v) = env_string("PARLEY_WRITE_TIMEOUT")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.write_timeout = Duration::from_secs(secs);
		info!(secs, "config: write_timeout overridden by env");
	}
	if let Some(v) = env_string("PARLEY_MAX_FRAME_SIZE")
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.max_frame_size = bytes;
		info!(bytes, "config: max_frame_size overridden by env");
	}
	if let Some(v) = env_string("PARLEY_TCP_CODEC") {
		cfg.tcp_codec = v.parse().map_err(|e| anyhow!("PARLEY_TCP_CODEC: {e}"))?;
		info!(codec = %cfg.tcp_codec, "config: tcp_codec overridden by env");
	}
	if let Some(v) = env_string("PARLEY_WS_CODEC") {
		cfg.ws_codec = v.parse().map_err(|e| anyhow!("PARLEY_WS_CODEC: {e}"))?;
		info!(codec = %cfg.ws_codec, "config: ws_codec overridden by env");
	}
	if let Some(v) = env_string("PARLEY_WS_PATH").filter(|v| v.starts_with('/')) {
		cfg.ws_path = v;
		info!("config: ws_path overridden by env");
	}
	if let Some(v) = env_string("PARLEY_HEARTBEAT_INTERVAL")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.heartbeat_interval = Duration::from_secs(secs);
		info!(secs, "config: heartbeat_interval overridden by env");
	}
	if let Some(v) = env_string("PARLEY_HEARTBEAT_TIMEOUT")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.heartbeat_timeout = Duration::from_secs(secs);
		info!(secs, "config: heartbeat_timeout overridden by env");
	}
	if let Some(v) = env_string("PARLEY_LOG_LEVEL") {
		cfg.log_level = v;
	}

	if let Some(v) = env_string("PARLEY_REMOTE_ENABLE")
		&& let Some(enable) = parse_env_bool(&v)
	{
		cfg.remote.enable = enable;
		info!(enable, "config: remote.enable overridden by env");
	}
	if let Some(v) = env_string("PARLEY_REMOTE_ADDR") {
		cfg.remote.addr = v;
		info!("config: remote.addr overridden by env");
	}
	if let Some(v) = env_string("PARLEY_REMOTE_DB")
		&& let Ok(db) = v.parse::<i64>()
	{
		cfg.remote.db = db;
		info!(db, "config: remote.db overridden by env");
	}
	if let Some(v) = env_string("PARLEY_REMOTE_STREAM") {
		cfg.remote.stream = v;
		info!("config: remote.stream overridden by env");
	}
	if let Some(v) = env_string("PARLEY_REMOTE_GROUP") {
		cfg.remote.group = v;
		info!("config: remote.group overridden by env");
	}

	Ok(())
}
