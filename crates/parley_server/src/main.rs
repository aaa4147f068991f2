#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use parley_hub::Hub;
use parley_protocol::codec_for;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use parley_server::bridge::{BridgeConfig, MemoryBus, start_bridge};
use parley_server::command::{CommandRegistry, register_builtins};
use parley_server::config::{ServerConfig, load_config_from_path};
use parley_server::gateway::Gateway;
use parley_server::health::{HealthState, spawn_health_server};
use parley_server::subscriber;
use parley_server::transport::{SessionRegistry, TransportOptions, spawn_idle_supervisor, tcp, ws};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--config path]\n\
\n\
Options:\n\
\t--config  Path to the TOML config (default: parley.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> PathBuf {
	let mut config_path = PathBuf::from("parley.toml");

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = PathBuf::from(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing(log_level: &str) {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| format!("{log_level},parley_server={log_level}"));

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}


fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config_path = parse_args();

	// The config decides the log level, so it loads before the subscriber;
	// anything it traces on the way in is intentionally dropped.
	let cfg = load_config_from_path(&config_path)?;
	init_tracing(&cfg.log_level);
	info!(path = %config_path.display(), level = %cfg.log_level, "loaded config (toml + env overrides)");

	init_metrics(cfg.metrics_addr.as_deref());

	let health_state = HealthState::new();
	match cfg.http_addr.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			spawn_health_server(addr, health_state.clone());
			info!(%addr, "health server listening");
		}
		Err(e) => warn!(error = %e, bind = %cfg.http_addr, "invalid http bind address (expected host:port)"),
	}

	let hub = Hub::new();

	let commands = CommandRegistry::new();
	register_builtins(&commands).context("register builtin commands")?;
	subscriber::register_all(&hub);

	let gateway = Gateway::new(Arc::clone(&hub), commands);
	let registry = SessionRegistry::new();

	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let opts = TransportOptions {
		out_buffer: cfg.out_buffer,
		read_timeout: cfg.read_timeout,
		write_timeout: cfg.write_timeout,
		max_frame_size: cfg.max_frame_size,
		..TransportOptions::default()
	};

	let supervisor = spawn_idle_supervisor(
		Arc::clone(&registry),
		cfg.heartbeat_interval,
		cfg.heartbeat_timeout,
		shutdown_rx.clone(),
	);

	let tcp_listener = TcpListener::bind(&cfg.tcp_addr)
		.await
		.with_context(|| format!("bind tcp listener on {}", cfg.tcp_addr))?;
	let tcp_task = tokio::spawn(tcp::serve_tcp(
		tcp_listener,
		Arc::clone(&gateway),
		codec_for(cfg.tcp_codec),
		Arc::clone(&registry),
		opts.clone(),
		shutdown_rx.clone(),
	));

	let ws_listener = TcpListener::bind(&cfg.ws_addr)
		.await
		.with_context(|| format!("bind websocket listener on {}", cfg.ws_addr))?;
	let ws_task = tokio::spawn(ws::serve_ws(
		ws_listener,
		cfg.ws_path.clone(),
		Arc::clone(&gateway),
		codec_for(cfg.ws_codec),
		Arc::clone(&registry),
		opts,
		shutdown_rx.clone(),
	));

	let bridge = start_remote_bridge(&cfg, &hub, shutdown_rx);

	health_state.mark_ready();
	info!(
		tcp = %cfg.tcp_addr,
		ws = %cfg.ws_addr,
		tcp_codec = %cfg.tcp_codec,
		ws_codec = %cfg.ws_codec,
		"parley server up"
	);

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutdown requested");
	let _ = shutdown_tx.send(true);

	let _ = tcp_task.await;
	let _ = ws_task.await;
	supervisor.abort();
	if let Some(handles) = bridge {
		handles.publisher.abort();
		handles.consumer.abort();
	}

	info!("bye");
	Ok(())
}

/// Wire the remote sync bridge when enabled.
///
/// The networked stream client is deployment-specific; this binary ships the
/// in-process bus, which keeps the bridge observable in a single-node setup.
fn start_remote_bridge(
	cfg: &ServerConfig,
	hub: &Arc<Hub>,
	shutdown: watch::Receiver<bool>,
) -> Option<parley_server::bridge::BridgeHandles> {
	if !cfg.remote.enable {
		return None;
	}

	let node_id = uuid::Uuid::new_v4().to_string();
	info!(
		addr = %cfg.remote.addr,
		db = cfg.remote.db,
		stream = %cfg.remote.stream,
		group = %cfg.remote.group,
		node = %node_id,
		"remote sync bridge enabled (in-process stream backend)"
	);

	let bus = Arc::new(MemoryBus::new());
	Some(start_bridge(hub, bus, BridgeConfig::for_node(node_id), shutdown))
}
