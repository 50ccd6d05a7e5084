use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use config::{Config, File as ConfigFile};
use pinnet_client::{ClientConfig, ContentClient, SessionFactory, StubSessionFactory};
use pinnet_p2p::{Libp2pSessionFactory, SessionConfig};
use pinnet_rpc::{start_server, AppState};
use pinnet_storage::{BlockStore, MemoryBlockStore, SledBlockStore};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod version;

use version::{git_commit_hash, PINNET_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetworkMode {
    Stub,
    Libp2p,
}

impl NetworkMode {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "stub" => Ok(NetworkMode::Stub),
            "libp2p" => Ok(NetworkMode::Libp2p),
            other => Err(anyhow!("unknown network mode '{other}'")),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            NetworkMode::Stub => "stub",
            NetworkMode::Libp2p => "libp2p",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreMode {
    Memory,
    Sled,
}

impl StoreMode {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreMode::Memory),
            "sled" => Ok(StoreMode::Sled),
            other => Err(anyhow!("unknown store mode '{other}'")),
        }
    }
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            StoreMode::Memory => "memory",
            StoreMode::Sled => "sled",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone)]
struct AppConfig {
    node_id: String,
    rpc_host: String,
    rpc_port: u16,
    data_dir: String,
    store: String,
    network: String,
    log_level: String,
    log_format: String,
    deadline_secs: u64,
    connect_deadline_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: "pinnet-node".to_string(),
            rpc_host: "127.0.0.1".to_string(),
            rpc_port: 8080,
            data_dir: "./data".to_string(),
            store: "memory".to_string(),
            network: "libp2p".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            deadline_secs: 60,
            connect_deadline_secs: 60,
        }
    }
}

/// Optional overrides loaded from a config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    node_id: Option<String>,
    rpc_host: Option<String>,
    rpc_port: Option<u16>,
    data_dir: Option<String>,
    store: Option<String>,
    network: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
    deadline_secs: Option<u64>,
    connect_deadline_secs: Option<u64>,
}

impl AppConfig {
    fn apply_file(&mut self, file: FileConfig) {
        if let Some(value) = file.node_id {
            self.node_id = value;
        }
        if let Some(value) = file.rpc_host {
            self.rpc_host = value;
        }
        if let Some(value) = file.rpc_port {
            self.rpc_port = value;
        }
        if let Some(value) = file.data_dir {
            self.data_dir = value;
        }
        if let Some(value) = file.store {
            self.store = value;
        }
        if let Some(value) = file.network {
            self.network = value;
        }
        if let Some(value) = file.log_level {
            self.log_level = value;
        }
        if let Some(value) = file.log_format {
            self.log_format = value;
        }
        if let Some(value) = file.deadline_secs {
            self.deadline_secs = value;
        }
        if let Some(value) = file.connect_deadline_secs {
            self.connect_deadline_secs = value;
        }
    }

    fn apply_cli(&mut self, matches: &ArgMatches) {
        if let Some(value) = matches.get_one::<String>("node-id") {
            self.node_id = value.clone();
        }
        if let Some(value) = matches.get_one::<String>("rpc-host") {
            self.rpc_host = value.clone();
        }
        if let Some(value) = matches.get_one::<u16>("rpc-port") {
            self.rpc_port = *value;
        }
        if let Some(value) = matches.get_one::<String>("data-dir") {
            self.data_dir = value.clone();
        }
        if let Some(value) = matches.get_one::<String>("store") {
            self.store = value.clone();
        }
        if let Some(value) = matches.get_one::<String>("network") {
            self.network = value.clone();
        }
        if let Some(value) = matches.get_one::<String>("log-level") {
            self.log_level = value.clone();
        }
        if let Some(value) = matches.get_one::<String>("log-format") {
            self.log_format = value.clone();
        }
    }
}

fn cli() -> Command {
    Command::new("pinnet-node")
        .version(PINNET_VERSION)
        .about("Pinnet content gateway node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .value_name("ID")
                .help("Node identity reported on /health"),
        )
        .arg(
            Arg::new("rpc-host")
                .long("rpc-host")
                .value_name("HOST")
                .help("RPC listen host"),
        )
        .arg(
            Arg::new("rpc-port")
                .long("rpc-port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("RPC listen port"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory for the sled store"),
        )
        .arg(
            Arg::new("store")
                .long("store")
                .value_name("MODE")
                .value_parser(["memory", "sled"])
                .help("Block store backend"),
        )
        .arg(
            Arg::new("network")
                .long("network")
                .value_name("MODE")
                .value_parser(["libp2p", "stub"])
                .help("Session backend: libp2p or in-process stub"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Log output format"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate the configuration, then exit"),
        )
}

fn load_config(matches: &ArgMatches) -> Result<AppConfig> {
    let mut app_config = AppConfig::default();

    if let Some(path) = matches.get_one::<String>("config") {
        let file = Config::builder()
            .add_source(ConfigFile::with_name(path))
            .build()
            .with_context(|| format!("failed to load config file {path}"))?;
        let overrides: FileConfig = file
            .try_deserialize()
            .with_context(|| format!("failed to parse config file {path}"))?;
        app_config.apply_file(overrides);
    }

    app_config.apply_cli(matches);
    Ok(app_config)
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

fn run_self_check(config: &AppConfig) -> Result<()> {
    println!("Running pinnet node self-check...");
    let mut issues = Vec::new();

    if config.node_id.trim().is_empty() {
        issues.push("node_id must not be empty".to_string());
    }
    if config.rpc_port == 0 {
        issues.push("rpc_port must be greater than zero".to_string());
    }
    if let Err(err) = StoreMode::parse(&config.store) {
        issues.push(err.to_string());
    }
    if let Err(err) = NetworkMode::parse(&config.network) {
        issues.push(err.to_string());
    }
    if config.deadline_secs == 0 {
        issues.push("deadline_secs must be greater than zero".to_string());
    }

    if issues.is_empty() {
        println!("Configuration OK");
        Ok(())
    } else {
        for issue in &issues {
            println!("  - {issue}");
        }
        Err(anyhow!("self-check found {} issue(s)", issues.len()))
    }
}

fn build_store(config: &AppConfig) -> Result<Arc<dyn BlockStore>> {
    match StoreMode::parse(&config.store)? {
        StoreMode::Memory => Ok(Arc::new(MemoryBlockStore::new())),
        StoreMode::Sled => {
            std::fs::create_dir_all(&config.data_dir)
                .with_context(|| format!("failed to create data dir {}", config.data_dir))?;
            let path = Path::new(&config.data_dir).join("blocks");
            let store = SledBlockStore::new(&path)
                .with_context(|| format!("failed to open block store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

fn build_session_factory(config: &AppConfig) -> Result<Arc<dyn SessionFactory>> {
    match NetworkMode::parse(&config.network)? {
        NetworkMode::Stub => Ok(Arc::new(StubSessionFactory::new())),
        NetworkMode::Libp2p => {
            let session_config = SessionConfig {
                connect_deadline: Duration::from_secs(config.connect_deadline_secs),
                ..SessionConfig::default()
            };
            Ok(Arc::new(Libp2pSessionFactory::new(session_config)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    if matches.get_flag("check") {
        return run_self_check(&config);
    }

    init_logging(&config)?;
    info!(
        "Pinnet {} (commit {}) starting with store={} network={}",
        PINNET_VERSION,
        git_commit_hash(),
        config.store,
        config.network
    );

    let store = build_store(&config)?;
    let factory = build_session_factory(&config)?;
    let client_config = ClientConfig {
        deadline: Duration::from_secs(config.deadline_secs),
        ..ClientConfig::default()
    };
    let client = ContentClient::new(store, factory, client_config);
    let state = Arc::new(AppState::new(client, config.node_id.clone()));

    let addr: SocketAddr = format!("{}:{}", config.rpc_host, config.rpc_port)
        .parse()
        .with_context(|| {
            format!(
                "invalid rpc listen address {}:{}",
                config.rpc_host, config.rpc_port
            )
        })?;

    tokio::select! {
        result = start_server(addr, state) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_mode_parsing() {
        assert_eq!(NetworkMode::parse("libp2p").unwrap(), NetworkMode::Libp2p);
        assert_eq!(NetworkMode::parse(" STUB ").unwrap(), NetworkMode::Stub);
        assert!(NetworkMode::parse("http").is_err());
    }

    #[test]
    fn cli_overrides_win_over_defaults() {
        let matches = cli().get_matches_from([
            "pinnet-node",
            "--rpc-port",
            "9099",
            "--network",
            "stub",
        ]);
        let config = load_config(&matches).unwrap();
        assert_eq!(config.rpc_port, 9099);
        assert_eq!(config.network, "stub");
        assert_eq!(config.store, "memory");
    }

    #[test]
    fn self_check_flags_bad_modes() {
        let config = AppConfig {
            store: "postgres".to_string(),
            ..AppConfig::default()
        };
        assert!(run_self_check(&config).is_err());
        assert!(run_self_check(&AppConfig::default()).is_ok());
    }
}
