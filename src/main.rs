//! tinysocks is a small SOCKS5 proxy (RFC 1928).
//!
//! Only TCP CONNECT is supported, with optional static username/password
//! authentication (RFC 1929). That authentication keeps out casual
//! unauthorized use but travels in cleartext; do not rely on it for real
//! security.

use crate::common::config::Config;
use crate::common::logger::{self, SimpleLogger};
use crate::proxy::TcpProxy;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

mod common;
mod net;
mod proxy;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, value_name = "ADDRESS")]
    addr: Option<String>,

    /// Username to expect; enables authentication
    #[arg(short, long)]
    username: Option<String>,

    /// Password to expect
    #[arg(short, long)]
    password: Option<String>,

    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[arg(long, value_name = "COUNT")]
    max_connections: Option<usize>,

    #[arg(long, value_name = "SECONDS")]
    connect_timeout: Option<u64>,

    /// Allow connections to destinations on this host
    #[arg(long)]
    allow_loopback: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    dump_config: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.listen_address = addr;
        }
        if let Some(username) = self.username {
            config.username = Some(username);
        }
        if let Some(password) = self.password {
            config.password = Some(password);
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(connect_timeout) = self.connect_timeout {
            config.connect_timeout = connect_timeout;
        }
        if self.allow_loopback {
            config.allow_loopback = true;
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let dump_config = args.dump_config;
    args.apply(&mut config);

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if dump_config {
        match config.to_toml() {
            Ok(rendered) => {
                print!("{}", rendered);
                return;
            }
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = logger::setup_logger(&config.log) {
        eprintln!("Failed to initialize logger: {}", e);
        SimpleLogger::install();
    }

    log::debug!(
        "Starting with config:\n{}",
        config.to_toml().unwrap_or_default()
    );

    let bind_address = match config.bind_address() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind to {}: {}", config.listen_address, e);
            std::process::exit(1);
        }
    };

    if config.auth_required() {
        log::info!("Username/password authentication enabled");
    }

    let proxy = TcpProxy::new(Arc::new(config));
    proxy.run(listener).await;
}
