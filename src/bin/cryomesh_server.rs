use std::{error::Error, net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use cryomesh::{
    cluster::{MessageServer, ServerCallbacks, ServerConfig, server::DEFAULT_WORKERS},
    protocol::TlsFiles,
};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    address: SocketAddr,
    /// Shared cluster secret
    #[arg(long)]
    secret: String,
    /// PEM certificate chain; enables TLS together with --key
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
    /// Handler worker threads
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    /// Seconds a new socket has to authenticate
    #[arg(long, default_value_t = 5)]
    handshake_timeout: u64,
    /// Reject join requests whose clock differs by more than this many seconds
    #[arg(long)]
    max_clock_skew: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ServerConfig::new(cli.address, cli.secret)
        .with_workers(cli.workers)
        .with_handshake_timeout(Duration::from_secs(cli.handshake_timeout));
    if let (Some(cert), Some(key)) = (cli.cert, cli.key) {
        config = config.with_tls(TlsFiles::new(cert, key));
    }
    if let Some(skew) = cli.max_clock_skew {
        config = config.with_max_clock_skew(Duration::from_secs(skew));
    }

    let callbacks = ServerCallbacks::default()
        .on_connection(|connection, join| {
            info!(
                "{} node {} connected from {:?} with tags {:?}",
                if join.is_replica { "slave" } else { "master" },
                join.node_id,
                connection.peer_addr(),
                join.tags
            )
        })
        .on_disconnect(|node_id, connection| info!("{node_id} left ({})", connection.id()));

    let server = MessageServer::bind(config, callbacks)?;
    let handle = server.clone();
    ctrlc::set_handler(move || handle.shutdown())?;

    server.run()?;
    Ok(())
}
