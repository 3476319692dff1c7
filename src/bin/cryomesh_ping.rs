use std::{error::Error, path::PathBuf, thread, time::Duration};

use clap::Parser;
use cryomesh::{
    cluster::{ClientConfig, MessageClient},
    protocol::ClientTls,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address as host:port
    server: String,
    /// Shared cluster secret
    #[arg(long)]
    secret: String,
    /// Node id to join as
    #[arg(long, default_value = "cryomesh-ping")]
    node_id: String,
    /// Join as a slave
    #[arg(long)]
    replica: bool,
    /// Number of pings to send
    #[arg(short, long, default_value_t = 4)]
    count: usize,
    /// Milliseconds to wait between pings
    #[arg(long, default_value_t = 1000)]
    interval: u64,
    /// CA certificate used to verify the server; enables TLS
    #[arg(long, requires = "server_name")]
    ca: Option<PathBuf>,
    /// Name the server certificate is issued for
    #[arg(long)]
    server_name: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::new(cli.server, cli.secret, cli.node_id)
        .with_replica(cli.replica)
        .with_connections(1, 1);
    if let (Some(ca), Some(name)) = (cli.ca, cli.server_name) {
        config = config.with_tls(ClientTls::new(ca, name));
    }

    let client = MessageClient::connect(config)?;
    let mut failures = 0;
    for seq in 0..cli.count {
        if seq > 0 {
            thread::sleep(Duration::from_millis(cli.interval));
        }
        match client.ping() {
            Ok(rtt) => println!("pong from {}: seq={seq} time={rtt:?}", client.config().server),
            Err(e) => {
                failures += 1;
                eprintln!("ping seq={seq} failed: {e}");
            }
        }
    }
    client.close();

    println!("{} sent, {} failed", cli.count, failures);
    if failures == cli.count && cli.count > 0 {
        return Err("no pong received".into());
    }
    Ok(())
}
