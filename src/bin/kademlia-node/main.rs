use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use kademlia_node::{NodeConfig, Peer, Session, DEFAULT_ALPHA, DEFAULT_K, DEFAULT_PORT};
use tracing::info;

// Please do not remove the blank lines in these doc comments.
// They are used for inserting line breaks when the help menu is rendered.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    /// Address to bind the IPv4 listener on.
    ///
    /// Defaults to `0.0.0.0` on the default Kademlia port.
    #[clap(long, default_value_t = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT))]
    listen_v4: SocketAddr,

    /// Address to bind the IPv6 listener on.
    #[clap(long, default_value_t = SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), DEFAULT_PORT))]
    listen_v6: SocketAddr,

    /// An existing node to bootstrap the routing table against, as
    /// `host:port`. Omit to start a fresh, empty network.
    #[clap(long)]
    bootstrap_peer: Option<String>,

    /// Replication/bucket-size parameter (K).
    #[clap(long, default_value_t = DEFAULT_K)]
    k: usize,

    /// Lookup concurrency parameter (alpha).
    #[clap(long, default_value_t = DEFAULT_ALPHA)]
    alpha: usize,

    /// Per-request timeout, in milliseconds.
    #[clap(long, default_value_t = 5000)]
    request_timeout_ms: u64,

    /// Ping timeout used before evicting a stale bucket entry, in
    /// milliseconds.
    #[clap(long, default_value_t = 1000)]
    ping_timeout_ms: u64,

    #[clap(subcommand)]
    cmd: Option<SubCmd>,
}

#[derive(Subcommand)]
enum SubCmd {
    /// Store a value under a key, then keep running.
    Put { key: String, value: String },
    /// Look up a key and print its value, then keep running.
    Get { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = Opt::parse();
    let bootstrap_peer = opt
        .bootstrap_peer
        .as_deref()
        .map(Peer::parse_addr)
        .transpose()
        .map_err(|err| eyre!("invalid --bootstrap-peer: {err}"))?;

    let config = NodeConfig {
        listen_v4: opt.listen_v4,
        listen_v6: opt.listen_v6,
        k: opt.k,
        alpha: opt.alpha,
        request_timeout: Duration::from_millis(opt.request_timeout_ms),
        ping_timeout: Duration::from_millis(opt.ping_timeout_ms),
    };

    let (session, handle) = Session::new(bootstrap_peer, config).await?;
    info!(id = %session.local_id(), "starting node");

    let cmd = opt.cmd;
    let driver = handle.clone();
    let command_task = tokio::spawn(async move {
        match cmd {
            Some(SubCmd::Put { key, value }) => {
                match driver.async_save(key.into_bytes(), value.into_bytes()).await {
                    Ok(()) => info!("stored value"),
                    Err(err) => tracing::error!(%err, "save failed"),
                }
            }
            Some(SubCmd::Get { key }) => match driver.async_load(key.into_bytes()).await {
                Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
                Err(err) => tracing::error!(%err, "load failed"),
            },
            None => {}
        }
    });

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            ctrl_c_handle.abort();
        }
    });

    session.run().await?;
    let _ = command_task.await;
    Ok(())
}
