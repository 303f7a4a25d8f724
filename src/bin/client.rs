//! sskcp client
//!
//! Listens for plain TCP connections and carries each one to the server as
//! a stream over a pool of encrypted KCP sessions.

use anyhow::{Context, Result};
use clap::Parser;
use sskcp::{
    client::Client,
    config::{ClientConfig, Config, TransportArgs},
    pool::{PoolConfig, SessionPool},
    relay::Relay,
    tunnel::{spawn_stats_logger, SecureDialer},
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// sskcp client - TCP over encrypted reliable UDP
#[derive(Parser, Debug)]
#[command(name = "sskcp-client")]
#[command(about = "sskcp client - TCP tunnel over encrypted, FEC-protected UDP")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "client.toml")]
    config: String,

    /// Local TCP listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Server UDP address (overrides config)
    #[arg(short, long)]
    remote: Option<String>,

    /// Number of pooled sessions
    #[arg(long)]
    conn: Option<usize>,

    /// Session lifetime in seconds, 0 disables
    #[arg(long)]
    autoexpire: Option<u64>,

    /// Grace period for retired sessions in seconds, negative disables
    #[arg(long, allow_negative_numbers = true)]
    scavengettl: Option<i64>,

    #[command(flatten)]
    transport: TransportArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default(&args.config).context("Failed to load configuration")?;
    args.transport.apply(&mut config.transport);
    let mut client_config = config.client.clone().unwrap_or_default();
    if let Some(listen) = args.listen {
        client_config.listen = listen;
    }
    if let Some(remote) = args.remote {
        client_config.remote = remote;
    }
    if let Some(conn) = args.conn {
        client_config.conn = conn;
    }
    if let Some(autoexpire) = args.autoexpire {
        client_config.autoexpire = autoexpire;
    }
    if let Some(scavengettl) = args.scavengettl {
        client_config.scavengettl = scavengettl;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.client = Some(client_config.clone());

    init_logging(&config);
    config.validate().context("Invalid configuration")?;

    info!("sskcp client v{}", sskcp::VERSION);
    log_settings(&config, &client_config);

    let shutdown = CancellationToken::new();
    let dialer = SecureDialer::new(client_config.remote.clone(), &config.transport)
        .context("Failed to set up session factory")?;
    let _stats = spawn_stats_logger(
        dialer.stats(),
        Duration::from_secs(config.transport.snmp_period),
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&client_config.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", client_config.listen))?;

    info!("Connecting {} session(s) to {}...", client_config.conn, client_config.remote);
    let pool = tokio::select! {
        r = SessionPool::connect(
            dialer,
            PoolConfig::from_client(&client_config),
            Relay::default(),
            shutdown.clone(),
        ) => r.context("Failed to fill session pool")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before the pool was ready");
            return Ok(());
        }
    };

    let client = Client::new(listener, pool);
    let run = client.run(shutdown.clone());
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => {}
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutting down...");
            shutdown.cancel();
            run.await;
        }
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let builder = tracing_subscriber::fmt().with_env_filter(config.logging.level.as_str());
    if config.logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

fn log_settings(config: &Config, client: &ClientConfig) {
    let t = &config.transport;
    let r = t.retransmission();
    info!("listening on: {}", client.listen);
    info!("remote address: {}", client.remote);
    info!("encryption: {}", t.crypt);
    info!(
        "mode: {:?} nodelay: {} interval: {} resend: {} nc: {}",
        t.mode, r.nodelay, r.interval, r.resend, r.nc
    );
    info!("sndwnd: {} rcvwnd: {} mtu: {}", t.sndwnd, t.rcvwnd, t.mtu);
    info!("datashard: {} parityshard: {}", t.datashard, t.parityshard);
    info!("acknodelay: {} dscp: {} sockbuf: {}", t.acknodelay, t.dscp, t.sockbuf);
    info!("keepalive: {}s conn: {} compression: {}", t.keepalive, client.conn, !t.nocomp);
    info!("autoexpire: {} scavengettl: {}", client.autoexpire, client.scavengettl);
}
