//! sskcp server
//!
//! Accepts encrypted KCP sessions and connects every stream they carry to
//! a fixed TCP target.

use anyhow::{Context, Result};
use clap::Parser;
use sskcp::{
    config::{Config, ServerConfig, TransportArgs},
    relay::Relay,
    server::Server,
    tunnel::{spawn_stats_logger, SecureListener},
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// sskcp server - TCP over encrypted reliable UDP
#[derive(Parser, Debug)]
#[command(name = "sskcp-server")]
#[command(about = "sskcp server - TCP tunnel over encrypted, FEC-protected UDP")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "server.toml")]
    config: String,

    /// UDP listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// TCP target address (overrides config)
    #[arg(short, long)]
    target: Option<String>,

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
    let mut server_config = config.server.clone().unwrap_or_default();
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if let Some(target) = args.target {
        server_config.target = target;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.server = Some(server_config.clone());

    init_logging(&config);
    config.validate().context("Invalid configuration")?;

    info!("sskcp server v{}", sskcp::VERSION);
    log_settings(&config, &server_config);

    let shutdown = CancellationToken::new();
    let listener = SecureListener::bind(&server_config.listen, &config.transport)
        .await
        .with_context(|| format!("Failed to listen on {}", server_config.listen))?;
    let _stats = spawn_stats_logger(
        listener.stats(),
        Duration::from_secs(config.transport.snmp_period),
        shutdown.clone(),
    );

    let server = Server::new(listener, &server_config.target, Relay::default());
    let run = server.run(shutdown.clone());
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

fn log_settings(config: &Config, server: &ServerConfig) {
    let t = &config.transport;
    let r = t.retransmission();
    info!("listening on: {}", server.listen);
    info!("target: {}", server.target);
    info!("encryption: {}", t.crypt);
    info!(
        "mode: {:?} nodelay: {} interval: {} resend: {} nc: {}",
        t.mode, r.nodelay, r.interval, r.resend, r.nc
    );
    info!("sndwnd: {} rcvwnd: {} mtu: {}", t.sndwnd, t.rcvwnd, t.mtu);
    info!("datashard: {} parityshard: {}", t.datashard, t.parityshard);
    info!("acknodelay: {} dscp: {} sockbuf: {}", t.acknodelay, t.dscp, t.sockbuf);
    info!("keepalive: {}s compression: {}", t.keepalive, !t.nocomp);
}
