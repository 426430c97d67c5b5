//! service-relay CLI entry point

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use service_relay::{
    BrokerAddr, BrokerBuilder, BrokerConfig, CancellationToken, LocalForwarder, ProviderAgent,
    RelayClient, ServiceName,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "service-relay")]
#[command(about = "Named-service relay broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    Serve {
        /// Raw TCP listen address [default: 0.0.0.0:8888 unless --ws is given]
        #[arg(long, env = "RELAY_TCP")]
        tcp: Option<String>,

        /// WebSocket listen address
        #[arg(long, env = "RELAY_WS")]
        ws: Option<String>,

        /// Seconds to wait for the identification line
        #[arg(long, env = "RELAY_IDENT_TIMEOUT", default_value_t = 30)]
        ident_timeout: u64,

        /// Seconds per keep-alive read on idle providers
        #[arg(long, env = "RELAY_KEEPALIVE", default_value_t = 30)]
        keepalive: u64,

        /// Silent keep-alive intervals before an idle provider is dropped
        #[arg(long, env = "RELAY_MISSED_KEEPALIVES", default_value_t = 4)]
        missed_keepalives: u32,

        /// Relay buffer size in bytes
        #[arg(long, env = "RELAY_BUFFER_SIZE", default_value_t = 4096)]
        buffer_size: usize,
    },

    /// Keep a local service registered with a broker
    Provide {
        /// Broker address (`host:port` or `ws://host:port`)
        #[arg(short, long, env = "RELAY_BROKER")]
        broker: BrokerAddr,

        /// Service name to register
        #[arg(short, long)]
        name: String,

        /// Local service to expose (`host:port`)
        #[arg(short, long)]
        target: String,
    },

    /// Expose a remote service on a local port
    Forward {
        /// Broker address (`host:port` or `ws://host:port`)
        #[arg(short, long, env = "RELAY_BROKER")]
        broker: BrokerAddr,

        /// Service name to request
        #[arg(short, long)]
        name: String,

        /// Local listen address
        #[arg(short, long, default_value = "127.0.0.1:15900")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            tcp,
            ws,
            ident_timeout,
            keepalive,
            missed_keepalives,
            buffer_size,
        } => {
            let config = BrokerConfig::default()
                .with_identification_timeout(Duration::from_secs(ident_timeout))
                .with_keepalive_interval(Duration::from_secs(keepalive))
                .with_max_missed_keepalives(missed_keepalives)
                .with_buffer_size(buffer_size);
            serve(config, tcp, ws).await
        }
        Commands::Provide {
            broker,
            name,
            target,
        } => {
            let name = parse_name(&name)?;
            let agent = ProviderAgent::new(RelayClient::new(broker), name, target);
            let shutdown = shutdown_on_ctrl_c();
            agent.run(shutdown).await;
            Ok(())
        }
        Commands::Forward {
            broker,
            name,
            listen,
        } => {
            let name = parse_name(&name)?;
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("Failed to bind {listen}"))?;
            let forwarder = LocalForwarder::new(RelayClient::new(broker), name);
            forwarder.run(listener, shutdown_on_ctrl_c()).await?;
            Ok(())
        }
    }
}

const DEFAULT_TCP_ADDR: &str = "0.0.0.0:8888";

// TCP falls back to the default address only when no listener was asked for.
fn listen_addrs(tcp: Option<String>, ws: Option<String>) -> (Option<String>, Option<String>) {
    match (tcp, ws) {
        (None, None) => (Some(DEFAULT_TCP_ADDR.to_string()), None),
        other => other,
    }
}

async fn serve(config: BrokerConfig, tcp: Option<String>, ws: Option<String>) -> Result<()> {
    let (tcp, ws) = listen_addrs(tcp, ws);
    let mut builder = BrokerBuilder::new(config);
    if let Some(addr) = tcp {
        builder = builder.tcp(addr);
    }
    if let Some(addr) = ws {
        builder = builder.websocket(addr);
    }
    let broker = builder.spawn().await.context("Failed to start broker")?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    broker.shutdown().await;
    Ok(())
}

fn parse_name(name: &str) -> Result<ServiceName> {
    ServiceName::new(name).with_context(|| format!("Invalid service name {name:?}"))
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
        }
        trigger.cancel();
    });
    token
}
