// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, RunArgs};
use dswarm_config::Config;
use dswarm_core::{
    introducer::{http::HttpIntroducer, static_list::StaticIntroducer},
    transport::tcp::{TcpTransport, TCP},
    BoxStream, JoinOptions, PeerContext, ReconnectPolicy, SwarmConfig, SwarmError, SwarmEvent,
    SwarmHandle, SwarmNode, Topic,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            Ok(())
        }
        Commands::ShowConfig => {
            let config = dswarm_config::load(cli.config.as_deref())?;
            print!("{}", serde_yaml::to_string(&config).context("serializing config")?);
            Ok(())
        }
        Commands::Run(args) => {
            let mut config = dswarm_config::load(cli.config.as_deref())?;
            apply_overrides(&mut config, args);
            run(config).await
        }
    }
}

fn apply_overrides(config: &mut Config, args: RunArgs) {
    config.topics.extend(args.topics);
    config.peers.extend(args.peers);
    if let Some(port) = args.port {
        config.swarm.listen_port = port;
    }
    if let Some(max) = args.max_connections {
        config.swarm.max_connections = max;
    }
    config.announce |= args.announce;
    config.swarm.debug |= args.debug;
}

fn swarm_config(config: &Config) -> anyhow::Result<SwarmConfig> {
    let mut swarm = SwarmConfig::new()
        .with_max_connections(config.swarm.max_connections)
        .with_debug(config.swarm.debug)
        .with_policy(
            ReconnectPolicy::from_millis(&config.swarm.reconnect_schedule_ms)
                .with_default_retries(config.swarm.default_retries),
        )
        .with_transport(
            TCP,
            Arc::new(TcpTransport::new("0.0.0.0", config.swarm.connect_timeout())),
        );
    if let Some(id) = &config.swarm.id {
        hex::decode(id).with_context(|| format!("swarm.id {id:?} is not hex"))?;
        swarm = swarm.with_id(id.to_lowercase());
    }
    if !config.peers.is_empty() {
        let intro = StaticIntroducer::from_uris(&config.peers);
        info!("{} static peer(s) configured", intro.len());
        swarm = swarm.with_introducer(Arc::new(intro));
    }
    for server in &config.discovery.servers {
        info!("peer directory {server}");
        let intro = HttpIntroducer::new(server.as_str()).with_refresh(config.discovery.refresh());
        swarm = swarm.with_introducer(Arc::new(intro));
    }
    let local_id = swarm.id.clone();
    Ok(swarm.with_handler(move |ctx: PeerContext| greeter(&local_id, ctx)))
}

/// Application stream: greets the remote, then logs every line it sends.
fn greeter(local_id: &str, mut ctx: PeerContext) -> Result<BoxStream, SwarmError> {
    let (ours, theirs) = tokio::io::duplex(16 * 1024);
    let greeting = format!("hello from {local_id}\n");
    tokio::spawn(async move {
        let peer = ctx.id.clone();
        let (rx, mut tx) = tokio::io::split(theirs);
        if let Err(e) = tx.write_all(greeting.as_bytes()).await {
            warn!(peer = %peer, "greeting failed: {e}");
            return;
        }
        let mut lines = BufReader::new(rx).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => info!(peer = %peer, "{line}"),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %peer, "read failed: {e}");
                        break;
                    }
                },
                Some(topic) = ctx.topics.recv() => {
                    info!(peer = %peer, topic = %topic, "also reachable under topic");
                }
            }
        }
        info!(peer = %peer, "stream closed");
    });
    Ok(Box::new(ours))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let swarm = SwarmNode::spawn(swarm_config(&config)?);
    info!(id = %swarm.local_id(), "swarm started");

    let mut events = swarm.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(&event);
        }
    });

    let report = swarm.listen(config.swarm.listen_port).await?;
    if let Some(port) = report.port(TCP) {
        info!("listening on tcp port {port}");
    }
    report.into_result().context("listen failed")?;

    join_all(&swarm, &config).await?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    swarm.close().await?;
    Ok(())
}

async fn join_all(swarm: &SwarmHandle, config: &Config) -> anyhow::Result<()> {
    if config.topics.is_empty() {
        warn!("no topics configured; only inbound peers will connect");
    }
    for name in &config.topics {
        let topic = Topic::from_name(name);
        info!(topic = %topic, "joining {name}");
        swarm
            .join(&topic, JoinOptions { announce: config.announce })
            .await?;
    }
    Ok(())
}

fn log_event(event: &SwarmEvent) {
    match event {
        SwarmEvent::Connected { peer } => info!(peer = %peer, "connected"),
        SwarmEvent::Disconnected { peer, error: Some(e) } => {
            info!(peer = %peer, "disconnected: {e}")
        }
        SwarmEvent::Disconnected { peer, error: None } => info!(peer = %peer, "disconnected"),
        SwarmEvent::Abandoned { peer } => warn!(peer = %peer, "giving up on peer"),
        SwarmEvent::ListenFailed { transport, error } => {
            warn!(transport = %transport, "listen failed: {error}")
        }
        other => tracing::debug!("{other:?}"),
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn,dswarm=info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
