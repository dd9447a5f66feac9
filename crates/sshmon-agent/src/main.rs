//! sshmon - SSH session and command telemetry agent
//!
//! Captures every execve on the host through an eBPF tracepoint,
//! correlates sshd logins and logouts from the auth log, and ships the
//! resulting events to an HTTP collector.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sshmon_agent::delivery::{DeliveryPool, HttpPoster};
use sshmon_agent::events;
use sshmon_agent::queue::delivery_queue;
use sshmon_agent::snoop::ExecSnoop;
use sshmon_agent::sshlog::LogWatcher;

/// SSH session and command telemetry agent
#[derive(Debug, Parser)]
#[command(name = "sshmon", version, about)]
struct Args {
    /// Collector endpoint events are POSTed to
    #[arg(long)]
    url: String,

    /// Path of the sshd auth log to follow
    #[arg(long, default_value = "/var/log/auth.log")]
    ssh_log: PathBuf,

    /// Compiled eBPF object to load
    #[arg(long, default_value = "/usr/lib/sshmon/sshmon.bpf.o")]
    bpf_object: PathBuf,

    /// Capacity of the in-memory delivery queue
    #[arg(long, default_value_t = 5000)]
    event_buffer: usize,

    /// Skip the kernel exec tracer and watch the auth log only
    #[arg(long)]
    disable_bpf: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("sshmon={0},sshmon_agent={0}", default_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sshmon agent");

    let hostname = events::hostname();
    info!("Running on host {}", hostname);

    let (queue, events_rx) = delivery_queue(args.event_buffer);
    let poster =
        Arc::new(HttpPoster::new(args.url.clone()).context("Failed to build delivery client")?);
    let pool = DeliveryPool::start(poster, events_rx);
    info!("Delivering events to {}", args.url);

    let watcher = match LogWatcher::start(&args.ssh_log, hostname.clone(), queue.clone()).await {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Failed to start SSH log watcher: {} (continuing without it)", e);
            None
        }
    };

    let snoop = if args.disable_bpf {
        info!("Kernel exec tracer disabled by flag");
        None
    } else {
        Some(
            ExecSnoop::start(&args.bpf_object, hostname, queue.clone())
                .context("Failed to start kernel exec tracer")?,
        )
    };

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
    }

    if let Some(snoop) = snoop {
        snoop.stop().await;
    }
    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    pool.stop().await;

    let dropped = queue.dropped();
    if dropped > 0 {
        warn!("{} event(s) dropped due to delivery backpressure", dropped);
    }
    info!("sshmon agent stopped");

    Ok(())
}
