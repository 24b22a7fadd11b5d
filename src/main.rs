//! Hookdesk Server
//!
//! Webhook delivery and API credential service.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;

use hookdesk::audit::{AuditSink, JsonlAuditSink, MemoryAuditSink};
use hookdesk::clock::SystemClock;
use hookdesk::config::Config;
use hookdesk::handlers::{router, AppState};
use hookdesk::scheduler::RetryScheduler;
use hookdesk::transport::HttpTransport;

/// Hookdesk Server
#[derive(Parser, Debug)]
#[command(name = "hookdesk")]
#[command(version)]
#[command(about = "Webhook delivery dispatcher and API credential service")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3001")]
    port: u16,

    /// Address to bind to; overrides HOOKDESK_BIND_ALL
    #[arg(short = 'H', long)]
    host: Option<IpAddr>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Disable the background retry scheduler
    #[arg(long)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.verbose {
        "hookdesk=debug,tower_http=debug,info"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(host) = args.host {
        config.bind_addr = host;
        config.bind_all = host.is_unspecified();
    }

    let audit_sink: Arc<dyn AuditSink> = match &config.audit_log_path {
        Some(path) => Arc::new(
            JsonlAuditSink::open(path)
                .with_context(|| format!("failed to open audit log {}", path.display()))?,
        ),
        None => {
            tracing::warn!("HOOKDESK_AUDIT_LOG not set; audit trail is kept in memory only");
            Arc::new(MemoryAuditSink::new())
        }
    };
    let transport = Arc::new(HttpTransport::new(config.transport_timeout)?);
    let addr = config.socket_addr(args.port);
    let scheduler_interval = if args.no_scheduler {
        None
    } else {
        config.scheduler_interval
    };

    let state = AppState::new(config, Arc::new(SystemClock), transport, audit_sink);

    let scheduler = scheduler_interval.map(|every| {
        let (scheduler, handle) = RetryScheduler::new(state.dispatcher.clone(), every);
        (tokio::spawn(scheduler.run()), handle)
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, version = hookdesk::VERSION, "Hookdesk server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some((task, handle)) = scheduler {
        handle.shutdown();
        if let Err(e) = task.await {
            tracing::error!(error = %e, "retry scheduler task failed");
        }
    }

    tracing::info!("Hookdesk server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
