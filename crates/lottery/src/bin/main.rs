use clap::Parser;
use lottery::{Config, Coordinator, DrawPolicy, LotteryServer, ShutdownTrigger, shutdown_channel, storage};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Lottery bet collection and draw server", long_about = None)]
struct Args {
    /// Configuration file (optional; defaults apply if missing)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Address to accept agency connections on
    #[arg(long)]
    listen_addr: Option<String>,

    /// Number of agencies taking part in the draw
    #[arg(short, long)]
    agencies: Option<u32>,

    /// Log filter, e.g. "info" or "lottery=debug"
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(addr) = args.listen_addr {
        config.server.listen_addr = addr;
    }
    if let Some(agencies) = args.agencies {
        config.server.agencies = agencies;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    config.validate()?;

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log.level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting lottery server");
    info!(
        "Agencies: {}, winning number: {}",
        config.server.agencies, config.lottery.winning_number
    );

    info!("Opening {:?} bet store", config.storage.backend);
    let store = storage::open(&config.storage)?;

    let coordinator = Arc::new(Coordinator::new(
        config.server.agencies,
        store,
        DrawPolicy::from(&config.lottery),
    ));

    let server = LotteryServer::bind(&config.server, coordinator).await?;

    let (trigger, token) = shutdown_channel();
    tokio::spawn(stop_on_signal(trigger));

    server.run(token).await?;
    info!("Lottery server stopped");
    Ok(())
}

/// Fire `trigger` on Ctrl-C or, on Unix, SIGTERM.
async fn stop_on_signal(trigger: ShutdownTrigger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                wait_for_ctrl_c().await;
                trigger.trigger();
                return;
            }
        };
        tokio::select! {
            _ = wait_for_ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    wait_for_ctrl_c().await;

    trigger.trigger();
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
