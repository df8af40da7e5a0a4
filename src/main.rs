use clap::Parser;
use page_vitals::{setup_logging, wait_for_shutdown, Cli, CliRunner};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting page-vitals v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match args.load_config().await {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(2);
        }
    };

    let cli_runner = CliRunner::new(config);

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());
    let shutdown = async move {
        wait_for_shutdown(shutdown_rx).await;
        info!("Received shutdown signal");
    };

    let result = cli_runner.run(args.command, shutdown).await;
    drop(shutdown_tx);

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("page-vitals stopped");
    Ok(())
}

fn setup_shutdown_handler(shutdown_tx: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) = match (
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
            signal::unix::signal(signal::unix::SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
