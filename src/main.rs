use clap::Parser;
use render_farm::{load_config, setup_logging, setup_metrics, Cli, CliRunner};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    setup_logging(args.verbose)?;

    info!("Starting render-farm v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    setup_metrics(&config)?;

    let shutdown = CancellationToken::new();
    let _shutdown_handler = setup_shutdown_handler(shutdown.clone());

    let runner = CliRunner::new(config);
    if let Err(e) = runner.run(args.command, shutdown).await {
        error!("Application error: {e:#}");
        std::process::exit(1);
    }

    info!("render-farm stopped");
    Ok(())
}

fn setup_shutdown_handler(shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                let _ = signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        shutdown.cancel();
    })
}
