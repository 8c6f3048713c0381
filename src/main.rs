use clap::Parser;
use color_eyre::Result;
use labport::{cli, config::Config, logging, server};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command);

        return Ok(());
    }

    logging::init(Level::INFO, None).await;

    let config = if let Some(config_path) = cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)
    } else {
        debug!("Default config");
        Config::default()
    };

    let ctx = server::AppContext::new(config);
    let sessions = ctx.sessions.clone();
    let port = cli.port.unwrap_or(server::DEFAULT_PORT);

    #[cfg(unix)]
    {
        let mut hangup = signal(SignalKind::hangup())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, quitting")
            }
            _ = hangup.recv() => {
                info!("Told to hang up, quitting")
            }
            _ = server::run_on_port(ctx, port) => {
                error!("Server returned");
                return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
            }
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = server::run_on_port(ctx, port) => {
            error!("Server returned");
            return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
        }
    }

    sessions.shutdown_all();

    Ok(())
}
