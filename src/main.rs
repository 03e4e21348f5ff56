use clap::Parser;
use tracing::info;

use feedgate::app::{App, Config};
use feedgate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command.as_ref().unwrap_or(&Command::Run) {
        Command::Run => run(&cli).await,
        Command::Check => feedgate::cli::check(&cli.config),
        Command::Feeds => feedgate::cli::feeds(&cli.config),
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)?;
    config.logging.init();

    info!(config = %cli.config.display(), "feedgate starting");

    let app = App::build(&config, &cli.config).await?;
    app.run(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    info!("feedgate stopped");
    Ok(())
}
