use clap::Parser;

use scriptorium_infra::config::EngineSettings;
use scriptorium_worker::app::build_app;
use scriptorium_worker::cli::{Cli, execute};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = EngineSettings::load(cli.config.as_deref())?;
    scriptorium_observability::init(&settings.logging);

    let app = build_app(settings, cli.command.backend_mode()).await?;
    execute(app, cli.command).await
}
