use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use listmill::app::AppContext;
use listmill::cli::{commands, Cli, Commands};
use listmill::config::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load()?;
    let ctx = AppContext::new(config, cli.data_dir)?;

    match cli.command {
        Commands::Get { key, no_cache } => {
            commands::get_asset(&ctx, &key, no_cache).await?;
        }
        Commands::Update { delay_secs } => {
            commands::update_assets(&ctx, delay_secs).await?;
        }
        Commands::List => {
            commands::list_assets(&ctx).await?;
        }
        Commands::Register { key, url, filters } => {
            commands::register_asset(&ctx, &key, url, filters).await?;
        }
        Commands::Unregister { key } => {
            commands::unregister_asset(&ctx, &key).await?;
        }
        Commands::Dirty { pattern } => {
            commands::mark_dirty(&ctx, pattern).await?;
        }
    }

    Ok(())
}
