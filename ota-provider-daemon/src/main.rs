mod bdx;
mod catalog;
mod config;
mod server;
mod session;

use std::path::PathBuf;

use log::info;

use crate::bdx::TransferSlot;
use crate::catalog::CatalogLookup;
use crate::config::DaemonConfig;
use crate::server::Server;

#[derive(clap::Parser)]
#[command(name = "ota-provider")]
#[command(about = "OTA software update provider")]
struct Cli {
    /// Config file (default: $OTA_PROVIDER_HOME/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Write a default config file
    InitConfig,
    /// Run the provider
    Run,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli: Cli = clap::Parser::parse();
    let path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };

    match cli.command {
        Commands::InitConfig => {
            DaemonConfig::default().create(&path)?;
            println!("Wrote {}", path.display());
        }
        Commands::Run => {
            let config = DaemonConfig::load(&path)?;
            info!(
                "loaded {} ({} catalog images, {} fabrics)",
                path.display(),
                config.catalog.len(),
                config.fabrics.len()
            );

            let catalog = config.catalog;
            let provider = ota_provider::service::spawn(
                &config.provider,
                |sink| CatalogLookup::new(catalog, sink),
                TransferSlot::new(),
                config.fabrics,
            );

            let server = Server::bind(&config.listen_addr, provider).await?;
            server.run().await?;
        }
    }
    Ok(())
}
