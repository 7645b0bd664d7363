//! CLI interface for voxgate

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "voxgate")]
#[command(about = "Real-time voice agent gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind (defaults to the configured value)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (defaults to the configured value)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the resolved configuration
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { host, port }) => crate::server::start(host, port).await,
        Some(Commands::Config) => {
            let config = Config::load()?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        // Bare invocation serves with configured defaults
        None => crate::server::start(None, None).await,
    }
}
