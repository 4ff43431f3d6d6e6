use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use wgmux::{Client, ClientConfig, Server, ServerConfig};

#[derive(Parser)]
#[command(name = "wgmux", version, about = "Multiplexing obfuscating WireGuard proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server leg in front of one or more WireGuard endpoints.
    Server {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run the client-side mangler leg.
    Client {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Server { config } => match ServerConfig::load(&config).and_then(|c| Server::new(&c)) {
            Ok(server) => server.run().await,
            Err(e) => Err(e),
        },
        Command::Client { config } => match ClientConfig::load(&config).and_then(|c| Client::new(&c)) {
            Ok(client) => client.run().await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
