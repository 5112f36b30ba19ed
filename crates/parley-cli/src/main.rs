mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing_subscriber::EnvFilter;

use commands::chat::ChatArgs;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one message and stream the reply
    Chat(ChatArgs),

    /// List the models the registry serves
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    // logs go to stderr so streamed text stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => commands::chat::execute(args).await,
        Command::Models => commands::models::execute(),
    }
}
