//! Storyvoice CLI - relay server and one-shot clients for TTS and story
//! generation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{ServeCommand, StoryCommand, TtsCommand};

/// Default log directives when RUST_LOG is unset.
const DEFAULT_LOG: &str = "storyvoice=info,storyvoice_relay=info";
const VERBOSE_LOG: &str = "storyvoice=debug,storyvoice_relay=debug";

/// Storyvoice - streaming relay for speech synthesis and story generation.
///
/// Configuration is read from an optional YAML file, then overridden by
/// environment variables (VOLC_TTS_APPID, VOLC_TTS_TOKEN, LLM_API_KEY, ...).
#[derive(Parser)]
#[command(name = "storyvoice")]
#[command(about = "Streaming relay for Volcano TTS and chat-completion story generation")]
#[command(version)]
pub struct Cli {
    /// Config file (YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the websocket gateway
    Serve(ServeCommand),
    /// Synthesize text to an audio file
    Tts(TtsCommand),
    /// Generate a story and print it as it streams
    Story(StoryCommand),
}

fn init_logging(verbose: bool) {
    let default = if verbose { VERBOSE_LOG } else { DEFAULT_LOG };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);
    let _ = rustls::crypto::ring::default_provider().install_default();

    match &cli.command {
        Commands::Serve(cmd) => cmd.run(&cli).await,
        Commands::Tts(cmd) => cmd.run(&cli).await,
        Commands::Story(cmd) => cmd.run(&cli).await,
    }
}
