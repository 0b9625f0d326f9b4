//! Gateway server command.

use clap::Args;
use storyvoice_relay::gateway;

use super::{load_config, print_verbose, shared};
use crate::Cli;

/// Run the websocket gateway.
#[derive(Args)]
pub struct ServeCommand {
    /// Listen address (overrides config and STORYVOICE_LISTEN)
    #[arg(short = 'l', long)]
    listen: Option<String>,
}

impl ServeCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut config = load_config(cli)?;
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }

        if config.tts.app_id.is_empty() || config.tts.token.is_empty() {
            tracing::warn!("tts credentials not configured; tts requests will fail");
        }
        if config.llm.api_key.is_empty() {
            tracing::warn!("llm api key not configured; story requests will fail");
        }
        print_verbose(cli, &format!("TTS endpoint: {}", config.tts.url));
        print_verbose(cli, &format!("LLM endpoint: {}", config.llm.completions_url()));

        gateway::serve(shared(config)).await?;
        Ok(())
    }
}
