//! One-shot story generation command.

use std::io::Write;

use clap::Args;
use storyvoice_relay::{RequestKind, StoryRequest, StoryUpstream, TextDelta, UpstreamEvent};
use tokio_util::sync::CancellationToken;

use super::{event_channel, load_config, print_success, print_verbose, shared};
use crate::Cli;

/// Generate a story. Content goes to stdout, reasoning to stderr.
#[derive(Args)]
pub struct StoryCommand {
    /// Story title
    #[arg(long)]
    title: String,
    /// Prompt sent to the model (defaults to the title)
    #[arg(short = 'p', long, default_value = "")]
    prompt: String,
}

impl StoryCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let config = shared(load_config(cli)?);
        print_verbose(cli, &format!("Model: {}", config.llm.model));
        print_verbose(cli, &format!("Endpoint: {}", config.llm.completions_url()));

        let req = StoryRequest {
            title: self.title.clone(),
            prompt: self.prompt.clone(),
            ..Default::default()
        };

        let (sink, mut rx) = event_channel(RequestKind::Story);
        let upstream = StoryUpstream::new(config, reqwest::Client::new());
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let task = tokio::spawn(async move { upstream.run(req, sink, child).await });

        let mut stdout = std::io::stdout();
        let mut stderr = std::io::stderr();
        let mut chars = 0;
        let result = loop {
            let Some(routed) = rx.recv().await else {
                break Err(anyhow::anyhow!("story session ended without completing"));
            };
            match routed.event {
                UpstreamEvent::Text(TextDelta::Content(chunk)) => {
                    chars += chunk.chars().count();
                    write!(stdout, "{}", chunk)?;
                    stdout.flush()?;
                }
                UpstreamEvent::Text(TextDelta::Reasoning(chunk)) => {
                    write!(stderr, "{}", chunk)?;
                }
                UpstreamEvent::Complete => break Ok(()),
                UpstreamEvent::Error(message) => {
                    break Err(anyhow::anyhow!("story failed: {}", message));
                }
                UpstreamEvent::Audio(_) => {}
            }
        };
        cancel.cancel();
        let _ = task.await;
        result?;

        writeln!(stdout)?;
        print_success(&format!("Story complete ({} chars)", chars));
        Ok(())
    }
}
