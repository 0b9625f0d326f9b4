//! One-shot TTS command.

use clap::Args;
use storyvoice_relay::{RequestKind, SynthesisRequest, TtsUpstream, UpstreamEvent};
use tokio_util::sync::CancellationToken;

use super::{
    event_channel, format_bytes, load_config, output_bytes, print_success, print_verbose, shared,
};
use crate::Cli;

/// Synthesize text through the Volcano binary websocket API.
#[derive(Args)]
pub struct TtsCommand {
    /// Text to synthesize
    #[arg(short = 't', long)]
    text: String,
    /// Voice id (ids with the clone prefix use the cloned-voice cluster)
    #[arg(short = 'V', long, default_value = "")]
    voice: String,
    /// Output audio file
    #[arg(short = 'o', long)]
    output: String,
}

impl TtsCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let config = shared(load_config(cli)?);
        let req = SynthesisRequest::new(&self.text, &self.voice, &config.tts);

        print_verbose(cli, &format!("Voice: {} ({:?})", req.voice_id, req.voice_class));
        print_verbose(cli, &format!("Request id: {}", req.request_id));

        let (sink, mut rx) = event_channel(RequestKind::Tts);
        let upstream = TtsUpstream::new(config);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let task = tokio::spawn(async move { upstream.run(req, sink, child).await });

        let mut audio = Vec::new();
        let mut chunks = 0;
        let result = loop {
            let Some(routed) = rx.recv().await else {
                break Err(anyhow::anyhow!("tts session ended without completing"));
            };
            match routed.event {
                UpstreamEvent::Audio(data) => {
                    chunks += 1;
                    audio.extend_from_slice(&data);
                }
                UpstreamEvent::Complete => break Ok(()),
                UpstreamEvent::Error(message) => break Err(anyhow::anyhow!("tts failed: {}", message)),
                UpstreamEvent::Text(_) => {}
            }
        };
        cancel.cancel();
        let _ = task.await;
        result?;

        output_bytes(&audio, &self.output)?;
        print_success(&format!(
            "Audio saved to {} ({}, {} chunks)",
            self.output,
            format_bytes(audio.len()),
            chunks
        ));
        Ok(())
    }
}
