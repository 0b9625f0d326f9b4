//! Shared helpers for commands.

use std::sync::Arc;

use anyhow::Context;
use storyvoice_relay::{Config, EventSink, RequestKind, RoutedEvent};
use tokio::sync::mpsc;

use crate::Cli;

/// Loads the configuration named by `--config`, with environment overrides.
pub fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let config = Config::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("failed to load config {}", path.display()),
        None => "failed to load config".to_string(),
    })?;
    Ok(config)
}

/// Creates a single-upstream event channel.
pub fn event_channel(kind: RequestKind) -> (EventSink, mpsc::Receiver<RoutedEvent>) {
    let (tx, rx) = mpsc::channel(64);
    (EventSink::new(1, kind, tx), rx)
}

pub fn shared(config: Config) -> Arc<Config> {
    Arc::new(config)
}

/// Writes bytes to a file.
pub fn output_bytes(data: &[u8], output_path: &str) -> anyhow::Result<()> {
    std::fs::write(output_path, data).with_context(|| format!("failed to write {}", output_path))?;
    Ok(())
}

/// Prints verbose message if verbose mode is enabled.
pub fn print_verbose(cli: &Cli, msg: &str) {
    if cli.verbose {
        eprintln!("[verbose] {}", msg);
    }
}

/// Prints success message.
pub fn print_success(msg: &str) {
    eprintln!("\x1b[32m✓\x1b[0m {}", msg);
}

/// Formats bytes as human-readable string.
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
