//! Relay configuration.
//!
//! Loaded once at startup from an optional YAML file, then overridden by
//! environment variables, then shared read-only behind an `Arc`. Missing
//! credentials are not a startup error; they fail the individual request.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default Volcano TTS binary websocket endpoint.
pub const DEFAULT_TTS_URL: &str = "wss://openspeech.bytedance.com/api/v1/tts/ws_binary";

/// Default chat-completion base URL.
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";

/// Default listen address for the gateway.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:3000";

/// Message reported when a request cannot resolve credentials.
pub const CREDENTIALS_MISSING: &str = "credentials missing";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gateway listen address.
    pub listen: String,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            tts: TtsConfig::default(),
            llm: LlmConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Volcano TTS settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Binary websocket endpoint.
    pub url: String,
    /// App id for standard voices.
    pub app_id: String,
    /// Access token for standard voices.
    pub token: String,
    /// App id for cloned voices. Falls back to `app_id` when empty.
    pub clone_app_id: String,
    /// Access token for cloned voices. Falls back to `token` when empty.
    pub clone_token: String,
    /// Voice ids starting with this prefix are cloned voices.
    pub clone_prefix: String,
    pub standard_cluster: String,
    pub clone_cluster: String,
    /// Voice used when a request names none.
    pub default_voice: String,
    /// Output encoding requested from the vendor (mp3, pcm, ogg_opus, ...).
    pub encoding: String,
    pub speed_ratio: f64,
    /// Vendor-side user id.
    pub uid: String,
    /// Request text is cut to this many characters.
    pub max_text_chars: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TTS_URL.to_string(),
            app_id: String::new(),
            token: String::new(),
            clone_app_id: String::new(),
            clone_token: String::new(),
            clone_prefix: "S_".to_string(),
            standard_cluster: "volcano_tts".to_string(),
            clone_cluster: "volcano_icl".to_string(),
            default_voice: "BV002_streaming".to_string(),
            encoding: "mp3".to_string(),
            speed_ratio: 1.0,
            uid: "user_1".to_string(),
            max_text_chars: 1000,
        }
    }
}

/// Voice family, decided by the voice id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceClass {
    Standard,
    Cloned,
}

/// Credentials and cluster a synthesis request is sent with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceRoute {
    pub app_id: String,
    pub token: String,
    pub cluster: String,
}

impl TtsConfig {
    /// Classifies a voice id by the configured clone prefix.
    pub fn classify(&self, voice_id: &str) -> VoiceClass {
        if !self.clone_prefix.is_empty() && voice_id.starts_with(&self.clone_prefix) {
            VoiceClass::Cloned
        } else {
            VoiceClass::Standard
        }
    }

    /// Resolves credentials and cluster for a voice class.
    pub fn route(&self, class: VoiceClass) -> Result<VoiceRoute> {
        let (app_id, token, cluster) = match class {
            VoiceClass::Standard => (
                self.app_id.as_str(),
                self.token.as_str(),
                self.standard_cluster.as_str(),
            ),
            VoiceClass::Cloned => (
                non_empty_or(&self.clone_app_id, &self.app_id),
                non_empty_or(&self.clone_token, &self.token),
                self.clone_cluster.as_str(),
            ),
        };

        if app_id.is_empty() || token.is_empty() {
            return Err(Error::Config(CREDENTIALS_MISSING.to_string()));
        }

        Ok(VoiceRoute {
            app_id: app_id.to_string(),
            token: token.to_string(),
            cluster: cluster.to_string(),
        })
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() { fallback } else { value }
}

/// Chat-completion endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL; `/chat/completions` is appended.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    /// Prepended as a system message when non-empty.
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            system_prompt: String::new(),
        }
    }
}

impl LlmConfig {
    /// Full URL of the streaming completion endpoint.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Returns the API key, or a configuration error when unset.
    pub fn api_key(&self) -> Result<&str> {
        if self.api_key.is_empty() {
            return Err(Error::Config(CREDENTIALS_MISSING.to_string()));
        }
        Ok(&self.api_key)
    }
}

/// Upstream deadlines, in seconds. Zero disables a deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Transport open / response headers.
    pub connect_secs: u64,
    /// Maximum gap between two inbound frames or body chunks.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            idle_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Option<Duration> {
        (self.connect_secs > 0).then(|| Duration::from_secs(self.connect_secs))
    }

    pub fn idle(&self) -> Option<Duration> {
        (self.idle_secs > 0).then(|| Duration::from_secs(self.idle_secs))
    }
}

impl Config {
    /// Parses a YAML document. Absent keys keep their defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Loads from `path` (if any), then applies process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overrides fields from environment-style lookups. Empty values are
    /// ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let targets: [(&str, &mut String); 9] = [
            ("STORYVOICE_LISTEN", &mut self.listen),
            ("VOLC_TTS_URL", &mut self.tts.url),
            ("VOLC_TTS_APPID", &mut self.tts.app_id),
            ("VOLC_TTS_TOKEN", &mut self.tts.token),
            ("VOLC_TTS_CLONE_APPID", &mut self.tts.clone_app_id),
            ("VOLC_TTS_CLONE_TOKEN", &mut self.tts.clone_token),
            ("LLM_API_KEY", &mut self.llm.api_key),
            ("LLM_BASE_URL", &mut self.llm.base_url),
            ("LLM_MODEL", &mut self.llm.model),
        ];
        for (key, field) in targets {
            if let Some(value) = get(key) {
                *field = value;
            }
        }
    }
}
