//! CLI commands module.

mod serve;
mod story;
mod tts;
mod util;

pub use serve::ServeCommand;
pub use story::StoryCommand;
pub use tts::TtsCommand;

pub(crate) use util::*;
