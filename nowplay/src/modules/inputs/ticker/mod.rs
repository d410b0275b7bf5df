//! Ticker input module: publishes a fixed song on an interval.
//!
//! Useful for exercising a chain end-to-end without a music player.
//!
//! # Configuration
//!
//! ```text
//! module ticker
//! interval 10         # seconds between songs (default 10)
//! title Title
//! artist Artist
//! album Album
//! genre Genre
//! length 60           # seconds (default 60)
//! ```

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::config::{register_module, ArgKind, ModuleBody, ModuleDecl, ModuleType, OptSpec};
use crate::{Error, Input, Lifecycle, Publisher, Shutdown, Sleep, Song};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_LENGTH: u32 = 60;

/// Fixed-song interval input.
pub struct TickerInput {
    interval: Duration,
    template: Song,
}

impl TickerInput {
    /// Build a ticker that publishes `template` every `interval`.
    pub fn new(interval: Duration, template: Song) -> Self {
        TickerInput { interval, template }
    }
}

#[async_trait]
impl Lifecycle for TickerInput {}

#[async_trait]
impl Input for TickerInput {
    async fn run(&mut self, songs: Publisher, shutdown: Shutdown) -> Result<(), Error> {
        debug!(interval = self.interval.as_secs(), "ticker running");
        while shutdown.sleep(self.interval).await == Sleep::Timeout {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            let mut song = self.template.clone();
            song.started_at = now;
            song.ends_at = now + i64::from(song.length);
            songs.publish(song);
        }
        Ok(())
    }
}

const OPTIONS: &[OptSpec] = &[
    OptSpec::new("interval", ArgKind::Int),
    OptSpec::new("title", ArgKind::Str),
    OptSpec::new("artist", ArgKind::Str),
    OptSpec::new("album", ArgKind::Str),
    OptSpec::new("genre", ArgKind::Str),
    OptSpec::new("length", ArgKind::Int),
];

fn create_ticker(decl: &ModuleDecl) -> Result<ModuleBody, Error> {
    let interval = match decl.get_int("interval") {
        Some(seconds) if seconds > 0 => Duration::from_secs(seconds as u64),
        Some(seconds) => {
            return Err(Error::Config(format!("interval: {}: must be positive", seconds)));
        }
        None => DEFAULT_INTERVAL,
    };
    let length = match decl.get_int("length") {
        Some(seconds) if seconds > 0 => seconds as u32,
        Some(seconds) => {
            return Err(Error::Config(format!("length: {}: must be positive", seconds)));
        }
        None => DEFAULT_LENGTH,
    };

    let template = Song {
        title: Some(decl.get("title").unwrap_or("Title").to_string()),
        artist: Some(decl.get("artist").unwrap_or("Artist").to_string()),
        album: Some(decl.get("album").unwrap_or("Album").to_string()),
        genre: Some(decl.get("genre").unwrap_or("Genre").to_string()),
        started_at: 0,
        ends_at: 0,
        length,
    };

    Ok(ModuleBody::Input(Box::new(TickerInput::new(
        interval, template,
    ))))
}

pub(crate) fn register_ticker() -> Result<(), Error> {
    register_module("ticker", ModuleType::Input, OPTIONS, create_ticker)
}
