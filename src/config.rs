use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::Context;
use serde::Deserialize;
use streamer_core::config::Options;

pub const CONFIG_ENV: &str = "STREAMER_CONFIG";
pub const DEFAULT_CONFIG: &str = "streamer.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Where the raw PCM songs live.
    pub directory: PathBuf,
    /// The MP3 stream is appended here.
    pub output: PathBuf,
    /// Passed to every component, e.g. `preload_amount` or `lame.bitrate`.
    pub options: Options,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("music"),
            output: PathBuf::from("stream.mp3"),
            options: Options::new(),
        }
    }
}

impl StreamerConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// A missing file falls back to the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                Self::from_json(&text).with_context(|| format!("parsing {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("{} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

/// First command line argument, then `STREAMER_CONFIG`, then `streamer.json`.
pub fn config_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

pub fn config() -> &'static StreamerConfig {
    static CONFIG: LazyLock<StreamerConfig> = LazyLock::new(|| {
        let path = config_path(std::env::args().nth(1), std::env::var(CONFIG_ENV).ok());
        StreamerConfig::load(&path).unwrap_or_else(|e| {
            eprintln!("Error loading config: {:#}", e);
            std::process::exit(1);
        })
    });
    &CONFIG
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
