use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use serde::Deserialize;
use serenity::prelude::TypeMapKey;

pub const DEFAULT_PREFIX: &str = "!";

/// Contents of `config.json`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigFile {
    pub token: Option<String>,
    pub prefix: Option<String>,
}

impl ConfigFile {
    /// Reads the file, or returns an empty config if it does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(j) => serde_json::from_str(&j)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}

/// Settings resolved from command-line options, the environment and
/// `config.json`, in that order of precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub token: String,
    pub prefix: String,
    pub decoder: PathBuf,
    pub max_playback_duration: Option<Duration>,
}

impl Settings {
    pub fn resolve(
        token: Option<String>,
        prefix: Option<String>,
        decoder: PathBuf,
        max_playback_duration: Option<Duration>,
        file: ConfigFile,
    ) -> anyhow::Result<Self> {
        let token = token
            .or(file.token)
            .filter(|t| !t.trim().is_empty())
            .context("No Discord token was given: set DISCORD_TOKEN or `token` in the config file")?;
        let prefix = prefix
            .or(file.prefix)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_owned());

        Ok(Self {
            token,
            prefix,
            decoder,
            max_playback_duration,
        })
    }
}

impl TypeMapKey for Settings {
    type Value = Arc<Self>;
}
