//! Configuration of an [`OrbitDb`](crate::OrbitDb).

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the config file looked up by [`Config::load_from_dir`].
pub const CONFIG_FILE_NAME: &str = "orbit.config.toml";

/// Node configuration.
///
/// Usually loaded from a TOML file with [`Self::load`]. [`Default`] keeps everything in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where databases, identities and keys are persisted.
    ///
    /// If `None`, everything lives in memory and is lost on exit.
    pub directory: Option<PathBuf>,
    /// Budget for dialing a peer and exchanging heads, in seconds.
    pub sync_timeout_secs: u64,
    /// Budget for fetching or storing a block, in seconds.
    pub block_timeout_secs: u64,
    /// Capacity of the LRU caches in front of every store.
    pub cache_size: usize,
    /// How many older ancestors each new entry references.
    pub references_count: usize,
    pub keystore_cache_size: usize,
    pub identity_cache_size: usize,
    /// Pin the blocks we write to the content network.
    pub pin_blocks: bool,
    /// Start syncing databases as soon as they are opened.
    pub sync_automatically: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: None,
            sync_timeout_secs: 30,
            block_timeout_secs: 30,
            cache_size: 1000,
            references_count: 16,
            keystore_cache_size: 1000,
            identity_cache_size: 1000,
            pin_blocks: true,
            sync_automatically: true,
        }
    }
}

impl Config {
    /// Load the config from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&s).with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Load `orbit.config.toml` from `dir` if it exists, falling back to the defaults.
    ///
    /// The returned config persists to `dir` unless the file says otherwise.
    pub async fn load_from_dir(dir: impl AsRef<Path>) -> Result<Config> {
        let dir = dir.as_ref();
        let path = dir.join(CONFIG_FILE_NAME);
        let mut config = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Self::load(&path).await?
        } else {
            Config::default()
        };
        if config.directory.is_none() {
            config.directory = Some(dir.to_path_buf());
        }
        Ok(config)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout_secs)
    }

    /// Path of the keystore below the data directory.
    pub fn keystore_path(&self) -> Option<PathBuf> {
        self.directory.as_ref().map(|d| d.join("keystore"))
    }

    /// Path of the identity store below the data directory.
    pub fn identities_path(&self) -> Option<PathBuf> {
        self.directory.as_ref().map(|d| d.join("identities"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
            directory = "/tmp/orbit"
            sync_timeout_secs = 5
            sync_automatically = false
            "#,
        )?;
        assert_eq!(config.directory.as_deref(), Some(Path::new("/tmp/orbit")));
        assert_eq!(config.sync_timeout(), Duration::from_secs(5));
        assert!(!config.sync_automatically);
        assert_eq!(config.references_count, 16);
        assert_eq!(config.block_timeout(), Duration::from_secs(30));
        Ok(())
    }

    #[tokio::test]
    async fn load_from_dir_defaults_to_the_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::load_from_dir(dir.path()).await?;
        assert_eq!(config.directory.as_deref(), Some(dir.path()));
        assert_eq!(config.keystore_path(), Some(dir.path().join("keystore")));

        tokio::fs::write(dir.path().join(CONFIG_FILE_NAME), "cache_size = 10\n").await?;
        let config = Config::load_from_dir(dir.path()).await?;
        assert_eq!(config.cache_size, 10);
        assert_eq!(config.directory.as_deref(), Some(dir.path()));
        Ok(())
    }
}
