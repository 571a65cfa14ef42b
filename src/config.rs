//! Worker transport configuration.
//!
//! Manages the config file at `~/.strongroom/config.toml` and resolution of
//! the worker socket path. The `STRONGROOM_WORKER_SOCKET` environment
//! variable overrides everything, which is how tests and alternative
//! embeddings point the transport at a private socket.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrongroomError};

/// Environment variable overriding the worker socket path.
pub const SOCKET_ENV: &str = "STRONGROOM_WORKER_SOCKET";

/// Get the strongroom config directory (~/.strongroom)
pub fn config_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".strongroom"))
        .ok_or_else(|| StrongroomError::Config("Could not determine home directory".into()))
}

/// Get the path to the config file (~/.strongroom/config.toml)
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Get the default worker socket path (~/.strongroom/worker.sock)
pub fn default_socket_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("worker.sock"))
}

/// Configuration for reaching (and optionally launching) the worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Socket path override. When absent, `default_socket_path()` is used.
    pub socket_path: Option<PathBuf>,
    /// Command line used to launch the worker when a dispatch finds it not
    /// running. When absent, dispatch never launches anything.
    pub launch_command: Option<Vec<String>>,
    /// Connection retry attempts after launching the worker.
    pub connect_retries: Option<u32>,
}

impl WorkerConfig {
    /// Load the config from `~/.strongroom/config.toml`.
    ///
    /// A missing file yields the default config; a malformed file is an
    /// error so a typo does not silently fall back to defaults.
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_toml_str(&std::fs::read_to_string(&path)?)
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Resolve the socket path: env override, then the configured path,
    /// then the default under `~/.strongroom`.
    pub fn resolved_socket_path(&self) -> Result<PathBuf> {
        if let Ok(path) = std::env::var(SOCKET_ENV) {
            return Ok(PathBuf::from(path));
        }
        match &self.socket_path {
            Some(path) => Ok(path.clone()),
            None => default_socket_path(),
        }
    }

    /// Retry attempts to use when waiting for a launched worker.
    pub fn connect_retries(&self) -> u32 {
        self.connect_retries.unwrap_or(10)
    }
}
