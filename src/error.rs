use thiserror::Error;

use crate::command::CommandId;

#[derive(Error, Debug)]
pub enum StrongroomError {
    #[error("Failed to connect to worker: {0}")]
    WorkerConnection(String),

    #[error("Worker protocol error: {0}")]
    WorkerProtocol(String),

    #[error("Failed to dispatch command: {0}")]
    Dispatch(String),

    #[error("Command {command} is missing required parameter '{key}'")]
    MissingParam {
        command: CommandId,
        key: &'static str,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, StrongroomError>;
