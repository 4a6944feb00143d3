use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error(
        "Settings file not found: {0}\n\
        Searched in order:\n\
        - AGENTSTACK_CONFIG_PATH\n\
        - current directory: agentstack.local.toml, agentstack.toml, .agentstack.toml\n\
        - ./.agentstack/ directory\n\
        - ~/.config/agentstack/agentstack.toml"
    )]
    SettingsFileNotFound(PathBuf),

    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
