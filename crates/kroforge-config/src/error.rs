//! Errors raised while loading deployment configuration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid KDL: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("`{0}` needs a value")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid environment override {var}: {message}")]
    Environment { var: String, message: String },

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
