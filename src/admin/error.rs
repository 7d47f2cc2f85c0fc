use std::path::{Path, PathBuf};

use crate::db::ConfigError;
use crate::types::TandemError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Database file not found at the specified path.
    #[error("database not found: {0}")]
    MissingDatabase(PathBuf),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Core database error.
    #[error(transparent)]
    Core(#[from] TandemError),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_database(path: impl AsRef<Path>) -> Self {
        AdminError::MissingDatabase(path.as_ref().to_path_buf())
    }
}

/// Opens an existing database; admin commands never create one.
pub(crate) fn open_existing(
    path: &Path,
    config: &crate::db::Config,
) -> Result<crate::db::Database> {
    if !path.exists() {
        return Err(AdminError::missing_database(path));
    }
    Ok(crate::db::Database::open(path, config.clone())?)
}
