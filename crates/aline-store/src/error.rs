use std::fmt;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Model(aline_core::AlineError),
    /// Unreadable or inconsistent checkpoint manifest.
    Manifest(String),
    InvalidData(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::Model(e) => write!(f, "model error: {e}"),
            StoreError::Manifest(msg) => write!(f, "invalid manifest: {msg}"),
            StoreError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) => Some(e),
            StoreError::Io(e) => Some(e),
            StoreError::Model(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<aline_core::AlineError> for StoreError {
    fn from(e: aline_core::AlineError) -> Self {
        StoreError::Model(e)
    }
}

impl From<candle_core::Error> for StoreError {
    fn from(e: candle_core::Error) -> Self {
        StoreError::Model(e.into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
