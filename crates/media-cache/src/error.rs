//! Error types for the media cache

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCacheError {
    InvalidKey(String),
    Config(String),
}

impl fmt::Display for MediaCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaCacheError::InvalidKey(msg) => write!(f, "Invalid cache key: {}", msg),
            MediaCacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for MediaCacheError {}

pub type Result<T> = std::result::Result<T, MediaCacheError>;
