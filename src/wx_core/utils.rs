use log::error;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// Error type for wx_core module
#[derive(Error, Debug)]
pub enum WxCoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WalkDir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("account is not online")]
    NotOnline,

    #[error("failed to open process {pid}: {reason}")]
    ProcessOpenFailed { pid: u32, reason: String },

    #[error("memory read failed at {address:#x} ({size} bytes)")]
    MemoryReadFailed { address: u64, size: usize },

    #[error("key error: {0}")]
    KeyInvalid(String),

    #[error("malformed database: {0}")]
    Malformed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),
}

// Result type for wx_core module
pub type WxCoreResult<T> = Result<T, WxCoreError>;

// Function to log errors and return a result
pub fn wx_core_error<T, F>(f: F) -> WxCoreResult<T>
where
    F: FnOnce() -> WxCoreResult<T>,
{
    match f() {
        Ok(result) => Ok(result),
        Err(e) => {
            error!("WxCore error: {}", e);
            Err(e)
        }
    }
}

/// Cooperative cancellation flag shared between a scan's producer and its
/// workers. Cloning hands out another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Maps the flag onto the error space for `?`-style early exit.
    pub fn check(&self) -> WxCoreResult<()> {
        if self.is_cancelled() {
            Err(WxCoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// File or directory existence, without distinguishing the two
pub fn exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}

// Deduplicate while preserving first-seen order
pub fn unique(elements: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    elements
        .into_iter()
        .filter(|e| seen.insert(e.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_roundtrip() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(WxCoreError::Cancelled)));
    }

    #[test]
    fn unique_preserves_order() {
        let input = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(unique(input), vec!["a".to_string(), "b".to_string()]);
    }
}
