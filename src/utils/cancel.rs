use crate::error::{OmnidexError, OmnidexResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag checked between statement checkpoints
/// (per posting list, per tree node expanded, per data page scanned).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Error out if cancellation was requested.
    pub fn checkpoint(&self) -> OmnidexResult<()> {
        if self.is_cancelled() {
            Err(OmnidexError::Internal("statement cancelled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_fires_after_cancel() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
        token.cancel();
        assert!(token.checkpoint().is_err());
    }
}
