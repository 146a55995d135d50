//! Cooperative cancellation flag shared between the front-end and the worker

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable handle to a single cancellation flag.
///
/// The pipeline reads it only between steps; a running step is never
/// interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the pipeline to stop at the next step boundary
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_flag() {
        let token = CancelToken::new();
        let front_end = token.clone();
        assert!(!token.is_requested());

        front_end.request();
        assert!(token.is_requested());
    }

    #[test]
    fn test_request_across_threads() {
        let token = CancelToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.request())
            .join()
            .unwrap();
        assert!(token.is_requested());
    }
}
