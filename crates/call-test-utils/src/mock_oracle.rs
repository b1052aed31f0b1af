//! Scripted verification oracle.

use async_trait::async_trait;
use call_session::errors::VerificationError;
use call_session::media::ImageCapture;
use call_session::session::{BiometricKind, VerificationOracle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pass,
    Reject,
    Error,
}

/// Mock `VerificationOracle` answering every request the same way.
#[derive(Debug, Clone)]
pub struct MockOracle {
    verdict: Verdict,
    calls: Arc<AtomicUsize>,
    captures: Arc<Mutex<Vec<(BiometricKind, ImageCapture)>>>,
}

impl MockOracle {
    fn with_verdict(verdict: Verdict) -> Self {
        Self {
            verdict,
            calls: Arc::new(AtomicUsize::new(0)),
            captures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every capture verifies.
    #[must_use]
    pub fn passing() -> Self {
        Self::with_verdict(Verdict::Pass)
    }

    /// Every capture is rejected.
    #[must_use]
    pub fn rejecting() -> Self {
        Self::with_verdict(Verdict::Reject)
    }

    /// Every request fails.
    #[must_use]
    pub fn erroring() -> Self {
        Self::with_verdict(Verdict::Error)
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received, in order.
    #[must_use]
    pub fn captures(&self) -> Vec<(BiometricKind, ImageCapture)> {
        self.captures.lock().unwrap().clone()
    }
}

#[async_trait]
impl VerificationOracle for MockOracle {
    async fn verify(
        &self,
        kind: BiometricKind,
        capture: &ImageCapture,
    ) -> Result<bool, VerificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.captures.lock().unwrap().push((kind, capture.clone()));
        match self.verdict {
            Verdict::Pass => Ok(true),
            Verdict::Reject => Ok(false),
            Verdict::Error => Err(VerificationError::Oracle(
                "mock oracle unavailable".to_string(),
            )),
        }
    }
}
