//! Mock camera and microphone.
//!
//! Unlike the synthetic devices, tracks produce no samples, which keeps
//! paused-clock tests idle. Acquired streams are retained so tests can check
//! that the session stopped them.

use async_trait::async_trait;
use call_session::errors::MediaError;
use call_session::media::{LocalStream, MediaConstraints, MediaDevices};
use std::sync::{Arc, Mutex};

/// Mock `MediaDevices`.
#[derive(Debug, Clone, Default)]
pub struct MockDevices {
    deny: bool,
    acquired: Arc<Mutex<Vec<Arc<LocalStream>>>>,
}

impl MockDevices {
    /// Devices that grant every request.
    #[must_use]
    pub fn working() -> Self {
        Self::default()
    }

    /// Devices whose permission is denied.
    #[must_use]
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Streams handed out so far.
    #[must_use]
    pub fn acquired(&self) -> Vec<Arc<LocalStream>> {
        self.acquired.lock().unwrap().clone()
    }

    /// Whether every acquired stream has been stopped.
    #[must_use]
    pub fn all_stopped(&self) -> bool {
        self.acquired.lock().unwrap().iter().all(|s| s.is_stopped())
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalStream>, MediaError> {
        if self.deny {
            return Err(MediaError::DeviceUnavailable(
                "permission denied".to_string(),
            ));
        }
        let stream = Arc::new(LocalStream::new(constraints));
        self.acquired.lock().unwrap().push(Arc::clone(&stream));
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_denied_devices() {
        let devices = MockDevices::denied();
        let result = devices.acquire(MediaConstraints::default()).await;
        assert!(matches!(result, Err(MediaError::DeviceUnavailable(_))));
        assert!(devices.acquired().is_empty());
    }

    #[tokio::test]
    async fn test_acquired_streams_are_tracked() {
        let devices = MockDevices::working();
        let stream = devices.acquire(MediaConstraints::default()).await.unwrap();
        assert!(!devices.all_stopped());

        stream.stop();

        assert!(devices.all_stopped());
    }
}
