use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::{
    LocalTrack, MediaAcquisitionError, MediaConstraints, MediaDevices, MediaHandle, MediaKind,
};

/// Capture layer that hands out fresh tracks without touching hardware.
///
/// Acquisitions can be made to fail, or held behind a gate so tests can
/// interleave other events while a call is waiting on "the camera prompt".
#[derive(Default)]
pub struct MockMediaDevices {
    failure: Mutex<Option<MediaAcquisitionError>>,
    has_camera: Mutex<Option<bool>>,
    gate: Option<Arc<Semaphore>>,
    issued: Mutex<Vec<LocalTrack>>,
    requests: Mutex<Vec<MediaConstraints>>,
}

impl MockMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquisitions block until [`MockMediaDevices::release`] is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    /// Every following acquisition fails with `error`.
    pub fn fail_with(&self, error: MediaAcquisitionError) {
        *self.failure.lock() = Some(error);
    }

    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Video requests fail with `DeviceNotFound`; audio-only still works.
    pub fn without_camera(&self) {
        *self.has_camera.lock() = Some(false);
    }

    pub fn issued_tracks(&self) -> Vec<LocalTrack> {
        self.issued.lock().clone()
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, MediaAcquisitionError> {
        self.requests.lock().push(constraints.clone());
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|err| MediaAcquisitionError::Other(err.to_string()))?;
            permit.forget();
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        if constraints.wants_video() && *self.has_camera.lock() == Some(false) {
            return Err(MediaAcquisitionError::DeviceNotFound);
        }

        let mut tracks = Vec::new();
        if constraints.wants_audio() {
            tracks.push(LocalTrack::new(MediaKind::Audio));
        }
        if constraints.wants_video() {
            tracks.push(LocalTrack::new(MediaKind::Video));
        }
        self.issued.lock().extend(tracks.iter().cloned());
        Ok(MediaHandle::new(tracks))
    }
}
