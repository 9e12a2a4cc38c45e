use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod mock;

/// Whether a session carries video+audio or audio only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn wants_video(self) -> bool {
        matches!(self, CallKind::Video)
    }

    /// Infers the caller's intent from an offer: any video media line wins.
    pub fn infer_from_sdp(sdp: &str) -> Self {
        let has_video = sdp
            .lines()
            .any(|line| line.trim_start().starts_with("m=video"));
        if has_video {
            CallKind::Video
        } else {
            CallKind::Voice
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Voice => f.write_str("voice"),
            CallKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 48_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub ideal_frame_rate: u32,
    pub min_frame_rate: u32,
    pub facing_user: bool,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            min_width: 640,
            min_height: 480,
            ideal_frame_rate: 30,
            min_frame_rate: 15,
            facing_user: true,
        }
    }
}

/// What to ask the capture layer for.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn new(want_audio: bool, want_video: bool) -> Self {
        Self {
            audio: want_audio.then(AudioConstraints::default),
            video: want_video.then(VideoConstraints::default),
        }
    }

    /// Audio is always requested; video only for video calls.
    pub fn for_call(kind: CallKind) -> Self {
        Self::new(true, kind.wants_video())
    }

    pub fn wants_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn wants_video(&self) -> bool {
        self.video.is_some()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("permission to use the camera or microphone was denied")]
    PermissionDenied,
    #[error("no camera or microphone found")]
    DeviceNotFound,
    #[error("media acquisition failed: {0}")]
    Other(String),
}

impl MediaAcquisitionError {
    /// Message suitable for showing to the person who pressed "call".
    pub fn user_message(&self) -> String {
        let hint = match self {
            MediaAcquisitionError::PermissionDenied => {
                "Please allow camera and microphone access.".to_string()
            }
            MediaAcquisitionError::DeviceNotFound => {
                "No camera or microphone found. Please connect a device.".to_string()
            }
            MediaAcquisitionError::Other(reason) if !reason.is_empty() => reason.clone(),
            MediaAcquisitionError::Other(_) => {
                "Please check your camera/microphone permissions.".to_string()
            }
        };
        format!("Failed to start call. {hint}")
    }
}

/// A single captured track. Clones share the enabled/stopped flags so the
/// engine and the capture source observe toggles made by the negotiator.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind) -> Self {
        let prefix = match kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        Self {
            id: format!("{prefix}-{}", Uuid::new_v4()),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Owns the local tracks of one call. Dropping the handle stops them.
#[derive(Debug)]
pub struct MediaHandle {
    stream_id: String,
    tracks: Vec<LocalTrack>,
}

impl MediaHandle {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: format!("lagoon-{}", Uuid::new_v4()),
            tracks,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Video)
    }

    pub fn has_video(&self) -> bool {
        self.video_tracks().next().is_some()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.audio_tracks() {
            track.set_enabled(enabled);
        }
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        for track in self.video_tracks() {
            track.set_enabled(enabled);
        }
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A track received from the peer. The session only records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteMedia {
    tracks: Vec<RemoteTrack>,
}

impl RemoteMedia {
    pub fn add(&mut self, track: RemoteTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Local capture layer.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, MediaAcquisitionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_video_from_media_line() {
        let sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
        assert_eq!(CallKind::infer_from_sdp(sdp), CallKind::Video);
    }

    #[test]
    fn audio_only_offer_is_voice() {
        let sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n";
        assert_eq!(CallKind::infer_from_sdp(sdp), CallKind::Voice);
    }

    #[test]
    fn constraints_follow_call_kind() {
        let voice = MediaConstraints::for_call(CallKind::Voice);
        assert!(voice.wants_audio());
        assert!(!voice.wants_video());

        let video = MediaConstraints::for_call(CallKind::Video);
        assert!(video.wants_video());
        let hints = video.video.unwrap();
        assert_eq!((hints.ideal_width, hints.ideal_height), (1280, 720));
        assert_eq!(video.audio.unwrap().sample_rate, 48_000);
    }

    #[test]
    fn toggling_audio_leaves_video_alone() {
        let handle = MediaHandle::new(vec![
            LocalTrack::new(MediaKind::Audio),
            LocalTrack::new(MediaKind::Video),
        ]);
        handle.set_audio_enabled(false);
        assert!(handle.audio_tracks().all(|t| !t.is_enabled()));
        assert!(handle.video_tracks().all(|t| t.is_enabled()));
    }

    #[test]
    fn dropping_handle_stops_shared_tracks() {
        let track = LocalTrack::new(MediaKind::Audio);
        let observer = track.clone();
        drop(MediaHandle::new(vec![track]));
        assert!(observer.is_stopped());
    }

    #[test]
    fn user_messages_distinguish_causes() {
        assert!(
            MediaAcquisitionError::PermissionDenied
                .user_message()
                .contains("allow camera")
        );
        assert!(
            MediaAcquisitionError::DeviceNotFound
                .user_message()
                .contains("No camera")
        );
        assert!(
            MediaAcquisitionError::Other("driver crashed".into())
                .user_message()
                .ends_with("driver crashed")
        );
    }
}
