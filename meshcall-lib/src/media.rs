use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use derive_new::new;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::client::EVENT_CAPACITY;

#[derive(Clone, Copy, Debug, Deserialize, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Mic,
    Camera,
    ScreenCast,
    File,
    Mixed,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize, new)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub source: SourceKind,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize, new)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// A captured stream. The media engine resolves `id` and the track ids to its own media objects.
#[derive(Clone, Debug, PartialEq, Eq, new)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<TrackInfo>,
    #[new(default)]
    pub attributes: HashMap<String, String>,
    #[new(default)]
    pub resolution: Option<Resolution>,
    #[new(default)]
    pub frame_rate: Option<u32>,
}

impl LocalStream {
    pub fn track(&self, kind: TrackKind) -> Option<&TrackInfo> {
        self.tracks.iter().find(|track| track.kind == kind)
    }

    pub fn source(&self) -> StreamSourceInfo {
        StreamSourceInfo {
            audio: self.track(TrackKind::Audio).map(|x| x.source),
            video: self.track(TrackKind::Video).map(|x| x.source),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct StreamSourceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<SourceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<SourceKind>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    #[default]
    Forward,
    Mixed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteStreamInfo {
    pub id: String,
    pub origin: String,
    pub stream_type: StreamType,
    pub source: StreamSourceInfo,
    pub attributes: HashMap<String, String>,
    /// Publication settings as announced by the server, kept undecoded.
    pub media: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteStreamEvent {
    Updated,
    Ended,
}

struct RemoteStreamShared {
    id: String,
    info: Mutex<RemoteStreamInfo>,
    ended: AtomicBool,
    events: broadcast::Sender<RemoteStreamEvent>,
}

/// A stream published by someone else. Clones share the same state.
#[derive(Clone)]
pub struct RemoteStream {
    shared: Arc<RemoteStreamShared>,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.shared.id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl RemoteStream {
    pub fn new(info: RemoteStreamInfo) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(RemoteStreamShared {
                id: info.id.clone(),
                info: Mutex::new(info),
                ended: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn info(&self) -> RemoteStreamInfo {
        match self.shared.info.lock() {
            Ok(info) => info.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn origin(&self) -> String {
        self.info().origin
    }

    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RemoteStreamEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut RemoteStreamInfo)) {
        match self.shared.info.lock() {
            Ok(mut info) => f(&mut info),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
        self.notify_updated();
    }

    pub(crate) fn notify_updated(&self) {
        let _ = self.shared.events.send(RemoteStreamEvent::Updated);
    }

    /// Returns false if the stream had already ended.
    pub(crate) fn end(&self) -> bool {
        if self.shared.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shared.events.send(RemoteStreamEvent::Ended);
        true
    }
}

/// A stream as the media engine delivers it, before any metadata is attached.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize, new)]
pub struct RemoteMediaStream {
    pub id: String,
    pub track_ids: Vec<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize, new)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Clone, Debug, PartialEq, Eq, new)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: u32,
    pub candidate: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatsReport {
    pub timestamp_us: i64,
    pub members: HashMap<String, Value>,
}
