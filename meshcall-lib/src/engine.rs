use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    config::IceServer,
    media::{
        IceCandidate, IceConnectionState, LocalStream, RemoteMediaStream, SessionDescription,
        SignalingState, StatsReport,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatheringPolicy {
    Once,
    Continually,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub gathering_policy: GatheringPolicy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OfferConstraints {
    pub receive_audio: bool,
    pub receive_video: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    IceCandidate(IceCandidate),
    SignalingStateChanged(SignalingState),
    IceConnectionStateChanged(IceConnectionState),
    AddStream(RemoteMediaStream),
    RemoveStream(String),
    RenegotiationNeeded,
    DataChannelOpen,
    DataChannelMessage(Bytes),
}

/// Identifies which connection an engine event belongs to.
/// The generation tells a replaced connection apart from its successor with the same id.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SessionTag {
    pub id: String,
    pub generation: u64,
}

pub(crate) type TaggedEngineEvent = (SessionTag, EngineEvent);

#[derive(Clone, Debug)]
pub struct EngineEventSender {
    tag: SessionTag,
    tx: mpsc::UnboundedSender<TaggedEngineEvent>,
}

impl EngineEventSender {
    pub(crate) fn new(tag: SessionTag, tx: mpsc::UnboundedSender<TaggedEngineEvent>) -> Self {
        Self { tag, tx }
    }

    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    /// Returns false once the owning client has shut down.
    pub fn send(&self, event: EngineEvent) -> bool {
        self.tx.send((self.tag.clone(), event)).is_ok()
    }
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync + 'static {
    async fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        events: EngineEventSender,
    ) -> Result<Box<dyn PeerConnection>>;
}

/// One connection of the underlying real-time media engine.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, constraints: OfferConstraints) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;
    async fn add_stream(&self, stream: &LocalStream) -> Result<()>;
    async fn remove_stream(&self, stream_id: &str) -> Result<()>;
    async fn set_max_bitrate(
        &self,
        stream_id: &str,
        video_kbps: Option<u32>,
        audio_kbps: Option<u32>,
    ) -> Result<()>;
    async fn create_data_channel(&self, label: &str) -> Result<()>;
    async fn send_data(&self, data: Bytes) -> Result<()>;
    async fn get_stats(&self) -> Result<StatsReport>;
    async fn close(&self);
}
