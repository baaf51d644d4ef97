mod registry;

use std::mem::take;

use anyhow::Result;
use tracing::{debug, trace};

use crate::{
    engine::{OfferConstraints, PeerConnection, SessionTag},
    error::Error,
    media::{
        IceCandidate, IceConnectionState, LocalStream, SdpType, SessionDescription,
        SignalingState, StatsReport,
    },
    sdp::{munge_local_description, CodecPreference},
};

pub(crate) use registry::SessionRegistry;

/// Per-mode behavior plugged into a [`PeerSession`].
pub(crate) trait SessionMode: Send {
    /// Resolves every completion still waiting on this session as a failure.
    fn fail_pending(&mut self, error: &Error);
    /// Tells the observers bound to this session that it ended, and why if it failed.
    fn notify_ended(&mut self, error: Option<&Error>);
}

/// One negotiated connection with a remote endpoint.
pub(crate) struct PeerSession<M> {
    tag: SessionTag,
    connection: Box<dyn PeerConnection>,
    codecs: CodecPreference,
    constraints: OfferConstraints,
    signaling_state: SignalingState,
    ice_state: IceConnectionState,
    negotiating: bool,
    renegotiation_deferred: bool,
    negotiation_round: u64,
    remote_description_applied: bool,
    queued_local_candidates: Vec<IceCandidate>,
    queued_remote_candidates: Vec<IceCandidate>,
    ended: bool,
    pub mode: M,
}

impl<M: SessionMode> PeerSession<M> {
    pub fn new(
        tag: SessionTag,
        connection: Box<dyn PeerConnection>,
        codecs: CodecPreference,
        mode: M,
    ) -> Self {
        Self {
            tag,
            connection,
            codecs,
            constraints: OfferConstraints::default(),
            signaling_state: SignalingState::Stable,
            ice_state: IceConnectionState::New,
            negotiating: false,
            renegotiation_deferred: false,
            negotiation_round: 0,
            remote_description_applied: false,
            queued_local_candidates: vec![],
            queued_remote_candidates: vec![],
            ended: false,
            mode,
        }
    }

    pub fn id(&self) -> &str {
        &self.tag.id
    }

    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.ice_state
    }

    pub fn set_ice_state(&mut self, state: IceConnectionState) {
        self.ice_state = state;
    }

    pub fn set_constraints(&mut self, constraints: OfferConstraints) {
        self.constraints = constraints;
    }

    pub fn is_negotiating(&self) -> bool {
        self.negotiating
    }

    pub fn negotiation_round(&self) -> u64 {
        self.negotiation_round
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_applied
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Starts an offer round, or defers it if one is already in flight.
    /// Returns the local offer to forward.
    pub async fn request_negotiation(&mut self) -> Result<Option<SessionDescription>> {
        if self.ended {
            return Ok(None);
        }
        if self.negotiating || self.signaling_state != SignalingState::Stable {
            trace!("{}: negotiation deferred", self.tag.id);
            self.renegotiation_deferred = true;
            return Ok(None);
        }
        self.negotiating = true;
        self.renegotiation_deferred = false;
        self.negotiation_round += 1;
        let offer = self.connection.create_offer(self.constraints).await?;
        let offer = munge_local_description(offer, &self.codecs);
        self.connection.set_local_description(&offer).await?;
        self.signaling_state = SignalingState::HaveLocalOffer;
        debug!("{}: offer {} created", self.tag.id, self.negotiation_round);
        Ok(Some(offer))
    }

    /// Applies the remote description. For an offer, returns the local answer to forward.
    pub async fn apply_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<Option<SessionDescription>> {
        self.connection.set_remote_description(desc).await?;
        self.remote_description_applied = true;
        for candidate in take(&mut self.queued_remote_candidates) {
            self.connection.add_ice_candidate(&candidate).await?;
        }
        match desc.sdp_type {
            SdpType::Offer => {
                self.signaling_state = SignalingState::HaveRemoteOffer;
                let answer = self.connection.create_answer().await?;
                let answer = munge_local_description(answer, &self.codecs);
                self.connection.set_local_description(&answer).await?;
                self.signaling_state = SignalingState::Stable;
                self.negotiating = false;
                Ok(Some(answer))
            }
            SdpType::Answer => {
                self.signaling_state = SignalingState::Stable;
                self.negotiating = false;
                Ok(None)
            }
        }
    }

    /// True once if a negotiation request was deferred and the session is idle again.
    pub fn take_deferred_renegotiation(&mut self) -> bool {
        if self.ended || self.negotiating || self.signaling_state != SignalingState::Stable {
            return false;
        }
        take(&mut self.renegotiation_deferred)
    }

    /// Returns the candidate if it may be forwarded now; otherwise keeps it for later.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_applied {
            return Some(candidate);
        }
        self.queued_local_candidates.push(candidate);
        None
    }

    /// Candidates held back until the remote description was applied, in discovery order.
    pub fn take_forwardable_candidates(&mut self) -> Vec<IceCandidate> {
        if !self.remote_description_applied {
            return vec![];
        }
        take(&mut self.queued_local_candidates)
    }

    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_description_applied {
            self.queued_remote_candidates.push(candidate);
            return Ok(());
        }
        self.connection.add_ice_candidate(&candidate).await
    }

    pub async fn add_stream(
        &mut self,
        stream: &LocalStream,
        video_kbps: Option<u32>,
        audio_kbps: Option<u32>,
    ) -> Result<()> {
        self.connection.add_stream(stream).await?;
        if video_kbps.is_some() || audio_kbps.is_some() {
            self.connection
                .set_max_bitrate(&stream.id, video_kbps, audio_kbps)
                .await?;
        }
        Ok(())
    }

    pub async fn remove_stream(&mut self, stream_id: &str) -> Result<()> {
        self.connection.remove_stream(stream_id).await
    }

    pub fn connection(&self) -> &dyn PeerConnection {
        self.connection.as_ref()
    }

    pub async fn get_stats(&self) -> crate::Result<StatsReport> {
        if self.ended {
            return Err(Error::invalid_state("session has ended"));
        }
        self.connection
            .get_stats()
            .await
            .map_err(|err| Error::invalid_state(format!("invalid stats: {}", err)))
    }

    /// Ends the session. Returns false if it had already ended.
    pub async fn dispose(&mut self, error: Option<&Error>) -> bool {
        if self.ended {
            return false;
        }
        debug!("{}: dispose", self.tag.id);
        self.ended = true;
        self.negotiating = false;
        self.signaling_state = SignalingState::Closed;
        let closed = Error::invalid_state("session closed");
        self.mode.fail_pending(error.unwrap_or(&closed));
        self.mode.notify_ended(error);
        self.connection.close().await;
        true
    }
}
