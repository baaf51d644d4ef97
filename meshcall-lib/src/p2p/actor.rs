use std::{
    collections::{HashMap, HashSet},
    future::pending,
    sync::Arc,
};

use serde_json::{json, Value};
use tokio::{
    select, spawn,
    sync::{mpsc, watch},
};
use tracing::{debug, info, trace, warn};

use crate::{
    client::{arm_negotiation_timeout, complete, Completion, ConnectionState, Lifecycle},
    config::ClientConfiguration,
    engine::{EngineEvent, PeerConnectionFactory, SessionTag, TaggedEngineEvent},
    error::{Error, ErrorCode, Result},
    media::{
        IceCandidate, IceConnectionState, LocalStream, RemoteStream, RemoteStreamInfo, SdpType,
        SessionDescription, SignalingState, StreamType,
    },
    session::SessionRegistry,
    user_agent::USER_AGENT,
};

use super::{
    capability::CapabilitySet,
    data::{check_message, parse_data_message, DATA_CHANNEL_LABEL},
    glare::{resolve_offer, OfferDisposition},
    handshake::{
        stream_info_message, track_sources_message, IncomingHandshake, StreamInfoMessage,
        TrackSource,
    },
    message::{decode, CloseReason, MessageKind},
    slot::{Handover, P2PSlot, PublicationEntry},
    writer::SignalingWriter,
    Command, P2PEvent, P2PPublication, P2PPublicationEvent, P2PSignalingChannel,
    P2PSignalingEvent,
};

enum Internal {
    Connected {
        generation: u64,
        result: anyhow::Result<String>,
        done: Completion<String>,
    },
    NegotiationTimeout(SessionTag, u64),
}

fn wrong_state() -> Error {
    Error::invalid_state("wrong server connection status")
}

fn no_session() -> Error {
    Error::invalid_state("no peer connection established")
}

fn uid_of(result: &str) -> Result<String> {
    serde_json::from_str::<Value>(result)
        .ok()
        .and_then(|x| x.get("uid").and_then(|x| x.as_str()).map(|x| x.to_owned()))
        .ok_or_else(|| Error::Protocol("login result without uid".to_owned()))
}

async fn recv_some<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

pub(crate) struct P2POrchestrator {
    config: ClientConfiguration,
    signaling: Arc<dyn P2PSignalingChannel>,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedSender<P2PEvent>,
    state_tx: watch::Sender<ConnectionState>,
    id_tx: watch::Sender<Option<String>>,
    state: ConnectionState,
    id: Option<String>,
    connect_generation: u64,
    allowed: HashSet<String>,
    registry: SessionRegistry<P2PSlot>,
    engine_rx: mpsc::UnboundedReceiver<TaggedEngineEvent>,
    /// Outlives the sessions, so metadata sent before a connection is replaced is not lost.
    incoming: HashMap<String, IncomingHandshake>,
    writer: SignalingWriter,
    failure_rx: mpsc::UnboundedReceiver<(String, Error)>,
    signal_rx: Option<mpsc::UnboundedReceiver<P2PSignalingEvent>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl P2POrchestrator {
    pub fn new(
        config: ClientConfiguration,
        signaling: Arc<dyn P2PSignalingChannel>,
        engine: Arc<dyn PeerConnectionFactory>,
        commands: mpsc::WeakUnboundedSender<Command>,
        events: mpsc::UnboundedSender<P2PEvent>,
        state_tx: watch::Sender<ConnectionState>,
        id_tx: watch::Sender<Option<String>>,
    ) -> Self {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(engine, engine_tx, config.codec_preference());
        let writer = SignalingWriter::spawn(signaling.clone(), failure_tx);
        Self {
            config,
            signaling,
            commands,
            events,
            state_tx,
            id_tx,
            state: ConnectionState::Disconnected,
            id: None,
            connect_generation: 0,
            allowed: HashSet::new(),
            registry,
            engine_rx,
            incoming: HashMap::new(),
            writer,
            failure_rx,
            signal_rx: None,
            internal_tx,
            internal_rx,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(event) = recv_some(&mut self.signal_rx) => self.on_signaling_event(event).await,
                Some((tag, event)) = self.engine_rx.recv() => self.on_engine_event(tag, event).await,
                Some(msg) = self.internal_rx.recv() => self.on_internal(msg).await,
                Some((peer, error)) = self.failure_rx.recv() => {
                    self.registry.dispose(&peer, Some(&error)).await;
                }
            }
        }
        debug!("p2p client dropped");
        self.registry.dispose_all(None).await;
        if self.state != ConnectionState::Disconnected {
            if let Err(err) = self.signaling.disconnect().await {
                warn!("disconnecting failed: {}", err);
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("connection state: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn set_id(&mut self, id: Option<String>) {
        self.id = id.clone();
        self.id_tx.send_replace(id);
    }

    fn emit(&self, event: P2PEvent) {
        let _ = self.events.send(event);
    }

    /// The server must be connected and `peer` allowed for anything sent to it.
    fn check_peer(&self, peer: &str) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(wrong_state());
        }
        if self.id.as_deref() == Some(peer) {
            return Err(Error::NotAllowed("cannot talk to self".to_owned()));
        }
        if !self.allowed.contains(peer) {
            return Err(Error::NotAllowed(format!("{} is not allowed", peer)));
        }
        Ok(())
    }

    fn send_signal(&self, peer: &str, signal: Value) {
        self.writer.send(peer, MessageKind::Signal, signal);
    }

    fn send_candidate(&self, peer: &str, candidate: &IceCandidate) {
        self.send_signal(
            peer,
            json!({
                "type": "candidates",
                "candidate": candidate.candidate,
                "sdpMLineIndex": candidate.sdp_mline_index,
                "sdpMid": candidate.sdp_mid,
            }),
        );
    }

    /// First contact with a peer: clear whatever it still holds for us, then introduce ourselves.
    fn greet(&self, peer: &str) {
        self.writer.send(peer, MessageKind::Closed, Value::Null);
        self.writer
            .send(peer, MessageKind::UserAgent, USER_AGENT.clone());
    }

    /// Gathering continues only if both this client and the peer support it.
    fn continual_for(&self, capabilities: &CapabilitySet) -> bool {
        self.config.continual_ice_gathering && capabilities.continual_ice_gathering
    }

    async fn ensure_session(&mut self, peer: &str, capabilities: CapabilitySet) -> Result<()> {
        let continual = self.continual_for(&capabilities);
        let rtc = self.config.rtc_configuration(continual);
        self.registry
            .get_or_create(peer, &rtc, || P2PSlot::new(continual, capabilities))
            .await
            .map(|_| ())
            .map_err(Error::negotiation)
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { token, done } => self.connect(token, done),
            Command::Disconnect { done } => {
                if self.state == ConnectionState::Disconnected {
                    complete(done, Ok(()));
                    return;
                }
                info!("disconnecting");
                if let Err(err) = self.signaling.disconnect().await {
                    warn!("disconnecting failed: {}", err);
                }
                self.signal_rx = None;
                self.on_server_disconnected().await;
                complete(done, Ok(()));
            }
            Command::Publish { peer, stream, done } => self.publish(peer, stream, done).await,
            Command::Unpublish {
                peer,
                stream_id,
                done,
            } => {
                let result = self.unpublish(&peer, &stream_id).await;
                complete(done, result);
            }
            Command::Stop { peer, done } => {
                if self.state != ConnectionState::Connected {
                    complete(done, Err(wrong_state()));
                    return;
                }
                if self.registry.dispose(&peer, None).await {
                    info!("{}: stopped", peer);
                    self.writer.send(&peer, MessageKind::Closed, Value::Null);
                }
                self.incoming.remove(&peer);
                complete(done, Ok(()));
            }
            Command::Send {
                peer,
                message,
                done,
            } => self.send(peer, message, done).await,
            Command::GetStats { peer, done } => {
                let result = match self.registry.get(&peer) {
                    Some(session) => session.get_stats().await,
                    None => Err(no_session()),
                };
                complete(done, result);
            }
            Command::Allow { peer, allowed } => {
                debug!("{} allowed: {}", peer, allowed);
                if allowed {
                    self.allowed.insert(peer);
                } else {
                    self.allowed.remove(&peer);
                }
            }
        }
    }

    fn connect(&mut self, token: String, done: Completion<String>) {
        if self.state != ConnectionState::Disconnected {
            complete(done, Err(wrong_state()));
            return;
        }
        info!("connecting to signaling server");
        self.set_state(ConnectionState::Connecting);
        self.connect_generation += 1;
        let generation = self.connect_generation;
        let (tx, rx) = mpsc::unbounded_channel();
        self.signal_rx = Some(rx);
        let signaling = self.signaling.clone();
        let internal_tx = self.internal_tx.clone();
        spawn(async move {
            let result = signaling.connect(&token, tx).await;
            let _ = internal_tx.send(Internal::Connected {
                generation,
                result,
                done,
            });
        });
    }

    async fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Connected {
                generation,
                result,
                done,
            } => {
                if generation != self.connect_generation
                    || self.state != ConnectionState::Connecting
                {
                    complete(done, Err(Error::transport("disconnected while connecting")));
                    return;
                }
                match result.map_err(Error::transport).and_then(|x| uid_of(&x)) {
                    Ok(uid) => {
                        info!("connected as {}", uid);
                        self.set_id(Some(uid.clone()));
                        self.set_state(ConnectionState::Connected);
                        complete(done, Ok(uid));
                    }
                    Err(err) => {
                        warn!("connecting failed: {}", err);
                        self.signal_rx = None;
                        self.set_state(ConnectionState::Disconnected);
                        complete(done, Err(err));
                    }
                }
            }
            Internal::NegotiationTimeout(tag, round) => {
                let expired = self.registry.get_tagged_mut(&tag).is_some_and(|session| {
                    session.is_negotiating() && session.negotiation_round() == round
                });
                if expired {
                    self.close_session(&tag.id, Error::negotiation("negotiation timed out"))
                        .await;
                }
            }
        }
    }

    async fn on_server_disconnected(&mut self) {
        info!("disconnected from signaling server");
        let was_connected = self.state != ConnectionState::Disconnected;
        self.set_state(ConnectionState::Disconnected);
        self.set_id(None);
        self.registry.dispose_all(None).await;
        self.incoming.clear();
        if was_connected {
            self.emit(P2PEvent::ServerDisconnected);
        }
    }

    async fn publish(&mut self, peer: String, stream: LocalStream, done: Completion<P2PPublication>) {
        if let Err(err) = self.check_peer(&peer) {
            complete(done, Err(err));
            return;
        }
        if stream.tracks.is_empty() {
            complete(
                done,
                Err(Error::IllegalArgument("stream has no tracks".to_owned())),
            );
            return;
        }
        let done = match self.registry.get_mut(&peer) {
            Some(session) => {
                let slot = &mut session.mode;
                let Some(done) = slot.outgoing.join(&stream.id, done) else {
                    debug!("{}: {} is already being published", peer, stream.id);
                    return;
                };
                if slot.is_published(&stream.id) {
                    complete(done, Err(Error::invalid_state("Duplicated stream.")));
                    return;
                }
                if !slot.capabilities.stream_removable && slot.ever_published {
                    complete(
                        done,
                        Err(Error::invalid_state("peer cannot take another stream")),
                    );
                    return;
                }
                done
            }
            None => {
                self.greet(&peer);
                done
            }
        };
        debug!("{}: publishing {}", peer, stream.id);
        self.writer
            .send(&peer, MessageKind::TrackSources, track_sources_message(&stream));
        self.writer
            .send(&peer, MessageKind::StreamInfo, stream_info_message(&stream));
        if let Err(err) = self.ensure_session(&peer, CapabilitySet::default()).await {
            complete(done, Err(err));
            return;
        }
        let Some(session) = self.registry.get_mut(&peer) else {
            complete(done, Err(no_session()));
            return;
        };
        let slot = &mut session.mode;
        slot.outgoing.begin(&stream, done);
        slot.published.push(stream.clone());
        slot.ever_published = true;
        if self.attach(&peer, std::slice::from_ref(&stream), true).await {
            self.negotiate(&peer).await;
        }
    }

    async fn unpublish(&mut self, peer: &str, stream_id: &str) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(wrong_state());
        }
        let session = self.registry.get_mut(peer).ok_or_else(no_session)?;
        if !session.mode.capabilities.stream_removable {
            return Err(Error::invalid_state("peer cannot remove streams"));
        }
        let slot = &mut session.mode;
        slot.published.retain(|x| x.id != stream_id);
        slot.publications.retain(|entry| {
            if entry.stream_id != stream_id {
                return true;
            }
            entry.lifecycle.end(P2PPublicationEvent::Ended);
            false
        });
        session
            .remove_stream(stream_id)
            .await
            .map_err(Error::negotiation)?;
        debug!("{}: unpublished {}", peer, stream_id);
        self.negotiate(peer).await;
        Ok(())
    }

    async fn send(&mut self, peer: String, message: String, done: Completion<()>) {
        if let Err(err) = self.check_peer(&peer).and_then(|_| check_message(&message)) {
            complete(done, Err(err));
            return;
        }
        if !self.registry.contains(&peer) {
            self.greet(&peer);
        }
        if let Err(err) = self.ensure_session(&peer, CapabilitySet::default()).await {
            complete(done, Err(err));
            return;
        }
        let Some(session) = self.registry.get_mut(&peer) else {
            complete(done, Err(no_session()));
            return;
        };
        let (id, body) = session.mode.data.enqueue(message, done);
        if let Some(body) = body {
            if let Err(err) = session.connection().send_data(body).await {
                session.mode.data.fail(id, Error::transport(err));
            }
        }
        if !session.mode.data.created && self.attach(&peer, &[], true).await {
            self.negotiate(&peer).await;
        }
    }

    /// Adds streams and, if asked for, the data channel. Returns false if the session failed.
    async fn attach(&mut self, peer: &str, streams: &[LocalStream], data: bool) -> bool {
        let video_kbps = self.config.max_video_bitrate_kbps;
        let audio_kbps = self.config.max_audio_bitrate_kbps;
        let Some(session) = self.registry.get_mut(peer) else {
            return false;
        };
        let result: anyhow::Result<()> = async {
            for stream in streams {
                session.add_stream(stream, video_kbps, audio_kbps).await?;
            }
            if data && !session.mode.data.created {
                session
                    .connection()
                    .create_data_channel(DATA_CHANNEL_LABEL)
                    .await?;
                session.mode.data.created = true;
            }
            Ok(())
        }
        .await;
        if let Err(err) = result {
            self.close_session(peer, Error::negotiation(err)).await;
            return false;
        }
        true
    }

    async fn negotiate(&mut self, peer: &str) {
        let Some(session) = self.registry.get_mut(peer) else {
            return;
        };
        match session.request_negotiation().await {
            Ok(Some(offer)) => {
                let tag = session.tag().clone();
                let round = session.negotiation_round();
                self.send_signal(peer, json!({ "type": "offer", "sdp": offer.sdp }));
                arm_negotiation_timeout(
                    self.config.negotiation_timeout(),
                    &self.internal_tx,
                    tag,
                    round,
                    Internal::NegotiationTimeout,
                );
            }
            Ok(None) => {}
            Err(err) => self.close_session(peer, Error::negotiation(err)).await,
        }
    }

    /// Ends the session with `error` and tells the peer why.
    async fn close_session(&mut self, peer: &str, error: Error) {
        warn!("{}: {}", peer, error);
        if self.registry.dispose(peer, Some(&error)).await {
            self.writer
                .send(peer, MessageKind::Closed, CloseReason::to_value(&error));
        }
    }

    /// Replaces the connection with `peer` by a new one carrying the same streams and messages.
    async fn rebuild(
        &mut self,
        peer: &str,
        handover: Handover,
        continual: bool,
        offer: Option<SessionDescription>,
    ) {
        info!("{}: rebuilding connection", peer);
        let data = handover.data_channel();
        let rtc = self.config.rtc_configuration(continual);
        let mut handover = Some(handover);
        let created = self
            .registry
            .get_or_create(peer, &rtc, || {
                P2PSlot::resume(continual, handover.take().unwrap_or_default())
            })
            .await
            .map(|session| session.mode.published.clone());
        let streams = match created {
            Ok(streams) => streams,
            Err(err) => {
                let error = Error::negotiation(err);
                warn!("{}: {}", peer, error);
                if let Some(handover) = handover {
                    handover.fail(&error);
                }
                return;
            }
        };
        if let Some(offer) = offer {
            self.apply_remote(peer, offer).await;
        }
        if self.attach(peer, &streams, data).await {
            self.negotiate(peer).await;
        }
    }

    async fn on_signaling_event(&mut self, event: P2PSignalingEvent) {
        match event {
            P2PSignalingEvent::Message { from, message } => match decode(&message) {
                Ok((kind, data)) => {
                    trace!("<- {} {}", from, kind.as_str());
                    self.on_message(&from, kind, data).await;
                }
                Err(err) => warn!("{}: {}", from, err),
            },
            P2PSignalingEvent::ServerDisconnected => {
                self.signal_rx = None;
                self.on_server_disconnected().await;
            }
        }
    }

    async fn on_message(&mut self, peer: &str, kind: MessageKind, data: Value) {
        if kind != MessageKind::Closed && !self.allowed.contains(peer) {
            self.deny(peer).await;
            return;
        }
        match kind {
            MessageKind::Signal => self.on_signal(peer, data).await,
            MessageKind::TrackSources => match serde_json::from_value::<Vec<TrackSource>>(data) {
                Ok(sources) => self
                    .incoming
                    .entry(peer.to_owned())
                    .or_default()
                    .add_track_sources(sources),
                Err(err) => warn!("{}: invalid track sources: {}", peer, err),
            },
            MessageKind::StreamInfo => match serde_json::from_value::<StreamInfoMessage>(data) {
                Ok(info) => {
                    self.incoming
                        .entry(peer.to_owned())
                        .or_default()
                        .add_info(info);
                    self.surface_streams(peer);
                }
                Err(err) => warn!("{}: invalid stream info: {}", peer, err),
            },
            MessageKind::TracksAdded => match serde_json::from_value::<Vec<String>>(data) {
                Ok(track_ids) => self.on_tracks_added(peer, &track_ids),
                Err(err) => warn!("{}: invalid track ids: {}", peer, err),
            },
            MessageKind::UserAgent => self.on_user_agent(peer, &data).await,
            MessageKind::DataReceived => {
                let Some(id) = data.as_u64() else {
                    warn!("{}: invalid data acknowledgement", peer);
                    return;
                };
                if let Some(session) = self.registry.get_mut(peer) {
                    session.mode.data.ack(id);
                }
            }
            MessageKind::Closed => self.on_closed(peer, CloseReason::parse(&data)).await,
        }
    }

    async fn deny(&mut self, peer: &str) {
        info!("{}: denied", peer);
        self.registry.dispose(peer, None).await;
        self.incoming.remove(peer);
        self.writer.send(
            peer,
            MessageKind::Closed,
            json!({ "code": ErrorCode::Denied.value(), "message": "Denied" }),
        );
    }

    async fn on_user_agent(&mut self, peer: &str, ua: &Value) {
        let capabilities = CapabilitySet::from_user_agent(ua);
        debug!("{}: {:?}", peer, capabilities);
        if let Some(session) = self.registry.get_mut(peer) {
            session.mode.capabilities = capabilities;
            return;
        }
        self.writer
            .send(peer, MessageKind::UserAgent, USER_AGENT.clone());
        if let Err(err) = self.ensure_session(peer, capabilities).await {
            warn!("{}: {}", peer, err);
        }
    }

    async fn on_signal(&mut self, peer: &str, data: Value) {
        match data.get("type").and_then(|x| x.as_str()) {
            Some("offer") | Some("answer") => {
                let desc: SessionDescription = match serde_json::from_value(data) {
                    Ok(desc) => desc,
                    Err(err) => {
                        warn!("{}: malformed description: {}", peer, err);
                        return;
                    }
                };
                match desc.sdp_type {
                    SdpType::Offer => self.on_offer(peer, desc).await,
                    SdpType::Answer => self.apply_remote(peer, desc).await,
                }
            }
            Some("candidates") => {
                let Some(sdp) = data.get("candidate").and_then(|x| x.as_str()) else {
                    warn!("{}: malformed candidate", peer);
                    return;
                };
                let candidate = IceCandidate::new(
                    data.get("sdpMid")
                        .and_then(|x| x.as_str())
                        .unwrap_or_default()
                        .to_owned(),
                    data.get("sdpMLineIndex")
                        .and_then(|x| x.as_u64())
                        .unwrap_or_default() as u32,
                    sdp.to_owned(),
                );
                let Some(session) = self.registry.get_mut(peer) else {
                    return;
                };
                if let Err(err) = session.add_remote_candidate(candidate).await {
                    warn!("{}: adding candidate failed: {}", peer, err);
                }
            }
            other => warn!("{}: unexpected signal {:?}", peer, other),
        }
    }

    async fn on_offer(&mut self, peer: &str, offer: SessionDescription) {
        let local_id = self.id.clone().unwrap_or_default();
        let state = self.registry.get(peer).map(|x| x.signaling_state());
        match resolve_offer(&local_id, peer, state) {
            OfferDisposition::Accept => {
                if let Err(err) = self.ensure_session(peer, CapabilitySet::default()).await {
                    warn!("{}: {}", peer, err);
                    return;
                }
                self.apply_remote(peer, offer).await;
            }
            OfferDisposition::Yield => {
                let Some(mut session) = self.registry.detach(peer) else {
                    return;
                };
                debug!("{}: offers collided, answering theirs", peer);
                let continual = session.mode.continual_ice_gathering;
                let handover = session.mode.hand_over();
                session.dispose(None).await;
                self.rebuild(peer, handover, continual, Some(offer)).await;
            }
            OfferDisposition::Ignore => debug!("{}: offers collided, keeping ours", peer),
        }
    }

    async fn apply_remote(&mut self, peer: &str, desc: SessionDescription) {
        let Some(session) = self.registry.get_mut(peer) else {
            return;
        };
        let answer = match session.apply_remote_description(&desc).await {
            Ok(answer) => answer,
            Err(err) => {
                self.close_session(peer, Error::negotiation(err)).await;
                return;
            }
        };
        let candidates = session.take_forwardable_candidates();
        let renegotiate = session.take_deferred_renegotiation();
        if let Some(answer) = answer {
            self.send_signal(peer, json!({ "type": "answer", "sdp": answer.sdp }));
        }
        for candidate in &candidates {
            self.send_candidate(peer, candidate);
        }
        if renegotiate {
            self.negotiate(peer).await;
        }
        self.surface_streams(peer);
    }

    async fn on_closed(&mut self, peer: &str, reason: CloseReason) {
        let Some(session) = self.registry.get(peer) else {
            trace!("{}: closed without a session", peer);
            return;
        };
        let fresh = session.negotiation_round() == 0 && !session.has_remote_description();
        if reason.code == 0 && (fresh || session.signaling_state() == SignalingState::HaveLocalOffer)
        {
            debug!("{}: ignoring close of a connection being set up", peer);
            return;
        }
        let Some(mut session) = self.registry.detach(peer) else {
            return;
        };
        match ErrorCode::from_value(reason.code) {
            ErrorCode::None => {
                info!("{}: closed by peer", peer);
                session.dispose(None).await;
                self.incoming.remove(peer);
            }
            ErrorCode::WebRtcIcePolicyUnsupported => {
                info!("{}: peer cannot gather continually", peer);
                let handover = session.mode.hand_over();
                session.dispose(None).await;
                self.rebuild(peer, handover, false, None).await;
            }
            _ => {
                let error = Error::Remote {
                    code: reason.code,
                    message: reason.message,
                };
                warn!("{}: {}", peer, error);
                session.dispose(Some(&error)).await;
                self.incoming.remove(peer);
            }
        }
    }

    fn on_tracks_added(&mut self, peer: &str, track_ids: &[String]) {
        let commands = self.commands.clone();
        let Some(session) = self.registry.get_mut(peer) else {
            return;
        };
        let slot = &mut session.mode;
        for (stream_id, waiters) in slot.outgoing.ack(track_ids) {
            info!("{}: {} published", peer, stream_id);
            let lifecycle = Lifecycle::new();
            slot.publications.push(PublicationEntry {
                stream_id: stream_id.clone(),
                lifecycle: lifecycle.clone(),
            });
            let publication =
                P2PPublication::new(peer.to_owned(), stream_id, commands.clone(), lifecycle);
            for done in waiters {
                complete(done, Ok(publication.clone()));
            }
        }
    }

    /// Announces the remote streams whose metadata and media are both in, once media can flow.
    fn surface_streams(&mut self, peer: &str) {
        let connected = self.registry.get(peer).is_some_and(|session| {
            matches!(
                session.ice_state(),
                IceConnectionState::Connected | IceConnectionState::Completed
            )
        });
        if !connected {
            return;
        }
        let Some(incoming) = self.incoming.get_mut(peer) else {
            return;
        };
        for ready in incoming.take_ready() {
            let stream = RemoteStream::new(RemoteStreamInfo {
                id: ready.media.id.clone(),
                origin: peer.to_owned(),
                stream_type: StreamType::Forward,
                source: ready.source,
                attributes: ready.info.attributes,
                media: Value::Null,
            });
            self.writer
                .send(peer, MessageKind::TracksAdded, json!(ready.media.track_ids));
            if let Some(session) = self.registry.get_mut(peer) {
                session
                    .mode
                    .remote_streams
                    .insert(ready.media.id, stream.clone());
            }
            info!("{}: stream {} added", peer, stream.id());
            self.emit(P2PEvent::StreamAdded(stream));
        }
    }

    async fn on_engine_event(&mut self, tag: SessionTag, event: EngineEvent) {
        let Some(session) = self.registry.get_tagged_mut(&tag) else {
            trace!("event of stale session {}: {:?}", tag.id, event);
            return;
        };
        let peer = tag.id.as_str();
        match event {
            EngineEvent::IceCandidate(candidate) => {
                if let Some(candidate) = session.on_local_candidate(candidate) {
                    self.send_candidate(peer, &candidate);
                }
            }
            EngineEvent::SignalingStateChanged(state) => trace!("{}: signaling {:?}", peer, state),
            EngineEvent::IceConnectionStateChanged(state) => {
                debug!("{}: ice {:?}", peer, state);
                session.set_ice_state(state);
                match state {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        self.surface_streams(peer);
                    }
                    IceConnectionState::Failed => {
                        warn!("{}: ice connection failed", peer);
                        session.mode.end_media();
                    }
                    _ => {}
                }
            }
            EngineEvent::AddStream(media) => {
                self.incoming
                    .entry(peer.to_owned())
                    .or_default()
                    .add_media(media);
                self.surface_streams(peer);
            }
            EngineEvent::RemoveStream(stream_id) => {
                match session.mode.remote_streams.remove(&stream_id) {
                    Some(stream) => {
                        info!("{}: stream {} removed", peer, stream_id);
                        stream.end();
                    }
                    None => {
                        if let Some(incoming) = self.incoming.get_mut(peer) {
                            incoming.remove_media(&stream_id);
                        }
                    }
                }
            }
            EngineEvent::RenegotiationNeeded => self.negotiate(peer).await,
            EngineEvent::DataChannelOpen => {
                debug!("{}: data channel open", peer);
                for body in session.mode.data.open() {
                    if let Err(err) = session.connection().send_data(body).await {
                        warn!("{}: sending data failed: {}", peer, err);
                    }
                }
            }
            EngineEvent::DataChannelMessage(raw) => match parse_data_message(&raw) {
                Some((id, message)) => {
                    self.emit(P2PEvent::DataReceived {
                        from: peer.to_owned(),
                        message,
                    });
                    self.writer.send(peer, MessageKind::DataReceived, json!(id));
                }
                None => warn!("{}: malformed data message", peer),
            },
        }
    }
}
