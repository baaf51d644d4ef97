use std::{collections::HashSet, mem::take, sync::Arc};

use serde_json::{json, Value};
use tokio::{
    select, spawn,
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, info, trace, warn};

use crate::{
    client::{arm_negotiation_timeout, complete, Completion, ConnectionState, Lifecycle},
    config::ClientConfiguration,
    engine::{
        EngineEvent, OfferConstraints, PeerConnectionFactory, SessionTag, TaggedEngineEvent,
    },
    error::{Error, Result},
    media::{
        IceCandidate, IceConnectionState, LocalStream, RemoteMediaStream, RemoteStream, SdpType,
        SessionDescription, TrackKind,
    },
    session::{SessionMode, SessionRegistry},
    signaling::{parse_ack, Ack, ChannelEvent, ChannelHandle, SignalingChannel},
};

use super::{
    info::{parse_stream, ConferenceInfo, Participant},
    options::{control_message, control_operation, publish_message, subscribe_message},
    Command, ConferenceEvent, PublishOptions, Publication, PublicationEvent, SubscribeOptions,
    Subscription, SubscriptionEvent, TransportFactory,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionRole {
    Publication,
    Subscription,
}

enum PendingReady {
    Publish(Completion<Publication>),
    Subscribe(Completion<Subscription>),
}

impl PendingReady {
    fn fail(self, error: Error) {
        match self {
            PendingReady::Publish(done) => complete(done, Err(error)),
            PendingReady::Subscribe(done) => complete(done, Err(error)),
        }
    }
}

enum SlotHandle {
    Publication(Arc<Lifecycle<PublicationEvent>>),
    Subscription(Arc<Lifecycle<SubscriptionEvent>>),
}

/// What a conference session carries besides its connection.
pub(crate) struct ConferenceSlot {
    role: SessionRole,
    /// The published local stream, or the subscribed remote stream.
    stream_id: String,
    pending: Option<PendingReady>,
    handle: Option<SlotHandle>,
    media: Option<RemoteMediaStream>,
}

impl ConferenceSlot {
    fn new(role: SessionRole, stream_id: String) -> Self {
        Self {
            role,
            stream_id,
            pending: None,
            handle: None,
            media: None,
        }
    }

    fn emit_status(&self, kind: TrackKind, active: bool) {
        match &self.handle {
            Some(SlotHandle::Publication(lifecycle)) => lifecycle.emit(if active {
                PublicationEvent::Unmute(kind)
            } else {
                PublicationEvent::Mute(kind)
            }),
            Some(SlotHandle::Subscription(lifecycle)) => lifecycle.emit(if active {
                SubscriptionEvent::Unmute(kind)
            } else {
                SubscriptionEvent::Mute(kind)
            }),
            None => {}
        }
    }
}

impl SessionMode for ConferenceSlot {
    fn fail_pending(&mut self, error: &Error) {
        if let Some(pending) = self.pending.take() {
            pending.fail(error.clone());
        }
    }

    fn notify_ended(&mut self, error: Option<&Error>) {
        match &self.handle {
            Some(SlotHandle::Publication(lifecycle)) => {
                if let Some(error) = error {
                    lifecycle.emit(PublicationEvent::Error(error.clone()));
                }
                lifecycle.end(PublicationEvent::Ended);
            }
            Some(SlotHandle::Subscription(lifecycle)) => {
                if let Some(error) = error {
                    lifecycle.emit(SubscriptionEvent::Error(error.clone()));
                }
                lifecycle.end(SubscriptionEvent::Ended);
            }
            None => {}
        }
    }
}

enum Internal {
    LogoutAck,
    PublishAck {
        stream: LocalStream,
        options: PublishOptions,
        done: Completion<Publication>,
        result: Result<Value>,
    },
    SubscribeAck {
        stream: RemoteStream,
        options: SubscribeOptions,
        done: Completion<Subscription>,
        result: Result<Value>,
    },
    StopAck {
        id: String,
        done: Completion<()>,
    },
    SubscriptionMuteAck {
        id: String,
        kind: TrackKind,
        mute: bool,
        done: Completion<()>,
        result: Result<Value>,
    },
    NegotiationTimeout(SessionTag, u64),
}

fn wrong_state() -> Error {
    Error::invalid_state("wrong room status")
}

/// Waits for the acknowledgement on another task and hands the result to `map`.
fn on_ack(map: impl FnOnce(Result<Value>) + Send + 'static) -> Ack {
    let (tx, rx) = oneshot::channel();
    spawn(async move {
        map(match rx.await {
            Ok(args) => parse_ack(args),
            Err(_) => Err(Error::transport("signaling channel closed")),
        });
    });
    tx
}

fn complete_on_ack(done: Completion<()>) -> Ack {
    on_ack(move |result| complete(done, result.map(|_| ())))
}

pub(crate) struct ConferenceOrchestrator {
    config: ClientConfiguration,
    transport_factory: TransportFactory,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedSender<ConferenceEvent>,
    state_tx: watch::Sender<ConnectionState>,
    info_tx: watch::Sender<Option<ConferenceInfo>>,
    state: ConnectionState,
    info: Option<ConferenceInfo>,
    channel: Option<ChannelHandle>,
    channel_tx: mpsc::UnboundedSender<(u64, ChannelEvent)>,
    channel_rx: mpsc::UnboundedReceiver<(u64, ChannelEvent)>,
    next_channel_generation: u64,
    join_done: Option<Completion<ConferenceInfo>>,
    leave_done: Vec<Completion<()>>,
    registry: SessionRegistry<ConferenceSlot>,
    engine_rx: mpsc::UnboundedReceiver<TaggedEngineEvent>,
    /// Remote streams with a subscribe request in flight.
    subscribing: HashSet<String>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl ConferenceOrchestrator {
    pub fn new(
        config: ClientConfiguration,
        transport_factory: TransportFactory,
        engine: Arc<dyn PeerConnectionFactory>,
        commands: mpsc::WeakUnboundedSender<Command>,
        events: mpsc::UnboundedSender<ConferenceEvent>,
        state_tx: watch::Sender<ConnectionState>,
        info_tx: watch::Sender<Option<ConferenceInfo>>,
    ) -> Self {
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(engine, engine_tx, config.codec_preference());
        Self {
            config,
            transport_factory,
            commands,
            events,
            state_tx,
            info_tx,
            state: ConnectionState::Disconnected,
            info: None,
            channel: None,
            channel_tx,
            channel_rx,
            next_channel_generation: 0,
            join_done: None,
            leave_done: vec![],
            registry,
            engine_rx,
            subscribing: HashSet::new(),
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
                Some((generation, event)) = self.channel_rx.recv() => {
                    self.on_channel_event(generation, event).await;
                }
                Some((tag, event)) = self.engine_rx.recv() => self.on_engine_event(tag, event).await,
                Some(msg) = self.internal_rx.recv() => self.on_internal(msg).await,
            }
        }
        debug!("conference client dropped");
        self.registry.dispose_all(None).await;
        if let Some(channel) = self.channel.take() {
            channel.disconnect();
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("connection state: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn publish_info(&self) {
        self.info_tx.send_replace(self.info.clone());
    }

    fn emit(&self, event: ConferenceEvent) {
        let _ = self.events.send(event);
    }

    /// Returns false if there is no channel; the ack, if any, is dropped then.
    fn send(&self, event: &str, payload: Value, ack: Option<Ack>) -> bool {
        match &self.channel {
            Some(channel) => channel.send(event, Some(payload), ack),
            None => false,
        }
    }

    fn forward_ack(&self, map: impl FnOnce(Result<Value>) -> Internal + Send + 'static) -> Ack {
        let internal_tx = self.internal_tx.clone();
        on_ack(move |result| {
            let _ = internal_tx.send(map(result));
        })
    }

    fn send_soac(&self, id: &str, signaling: Value) {
        self.send("soac", json!({ "id": id, "signaling": signaling }), None);
    }

    fn send_candidate(&self, id: &str, candidate: &IceCandidate) {
        let sdp = if candidate.candidate.starts_with("a=") {
            candidate.candidate.clone()
        } else {
            format!("a={}", candidate.candidate)
        };
        self.send_soac(
            id,
            json!({
                "type": "candidate",
                "candidate": {
                    "sdpMLineIndex": candidate.sdp_mline_index,
                    "sdpMid": candidate.sdp_mid,
                    "candidate": sdp,
                },
            }),
        );
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Join { token, done } => self.join(token, done),
            Command::Leave { done } => self.leave(done),
            Command::Publish {
                stream,
                options,
                done,
            } => self.publish(stream, options, done),
            Command::Subscribe {
                stream,
                options,
                done,
            } => self.subscribe(stream, options, done),
            Command::Send { to, message, done } => {
                if self.state != ConnectionState::Connected {
                    complete(done, Err(wrong_state()));
                    return;
                }
                let to = to.unwrap_or_else(|| "all".to_owned());
                let ack = complete_on_ack(done);
                self.send("text", json!({ "to": to, "message": message }), Some(ack));
            }
            Command::Stop { id, done } => self.stop(id, done),
            Command::Mute {
                id,
                kind,
                mute,
                done,
            } => self.mute(id, kind, mute, done),
            Command::ApplyOptions { id, options, done } => {
                if let Err(err) = self.check_session(&id, Some(SessionRole::Subscription)) {
                    complete(done, Err(err));
                    return;
                }
                let msg = json!({
                    "id": id,
                    "operation": "update",
                    "data": { "video": { "parameters": options.parameters() } },
                });
                self.send("subscription-control", msg, Some(complete_on_ack(done)));
            }
            Command::GetStats { id, done } => {
                let result = match self.registry.get(&id) {
                    Some(session) => session.get_stats().await,
                    None => Err(Error::invalid_state("no such session")),
                };
                complete(done, result);
            }
        }
    }

    /// Acknowledgements may arrive after the room is gone.
    fn check_room(&self) -> Result<()> {
        if self.state != ConnectionState::Connected || self.channel.is_none() {
            return Err(wrong_state());
        }
        Ok(())
    }

    /// Fails unless connected and `id` names a live session of the given role.
    fn check_session(&self, id: &str, role: Option<SessionRole>) -> Result<SessionRole> {
        if self.state != ConnectionState::Connected {
            return Err(wrong_state());
        }
        let session = self
            .registry
            .get(id)
            .filter(|session| !session.is_ended())
            .ok_or_else(|| Error::invalid_state("no such session"))?;
        let actual = session.mode.role;
        if role.is_some_and(|role| role != actual) {
            return Err(Error::invalid_state("operation does not apply to this session"));
        }
        Ok(actual)
    }

    fn join(&mut self, token: String, done: Completion<ConferenceInfo>) {
        if self.state != ConnectionState::Disconnected {
            complete(done, Err(wrong_state()));
            return;
        }
        self.next_channel_generation += 1;
        let transport = (self.transport_factory)();
        let channel = match SignalingChannel::spawn(
            self.next_channel_generation,
            transport,
            &token,
            self.config.clone(),
            self.channel_tx.clone(),
        ) {
            Ok(channel) => channel,
            Err(err) => {
                complete(done, Err(err));
                return;
            }
        };
        info!("joining conference");
        self.channel = Some(channel);
        self.join_done = Some(done);
        self.set_state(ConnectionState::Connecting);
    }

    fn leave(&mut self, done: Completion<()>) {
        if self.state == ConnectionState::Disconnected {
            complete(done, Err(wrong_state()));
            return;
        }
        self.leave_done.push(done);
        if self.state == ConnectionState::Connecting {
            if let Some(channel) = &self.channel {
                channel.disconnect();
            }
            return;
        }
        let ack = self.forward_ack(|_| Internal::LogoutAck);
        self.send("logout", Value::Null, Some(ack));
    }

    fn publish(&mut self, stream: LocalStream, options: PublishOptions, done: Completion<Publication>) {
        if self.state != ConnectionState::Connected {
            complete(done, Err(wrong_state()));
            return;
        }
        if stream.tracks.is_empty() {
            complete(done, Err(Error::IllegalArgument("stream has no tracks".to_owned())));
            return;
        }
        let msg = publish_message(&stream);
        let ack = self.forward_ack(move |result| Internal::PublishAck {
            stream,
            options,
            done,
            result,
        });
        self.send("publish", msg, Some(ack));
    }

    fn is_subscribed(&self, stream_id: &str) -> bool {
        self.subscribing.contains(stream_id)
            || self.registry.values().any(|session| {
                session.mode.role == SessionRole::Subscription
                    && session.mode.stream_id == stream_id
            })
    }

    fn subscribe(
        &mut self,
        stream: RemoteStream,
        options: SubscribeOptions,
        done: Completion<Subscription>,
    ) {
        if self.state != ConnectionState::Connected {
            complete(done, Err(wrong_state()));
            return;
        }
        if !options.audio && options.video.is_none() {
            complete(
                done,
                Err(Error::IllegalArgument("nothing to subscribe".to_owned())),
            );
            return;
        }
        if self.is_subscribed(stream.id()) {
            complete(done, Err(Error::invalid_state("already subscribed")));
            return;
        }
        self.subscribing.insert(stream.id().to_owned());
        let msg = subscribe_message(stream.id(), &options);
        let ack = self.forward_ack(move |result| Internal::SubscribeAck {
            stream,
            options,
            done,
            result,
        });
        self.send("subscribe", msg, Some(ack));
    }

    fn stop(&mut self, id: String, done: Completion<()>) {
        let role = match self.check_session(&id, None) {
            Ok(role) => role,
            Err(err) => {
                complete(done, Err(err));
                return;
            }
        };
        let event = match role {
            SessionRole::Publication => "unpublish",
            SessionRole::Subscription => "unsubscribe",
        };
        let msg = json!({ "id": id });
        let ack = self.forward_ack(move |result| {
            if let Err(err) = result {
                debug!("{} {} not acknowledged: {}", event, id, err);
            }
            Internal::StopAck { id, done }
        });
        self.send(event, msg, Some(ack));
    }

    fn mute(&mut self, id: String, kind: TrackKind, mute: bool, done: Completion<()>) {
        let role = match self.check_session(&id, None) {
            Ok(role) => role,
            Err(err) => {
                complete(done, Err(err));
                return;
            }
        };
        let msg = control_message(&id, kind, mute);
        match role {
            SessionRole::Publication => {
                self.send("stream-control", msg, Some(complete_on_ack(done)));
            }
            SessionRole::Subscription => {
                let ack = self.forward_ack(move |result| Internal::SubscriptionMuteAck {
                    id,
                    kind,
                    mute,
                    done,
                    result,
                });
                self.send("subscription-control", msg, Some(ack));
            }
        }
    }

    async fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::LogoutAck => {
                if let Some(channel) = &self.channel {
                    channel.disconnect();
                }
            }
            Internal::PublishAck {
                stream,
                options,
                done,
                result,
            } => self.on_publish_ack(stream, options, done, result).await,
            Internal::SubscribeAck {
                stream,
                options,
                done,
                result,
            } => self.on_subscribe_ack(stream, options, done, result).await,
            Internal::StopAck { id, done } => {
                self.registry.dispose(&id, None).await;
                complete(done, Ok(()));
            }
            Internal::SubscriptionMuteAck {
                id,
                kind,
                mute,
                done,
                result,
            } => {
                if result.is_ok() {
                    if let Some(session) = self.registry.get(&id) {
                        session.mode.emit_status(kind, !mute);
                    }
                } else {
                    debug!("subscription-control {} {} failed", control_operation(mute), id);
                }
                complete(done, result.map(|_| ()));
            }
            Internal::NegotiationTimeout(tag, round) => {
                let expired = self.registry.get_tagged_mut(&tag).is_some_and(|session| {
                    session.is_negotiating() && session.negotiation_round() == round
                });
                if expired {
                    warn!("{}: negotiation timed out", tag.id);
                    self.fail_session(&tag.id, Error::negotiation("negotiation timed out"))
                        .await;
                }
            }
        }
    }

    fn session_id_of(result: Value) -> Result<String> {
        result
            .get("id")
            .and_then(|x| x.as_str())
            .map(|x| x.to_owned())
            .ok_or_else(|| Error::Protocol("acknowledgement without session id".to_owned()))
    }

    async fn on_publish_ack(
        &mut self,
        stream: LocalStream,
        options: PublishOptions,
        done: Completion<Publication>,
        result: Result<Value>,
    ) {
        if let Err(err) = self.check_room() {
            complete(done, Err(err));
            return;
        }
        let id = match result.and_then(Self::session_id_of) {
            Ok(id) => id,
            Err(err) => {
                complete(done, Err(err));
                return;
            }
        };
        debug!("publishing {} as {}", stream.id, id);
        let slot = ConferenceSlot::new(SessionRole::Publication, stream.id.clone());
        let video_kbps = options
            .max_video_bitrate_kbps
            .or(self.config.max_video_bitrate_kbps);
        let audio_kbps = options
            .max_audio_bitrate_kbps
            .or(self.config.max_audio_bitrate_kbps);
        self.start_session(
            &id,
            slot,
            PendingReady::Publish(done),
            OfferConstraints::default(),
            Some((&stream, video_kbps, audio_kbps)),
        )
        .await;
    }

    async fn on_subscribe_ack(
        &mut self,
        stream: RemoteStream,
        options: SubscribeOptions,
        done: Completion<Subscription>,
        result: Result<Value>,
    ) {
        self.subscribing.remove(stream.id());
        if let Err(err) = self.check_room() {
            complete(done, Err(err));
            return;
        }
        let id = match result.and_then(Self::session_id_of) {
            Ok(id) => id,
            Err(err) => {
                complete(done, Err(err));
                return;
            }
        };
        debug!("subscribing {} as {}", stream.id(), id);
        let slot = ConferenceSlot::new(SessionRole::Subscription, stream.id().to_owned());
        let constraints = OfferConstraints {
            receive_audio: options.audio,
            receive_video: options.video.is_some(),
        };
        self.start_session(&id, slot, PendingReady::Subscribe(done), constraints, None)
            .await;
    }

    /// Creates the session for a freshly acknowledged publish or subscribe and sends the offer.
    async fn start_session(
        &mut self,
        id: &str,
        slot: ConferenceSlot,
        pending: PendingReady,
        constraints: OfferConstraints,
        stream: Option<(&LocalStream, Option<u32>, Option<u32>)>,
    ) {
        if self.registry.contains(id) {
            warn!("{}: session already exists", id);
            pending.fail(Error::invalid_state("session already exists"));
            return;
        }
        let rtc = self
            .config
            .rtc_configuration(self.config.continual_ice_gathering);
        let session = match self.registry.get_or_create(id, &rtc, move || slot).await {
            Ok(session) => session,
            Err(err) => {
                pending.fail(Error::negotiation(err));
                return;
            }
        };
        session.mode.pending = Some(pending);
        session.set_constraints(constraints);
        if let Some((stream, video_kbps, audio_kbps)) = stream {
            if let Err(err) = session.add_stream(stream, video_kbps, audio_kbps).await {
                self.fail_session(id, Error::negotiation(err)).await;
                return;
            }
        }
        self.negotiate(id).await;
    }

    async fn negotiate(&mut self, id: &str) {
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        match session.request_negotiation().await {
            Ok(Some(offer)) => {
                let tag = session.tag().clone();
                let round = session.negotiation_round();
                self.send_soac(id, json!({ "type": "offer", "sdp": offer.sdp }));
                arm_negotiation_timeout(
                    self.config.negotiation_timeout(),
                    &self.internal_tx,
                    tag,
                    round,
                    Internal::NegotiationTimeout,
                );
            }
            Ok(None) => {}
            Err(err) => self.fail_session(id, Error::negotiation(err)).await,
        }
    }

    async fn fail_session(&mut self, id: &str, error: Error) {
        warn!("{}: {}", id, error);
        self.registry.dispose(id, Some(&error)).await;
    }

    async fn on_channel_event(&mut self, generation: u64, event: ChannelEvent) {
        if self.channel.as_ref().map(|x| x.generation()) != Some(generation) {
            trace!("event of stale channel {}: {:?}", generation, event);
            return;
        }
        match event {
            ChannelEvent::Connected(info) => match ConferenceInfo::parse(info) {
                Ok(info) => {
                    info!("joined conference {}", info.id());
                    self.info = Some(info.clone());
                    self.publish_info();
                    self.set_state(ConnectionState::Connected);
                    if let Some(done) = self.join_done.take() {
                        complete(done, Ok(info));
                    }
                }
                Err(err) => {
                    warn!("invalid conference info: {}", err);
                    if let Some(done) = self.join_done.take() {
                        complete(done, Err(err));
                    }
                    if let Some(channel) = &self.channel {
                        channel.disconnect();
                    }
                }
            },
            ChannelEvent::ConnectFailed(err) => {
                warn!("joining conference failed: {}", err);
                self.channel = None;
                self.set_state(ConnectionState::Disconnected);
                if let Some(done) = self.join_done.take() {
                    complete(done, Err(err));
                }
                for done in take(&mut self.leave_done) {
                    complete(done, Ok(()));
                }
            }
            ChannelEvent::Reconnecting => self.emit(ConferenceEvent::Reconnecting),
            ChannelEvent::Disconnected => self.on_disconnected().await,
            ChannelEvent::Message { event, payload } => self.on_message(&event, payload).await,
        }
    }

    async fn on_disconnected(&mut self) {
        info!("disconnected from conference");
        let was_connected = self.state == ConnectionState::Connected;
        self.channel = None;
        self.set_state(ConnectionState::Disconnected);
        if let Some(done) = self.join_done.take() {
            complete(done, Err(Error::transport("disconnected before joining")));
        }
        self.subscribing.clear();
        self.registry.dispose_all(None).await;
        self.info = None;
        self.publish_info();
        for done in take(&mut self.leave_done) {
            complete(done, Ok(()));
        }
        if was_connected {
            self.emit(ConferenceEvent::ServerDisconnected);
        }
    }

    async fn on_message(&mut self, event: &str, payload: Value) {
        match event {
            "progress" => self.on_progress(payload).await,
            "stream" => self.on_stream(payload),
            "participant" => self.on_participant(payload),
            "text" => {
                let field = |name: &str| {
                    payload
                        .get(name)
                        .and_then(|x| x.as_str())
                        .unwrap_or_default()
                        .to_owned()
                };
                self.emit(ConferenceEvent::MessageReceived {
                    from: field("from"),
                    to: field("to"),
                    message: field("message"),
                });
            }
            _ => warn!("unexpected message: {}", event),
        }
    }

    async fn on_progress(&mut self, payload: Value) {
        let Some(id) = payload.get("id").and_then(|x| x.as_str()).map(|x| x.to_owned()) else {
            warn!("progress without id");
            return;
        };
        if !self.registry.contains(&id) {
            warn!("progress for unknown session {}", id);
            return;
        }
        let status = payload.get("status").and_then(|x| x.as_str()).unwrap_or_default();
        match status {
            "soac" => self.on_soac(&id, payload.get("data").cloned().unwrap_or_default()).await,
            "ready" => self.on_ready(&id),
            "error" => {
                let message = match payload.get("data") {
                    Some(Value::String(message)) => message.clone(),
                    Some(other) => other.to_string(),
                    None => "unknown error".to_owned(),
                };
                self.fail_session(&id, Error::Remote { code: 0, message })
                    .await;
            }
            other => warn!("{}: unexpected progress status {}", id, other),
        }
    }

    async fn on_soac(&mut self, id: &str, data: Value) {
        match data.get("type").and_then(|x| x.as_str()) {
            Some("offer") | Some("answer") => {
                let desc: SessionDescription = match serde_json::from_value(data) {
                    Ok(desc) => desc,
                    Err(err) => {
                        warn!("{}: malformed description: {}", id, err);
                        return;
                    }
                };
                self.apply_remote_description(id, desc).await;
            }
            Some("candidate") => {
                let candidate = &data["candidate"];
                let Some(sdp) = candidate["candidate"].as_str() else {
                    warn!("{}: malformed candidate", id);
                    return;
                };
                let candidate = IceCandidate::new(
                    candidate["sdpMid"].as_str().unwrap_or_default().to_owned(),
                    candidate["sdpMLineIndex"].as_u64().unwrap_or_default() as u32,
                    sdp.strip_prefix("a=").unwrap_or(sdp).to_owned(),
                );
                let Some(session) = self.registry.get_mut(id) else {
                    return;
                };
                if let Err(err) = session.add_remote_candidate(candidate).await {
                    warn!("{}: adding candidate failed: {}", id, err);
                }
            }
            other => warn!("{}: unexpected signaling {:?}", id, other),
        }
    }

    async fn apply_remote_description(&mut self, id: &str, desc: SessionDescription) {
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        let answer = match session.apply_remote_description(&desc).await {
            Ok(answer) => answer,
            Err(err) => {
                self.fail_session(id, Error::negotiation(err)).await;
                return;
            }
        };
        let candidates = session.take_forwardable_candidates();
        let renegotiate = session.take_deferred_renegotiation();
        if let Some(answer) = answer {
            debug_assert_eq!(answer.sdp_type, SdpType::Answer);
            self.send_soac(id, json!({ "type": "answer", "sdp": answer.sdp }));
        }
        for candidate in &candidates {
            self.send_candidate(id, candidate);
        }
        if renegotiate {
            self.negotiate(id).await;
        }
    }

    fn on_ready(&mut self, id: &str) {
        let commands = self.commands.clone();
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        let slot = &mut session.mode;
        match slot.pending.take() {
            Some(PendingReady::Publish(done)) => {
                let lifecycle = Lifecycle::new();
                slot.handle = Some(SlotHandle::Publication(lifecycle.clone()));
                info!("{}: publication ready", id);
                complete(
                    done,
                    Ok(Publication::new(
                        id.to_owned(),
                        slot.stream_id.clone(),
                        commands,
                        lifecycle,
                    )),
                );
            }
            Some(PendingReady::Subscribe(done)) => {
                let lifecycle = Lifecycle::new();
                slot.handle = Some(SlotHandle::Subscription(lifecycle.clone()));
                info!("{}: subscription ready", id);
                complete(
                    done,
                    Ok(Subscription::new(
                        id.to_owned(),
                        slot.stream_id.clone(),
                        slot.media.clone(),
                        commands,
                        lifecycle,
                    )),
                );
            }
            None => debug!("{}: ready again", id),
        }
    }

    fn on_stream(&mut self, payload: Value) {
        let id = payload
            .get("id")
            .and_then(|x| x.as_str())
            .unwrap_or_default()
            .to_owned();
        let data = payload.get("data").cloned().unwrap_or_default();
        let Some(info) = self.info.as_mut() else {
            return;
        };
        match payload.get("status").and_then(|x| x.as_str()) {
            Some("add") => match parse_stream(data) {
                Ok(stream_info) => {
                    let stream = RemoteStream::new(stream_info);
                    info.add_remote_stream(stream.clone());
                    self.publish_info();
                    self.emit(ConferenceEvent::StreamAdded(stream));
                }
                Err(err) => warn!("invalid stream: {}", err),
            },
            Some("remove") => {
                if let Some(stream) = info.remove_remote_stream(&id) {
                    self.publish_info();
                    stream.end();
                }
            }
            Some("update") => self.on_stream_update(&id, data),
            other => warn!("unexpected stream status {:?}", other),
        }
    }

    fn on_stream_update(&mut self, id: &str, data: Value) {
        let field = data.get("field").and_then(|x| x.as_str()).unwrap_or_default();
        let stream = self
            .info
            .as_ref()
            .and_then(|info| info.remote_stream(id))
            .cloned();
        match field {
            "audio.status" | "video.status" => {
                let kind = if field == "audio.status" {
                    TrackKind::Audio
                } else {
                    TrackKind::Video
                };
                let active = data.get("value").and_then(|x| x.as_str()) == Some("active");
                // A subscription follows its remote stream id, a publication its own session id.
                for session in self.registry.values() {
                    if session.mode.stream_id == id || session.id() == id {
                        session.mode.emit_status(kind, active);
                    }
                }
            }
            "." => {
                let Some(stream) = stream else {
                    return;
                };
                match parse_stream(data.get("value").cloned().unwrap_or_default()) {
                    Ok(new_info) => stream.update(|info| *info = new_info),
                    Err(err) => warn!("{}: invalid stream update: {}", id, err),
                }
            }
            "video.layout" | "activeInput" => {
                if let Some(stream) = stream {
                    let value = data.get("value").cloned().unwrap_or_default();
                    let key = field.to_owned();
                    stream.update(|info| {
                        if let Value::Object(media) = &mut info.media {
                            media.insert(key, value);
                        }
                    });
                }
            }
            other => trace!("{}: ignoring update of {}", id, other),
        }
    }

    fn on_participant(&mut self, payload: Value) {
        let data = payload.get("data").cloned().unwrap_or_default();
        let Some(info) = self.info.as_mut() else {
            return;
        };
        match payload.get("action").and_then(|x| x.as_str()) {
            Some("join") => match Participant::from_value(data) {
                Ok(participant) => {
                    info.add_participant(participant.clone());
                    self.publish_info();
                    self.emit(ConferenceEvent::ParticipantJoined(participant));
                }
                Err(err) => warn!("invalid participant: {}", err),
            },
            Some("leave") => {
                let Some(id) = data.as_str() else {
                    warn!("participant leave without id");
                    return;
                };
                if let Some(participant) = info.remove_participant(id) {
                    self.publish_info();
                    participant.leave();
                }
            }
            other => warn!("unexpected participant action {:?}", other),
        }
    }

    async fn on_engine_event(&mut self, tag: SessionTag, event: EngineEvent) {
        let Some(session) = self.registry.get_tagged_mut(&tag) else {
            trace!("event of stale session {}: {:?}", tag.id, event);
            return;
        };
        let id = tag.id.as_str();
        match event {
            EngineEvent::IceCandidate(candidate) => {
                if let Some(candidate) = session.on_local_candidate(candidate) {
                    self.send_candidate(id, &candidate);
                }
            }
            EngineEvent::SignalingStateChanged(state) => trace!("{}: signaling {:?}", id, state),
            EngineEvent::IceConnectionStateChanged(state) => {
                debug!("{}: ice {:?}", id, state);
                session.set_ice_state(state);
                match state {
                    IceConnectionState::Failed => {
                        self.fail_session(id, Error::negotiation("ice connection failed"))
                            .await;
                    }
                    IceConnectionState::Closed => {
                        self.registry.dispose(id, None).await;
                    }
                    _ => {}
                }
            }
            EngineEvent::AddStream(media) => {
                if let Some(SlotHandle::Subscription(lifecycle)) = &session.mode.handle {
                    lifecycle.emit(SubscriptionEvent::MediaAdded(media.clone()));
                }
                session.mode.media = Some(media);
            }
            EngineEvent::RemoveStream(stream_id) => trace!("{}: stream {} removed", id, stream_id),
            EngineEvent::RenegotiationNeeded => self.negotiate(id).await,
            EngineEvent::DataChannelOpen | EngineEvent::DataChannelMessage(_) => {
                trace!("{}: ignoring data channel event", id);
            }
        }
    }
}
