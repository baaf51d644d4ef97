mod actor;
mod info;
mod options;
mod publication;

use std::sync::Arc;

use tokio::{
    spawn,
    sync::{mpsc, watch},
};

use crate::{
    client::{request, Completion, ConnectionState},
    config::ClientConfiguration,
    engine::PeerConnectionFactory,
    error::Result,
    media::{LocalStream, RemoteStream, StatsReport, TrackKind},
    signaling::SignalingTransport,
};

use self::actor::ConferenceOrchestrator;

pub use self::{
    info::{ConferenceInfo, Participant, ParticipantEvent},
    options::{PublishOptions, SubscribeOptions, VideoUpdateOptions},
    publication::{Publication, PublicationEvent, Subscription, SubscriptionEvent},
};

/// Makes a fresh transport for every `join`.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn SignalingTransport> + Send + Sync>;

#[derive(Clone, Debug)]
pub enum ConferenceEvent {
    StreamAdded(RemoteStream),
    ParticipantJoined(Participant),
    MessageReceived {
        from: String,
        to: String,
        message: String,
    },
    /// The signaling connection dropped and is being re-established.
    Reconnecting,
    ServerDisconnected,
}

pub(crate) enum Command {
    Join {
        token: String,
        done: Completion<ConferenceInfo>,
    },
    Leave {
        done: Completion<()>,
    },
    Publish {
        stream: LocalStream,
        options: PublishOptions,
        done: Completion<Publication>,
    },
    Subscribe {
        stream: RemoteStream,
        options: SubscribeOptions,
        done: Completion<Subscription>,
    },
    Send {
        to: Option<String>,
        message: String,
        done: Completion<()>,
    },
    Stop {
        id: String,
        done: Completion<()>,
    },
    Mute {
        id: String,
        kind: TrackKind,
        mute: bool,
        done: Completion<()>,
    },
    ApplyOptions {
        id: String,
        options: VideoUpdateOptions,
        done: Completion<()>,
    },
    GetStats {
        id: String,
        done: Completion<StatsReport>,
    },
}

/// Client of a conference server. Must be created inside a tokio runtime.
pub struct ConferenceClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    info: watch::Receiver<Option<ConferenceInfo>>,
}

impl ConferenceClient {
    pub fn new(
        config: ClientConfiguration,
        transport_factory: TransportFactory,
        engine: Arc<dyn PeerConnectionFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<ConferenceEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (info_tx, info) = watch::channel(None);
        let orchestrator = ConferenceOrchestrator::new(
            config,
            transport_factory,
            engine,
            commands.downgrade(),
            events,
            state_tx,
            info_tx,
        );
        spawn(orchestrator.run(command_rx));
        (
            Self {
                commands,
                state,
                info,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// The conference as last known, while joined.
    pub fn info(&self) -> Option<ConferenceInfo> {
        self.info.borrow().clone()
    }

    pub async fn join(&self, token: &str) -> Result<ConferenceInfo> {
        let token = token.to_owned();
        request(&self.commands, |done| Command::Join { token, done }).await
    }

    pub async fn leave(&self) -> Result<()> {
        request(&self.commands, |done| Command::Leave { done }).await
    }

    pub async fn publish(&self, stream: LocalStream, options: PublishOptions) -> Result<Publication> {
        request(&self.commands, |done| Command::Publish {
            stream,
            options,
            done,
        })
        .await
    }

    pub async fn subscribe(
        &self,
        stream: RemoteStream,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        request(&self.commands, |done| Command::Subscribe {
            stream,
            options,
            done,
        })
        .await
    }

    /// Sends a text message to one participant, or to everyone when `to` is `None`.
    pub async fn send(&self, to: Option<&str>, message: &str) -> Result<()> {
        let to = to.map(|x| x.to_owned());
        let message = message.to_owned();
        request(&self.commands, |done| Command::Send { to, message, done }).await
    }

    pub async fn get_stats(&self, session_id: &str) -> Result<StatsReport> {
        let id = session_id.to_owned();
        request(&self.commands, |done| Command::GetStats { id, done }).await
    }
}
