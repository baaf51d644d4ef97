mod actor;
mod capability;
mod data;
mod glare;
mod handshake;
mod message;
mod publication;
mod slot;
mod writer;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    spawn,
    sync::{mpsc, watch},
};

use crate::{
    client::{request, Completion, ConnectionState},
    config::ClientConfiguration,
    engine::PeerConnectionFactory,
    error::Result,
    media::{LocalStream, RemoteStream, StatsReport},
};

use self::actor::P2POrchestrator;

pub use self::publication::{P2PPublication, P2PPublicationEvent};

/// A signaling server relaying opaque messages between clients by id.
#[async_trait]
pub trait P2PSignalingChannel: Send + Sync + 'static {
    /// Returns the server's login result, a JSON object carrying this client's `uid`.
    async fn connect(
        &self,
        token: &str,
        events: mpsc::UnboundedSender<P2PSignalingEvent>,
    ) -> anyhow::Result<String>;
    async fn send_message(&self, peer: &str, message: &str) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum P2PSignalingEvent {
    Message { from: String, message: String },
    ServerDisconnected,
}

#[derive(Clone, Debug)]
pub enum P2PEvent {
    StreamAdded(RemoteStream),
    DataReceived { from: String, message: String },
    ServerDisconnected,
}

pub(crate) enum Command {
    Connect {
        token: String,
        done: Completion<String>,
    },
    Disconnect {
        done: Completion<()>,
    },
    Publish {
        peer: String,
        stream: LocalStream,
        done: Completion<P2PPublication>,
    },
    Unpublish {
        peer: String,
        stream_id: String,
        done: Completion<()>,
    },
    Stop {
        peer: String,
        done: Completion<()>,
    },
    Send {
        peer: String,
        message: String,
        done: Completion<()>,
    },
    GetStats {
        peer: String,
        done: Completion<StatsReport>,
    },
    Allow {
        peer: String,
        allowed: bool,
    },
}

/// Client talking directly to other clients, with a signaling server only relaying the setup.
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct P2PClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    id: watch::Receiver<Option<String>>,
}

impl P2PClient {
    pub fn new(
        config: ClientConfiguration,
        signaling: Arc<dyn P2PSignalingChannel>,
        engine: Arc<dyn PeerConnectionFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<P2PEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (id_tx, id) = watch::channel(None);
        let orchestrator = P2POrchestrator::new(
            config,
            signaling,
            engine,
            commands.downgrade(),
            events,
            state_tx,
            id_tx,
        );
        spawn(orchestrator.run(command_rx));
        (
            Self {
                commands,
                state,
                id,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// This client's id as assigned by the server, while connected.
    pub fn id(&self) -> Option<String> {
        self.id.borrow().clone()
    }

    /// Lets `peer` talk to this client. Messages of anyone else are answered with a denial.
    pub fn add_allowed_remote_peer(&self, peer: &str) {
        let _ = self.commands.send(Command::Allow {
            peer: peer.to_owned(),
            allowed: true,
        });
    }

    pub fn remove_allowed_remote_peer(&self, peer: &str) {
        let _ = self.commands.send(Command::Allow {
            peer: peer.to_owned(),
            allowed: false,
        });
    }

    /// Returns this client's id.
    pub async fn connect(&self, token: &str) -> Result<String> {
        let token = token.to_owned();
        request(&self.commands, |done| Command::Connect { token, done }).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        request(&self.commands, |done| Command::Disconnect { done }).await
    }

    pub async fn publish(&self, peer: &str, stream: LocalStream) -> Result<P2PPublication> {
        let peer = peer.to_owned();
        request(&self.commands, |done| Command::Publish { peer, stream, done }).await
    }

    /// Closes the connection with `peer`, ending everything sent and received over it.
    pub async fn stop(&self, peer: &str) -> Result<()> {
        let peer = peer.to_owned();
        request(&self.commands, |done| Command::Stop { peer, done }).await
    }

    /// Resolves once `peer` confirmed receiving the message.
    pub async fn send(&self, peer: &str, message: &str) -> Result<()> {
        let peer = peer.to_owned();
        let message = message.to_owned();
        request(&self.commands, |done| Command::Send {
            peer,
            message,
            done,
        })
        .await
    }

    pub async fn get_stats(&self, peer: &str) -> Result<StatsReport> {
        let peer = peer.to_owned();
        request(&self.commands, |done| Command::GetStats { peer, done }).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::{join, time::timeout};

    use crate::{
        error::Error,
        media::{RemoteStreamEvent, SourceKind, TrackInfo, TrackKind},
        testing::{eventually, init_tracing, FakeNetwork, RelayHub},
    };

    use super::*;

    type Events = mpsc::UnboundedReceiver<P2PEvent>;

    fn client(hub: &RelayHub, network: &FakeNetwork, id: &str) -> (P2PClient, Events) {
        P2PClient::new(
            ClientConfiguration::default(),
            hub.channel(id),
            network.engine(id),
        )
    }

    /// Alice and Bob, connected and allowing each other.
    async fn pair(hub: &RelayHub, network: &FakeNetwork) -> (P2PClient, Events, P2PClient, Events) {
        init_tracing();
        let (alice, alice_events) = client(hub, network, "alice");
        let (bob, bob_events) = client(hub, network, "bob");
        assert_eq!(alice.connect("alice-token").await.unwrap(), "alice");
        assert_eq!(bob.connect("bob-token").await.unwrap(), "bob");
        alice.add_allowed_remote_peer("bob");
        bob.add_allowed_remote_peer("alice");
        (alice, alice_events, bob, bob_events)
    }

    fn camera(owner: &str) -> LocalStream {
        LocalStream::new(
            format!("{}-cam", owner),
            vec![
                TrackInfo::new(format!("{}-a", owner), TrackKind::Audio, SourceKind::Mic),
                TrackInfo::new(format!("{}-v", owner), TrackKind::Video, SourceKind::Camera),
            ],
        )
    }

    async fn next_event(events: &mut Events) -> P2PEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event")
            .expect("client dropped")
    }

    async fn next_stream(events: &mut Events) -> RemoteStream {
        match next_event(events).await {
            P2PEvent::StreamAdded(stream) => stream,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn operations_need_a_connection() {
        init_tracing();
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _events) = client(&hub, &network, "alice");
        let wrong = Some(Error::invalid_state("wrong server connection status"));
        assert_eq!(alice.state(), ConnectionState::Disconnected);
        assert_eq!(alice.publish("bob", camera("alice")).await.err(), wrong);
        assert_eq!(alice.send("bob", "hi").await.err(), wrong);
        assert_eq!(alice.stop("bob").await.err(), wrong);
        let unpublished = request(&alice.commands, |done| Command::Unpublish {
            peer: "bob".to_owned(),
            stream_id: "alice-cam".to_owned(),
            done,
        })
        .await;
        assert_eq!(unpublished.err(), wrong);
        assert_eq!(alice.disconnect().await, Ok(()));

        alice.connect("token").await.unwrap();
        assert_eq!(alice.state(), ConnectionState::Connected);
        assert_eq!(alice.connect("token").await.err(), wrong);
    }

    #[tokio::test]
    async fn published_stream_reaches_the_peer() {
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _alice_events, _bob, mut bob_events) = pair(&hub, &network).await;
        assert_eq!(alice.id(), Some("alice".to_owned()));

        let mut stream = camera("alice");
        stream
            .attributes
            .insert("label".to_owned(), "desk".to_owned());
        let publication = alice.publish("bob", stream).await.unwrap();
        assert_eq!(publication.peer(), "bob");
        assert_eq!(publication.stream_id(), "alice-cam");
        assert!(!publication.is_ended());

        let remote = next_stream(&mut bob_events).await;
        let info = remote.info();
        assert_eq!(info.id, "alice-cam");
        assert_eq!(info.origin, "alice");
        assert_eq!(info.source.audio, Some(SourceKind::Mic));
        assert_eq!(info.source.video, Some(SourceKind::Camera));
        assert_eq!(info.attributes.get("label").map(|x| x.as_str()), Some("desk"));

        let kinds: Vec<String> = hub
            .messages_of("alice", "chat-closed")
            .into_iter()
            .chain(hub.messages_of("alice", "chat-ua"))
            .map(|x| x.kind())
            .collect();
        assert_eq!(kinds, vec!["chat-closed", "chat-ua"]);
        assert_eq!(hub.messages_of("bob", "chat-tracks-added")[0].data(), json!(["alice-a", "alice-v"]));
        assert!(alice.get_stats("bob").await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_publish_joins_the_one_in_flight() {
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _alice_events, _bob, _bob_events) = pair(&hub, &network).await;

        let stream = camera("alice");
        let (first, second) = join!(
            alice.publish("bob", stream.clone()),
            alice.publish("bob", stream.clone())
        );
        assert_eq!(first.unwrap().id(), second.unwrap().id());
        assert_eq!(network.calls_of("alice", "create").len(), 1);
        assert_eq!(network.calls_of("alice", "add_stream").len(), 1);

        assert_eq!(
            alice.publish("bob", stream).await.err(),
            Some(Error::invalid_state("Duplicated stream."))
        );
        let empty = LocalStream::new("empty".to_owned(), vec![]);
        assert!(matches!(
            alice.publish("bob", empty).await,
            Err(Error::IllegalArgument(_))
        ));
    }

    #[tokio::test]
    async fn colliding_offers_are_settled_by_client_id() {
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _alice_events, bob, _bob_events) = pair(&hub, &network).await;

        hub.hold();
        let release = async {
            eventually("both offers", || {
                !hub.messages_of("alice", "chat-signal").is_empty()
                    && !hub.messages_of("bob", "chat-signal").is_empty()
            })
            .await;
            hub.release();
        };
        let (from_alice, from_bob, ()) = join!(
            alice.publish("bob", camera("alice")),
            bob.publish("alice", camera("bob")),
            release
        );
        from_alice.unwrap();
        from_bob.unwrap();

        // The greater id gives up its connection and answers.
        assert_eq!(network.calls_of("alice", "create").len(), 1);
        assert!(network.calls_of("alice", "close").is_empty());
        assert_eq!(network.calls_of("bob", "create").len(), 2);
        assert_eq!(network.calls_of("bob", "close").len(), 1);
    }

    #[tokio::test]
    async fn peers_outside_the_allow_list_are_refused() {
        init_tracing();
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _alice_events) = client(&hub, &network, "alice");
        let (bob, _bob_events) = client(&hub, &network, "bob");
        alice.connect("token").await.unwrap();
        bob.connect("token").await.unwrap();
        alice.add_allowed_remote_peer("bob");

        assert_eq!(
            alice.publish("bob", camera("alice")).await.err(),
            Some(Error::Remote {
                code: 2202,
                message: "Denied".to_owned()
            })
        );
        assert!(matches!(
            alice.publish("carol", camera("alice")).await,
            Err(Error::NotAllowed(_))
        ));
        alice.add_allowed_remote_peer("alice");
        assert!(matches!(
            alice.send("alice", "hi").await,
            Err(Error::NotAllowed(_))
        ));
        alice.remove_allowed_remote_peer("bob");
        assert!(matches!(
            alice.send("bob", "hi").await,
            Err(Error::NotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn sent_data_is_acknowledged() {
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _alice_events, _bob, mut bob_events) = pair(&hub, &network).await;

        alice.send("bob", "hello").await.unwrap();
        match next_event(&mut bob_events).await {
            P2PEvent::DataReceived { from, message } => {
                assert_eq!(from, "alice");
                assert_eq!(message, "hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
        alice.send("bob", "again").await.unwrap();
        assert_eq!(network.calls_of("alice", "create_data_channel").len(), 1);
        assert_eq!(network.calls_of("alice", "send_data").len(), 2);

        assert_eq!(
            alice.send("bob", &"x".repeat(0x10000)).await.err(),
            Some(Error::IllegalArgument("message too long".to_owned()))
        );
    }

    #[tokio::test]
    async fn failed_offer_closes_the_session() {
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _alice_events, _bob, _bob_events) = pair(&hub, &network).await;

        network.fail_next("create_offer");
        assert!(matches!(
            alice.publish("bob", camera("alice")).await,
            Err(Error::Negotiation(_))
        ));
        eventually("close with reason", || {
            hub.messages_of("alice", "chat-closed")
                .iter()
                .any(|x| x.data()["code"] == 2502)
        })
        .await;
        assert_eq!(network.calls_of("alice", "close").len(), 1);
        assert_eq!(
            alice.get_stats("bob").await.err(),
            Some(Error::invalid_state("no peer connection established"))
        );
    }

    #[tokio::test]
    async fn unsupported_gathering_policy_rebuilds_the_connection() {
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _alice_events, _bob, _bob_events) = pair(&hub, &network).await;

        hub.hold();
        let offers = || {
            hub.messages_of("alice", "chat-signal")
                .into_iter()
                .filter(|x| x.data()["type"] == "offer")
                .count()
        };
        let driver = async {
            eventually("first offer", || offers() == 1).await;
            hub.inject(
                "bob",
                "alice",
                json!({ "type": "chat-closed", "data": { "code": 2503, "message": "unsupported" } }),
            );
            eventually("second offer", || offers() == 2).await;
            hub.release();
        };
        let (publication, ()) = join!(alice.publish("bob", camera("alice")), driver);
        publication.unwrap();

        let policies: Vec<String> = network
            .calls_of("alice", "create")
            .into_iter()
            .map(|x| x.detail)
            .collect();
        assert_eq!(policies, vec!["Continually", "Once"]);
    }

    #[tokio::test]
    async fn stop_ends_both_sides() {
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _alice_events, _bob, mut bob_events) = pair(&hub, &network).await;

        let publication = alice.publish("bob", camera("alice")).await.unwrap();
        let remote = next_stream(&mut bob_events).await;
        let mut remote_events = remote.subscribe_events();
        let mut publication_events = publication.subscribe_events();

        alice.stop("bob").await.unwrap();
        assert!(publication.is_ended());
        assert_eq!(
            publication_events.recv().await.unwrap(),
            P2PPublicationEvent::Ended
        );
        assert_eq!(
            timeout(Duration::from_secs(5), remote_events.recv())
                .await
                .unwrap()
                .unwrap(),
            RemoteStreamEvent::Ended
        );
        assert_eq!(
            publication.get_stats().await.err(),
            Some(Error::invalid_state("publication has ended"))
        );
        assert_eq!(
            alice.get_stats("bob").await.err(),
            Some(Error::invalid_state("no peer connection established"))
        );
        assert_eq!(publication.stop().await, Ok(()));
    }

    #[tokio::test]
    async fn stopped_publication_keeps_the_connection() {
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _alice_events, _bob, mut bob_events) = pair(&hub, &network).await;

        let publication = alice.publish("bob", camera("alice")).await.unwrap();
        let remote = next_stream(&mut bob_events).await;
        let mut remote_events = remote.subscribe_events();

        publication.stop().await.unwrap();
        assert!(publication.is_ended());
        assert_eq!(network.calls_of("alice", "remove_stream").len(), 1);
        assert_eq!(
            timeout(Duration::from_secs(5), remote_events.recv())
                .await
                .unwrap()
                .unwrap(),
            RemoteStreamEvent::Ended
        );
        assert!(alice.get_stats("bob").await.is_ok());
        assert!(network.calls_of("alice", "close").is_empty());

        // The same stream may go out again.
        alice.publish("bob", camera("alice")).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_client_closes_its_connections() {
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, _alice_events, _bob, _bob_events) = pair(&hub, &network).await;

        let publication = alice.publish("bob", camera("alice")).await.unwrap();
        drop(alice);
        eventually("publication ended", || publication.is_ended()).await;
        eventually("connection closed", || {
            network.calls_of("alice", "close").len() == 1
        })
        .await;
        assert_eq!(
            publication.get_stats().await.err(),
            Some(Error::invalid_state("publication has ended"))
        );
    }

    #[tokio::test]
    async fn disconnect_ends_everything() {
        let hub = RelayHub::new();
        let network = FakeNetwork::new();
        let (alice, mut alice_events, _bob, _bob_events) = pair(&hub, &network).await;

        let publication = alice.publish("bob", camera("alice")).await.unwrap();
        alice.disconnect().await.unwrap();
        assert_eq!(alice.state(), ConnectionState::Disconnected);
        assert_eq!(alice.id(), None);
        assert!(publication.is_ended());
        assert!(matches!(
            next_event(&mut alice_events).await,
            P2PEvent::ServerDisconnected
        ));
        assert_eq!(
            alice.publish("bob", camera("alice")).await.err(),
            Some(Error::invalid_state("wrong server connection status"))
        );
    }
}
