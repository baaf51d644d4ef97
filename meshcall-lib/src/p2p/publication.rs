use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::{
    client::{request_weak, Lifecycle},
    error::{Error, Result},
    media::StatsReport,
};

use super::Command;

#[derive(Clone, Debug, PartialEq)]
pub enum P2PPublicationEvent {
    Ended,
    Error(Error),
}

/// A local stream being sent to one remote peer.
#[derive(Clone)]
pub struct P2PPublication {
    id: String,
    peer: String,
    stream_id: String,
    commands: mpsc::WeakUnboundedSender<Command>,
    lifecycle: Arc<Lifecycle<P2PPublicationEvent>>,
}

impl P2PPublication {
    pub(crate) fn new(
        peer: String,
        stream_id: String,
        commands: mpsc::WeakUnboundedSender<Command>,
        lifecycle: Arc<Lifecycle<P2PPublicationEvent>>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer,
            stream_id,
            commands,
            lifecycle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_ended(&self) -> bool {
        self.lifecycle.is_ended()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<P2PPublicationEvent> {
        self.lifecycle.subscribe()
    }

    /// Stops sending the stream to the peer. The connection stays up.
    pub async fn stop(&self) -> Result<()> {
        if self.is_ended() {
            return Ok(());
        }
        let peer = self.peer.clone();
        let stream_id = self.stream_id.clone();
        request_weak(&self.commands, |done| Command::Unpublish {
            peer,
            stream_id,
            done,
        })
        .await
    }

    pub async fn get_stats(&self) -> Result<StatsReport> {
        if self.is_ended() {
            return Err(Error::invalid_state("publication has ended"));
        }
        let peer = self.peer.clone();
        request_weak(&self.commands, |done| Command::GetStats { peer, done }).await
    }
}
