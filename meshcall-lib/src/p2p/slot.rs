use std::{collections::HashMap, mem::take, sync::Arc};

use crate::{
    client::Lifecycle,
    error::Error,
    media::{LocalStream, RemoteStream},
    session::SessionMode,
};

use super::{
    capability::CapabilitySet, data::DataChannelState, handshake::OutgoingHandshake,
    P2PPublicationEvent,
};

pub(crate) struct PublicationEntry {
    pub stream_id: String,
    pub lifecycle: Arc<Lifecycle<P2PPublicationEvent>>,
}

/// Everything a replacement connection takes over from the one it replaces.
#[derive(Default)]
pub(crate) struct Handover {
    published: Vec<LocalStream>,
    outgoing: OutgoingHandshake,
    publications: Vec<PublicationEntry>,
    data: DataChannelState,
    data_channel: bool,
    ever_published: bool,
    capabilities: CapabilitySet,
}

impl Handover {
    /// Whether the replaced connection had, or was about to get, a data channel.
    pub fn data_channel(&self) -> bool {
        self.data_channel
    }

    pub fn fail(mut self, error: &Error) {
        self.outgoing.fail_all(error);
        self.data.fail_all(error);
        for entry in self.publications {
            entry.lifecycle.end(P2PPublicationEvent::Ended);
        }
    }
}

/// What a session with one remote peer carries besides its connection.
pub(crate) struct P2PSlot {
    pub capabilities: CapabilitySet,
    pub continual_ice_gathering: bool,
    pub published: Vec<LocalStream>,
    pub outgoing: OutgoingHandshake,
    pub publications: Vec<PublicationEntry>,
    pub remote_streams: HashMap<String, RemoteStream>,
    /// Once a stream went out, a peer that cannot remove streams takes no other.
    pub ever_published: bool,
    pub data: DataChannelState,
}

impl P2PSlot {
    pub fn new(continual_ice_gathering: bool, capabilities: CapabilitySet) -> Self {
        Self::resume(
            continual_ice_gathering,
            Handover {
                capabilities,
                ..Handover::default()
            },
        )
    }

    pub fn resume(continual_ice_gathering: bool, handover: Handover) -> Self {
        Self {
            capabilities: handover.capabilities,
            continual_ice_gathering,
            published: handover.published,
            outgoing: handover.outgoing,
            publications: handover.publications,
            remote_streams: HashMap::new(),
            ever_published: handover.ever_published,
            data: handover.data,
        }
    }

    /// Empties the slot into a [`Handover`]. Remote streams stay behind and end with it.
    pub fn hand_over(&mut self) -> Handover {
        Handover {
            published: take(&mut self.published),
            outgoing: take(&mut self.outgoing),
            publications: take(&mut self.publications),
            data_channel: self.data.wanted(),
            data: self.data.hand_over(),
            ever_published: self.ever_published,
            capabilities: self.capabilities,
        }
    }

    pub fn is_published(&self, stream_id: &str) -> bool {
        self.published.iter().any(|x| x.id == stream_id)
    }

    /// Ends what was received and sent over the connection, keeping the connection itself.
    pub fn end_media(&mut self) {
        for (_, stream) in self.remote_streams.drain() {
            stream.end();
        }
        for entry in self.publications.drain(..) {
            entry.lifecycle.end(P2PPublicationEvent::Ended);
        }
    }
}

impl SessionMode for P2PSlot {
    fn fail_pending(&mut self, error: &Error) {
        self.outgoing.fail_all(error);
        self.data.fail_all(error);
    }

    fn notify_ended(&mut self, error: Option<&Error>) {
        if let Some(error) = error {
            for entry in &self.publications {
                entry
                    .lifecycle
                    .emit(P2PPublicationEvent::Error(error.clone()));
            }
        }
        self.end_media();
    }
}
