use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    engine::{EngineEventSender, PeerConnectionFactory, RtcConfiguration, SessionTag, TaggedEngineEvent},
    error::Error,
    sdp::CodecPreference,
};

use super::{PeerSession, SessionMode};

/// Sessions of one client by id. Only the client's own task touches it.
pub(crate) struct SessionRegistry<M> {
    sessions: HashMap<String, PeerSession<M>>,
    factory: Arc<dyn PeerConnectionFactory>,
    events: mpsc::UnboundedSender<TaggedEngineEvent>,
    codecs: CodecPreference,
    next_generation: u64,
}

impl<M: SessionMode> SessionRegistry<M> {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        events: mpsc::UnboundedSender<TaggedEngineEvent>,
        codecs: CodecPreference,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            factory,
            events,
            codecs,
            next_generation: 0,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&PeerSession<M>> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PeerSession<M>> {
        self.sessions.get_mut(id)
    }

    /// The session an engine event belongs to, unless it has been replaced since.
    pub fn get_tagged_mut(&mut self, tag: &SessionTag) -> Option<&mut PeerSession<M>> {
        self.sessions
            .get_mut(&tag.id)
            .filter(|session| session.tag().generation == tag.generation)
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &PeerSession<M>> {
        self.sessions.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut PeerSession<M>> {
        self.sessions.values_mut()
    }

    /// Returns the session for `id`, creating its connection first if there is none.
    pub async fn get_or_create(
        &mut self,
        id: &str,
        config: &RtcConfiguration,
        mode: impl FnOnce() -> M,
    ) -> Result<&mut PeerSession<M>> {
        match self.sessions.entry(id.to_owned()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                self.next_generation += 1;
                let tag = SessionTag {
                    id: id.to_owned(),
                    generation: self.next_generation,
                };
                trace!("creating session {} ({})", tag.id, tag.generation);
                let connection = self
                    .factory
                    .create_peer_connection(
                        config,
                        EngineEventSender::new(tag.clone(), self.events.clone()),
                    )
                    .await?;
                Ok(entry.insert(PeerSession::new(
                    tag,
                    connection,
                    self.codecs.clone(),
                    mode(),
                )))
            }
        }
    }

    /// Removes the session without disposing it.
    pub fn detach(&mut self, id: &str) -> Option<PeerSession<M>> {
        self.sessions.remove(id)
    }

    /// Detaches the session, then disposes it. Returns false if there was none.
    pub async fn dispose(&mut self, id: &str, error: Option<&Error>) -> bool {
        let Some(mut session) = self.detach(id) else {
            return false;
        };
        session.dispose(error).await
    }

    pub async fn dispose_all(&mut self, error: Option<&Error>) {
        for id in self.ids() {
            self.dispose(&id, error).await;
        }
    }
}
