use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    client::{complete, Completion},
    error::Error,
    media::{LocalStream, RemoteMediaStream, SourceKind, StreamSourceInfo},
};

use super::P2PPublication;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub(crate) struct TrackSource {
    pub id: String,
    pub source: SourceKind,
}

/// Payload of `chat-stream-info`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub(crate) struct StreamInfoMessage {
    pub id: String,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub source: StreamSourceInfo,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

pub(crate) fn track_sources_message(stream: &LocalStream) -> Value {
    let sources: Vec<TrackSource> = stream
        .tracks
        .iter()
        .map(|track| TrackSource {
            id: track.id.clone(),
            source: track.source,
        })
        .collect();
    json!(sources)
}

pub(crate) fn stream_info_message(stream: &LocalStream) -> Value {
    json!(StreamInfoMessage {
        id: stream.id.clone(),
        tracks: stream.tracks.iter().map(|x| x.id.clone()).collect(),
        source: stream.source(),
        attributes: stream.attributes.clone(),
    })
}

struct PendingPublish {
    remaining: Vec<String>,
    waiters: Vec<Completion<P2PPublication>>,
}

/// Local streams sent to one peer whose tracks it has not acknowledged yet.
#[derive(Default)]
pub(crate) struct OutgoingHandshake {
    pending: HashMap<String, PendingPublish>,
}

impl OutgoingHandshake {
    pub fn begin(&mut self, stream: &LocalStream, done: Completion<P2PPublication>) {
        self.pending.insert(
            stream.id.clone(),
            PendingPublish {
                remaining: stream.tracks.iter().map(|x| x.id.clone()).collect(),
                waiters: vec![done],
            },
        );
    }

    /// Waits on a publish already in flight. Hands `done` back if there is none.
    pub fn join(
        &mut self,
        stream_id: &str,
        done: Completion<P2PPublication>,
    ) -> Option<Completion<P2PPublication>> {
        match self.pending.get_mut(stream_id) {
            Some(pending) => {
                pending.waiters.push(done);
                None
            }
            None => Some(done),
        }
    }

    /// Marks tracks as received by the peer. Returns the streams now fully acknowledged.
    pub fn ack(&mut self, track_ids: &[String]) -> Vec<(String, Vec<Completion<P2PPublication>>)> {
        for pending in self.pending.values_mut() {
            pending.remaining.retain(|id| !track_ids.contains(id));
        }
        let done: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.remaining.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        done.into_iter()
            .filter_map(|id| {
                let pending = self.pending.remove(&id)?;
                Some((id, pending.waiters))
            })
            .collect()
    }

    pub fn fail_all(&mut self, error: &Error) {
        for (_, pending) in self.pending.drain() {
            for done in pending.waiters {
                complete(done, Err(error.clone()));
            }
        }
    }
}

/// A remote stream whose metadata and media have both arrived.
pub(crate) struct ReadyStream {
    pub media: RemoteMediaStream,
    pub info: StreamInfoMessage,
    pub source: StreamSourceInfo,
}

/// Metadata and media of one peer's streams, matched up as they arrive in either order.
#[derive(Default)]
pub(crate) struct IncomingHandshake {
    infos: HashMap<String, StreamInfoMessage>,
    track_sources: HashMap<String, SourceKind>,
    media: HashMap<String, RemoteMediaStream>,
}

impl IncomingHandshake {
    pub fn add_track_sources(&mut self, sources: Vec<TrackSource>) {
        for source in sources {
            self.track_sources.insert(source.id, source.source);
        }
    }

    pub fn add_info(&mut self, info: StreamInfoMessage) {
        self.infos.insert(info.id.clone(), info);
    }

    pub fn add_media(&mut self, media: RemoteMediaStream) {
        self.media.insert(media.id.clone(), media);
    }

    pub fn remove_media(&mut self, stream_id: &str) {
        self.media.remove(stream_id);
    }

    pub fn take_ready(&mut self) -> Vec<ReadyStream> {
        let ids: Vec<String> = self
            .media
            .keys()
            .filter(|id| self.infos.contains_key(*id))
            .cloned()
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                let media = self.media.remove(&id)?;
                let info = self.infos.remove(&id)?;
                let source = self.source_of(&info);
                Some(ReadyStream {
                    media,
                    info,
                    source,
                })
            })
            .collect()
    }

    /// Fills what `chat-stream-info` left out from the per-track sources.
    fn source_of(&self, info: &StreamInfoMessage) -> StreamSourceInfo {
        let mut source = info.source;
        for track in &info.tracks {
            match self.track_sources.get(track) {
                Some(SourceKind::Mic) if source.audio.is_none() => {
                    source.audio = Some(SourceKind::Mic)
                }
                Some(kind @ (SourceKind::Camera | SourceKind::ScreenCast))
                    if source.video.is_none() =>
                {
                    source.video = Some(*kind)
                }
                _ => {}
            }
        }
        source
    }
}
