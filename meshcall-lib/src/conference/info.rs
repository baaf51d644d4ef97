use std::{collections::HashMap, fmt, sync::Arc};

use getset::Getters;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    client::Lifecycle,
    error::{Error, Result},
    media::{RemoteStream, RemoteStreamInfo, SourceKind, StreamSourceInfo, StreamType},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticipantEvent {
    Left,
}

/// Someone in the conference, including this client.
#[derive(Clone, Getters)]
pub struct Participant {
    #[get = "pub"]
    id: String,
    #[get = "pub"]
    role: String,
    #[get = "pub"]
    user_id: String,
    lifecycle: Arc<Lifecycle<ParticipantEvent>>,
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl Participant {
    pub(crate) fn from_value(value: Value) -> Result<Self> {
        let dto: ParticipantDto = from_value(value)?;
        Ok(dto.into())
    }

    pub fn has_left(&self) -> bool {
        self.lifecycle.is_ended()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ParticipantEvent> {
        self.lifecycle.subscribe()
    }

    pub(crate) fn leave(&self) -> bool {
        self.lifecycle.end(ParticipantEvent::Left)
    }
}

#[derive(Clone, Debug, Getters)]
#[getset(get = "pub")]
pub struct ConferenceInfo {
    id: String,
    participants: Vec<Participant>,
    remote_streams: Vec<RemoteStream>,
    self_participant: Option<Participant>,
}

impl ConferenceInfo {
    /// Builds the conference from the login acknowledgement.
    pub(crate) fn parse(info: Value) -> Result<Self> {
        let dto: LoginInfoDto = from_value(info)?;
        let participants: Vec<Participant> = dto
            .room
            .participants
            .into_iter()
            .map(Participant::from)
            .collect();
        let self_participant = participants.iter().find(|x| x.id == dto.id).cloned();
        Ok(Self {
            id: dto.room.id,
            participants,
            remote_streams: dto
                .room
                .streams
                .into_iter()
                .map(|x| RemoteStream::new(x.into()))
                .collect(),
            self_participant,
        })
    }

    pub fn remote_stream(&self, id: &str) -> Option<&RemoteStream> {
        self.remote_streams.iter().find(|x| x.id() == id)
    }

    pub(crate) fn add_participant(&mut self, participant: Participant) {
        self.participants.push(participant);
    }

    pub(crate) fn remove_participant(&mut self, id: &str) -> Option<Participant> {
        let index = self.participants.iter().position(|x| x.id == id)?;
        Some(self.participants.remove(index))
    }

    pub(crate) fn add_remote_stream(&mut self, stream: RemoteStream) {
        self.remote_streams.push(stream);
    }

    pub(crate) fn remove_remote_stream(&mut self, id: &str) -> Option<RemoteStream> {
        let index = self.remote_streams.iter().position(|x| x.id() == id)?;
        Some(self.remote_streams.remove(index))
    }
}

/// Parses one entry of `room.streams` or the payload of a stream `add` / `.` update.
pub(crate) fn parse_stream(value: Value) -> Result<RemoteStreamInfo> {
    let dto: StreamDto = from_value(value)?;
    Ok(dto.into())
}

fn from_value<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|err| Error::Protocol(err.to_string()))
}

#[derive(Deserialize)]
struct LoginInfoDto {
    id: String,
    room: RoomDto,
}

#[derive(Deserialize)]
struct RoomDto {
    id: String,
    #[serde(default)]
    participants: Vec<ParticipantDto>,
    #[serde(default)]
    streams: Vec<StreamDto>,
}

#[derive(Deserialize)]
struct ParticipantDto {
    id: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    user: String,
}

impl From<ParticipantDto> for Participant {
    fn from(dto: ParticipantDto) -> Self {
        Self {
            id: dto.id,
            role: dto.role,
            user_id: dto.user,
            lifecycle: Lifecycle::new(),
        }
    }
}

#[derive(Deserialize)]
struct StreamDto {
    id: String,
    #[serde(rename = "type", default)]
    stream_type: StreamType,
    #[serde(default)]
    info: StreamInfoDto,
    #[serde(default)]
    media: Value,
}

#[derive(Default, Deserialize)]
struct StreamInfoDto {
    owner: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, Value>,
}

fn source_of(media: &Value, kind: &str) -> Option<SourceKind> {
    let track = media.get(kind).filter(|x| x.is_object())?;
    let source = track
        .get("source")
        .and_then(|x| x.as_str())
        .unwrap_or("mixed");
    serde_json::from_value(Value::String(source.to_owned())).ok()
}

impl From<StreamDto> for RemoteStreamInfo {
    fn from(dto: StreamDto) -> Self {
        let attributes = dto
            .info
            .attributes
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(value) => (key, value),
                other => (key, other.to_string()),
            })
            .collect();
        RemoteStreamInfo {
            id: dto.id,
            origin: dto.info.owner.unwrap_or_else(|| "mixer".to_owned()),
            stream_type: dto.stream_type,
            source: StreamSourceInfo {
                audio: source_of(&dto.media, "audio"),
                video: source_of(&dto.media, "video"),
            },
            attributes,
            media: dto.media,
        }
    }
}
