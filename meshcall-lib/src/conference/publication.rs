use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::{
    client::{request_weak, Lifecycle},
    error::{Error, Result},
    media::{RemoteMediaStream, StatsReport, TrackKind},
};

use super::{Command, VideoUpdateOptions};

#[derive(Clone, Debug, PartialEq)]
pub enum PublicationEvent {
    Ended,
    Error(Error),
    Mute(TrackKind),
    Unmute(TrackKind),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    Ended,
    Error(Error),
    Mute(TrackKind),
    Unmute(TrackKind),
    MediaAdded(RemoteMediaStream),
}

/// A local stream being sent to the conference.
#[derive(Clone)]
pub struct Publication {
    id: String,
    stream_id: String,
    commands: mpsc::WeakUnboundedSender<Command>,
    lifecycle: Arc<Lifecycle<PublicationEvent>>,
}

impl Publication {
    pub(crate) fn new(
        id: String,
        stream_id: String,
        commands: mpsc::WeakUnboundedSender<Command>,
        lifecycle: Arc<Lifecycle<PublicationEvent>>,
    ) -> Self {
        Self {
            id,
            stream_id,
            commands,
            lifecycle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_ended(&self) -> bool {
        self.lifecycle.is_ended()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PublicationEvent> {
        self.lifecycle.subscribe()
    }

    pub async fn mute(&self, kind: TrackKind) -> Result<()> {
        mute(&self.commands, &self.id, kind, true).await
    }

    pub async fn unmute(&self, kind: TrackKind) -> Result<()> {
        mute(&self.commands, &self.id, kind, false).await
    }

    pub async fn stop(&self) -> Result<()> {
        stop(&self.commands, &self.id).await
    }

    pub async fn get_stats(&self) -> Result<StatsReport> {
        if self.is_ended() {
            return Err(Error::invalid_state("publication has ended"));
        }
        get_stats(&self.commands, &self.id).await
    }
}

/// A remote stream being received from the conference.
#[derive(Clone)]
pub struct Subscription {
    id: String,
    stream_id: String,
    media: Option<RemoteMediaStream>,
    commands: mpsc::WeakUnboundedSender<Command>,
    lifecycle: Arc<Lifecycle<SubscriptionEvent>>,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        stream_id: String,
        media: Option<RemoteMediaStream>,
        commands: mpsc::WeakUnboundedSender<Command>,
        lifecycle: Arc<Lifecycle<SubscriptionEvent>>,
    ) -> Self {
        Self {
            id,
            stream_id,
            media,
            commands,
            lifecycle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the subscribed remote stream.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The engine stream, if it had arrived by the time the subscription was ready.
    /// Later arrivals are reported as [`SubscriptionEvent::MediaAdded`].
    pub fn media(&self) -> Option<&RemoteMediaStream> {
        self.media.as_ref()
    }

    pub fn is_ended(&self) -> bool {
        self.lifecycle.is_ended()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.lifecycle.subscribe()
    }

    pub async fn mute(&self, kind: TrackKind) -> Result<()> {
        mute(&self.commands, &self.id, kind, true).await
    }

    pub async fn unmute(&self, kind: TrackKind) -> Result<()> {
        mute(&self.commands, &self.id, kind, false).await
    }

    pub async fn apply_options(&self, options: VideoUpdateOptions) -> Result<()> {
        let id = self.id.clone();
        request_weak(&self.commands, |done| Command::ApplyOptions { id, options, done }).await
    }

    pub async fn stop(&self) -> Result<()> {
        stop(&self.commands, &self.id).await
    }

    pub async fn get_stats(&self) -> Result<StatsReport> {
        if self.is_ended() {
            return Err(Error::invalid_state("subscription has ended"));
        }
        get_stats(&self.commands, &self.id).await
    }
}

async fn mute(
    commands: &mpsc::WeakUnboundedSender<Command>,
    id: &str,
    kind: TrackKind,
    mute: bool,
) -> Result<()> {
    let id = id.to_owned();
    request_weak(commands, |done| Command::Mute {
        id,
        kind,
        mute,
        done,
    })
    .await
}

async fn stop(commands: &mpsc::WeakUnboundedSender<Command>, id: &str) -> Result<()> {
    let id = id.to_owned();
    request_weak(commands, |done| Command::Stop { id, done }).await
}

async fn get_stats(commands: &mpsc::WeakUnboundedSender<Command>, id: &str) -> Result<StatsReport> {
    let id = id.to_owned();
    request_weak(commands, |done| Command::GetStats { id, done }).await
}
