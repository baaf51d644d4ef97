use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    engine::{
        EngineEvent, EngineEventSender, OfferConstraints, PeerConnection, PeerConnectionFactory,
        RtcConfiguration,
    },
    media::{
        IceCandidate, IceConnectionState, LocalStream, RemoteMediaStream, SdpType,
        SessionDescription, StatsReport,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RecordedCall {
    pub owner: String,
    pub remote: String,
    pub op: String,
    pub detail: String,
}

/// What the loopback engine puts in a session description instead of SDP.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct FakeSdp {
    owner: String,
    streams: Vec<RemoteMediaStream>,
    data: bool,
}

#[derive(Default)]
struct NetworkState {
    connections: HashMap<(String, String), Arc<FakeConnection>>,
    calls: Vec<RecordedCall>,
    failures: Vec<String>,
}

/// Connects loopback engines of several clients so data sent on one side arrives at the other.
#[derive(Clone, Default)]
pub(crate) struct FakeNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(&self, owner: &str) -> Arc<FakeEngine> {
        Arc::new(FakeEngine {
            network: self.clone(),
            owner: owner.to_owned(),
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, owner: &str, op: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.owner == owner && call.op == op)
            .collect()
    }

    /// Makes the next `op` call fail on any connection.
    pub fn fail_next(&self, op: &str) {
        self.state.lock().unwrap().failures.push(op.to_owned());
    }

    /// Emits an engine event on the newest connection `owner` holds towards `remote`.
    pub fn inject(&self, owner: &str, remote: &str, event: EngineEvent) {
        let connection = self
            .state
            .lock()
            .unwrap()
            .connections
            .get(&(owner.to_owned(), remote.to_owned()))
            .cloned()
            .expect("no such connection");
        connection.events.send(event);
    }

    fn record(&self, owner: &str, remote: &str, op: &str, detail: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall {
            owner: owner.to_owned(),
            remote: remote.to_owned(),
            op: op.to_owned(),
            detail,
        });
        if let Some(index) = state.failures.iter().position(|x| x == op) {
            state.failures.remove(index);
            bail!("injected {} failure", op);
        }
        Ok(())
    }

    fn counterpart(&self, owner: &str, remote: &str) -> Option<Arc<FakeConnection>> {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(&(remote.to_owned(), owner.to_owned()))
            .cloned()
    }
}

pub(crate) struct FakeEngine {
    network: FakeNetwork,
    owner: String,
}

#[async_trait]
impl PeerConnectionFactory for FakeEngine {
    async fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        events: EngineEventSender,
    ) -> Result<Box<dyn PeerConnection>> {
        let remote = events.tag().id.clone();
        self.network.record(
            &self.owner,
            &remote,
            "create",
            format!("{:?}", config.gathering_policy),
        )?;
        let connection = Arc::new(FakeConnection {
            network: self.network.clone(),
            owner: self.owner.clone(),
            remote: remote.clone(),
            events,
            state: Mutex::new(ConnectionState::default()),
        });
        self.network
            .state
            .lock()
            .unwrap()
            .connections
            .insert((self.owner.clone(), remote), connection.clone());
        Ok(Box::new(FakeConnectionHandle(connection)))
    }
}

#[derive(Default)]
struct ConnectionState {
    streams: Vec<RemoteMediaStream>,
    data: bool,
    remote_data: bool,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    seen_remote_streams: Vec<String>,
    candidates: u32,
    connected: bool,
    data_open: bool,
    closed: bool,
}

struct FakeConnection {
    network: FakeNetwork,
    owner: String,
    remote: String,
    events: EngineEventSender,
    state: Mutex<ConnectionState>,
}

impl FakeConnection {
    fn record(&self, op: &str, detail: String) -> Result<()> {
        self.network.record(&self.owner, &self.remote, op, detail)
    }

    fn describe(&self, sdp_type: SdpType) -> SessionDescription {
        let state = self.state.lock().unwrap();
        let sdp = FakeSdp {
            owner: self.owner.clone(),
            streams: state.streams.clone(),
            data: state.data || state.remote_data,
        };
        SessionDescription::new(sdp_type, json!(sdp).to_string())
    }

    /// Emits the events a real engine produces once both descriptions are in place.
    fn settle(&self) {
        let mut state = self.state.lock().unwrap();
        if state.local.is_none() || state.remote.is_none() {
            return;
        }
        if !state.connected {
            state.connected = true;
            self.events.send(EngineEvent::IceConnectionStateChanged(
                IceConnectionState::Connected,
            ));
        }
        if !state.data_open && (state.data || state.remote_data) {
            state.data_open = true;
            self.events.send(EngineEvent::DataChannelOpen);
        }
    }
}

struct FakeConnectionHandle(Arc<FakeConnection>);

#[async_trait]
impl PeerConnection for FakeConnectionHandle {
    async fn create_offer(&self, constraints: OfferConstraints) -> Result<SessionDescription> {
        self.0.record("create_offer", format!("{:?}", constraints))?;
        Ok(self.0.describe(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.0.record("create_answer", String::new())?;
        Ok(self.0.describe(SdpType::Answer))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.0.record("set_local_description", desc.sdp.clone())?;
        let candidate = {
            let mut state = self.0.state.lock().unwrap();
            state.local = Some(desc.clone());
            state.candidates += 1;
            IceCandidate::new(
                "0".to_owned(),
                0,
                format!("candidate:{} {} udp", self.0.owner, state.candidates),
            )
        };
        self.0.events.send(EngineEvent::IceCandidate(candidate));
        self.0.settle();
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.0.record("set_remote_description", desc.sdp.clone())?;
        let sdp: FakeSdp = serde_json::from_str(&desc.sdp).unwrap_or_default();
        let (added, removed) = {
            let mut state = self.0.state.lock().unwrap();
            state.remote = Some(desc.clone());
            state.remote_data = sdp.data;
            let added: Vec<RemoteMediaStream> = sdp
                .streams
                .iter()
                .filter(|x| !state.seen_remote_streams.contains(&x.id))
                .cloned()
                .collect();
            let removed: Vec<String> = state
                .seen_remote_streams
                .iter()
                .filter(|id| !sdp.streams.iter().any(|x| &x.id == *id))
                .cloned()
                .collect();
            state.seen_remote_streams = sdp.streams.iter().map(|x| x.id.clone()).collect();
            (added, removed)
        };
        for stream in added {
            self.0.events.send(EngineEvent::AddStream(stream));
        }
        for id in removed {
            self.0.events.send(EngineEvent::RemoveStream(id));
        }
        self.0.settle();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.0.record("add_ice_candidate", candidate.candidate.clone())
    }

    async fn add_stream(&self, stream: &LocalStream) -> Result<()> {
        self.0.record("add_stream", stream.id.clone())?;
        let tracks = stream.tracks.iter().map(|x| x.id.clone()).collect();
        self.0
            .state
            .lock()
            .unwrap()
            .streams
            .push(RemoteMediaStream::new(stream.id.clone(), tracks));
        Ok(())
    }

    async fn remove_stream(&self, stream_id: &str) -> Result<()> {
        self.0.record("remove_stream", stream_id.to_owned())?;
        self.0
            .state
            .lock()
            .unwrap()
            .streams
            .retain(|x| x.id != stream_id);
        Ok(())
    }

    async fn set_max_bitrate(
        &self,
        stream_id: &str,
        video_kbps: Option<u32>,
        audio_kbps: Option<u32>,
    ) -> Result<()> {
        self.0.record(
            "set_max_bitrate",
            format!("{} {:?} {:?}", stream_id, video_kbps, audio_kbps),
        )
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        self.0.record("create_data_channel", label.to_owned())?;
        self.0.state.lock().unwrap().data = true;
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> Result<()> {
        self.0.record(
            "send_data",
            String::from_utf8_lossy(&data).into_owned(),
        )?;
        let counterpart = self
            .0
            .network
            .counterpart(&self.0.owner, &self.0.remote)
            .ok_or_else(|| anyhow!("no counterpart"))?;
        counterpart
            .events
            .send(EngineEvent::DataChannelMessage(data));
        Ok(())
    }

    async fn get_stats(&self) -> Result<StatsReport> {
        self.0.record("get_stats", String::new())?;
        if self.0.state.lock().unwrap().closed {
            bail!("connection closed");
        }
        let mut report = StatsReport::default();
        report
            .members
            .insert("owner".to_owned(), json!(self.0.owner));
        Ok(report)
    }

    async fn close(&self) {
        let _ = self.0.record("close", String::new());
        self.0.state.lock().unwrap().closed = true;
    }
}
