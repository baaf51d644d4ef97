use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::p2p::{P2PSignalingChannel, P2PSignalingEvent};

#[derive(Clone, Debug)]
pub(crate) struct RelayedMessage {
    pub from: String,
    pub to: String,
    pub message: String,
}

impl RelayedMessage {
    pub fn kind(&self) -> String {
        serde_json::from_str::<Value>(&self.message)
            .ok()
            .and_then(|x| x.get("type").and_then(|x| x.as_str()).map(|x| x.to_owned()))
            .unwrap_or_default()
    }

    pub fn data(&self) -> Value {
        serde_json::from_str::<Value>(&self.message)
            .ok()
            .and_then(|mut x| x.get_mut("data").map(|x| x.take()))
            .unwrap_or(Value::Null)
    }
}

#[derive(Default)]
struct HubState {
    clients: HashMap<String, mpsc::UnboundedSender<P2PSignalingEvent>>,
    held: bool,
    buffer: Vec<RelayedMessage>,
    log: Vec<RelayedMessage>,
}

/// An in-memory signaling server routing messages between clients by id.
#[derive(Clone, Default)]
pub(crate) struct RelayHub {
    state: Arc<Mutex<HubState>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, id: &str) -> Arc<RelayChannel> {
        Arc::new(RelayChannel {
            hub: self.clone(),
            id: id.to_owned(),
        })
    }

    /// Buffers every message until `release`.
    pub fn hold(&self) {
        self.state.lock().unwrap().held = true;
    }

    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.held = false;
        for msg in std::mem::take(&mut state.buffer) {
            Self::deliver(&state, msg);
        }
    }

    pub fn messages(&self) -> Vec<RelayedMessage> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn messages_of(&self, from: &str, kind: &str) -> Vec<RelayedMessage> {
        self.messages()
            .into_iter()
            .filter(|x| x.from == from && x.kind() == kind)
            .collect()
    }

    /// Sends a raw message as if `from` had sent it.
    pub fn inject(&self, from: &str, to: &str, message: Value) {
        let state = self.state.lock().unwrap();
        Self::deliver(
            &state,
            RelayedMessage {
                from: from.to_owned(),
                to: to.to_owned(),
                message: message.to_string(),
            },
        );
    }

    fn deliver(state: &HubState, msg: RelayedMessage) {
        if let Some(client) = state.clients.get(&msg.to) {
            let _ = client.send(P2PSignalingEvent::Message {
                from: msg.from,
                message: msg.message,
            });
        }
    }
}

pub(crate) struct RelayChannel {
    hub: RelayHub,
    id: String,
}

#[async_trait]
impl P2PSignalingChannel for RelayChannel {
    async fn connect(
        &self,
        _token: &str,
        events: mpsc::UnboundedSender<P2PSignalingEvent>,
    ) -> Result<String> {
        let mut state = self.hub.state.lock().unwrap();
        state.clients.insert(self.id.clone(), events);
        Ok(json!({ "uid": self.id }).to_string())
    }

    async fn send_message(&self, peer: &str, message: &str) -> Result<()> {
        let mut state = self.hub.state.lock().unwrap();
        if !state.clients.contains_key(peer) {
            bail!("{} is not connected", peer);
        }
        let msg = RelayedMessage {
            from: self.id.clone(),
            to: peer.to_owned(),
            message: message.to_owned(),
        };
        state.log.push(msg.clone());
        if state.held {
            state.buffer.push(msg);
        } else {
            RelayHub::deliver(&state, msg);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.hub.state.lock().unwrap();
        if let Some(events) = state.clients.remove(&self.id) {
            let _ = events.send(P2PSignalingEvent::ServerDisconnected);
        }
        Ok(())
    }
}
