use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::signaling::{token::Endpoint, Ack, SignalingTransport, TransportEvent};

use super::eventually;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TransportCall {
    pub name: String,
    pub payload: Option<Value>,
}

type Responder = Box<dyn Fn(&str, &Option<Value>) -> Option<Vec<Value>> + Send>;

#[derive(Default)]
struct State {
    calls: Vec<TransportCall>,
    pending_acks: Vec<(String, Ack)>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    fail_connects: bool,
    keep_acks: bool,
    responder: Option<Responder>,
}

/// A transport whose server side is driven by the test.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    state: Arc<Mutex<State>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state.lock().unwrap().fail_connects = fail;
    }

    /// Leaves unanswered acknowledgements answerable after a disconnect, like a late server reply.
    pub fn keep_acks_on_disconnect(&self, keep: bool) {
        self.state.lock().unwrap().keep_acks = keep;
    }

    /// Acknowledges emitted events immediately when `responder` returns arguments.
    pub fn respond_with(
        &self,
        responder: impl Fn(&str, &Option<Value>) -> Option<Vec<Value>> + Send + 'static,
    ) {
        self.state.lock().unwrap().responder = Some(Box::new(responder));
    }

    pub fn push_event(&self, event: TransportEvent) {
        let state = self.state.lock().unwrap();
        let events = state.events.as_ref().expect("transport was never connected");
        let _ = events.send(event);
    }

    pub fn push_message(&self, event: &str, payload: Value) {
        self.push_event(TransportEvent::Message {
            event: event.to_owned(),
            payload,
        });
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_named(&self, name: &str) -> Vec<TransportCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.name == name)
            .collect()
    }

    pub async fn wait_for_call(&self, name: &str) {
        self.wait_for_call_count(name, 1).await;
    }

    pub async fn wait_for_call_count(&self, name: &str, count: usize) {
        eventually(&format!("{} x{}", name, count), || {
            self.calls_named(name).len() >= count
        })
        .await;
    }

    /// Answers the most recent unacknowledged `name` event.
    pub async fn ack_last(&self, name: &str, args: Vec<Value>) {
        eventually(&format!("ack for {}", name), || {
            self.state
                .lock()
                .unwrap()
                .pending_acks
                .iter()
                .any(|(event, _)| event == name)
        })
        .await;
        let ack = {
            let mut state = self.state.lock().unwrap();
            let index = state
                .pending_acks
                .iter()
                .rposition(|(event, _)| event == name)
                .unwrap();
            state.pending_acks.remove(index).1
        };
        let _ = ack.send(args);
    }
}

#[async_trait]
impl SignalingTransport for ScriptedTransport {
    async fn connect(
        &mut self,
        _endpoint: &Endpoint,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(TransportCall {
            name: "connect".to_owned(),
            payload: None,
        });
        if state.fail_connects {
            bail!("connection refused");
        }
        let _ = events.send(TransportEvent::Connected);
        state.events = Some(events);
        Ok(())
    }

    async fn emit(&mut self, event: &str, payload: Option<Value>, ack: Option<Ack>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let reply = state
            .responder
            .as_ref()
            .and_then(|responder| responder(event, &payload));
        state.calls.push(TransportCall {
            name: event.to_owned(),
            payload,
        });
        if let Some(ack) = ack {
            match reply {
                Some(args) => {
                    let _ = ack.send(args);
                }
                None => state.pending_acks.push((event.to_owned(), ack)),
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(TransportCall {
            name: "disconnect".to_owned(),
            payload: None,
        });
        if !state.keep_acks {
            state.pending_acks.clear();
        }
    }
}
