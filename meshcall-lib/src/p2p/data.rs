use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    client::{complete, Completion},
    error::{Error, Result},
};

pub(crate) const DATA_CHANNEL_LABEL: &str = "message";
pub(crate) const MAX_MESSAGE_LENGTH: usize = 0xFFFF;

#[derive(Debug, Deserialize, Serialize)]
struct DataMessage {
    id: u64,
    data: String,
}

pub(crate) fn check_message(message: &str) -> Result<()> {
    if message.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(Error::IllegalArgument("message too long".to_owned()));
    }
    Ok(())
}

pub(crate) fn parse_data_message(raw: &[u8]) -> Option<(u64, String)> {
    let msg: DataMessage = serde_json::from_slice(raw).ok()?;
    Some((msg.id, msg.data))
}

/// Outgoing text messages of one peer, kept until the channel opens and the peer acknowledges them.
#[derive(Default)]
pub(crate) struct DataChannelState {
    pub created: bool,
    pub open: bool,
    next_id: u64,
    queue: VecDeque<Bytes>,
    pending: HashMap<u64, Completion<()>>,
}

impl DataChannelState {
    /// Registers a message. Returns its id, and its body if it may be sent right away.
    pub fn enqueue(&mut self, message: String, done: Completion<()>) -> (u64, Option<Bytes>) {
        self.next_id += 1;
        let id = self.next_id;
        let body = Bytes::from(
            serde_json::to_vec(&DataMessage { id, data: message }).unwrap_or_default(),
        );
        self.pending.insert(id, done);
        if self.open {
            return (id, Some(body));
        }
        self.queue.push_back(body);
        (id, None)
    }

    /// Marks the channel open and returns the queued bodies in order.
    pub fn open(&mut self) -> Vec<Bytes> {
        self.open = true;
        self.queue.drain(..).collect()
    }

    pub fn ack(&mut self, id: u64) -> bool {
        match self.pending.remove(&id) {
            Some(done) => {
                complete(done, Ok(()));
                true
            }
            None => false,
        }
    }

    pub fn fail(&mut self, id: u64, error: Error) {
        if let Some(done) = self.pending.remove(&id) {
            complete(done, Err(error));
        }
    }

    pub fn fail_all(&mut self, error: &Error) {
        self.queue.clear();
        for (_, done) in self.pending.drain() {
            complete(done, Err(error.clone()));
        }
    }

    /// Moves the unsent and unacknowledged messages to the state of a replacement connection.
    pub fn hand_over(&mut self) -> Self {
        Self {
            created: false,
            open: false,
            next_id: self.next_id,
            queue: self.queue.drain(..).collect(),
            pending: self.pending.drain().collect(),
        }
    }

    pub fn wanted(&self) -> bool {
        self.created || !self.pending.is_empty()
    }
}
