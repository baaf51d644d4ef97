use std::sync::Arc;

use serde_json::Value;
use tokio::{spawn, sync::mpsc};
use tracing::{trace, warn};

use crate::error::Error;

use super::{
    message::{encode, MessageKind},
    P2PSignalingChannel,
};

/// Sends signaling messages in order on a task of its own, so the orchestrator never waits on the server.
pub(crate) struct SignalingWriter {
    tx: mpsc::UnboundedSender<(String, MessageKind, String)>,
}

impl SignalingWriter {
    /// Failed `chat-signal` sends are reported on `failures`; others are only logged.
    pub fn spawn(
        channel: Arc<dyn P2PSignalingChannel>,
        failures: mpsc::UnboundedSender<(String, Error)>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, MessageKind, String)>();
        spawn(async move {
            while let Some((peer, kind, message)) = rx.recv().await {
                trace!("-> {} {}", peer, kind.as_str());
                if let Err(err) = channel.send_message(&peer, &message).await {
                    warn!("sending {} to {} failed: {}", kind.as_str(), peer, err);
                    if kind == MessageKind::Signal {
                        let _ = failures.send((peer, Error::transport(err)));
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn send(&self, peer: &str, kind: MessageKind, data: Value) {
        let _ = self.tx.send((peer.to_owned(), kind, encode(kind, data)));
    }
}
