use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    spawn,
    sync::{broadcast, mpsc, oneshot},
    time::sleep,
};

use crate::{
    engine::SessionTag,
    error::{Error, Result},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub(crate) type Completion<T> = oneshot::Sender<Result<T>>;

pub(crate) fn complete<T>(done: Completion<T>, result: Result<T>) {
    // The caller may have stopped waiting.
    let _ = done.send(result);
}

pub(crate) fn shut_down() -> Error {
    Error::invalid_state("client has shut down")
}

/// Sends a command to an orchestrator task and waits for its completion.
pub(crate) async fn request<C, T>(
    commands: &mpsc::UnboundedSender<C>,
    command: impl FnOnce(Completion<T>) -> C,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    commands.send(command(tx)).map_err(|_| shut_down())?;
    rx.await.map_err(|_| shut_down())?
}

/// [`request`] for handles that must not keep the orchestrator running once its client is gone.
pub(crate) async fn request_weak<C, T>(
    commands: &mpsc::WeakUnboundedSender<C>,
    command: impl FnOnce(Completion<T>) -> C,
) -> Result<T> {
    let commands = commands.upgrade().ok_or_else(shut_down)?;
    request(&commands, command).await
}

/// Events a handle's subscribers may fall behind by before missing some.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Ended flag plus event fan-out shared by a handle and the orchestrator that drives it.
pub(crate) struct Lifecycle<E> {
    ended: AtomicBool,
    events: broadcast::Sender<E>,
}

impl<E: Clone> Lifecycle<E> {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            ended: AtomicBool::new(false),
            events,
        })
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: E) {
        if self.is_ended() {
            return;
        }
        let _ = self.events.send(event);
    }

    /// Emits `event` and marks the lifecycle ended, the first time only.
    pub fn end(&self, event: E) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.events.send(event);
        true
    }
}

/// Posts `message` back to the orchestrator if the offer of `round` is still unanswered after `timeout`.
pub(crate) fn arm_negotiation_timeout<I: Send + 'static>(
    timeout: Option<Duration>,
    internal: &mpsc::UnboundedSender<I>,
    tag: SessionTag,
    round: u64,
    message: fn(SessionTag, u64) -> I,
) {
    let Some(timeout) = timeout else {
        return;
    };
    let internal = internal.clone();
    spawn(async move {
        sleep(timeout).await;
        let _ = internal.send(message(tag, round));
    });
}
