pub mod ticket;
pub mod token;

use std::{collections::VecDeque, future::pending};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    select, spawn,
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ClientConfiguration,
    error::Error,
    user_agent::{PROTOCOL_VERSION, USER_AGENT},
};

use self::{
    ticket::{now_ms, ReconnectionTicket},
    token::{parse_token, Endpoint},
};

/// Delivers the acknowledgement arguments of an emitted event.
pub type Ack = oneshot::Sender<Vec<Value>>;

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Connected,
    ConnectError(String),
    Disconnected(String),
    Message { event: String, payload: Value },
}

/// A persistent named-event message channel, e.g. a Socket.IO connection.
/// Each `connect` call is a single attempt; retrying is up to the caller.
#[async_trait]
pub trait SignalingTransport: Send + 'static {
    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()>;
    async fn emit(&mut self, event: &str, payload: Option<Value>, ack: Option<Ack>) -> Result<()>;
    async fn disconnect(&mut self);
}

/// Interprets acknowledgement arguments: `["ok", data]` or `[error, reason]`.
pub fn parse_ack(args: Vec<Value>) -> std::result::Result<Value, Error> {
    let mut args = args.into_iter();
    let status = args.next().unwrap_or(Value::Null);
    let data = args.next().unwrap_or(Value::Null);
    if status.as_str() == Some("ok") {
        return Ok(data);
    }
    let reason = match data {
        Value::String(reason) => reason,
        Value::Null => status.to_string(),
        other => other.to_string(),
    };
    Err(Error::Remote { code: 0, message: reason })
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Connected(Value),
    ConnectFailed(Error),
    Reconnecting,
    Disconnected,
    Message { event: String, payload: Value },
}

/// Events of one channel instance, tagged so the owner can drop those of a replaced channel.
pub type ChannelEventSender = mpsc::UnboundedSender<(u64, ChannelEvent)>;

struct CachedMessage {
    event: String,
    payload: Option<Value>,
    ack: Option<Ack>,
}

enum ChannelCommand {
    Send(CachedMessage),
    Disconnect,
}

enum ChannelAck {
    Login(std::result::Result<Value, Error>),
    Relogin(std::result::Result<Value, Error>),
    Ticket(std::result::Result<Value, Error>),
}

#[derive(Clone, Debug)]
pub struct ChannelHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queues a message. If the channel is gone the ack is dropped, which its receiver observes.
    pub fn send(&self, event: &str, payload: Option<Value>, ack: Option<Ack>) -> bool {
        self.commands
            .send(ChannelCommand::Send(CachedMessage {
                event: event.to_owned(),
                payload,
                ack,
            }))
            .is_ok()
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(ChannelCommand::Disconnect);
    }
}

pub struct SignalingChannel {
    generation: u64,
    transport: Box<dyn SignalingTransport>,
    endpoint: Endpoint,
    token: String,
    config: ClientConfiguration,
    events: ChannelEventSender,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    ack_tx: mpsc::UnboundedSender<ChannelAck>,
    logged_in: bool,
    /// Transport connected and the session (re)established.
    ready: bool,
    reconnect_attempts: u32,
    ticket: Option<ReconnectionTicket>,
    cache: VecDeque<CachedMessage>,
    refresh_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    finished: bool,
}

impl SignalingChannel {
    /// Starts connecting in a new task. Fails only if the token cannot be decoded.
    pub fn spawn(
        generation: u64,
        transport: Box<dyn SignalingTransport>,
        token: &str,
        config: ClientConfiguration,
        events: ChannelEventSender,
    ) -> crate::Result<ChannelHandle> {
        let endpoint = parse_token(token)?;
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let channel = Self {
            generation,
            transport,
            endpoint,
            token: token.to_owned(),
            config,
            events,
            transport_tx,
            ack_tx,
            logged_in: false,
            ready: false,
            reconnect_attempts: 0,
            ticket: None,
            cache: VecDeque::new(),
            refresh_at: None,
            reconnect_at: None,
            finished: false,
        };
        spawn(channel.run(transport_rx, ack_rx, command_rx));
        Ok(ChannelHandle {
            generation,
            commands: command_tx,
        })
    }

    async fn run(
        mut self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut ack_rx: mpsc::UnboundedReceiver<ChannelAck>,
        mut command_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    ) {
        self.connect().await;
        while !self.finished {
            select! {
                Some(event) = transport_rx.recv() => self.on_transport_event(event).await,
                Some(ack) = ack_rx.recv() => self.on_ack(ack).await,
                command = command_rx.recv() => match command {
                    Some(ChannelCommand::Send(msg)) => self.send(msg).await,
                    Some(ChannelCommand::Disconnect) | None => {
                        debug!("disconnect requested");
                        self.trigger_disconnected().await;
                    }
                },
                _ = sleep_until_some(self.refresh_at) => {
                    self.refresh_at = None;
                    self.refresh_ticket().await;
                }
                _ = sleep_until_some(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
            }
        }
        trace!("signaling channel {} finished", self.generation);
    }

    fn emit_event(&self, event: ChannelEvent) {
        let _ = self.events.send((self.generation, event));
    }

    async fn connect(&mut self) {
        debug!("connecting to {}", self.endpoint.url());
        let result = self
            .transport
            .connect(&self.endpoint, self.transport_tx.clone())
            .await;
        if let Err(err) = result {
            self.on_connection_lost(err.to_string()).await;
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if self.logged_in {
                    self.relogin().await;
                } else {
                    self.login().await;
                }
            }
            TransportEvent::ConnectError(reason) | TransportEvent::Disconnected(reason) => {
                self.ready = false;
                self.on_connection_lost(reason).await;
            }
            TransportEvent::Message { event, payload } => {
                if event == "drop" {
                    info!("dropped by server");
                    self.trigger_disconnected().await;
                    return;
                }
                self.emit_event(ChannelEvent::Message { event, payload });
            }
        }
    }

    async fn on_connection_lost(&mut self, reason: String) {
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!("giving up after {} attempts: {}", self.reconnect_attempts, reason);
            if self.logged_in {
                self.trigger_disconnected().await;
            } else {
                self.emit_event(ChannelEvent::ConnectFailed(Error::Transport(reason)));
                self.finish().await;
            }
            return;
        }
        self.reconnect_attempts += 1;
        debug!("connection lost ({}), attempt {}", reason, self.reconnect_attempts);
        if self.logged_in && self.reconnect_attempts == 1 {
            self.emit_event(ChannelEvent::Reconnecting);
        }
        self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay());
    }

    fn request_ack(&self, map: fn(std::result::Result<Value, Error>) -> ChannelAck) -> Ack {
        let (tx, rx) = oneshot::channel();
        let ack_tx = self.ack_tx.clone();
        spawn(async move {
            // A dropped ack means the connection went away; that is reported separately.
            if let Ok(args) = rx.await {
                let _ = ack_tx.send(map(parse_ack(args)));
            }
        });
        tx
    }

    async fn login(&mut self) {
        let payload = json!({
            "token": self.token,
            "userAgent": *USER_AGENT,
            "protocol": PROTOCOL_VERSION,
        });
        let ack = self.request_ack(ChannelAck::Login);
        if let Err(err) = self.transport.emit("login", Some(payload), Some(ack)).await {
            self.on_connection_lost(err.to_string()).await;
        }
    }

    async fn relogin(&mut self) {
        let Some(ticket) = self
            .ticket
            .as_ref()
            .filter(|ticket| !ticket.is_expired(now_ms()))
        else {
            warn!("no valid reconnection ticket");
            self.trigger_disconnected().await;
            return;
        };
        let payload = Value::String(ticket.raw().to_owned());
        let ack = self.request_ack(ChannelAck::Relogin);
        if let Err(err) = self.transport.emit("relogin", Some(payload), Some(ack)).await {
            self.on_connection_lost(err.to_string()).await;
        }
    }

    async fn on_ack(&mut self, ack: ChannelAck) {
        match ack {
            ChannelAck::Login(Ok(info)) => {
                info!("login ok");
                self.logged_in = true;
                self.ready = true;
                self.reconnect_attempts = 0;
                match info.get("reconnectionTicket").and_then(|x| x.as_str()) {
                    Some(raw) => self.store_ticket(raw),
                    None => warn!("login ack without reconnection ticket"),
                }
                self.emit_event(ChannelEvent::Connected(info));
                self.flush_cache().await;
            }
            ChannelAck::Login(Err(err)) => {
                warn!("login failed: {}", err);
                self.emit_event(ChannelEvent::ConnectFailed(err));
                self.finish().await;
            }
            ChannelAck::Relogin(Ok(ticket)) => {
                self.reconnect_attempts = 0;
                self.ready = true;
                match ticket.as_str() {
                    Some(raw) => self.store_ticket(raw),
                    None => warn!("relogin ack without ticket"),
                }
                debug!("relogin ok, flushing {} cached messages", self.cache.len());
                self.flush_cache().await;
            }
            ChannelAck::Relogin(Err(err)) => {
                warn!("relogin failed: {}", err);
                self.trigger_disconnected().await;
            }
            ChannelAck::Ticket(Ok(ticket)) => match ticket.as_str() {
                Some(raw) => self.store_ticket(raw),
                None => self.schedule_fallback_refresh(),
            },
            ChannelAck::Ticket(Err(err)) => {
                warn!("refreshing reconnection ticket failed: {}", err);
                self.schedule_fallback_refresh();
            }
        }
    }

    fn store_ticket(&mut self, raw: &str) {
        let ticket = ReconnectionTicket::parse(raw);
        let delay = ticket.refresh_delay(now_ms(), self.config.ticket_refresh_fallback());
        trace!("refreshing reconnection ticket in {:?}", delay);
        self.refresh_at = Some(Instant::now() + delay);
        self.ticket = Some(ticket);
    }

    fn schedule_fallback_refresh(&mut self) {
        self.refresh_at = Some(Instant::now() + self.config.ticket_refresh_fallback());
    }

    async fn refresh_ticket(&mut self) {
        if !self.ready {
            // The next relogin issues a fresh ticket.
            return;
        }
        let ack = self.request_ack(ChannelAck::Ticket);
        if let Err(err) = self
            .transport
            .emit("refreshReconnectionTicket", None, Some(ack))
            .await
        {
            warn!("requesting reconnection ticket failed: {}", err);
        }
    }

    async fn send(&mut self, msg: CachedMessage) {
        if !self.ready {
            trace!("caching {}", msg.event);
            self.cache.push_back(msg);
            return;
        }
        self.emit_message(msg).await;
    }

    async fn emit_message(&mut self, msg: CachedMessage) {
        let CachedMessage {
            event,
            payload,
            ack,
        } = msg;
        if let Err(err) = self.transport.emit(&event, payload, ack).await {
            warn!("emit {} failed: {}", event, err);
        }
    }

    async fn flush_cache(&mut self) {
        while let Some(msg) = self.cache.pop_front() {
            self.emit_message(msg).await;
        }
    }

    async fn trigger_disconnected(&mut self) {
        // Dropping the cached acks fails the callers waiting on them.
        self.cache.clear();
        self.ticket = None;
        self.logged_in = false;
        self.reconnect_attempts = 0;
        self.emit_event(ChannelEvent::Disconnected);
        self.finish().await;
    }

    async fn finish(&mut self) {
        self.ready = false;
        self.refresh_at = None;
        self.reconnect_at = None;
        self.finished = true;
        self.transport.disconnect().await;
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
