//! Reconnecting push channel.
//!
//! An [`EventChannel`] is a cheap, clonable handle. The connection, the
//! outbound queue and the reconnect timer are owned by one background driver
//! task; handles talk to it over an unbounded command queue, so `open`,
//! `send` and `close` never block.
//!
//! ```text
//!   Closed ──open/send──► Connecting ──ok──► Open
//!     ▲                      │                 │
//!     │◄────────fail─────────┘                 │
//!     │◄──────────────drop/error───────────────┘
//!     └── reconnect timer fires ──► Connecting
//! ```

mod dispatch;
mod message;
mod transport;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior},
};

use crate::{options::ReconnectTimer, ChannelConfig, ChannelError};

use self::dispatch::Subscribers;
pub use self::dispatch::SubscriptionId;
pub use self::message::{categories, ChannelState, InboundMessage, OrderEvent};
pub use self::transport::{Connection, Connector, WsConnector};

/// Stand-in deadline when a reconnect delay does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug)]
enum Command {
    Open,
    Send(String),
    Close,
}

/// Handle to a reconnecting push channel.
///
/// # Example
///
/// ```no_run
/// use pos_link::{categories, ChannelConfig, EventChannel, OrderEvent};
///
/// # async fn run() -> Result<(), pos_link::ChannelError> {
/// let channel = EventChannel::websocket(ChannelConfig::new("ws://localhost:8000/ws"));
/// channel.subscribe(categories::NEW_ORDER, |msg| {
///     if let Ok(event) = msg.decode::<OrderEvent>() {
///         println!("order {} is {}", event.order_id, event.status);
///     }
/// });
/// channel.open()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventChannel {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
    subscribers: Arc<Subscribers>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EventChannel {
    /// Creates a channel over `connector` and spawns its driver task.
    ///
    /// The channel starts `Closed`; nothing connects until [`open`](Self::open)
    /// or [`send`](Self::send) is called. Must be called inside a Tokio runtime.
    pub fn new<C: Connector>(connector: C, config: ChannelConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Closed);
        let subscribers = Arc::new(Subscribers::default());

        let driver = Driver {
            connector: Arc::new(connector),
            url: config.url,
            timer: ReconnectTimer::new(config.reconnect),
            ping_interval: config.ping_interval,
            queue: VecDeque::new(),
            user_closed: false,
            commands: commands_rx,
            state: state_tx,
            subscribers: Arc::clone(&subscribers),
        };
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            subscribers,
        }
    }

    /// Creates a channel over a real WebSocket connection.
    pub fn websocket(config: ChannelConfig) -> Self {
        Self::new(WsConnector, config)
    }

    /// Starts connecting. No-op while open, connecting, or waiting to reconnect.
    pub fn open(&self) -> Result<(), ChannelError> {
        self.command(Command::Open)
    }

    /// Queues `message` as a JSON text frame and delivers it once open.
    ///
    /// An idle channel that was never opened starts connecting. After
    /// [`close`](Self::close) the message stays queued until the next `open`.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), ChannelError> {
        let text = serde_json::to_string(message)?;
        self.send_text(text)
    }

    /// Queues a pre-serialized text frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.command(Command::Send(text.into()))
    }

    /// Closes the channel and cancels any pending reconnect.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.command(Command::Close)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Receiver that observes the latest state; intermediate states may be
    /// skipped. Use [`on_state_change`](Self::on_state_change) to see every
    /// transition.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Registers `handler` for inbound messages of `category`.
    pub fn subscribe<F>(&self, category: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(category.into(), Arc::new(handler))
    }

    /// Registers `handler` for every state transition.
    pub fn on_state_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(ChannelState) + Send + Sync + 'static,
    {
        self.subscribers.on_state_change(Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    fn command(&self, command: Command) -> Result<(), ChannelError> {
        self.commands
            .send(command)
            .map_err(|_| ChannelError::Shutdown)
    }
}

enum Phase {
    /// Closed with no reconnect pending.
    Idle,
    Connecting,
    Open(Box<dyn Connection>),
    /// Closed with a reconnect scheduled at the deadline.
    Waiting(Instant),
}

/// Owns the single connection, the outbound queue and the reconnect timer.
struct Driver {
    connector: Arc<dyn Connector>,
    url: String,
    timer: ReconnectTimer,
    ping_interval: Option<Duration>,
    queue: VecDeque<String>,
    user_closed: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ChannelState>,
    subscribers: Arc<Subscribers>,
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
impl Driver {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            let next = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connecting => self.connecting().await,
                Phase::Open(conn) => self.open(conn).await,
                Phase::Waiting(deadline) => self.waiting(deadline).await,
            };
            match next {
                Some(next) => phase = next,
                None => break,
            }
        }

        if !self.queue.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                undelivered = self.queue.len(),
                "channel dropped with queued messages"
            );
        }
    }

    async fn idle(&mut self) -> Option<Phase> {
        loop {
            match self.commands.recv().await? {
                Command::Open => {
                    self.user_closed = false;
                    return Some(self.begin_connect());
                }
                Command::Send(text) => {
                    self.queue.push_back(text);
                    if !self.user_closed {
                        return Some(self.begin_connect());
                    }
                }
                Command::Close => self.user_closed = true,
            }
        }
    }

    async fn connecting(&mut self) -> Option<Phase> {
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let attempt = async move { connector.connect(&url).await };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return Some(match result {
                        Ok(conn) => self.connected(conn).await,
                        Err(err) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(url = %self.url, error = %err, "connection attempt failed");
                            self.connection_lost()
                        }
                    });
                }
                command = self.commands.recv() => match command? {
                    Command::Open => {}
                    Command::Send(text) => self.queue.push_back(text),
                    Command::Close => {
                        self.user_closed = true;
                        self.transition(ChannelState::Closed);
                        return Some(Phase::Idle);
                    }
                },
            }
        }
    }

    async fn connected(&mut self, mut conn: Box<dyn Connection>) -> Phase {
        self.timer.reset();
        self.transition(ChannelState::Open);
        match self.flush(conn.as_mut()).await {
            Ok(()) => Phase::Open(conn),
            Err(_) => self.connection_lost(),
        }
    }

    async fn open(&mut self, mut conn: Box<dyn Connection>) -> Option<Phase> {
        let mut keepalive = self
            .ping_interval
            .filter(|period| !period.is_zero())
            .map(|period| {
                let now = Instant::now();
                let first = now.checked_add(period).unwrap_or_else(|| now + FAR_FUTURE);
                let mut ticker = interval_at(first, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

        loop {
            let event = tokio::select! {
                command = self.commands.recv() => OpenEvent::Command(command),
                frame = conn.next_text() => OpenEvent::Frame(frame),
                () = next_tick(&mut keepalive) => OpenEvent::Keepalive,
            };

            match event {
                OpenEvent::Command(None) => {
                    close_connection(conn.as_mut()).await;
                    self.transition(ChannelState::Closed);
                    return None;
                }
                OpenEvent::Command(Some(Command::Open)) => {}
                OpenEvent::Command(Some(Command::Send(text))) => {
                    self.queue.push_back(text);
                    if self.flush(conn.as_mut()).await.is_err() {
                        return Some(self.connection_lost());
                    }
                }
                OpenEvent::Command(Some(Command::Close)) => {
                    self.user_closed = true;
                    close_connection(conn.as_mut()).await;
                    self.transition(ChannelState::Closed);
                    return Some(Phase::Idle);
                }
                OpenEvent::Keepalive => {
                    if let Err(err) = conn.ping().await {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %err, "keepalive ping failed");
                        return Some(self.connection_lost());
                    }
                }
                OpenEvent::Frame(Some(Ok(text))) => self.dispatch(&text),
                OpenEvent::Frame(Some(Err(ChannelError::Protocol(reason)))) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%reason, "dropping undecodable frame");
                }
                OpenEvent::Frame(Some(Err(err))) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %err, "connection failed");
                    return Some(self.connection_lost());
                }
                OpenEvent::Frame(None) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("connection closed by peer");
                    return Some(self.connection_lost());
                }
            }
        }
    }

    async fn waiting(&mut self, deadline: Instant) -> Option<Phase> {
        let timer = sleep_until(deadline);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                () = &mut timer => return Some(self.begin_connect()),
                command = self.commands.recv() => match command? {
                    // a reconnect is already scheduled
                    Command::Open => {}
                    Command::Send(text) => self.queue.push_back(text),
                    Command::Close => {
                        self.user_closed = true;
                        return Some(Phase::Idle);
                    }
                },
            }
        }
    }

    fn begin_connect(&mut self) -> Phase {
        self.transition(ChannelState::Connecting);
        Phase::Connecting
    }

    /// Moves to `Closed` and schedules one reconnect.
    fn connection_lost(&mut self) -> Phase {
        self.transition(ChannelState::Closed);
        let delay = self.timer.next_delay();

        #[cfg(feature = "tracing")]
        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            queued = self.queue.len(),
            "reconnect scheduled"
        );

        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Phase::Waiting(deadline)
    }

    /// Sends queued messages in order. A message leaves the queue only after
    /// the transport accepted it.
    async fn flush(&mut self, conn: &mut dyn Connection) -> Result<(), ChannelError> {
        while let Some(text) = self.queue.front() {
            if let Err(err) = conn.send_text(text.clone()).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    error = %err,
                    queued = self.queue.len(),
                    "send failed, keeping message queued"
                );
                return Err(err);
            }
            self.queue.pop_front();
        }
        Ok(())
    }

    fn dispatch(&self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, frame = %text, "dropping malformed push message");
                return;
            }
        };

        let handled = self.subscribers.dispatch(&message);

        #[cfg(feature = "tracing")]
        tracing::debug!(category = %message.category, handled, "push message dispatched");
    }

    fn transition(&mut self, state: ChannelState) {
        if *self.state.borrow() == state {
            return;
        }
        self.state.send_replace(state);

        #[cfg(feature = "tracing")]
        tracing::debug!(?state, url = %self.url, "channel state changed");

        self.subscribers.notify_state(state);
    }
}

enum OpenEvent {
    Command(Option<Command>),
    Frame(Option<Result<String, ChannelError>>),
    Keepalive,
}

/// Waits for the next keepalive tick; never completes when pings are off.
async fn next_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
async fn close_connection(conn: &mut dyn Connection) {
    if let Err(err) = conn.close().await {
        #[cfg(feature = "tracing")]
        tracing::debug!(error = %err, "error while closing connection");
    }
}
