use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff};
use ractor::{Actor, ActorProcessingErr, ActorRef, MessagingErr, RpcReplyPort};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::config::{RetryConfig, StoreCoordinates};
use crate::db::driver::{Connection, ConnectionSignal, Connector, DriverError};
use crate::error::StoreError;
use crate::types::{ConnectionEvent, ConnectionEventKind, ConnectionState};

/// Messages handled by the connection actor.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Connect once if not already connected and report the outcome.
    Connect(RpcReplyPort<Result<(), StoreError>>),
    /// The live connection, or a connection error while disconnected.
    Current(RpcReplyPort<Result<Arc<dyn Connection>, StoreError>>),
    State(RpcReplyPort<ConnectionState>),

    // Internal messages (sent by observers and timers)
    /// Notification forwarded from the connection opened as `generation`.
    Signal {
        generation: u64,
        signal: ConnectionSignal,
    },
    /// A scheduled reconnect delay has elapsed.
    Reconnect,
    /// Outcome of the connect attempt started as `attempt_id`.
    Opened {
        attempt_id: u64,
        attempt: usize,
        result: Result<Arc<dyn Connection>, DriverError>,
    },
}

/// Handle for interacting with the connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    actor: ActorRef<ConnectionMessage>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionHandle {
    /// Spawn a connection actor in the `Disconnected` state.
    pub async fn spawn(
        connector: Arc<dyn Connector>,
        coordinates: StoreCoordinates,
        retry: RetryConfig,
        connect_timeout: Option<Duration>,
    ) -> Result<Self, StoreError> {
        let (events, _) = broadcast::channel(64);
        let args = ConnectionArgs {
            connector,
            coordinates,
            retry,
            connect_timeout,
            events: events.clone(),
        };
        let (actor, _jh) = Actor::spawn(None, ConnectionActor, args)
            .await
            .map_err(|e| StoreError::RactorError(format!("spawn ConnectionActor failed: {e}")))?;
        Ok(Self { actor, events })
    }

    pub async fn connect(&self) -> Result<(), StoreError> {
        ractor::call!(self.actor, ConnectionMessage::Connect)
            .map_err(|e| StoreError::RactorError(format!("Connect RPC failed: {e}")))?
    }

    /// Borrow the live connection. Never waits for a reconnect.
    pub async fn current(&self) -> Result<Arc<dyn Connection>, StoreError> {
        ractor::call!(self.actor, ConnectionMessage::Current)
            .map_err(|e| StoreError::RactorError(format!("Current RPC failed: {e}")))?
    }

    pub async fn state(&self) -> Result<ConnectionState, StoreError> {
        ractor::call!(self.actor, ConnectionMessage::State)
            .map_err(|e| StoreError::RactorError(format!("State RPC failed: {e}")))
    }

    /// Lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Stop the actor; the live connection is closed on the way out.
    pub async fn shutdown(&self) {
        if let Err(e) = self.actor.stop_and_wait(None, None).await {
            warn!("ConnectionActor did not stop cleanly: {}", e);
        }
    }
}

struct ConnectionArgs {
    connector: Arc<dyn Connector>,
    coordinates: StoreCoordinates,
    retry: RetryConfig,
    connect_timeout: Option<Duration>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Internal state held by the connection actor.
struct ConnectionActorState {
    connector: Arc<dyn Connector>,
    coordinates: StoreCoordinates,
    retry: RetryConfig,
    connect_timeout: Option<Duration>,
    events: broadcast::Sender<ConnectionEvent>,
    phase: ConnectionState,
    connection: Option<Arc<dyn Connection>>,
    /// Bumped for every opened connection so late signals from a discarded
    /// handle are ignored.
    generation: u64,
    backoff: Option<ExponentialBackoff>,
    attempts: usize,
    reconnect_pending: bool,
    /// Set from a close until a reconnect succeeds or the budget runs out.
    retrying: bool,
    /// Id of the connect attempt currently running outside the mailbox.
    in_flight: Option<u64>,
    next_attempt_id: u64,
    /// Connect callers waiting on the in-flight attempt.
    waiters: Vec<RpcReplyPort<Result<(), StoreError>>>,
}

impl ConnectionActorState {
    fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.events.send(ConnectionEvent::now(kind));
    }
}

struct ConnectionActor;

#[ractor::async_trait]
impl Actor for ConnectionActor {
    type Msg = ConnectionMessage;
    type State = ConnectionActorState;
    type Arguments = ConnectionArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!(
            host = %args.coordinates.host,
            port = args.coordinates.port,
            "ConnectionActor starting"
        );
        Ok(ConnectionActorState {
            connector: args.connector,
            coordinates: args.coordinates,
            retry: args.retry,
            connect_timeout: args.connect_timeout,
            events: args.events,
            phase: ConnectionState::Disconnected,
            connection: None,
            generation: 0,
            backoff: None,
            attempts: 0,
            reconnect_pending: false,
            retrying: false,
            in_flight: None,
            next_attempt_id: 0,
            waiters: Vec::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConnectionMessage::Connect(rp) => {
                self.handle_connect(&myself, state, rp);
            }
            ConnectionMessage::Current(rp) => {
                let current = state.connection.clone().ok_or_else(|| {
                    StoreError::Connection(format!("not connected (state: {:?})", state.phase))
                });
                let _ = rp.send(current);
            }
            ConnectionMessage::State(rp) => {
                let _ = rp.send(state.phase);
            }
            ConnectionMessage::Signal { generation, signal } => {
                self.handle_signal(&myself, state, generation, signal);
            }
            ConnectionMessage::Reconnect => {
                self.handle_reconnect(&myself, state);
            }
            ConnectionMessage::Opened {
                attempt_id,
                attempt,
                result,
            } => {
                self.handle_opened(&myself, state, attempt_id, attempt, result)
                    .await;
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.generation += 1;
        state.in_flight = None;
        if let Some(conn) = state.connection.take() {
            conn.close().await;
            info!("Connection closed on shutdown");
        }
        state.phase = ConnectionState::Disconnected;
        Ok(())
    }
}

impl ConnectionActor {
    fn handle_connect(
        &self,
        myself: &ActorRef<ConnectionMessage>,
        state: &mut ConnectionActorState,
        rp: RpcReplyPort<Result<(), StoreError>>,
    ) {
        if state.connection.is_some() {
            debug!("Connect requested while connected; reusing live connection");
            let _ = rp.send(Ok(()));
            return;
        }
        state.waiters.push(rp);
        if state.in_flight.is_none() {
            self.start_attempt(myself, state, 0);
        }
    }

    /// Start one connection attempt in its own task. The mailbox keeps being
    /// served meanwhile; the outcome comes back as `Opened`.
    fn start_attempt(
        &self,
        myself: &ActorRef<ConnectionMessage>,
        state: &mut ConnectionActorState,
        attempt: usize,
    ) {
        state.next_attempt_id += 1;
        let attempt_id = state.next_attempt_id;
        state.in_flight = Some(attempt_id);
        state.phase = ConnectionState::Connecting;
        state.emit(ConnectionEventKind::Connecting { attempt });
        info!(
            host = %state.coordinates.host,
            port = state.coordinates.port,
            attempt,
            "Connecting to store"
        );

        let connector = state.connector.clone();
        let coordinates = state.coordinates.clone();
        let limit = state.connect_timeout;
        let myself = myself.clone();
        tokio::spawn(async move {
            let result = connect_once(connector.as_ref(), &coordinates, limit).await;
            let opened = ConnectionMessage::Opened {
                attempt_id,
                attempt,
                result,
            };
            // The actor stopped while we were connecting.
            if let Err(MessagingErr::SendErr(ConnectionMessage::Opened {
                result: Ok(conn), ..
            })) = myself.cast(opened)
            {
                conn.close().await;
            }
        });
    }

    async fn handle_opened(
        &self,
        myself: &ActorRef<ConnectionMessage>,
        state: &mut ConnectionActorState,
        attempt_id: u64,
        attempt: usize,
        result: Result<Arc<dyn Connection>, DriverError>,
    ) {
        if state.in_flight != Some(attempt_id) {
            debug!(attempt_id, "Discarding outcome of an abandoned connect attempt");
            if let Ok(conn) = result {
                conn.close().await;
            }
            return;
        }
        state.in_flight = None;

        match result {
            Ok(conn) => {
                state.generation += 1;
                observe(myself.clone(), conn.subscribe(), state.generation);
                state.connection = Some(conn);
                state.phase = ConnectionState::Connected;
                state.backoff = None;
                state.attempts = 0;
                state.retrying = false;
                state.emit(ConnectionEventKind::Connected);
                info!(generation = state.generation, "Connected to store");
                for rp in state.waiters.drain(..) {
                    let _ = rp.send(Ok(()));
                }
            }
            Err(e) => {
                state.phase = ConnectionState::Disconnected;
                state.emit(ConnectionEventKind::Error(e.to_string()));
                warn!(attempt, "Connect attempt failed: {}", e);
                for rp in state.waiters.drain(..) {
                    let _ = rp.send(Err(StoreError::Connection(e.to_string())));
                }
                if state.reconnect_pending {
                    state.phase = ConnectionState::Reconnecting {
                        attempt: state.attempts,
                    };
                } else if state.retrying {
                    self.schedule_reconnect(myself, state);
                }
            }
        }
    }

    fn handle_signal(
        &self,
        myself: &ActorRef<ConnectionMessage>,
        state: &mut ConnectionActorState,
        generation: u64,
        signal: ConnectionSignal,
    ) {
        if generation != state.generation || state.connection.is_none() {
            debug!(generation, "Ignoring signal from a discarded connection");
            return;
        }
        match signal {
            ConnectionSignal::Error(msg) => {
                warn!("Store reported an error: {}", msg);
                state.emit(ConnectionEventKind::Error(msg));
            }
            ConnectionSignal::Closed => {
                warn!(generation, "Connection closed; scheduling reconnect");
                state.connection = None;
                state.phase = ConnectionState::Disconnected;
                state.retrying = true;
                state.emit(ConnectionEventKind::Closed);
                self.schedule_reconnect(myself, state);
            }
        }
    }

    fn schedule_reconnect(
        &self,
        myself: &ActorRef<ConnectionMessage>,
        state: &mut ConnectionActorState,
    ) {
        if state.reconnect_pending {
            return;
        }
        let policy = state.retry.policy();
        let backoff = state.backoff.get_or_insert_with(|| policy.build());
        match backoff.next() {
            Some(delay) => {
                state.attempts += 1;
                let attempt = state.attempts;
                state.reconnect_pending = true;
                state.phase = ConnectionState::Reconnecting { attempt };
                state.emit(ConnectionEventKind::ReconnectScheduled { attempt, delay });
                info!(attempt, delay = ?delay, "Reconnect scheduled");
                let _ = myself.send_after(delay, || ConnectionMessage::Reconnect);
            }
            None => {
                let attempts = state.attempts;
                error!(attempts, "Reconnect attempts exhausted; staying disconnected");
                state.phase = ConnectionState::Disconnected;
                state.backoff = None;
                state.attempts = 0;
                state.retrying = false;
                state.emit(ConnectionEventKind::GaveUp { attempts });
            }
        }
    }

    fn handle_reconnect(
        &self,
        myself: &ActorRef<ConnectionMessage>,
        state: &mut ConnectionActorState,
    ) {
        state.reconnect_pending = false;
        if state.connection.is_some() {
            debug!("Reconnect timer fired while connected; nothing to do");
            return;
        }
        if state.in_flight.is_some() {
            debug!("Reconnect timer fired during a connect attempt; waiting on it");
            return;
        }
        let attempt = state.attempts;
        self.start_attempt(myself, state, attempt);
    }
}

async fn connect_once(
    connector: &dyn Connector,
    coordinates: &StoreCoordinates,
    limit: Option<Duration>,
) -> Result<Arc<dyn Connection>, DriverError> {
    let connecting = connector.connect(coordinates);
    match limit {
        Some(limit) => tokio::time::timeout(limit, connecting)
            .await
            .unwrap_or_else(|_| {
                Err(DriverError::Disconnected(format!(
                    "connect timed out after {limit:?}"
                )))
            }),
        None => connecting.await,
    }
}

/// Forward error/close notifications of one connection to the actor.
fn observe(
    myself: ActorRef<ConnectionMessage>,
    mut signals: broadcast::Receiver<ConnectionSignal>,
    generation: u64,
) {
    tokio::spawn(async move {
        loop {
            let signal = match signals.recv().await {
                Ok(signal) => signal,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Connection observer lagged");
                    continue;
                }
                // Every sender is gone: the connection itself was dropped.
                Err(RecvError::Closed) => ConnectionSignal::Closed,
            };
            let closed = signal == ConnectionSignal::Closed;
            if ractor::cast!(myself, ConnectionMessage::Signal { generation, signal }).is_err()
                || closed
            {
                break;
            }
        }
    });
}
