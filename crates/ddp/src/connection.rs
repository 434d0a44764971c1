//! Connection state machine.
//!
//! One connection runs as three tasks:
//!
//! - the **reader** decodes frames, answers `ping`, tracks the pong deadline
//!   and forwards everything else in arrival order;
//! - the **writer** is the only code touching the sink: it drains the bounded
//!   outbound queue in order, batches what is already queued, and sends the
//!   keepalive `ping`;
//! - the **dispatch loop** (the caller's task) owns the handshake state, the
//!   subscriptions and the merge box, and applies publication writes.
//!
//! States: `New -> Handshaking -> Connected -> Closed`. Everything that ends
//! the connection goes through one teardown path: stop all subscriptions,
//! unregister, drain or abandon the outbound queue, close the sink.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, TransportError};
use crate::id::random_id;
use crate::method::{MethodCompletion, MethodInvocation, UserIdCell};
use crate::protocol::{
    ClientMessage, ServerMessage, decode_client_message, encode_server_hello,
    encode_server_message,
};
use crate::publication::{CommandReceiver, PublicationCommand, command_channel};
use crate::server::Server;
use crate::subscription::SubscriptionManager;
use crate::transport::Frame;

/// Frames written per flush when the outbound queue is backed up.
const MAX_WRITE_BATCH: usize = 64;

/// Attempts at drawing a session id not held by a live connection.
const MAX_SESSION_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    New,
    Handshaking,
    Connected,
    Closed,
}

enum Outbound {
    Text(String),
    /// Flush everything before this, then close the sink.
    Close,
}

/// Producer side of the outbound queue.
#[derive(Clone)]
struct Outbox {
    tx: mpsc::Sender<Outbound>,
    write_wait: Duration,
    close: CancellationToken,
}

impl Outbox {
    async fn send(&self, message: &ServerMessage) -> Result<(), ConnectionError> {
        let text = encode_server_message(message)?;
        self.push(Outbound::Text(text)).await
    }

    /// Enqueue one item. Not getting a slot within `write_wait` is fatal for
    /// the connection.
    async fn push(&self, item: Outbound) -> Result<(), ConnectionError> {
        match self.tx.send_timeout(item, self.write_wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.close.cancel();
                Err(ConnectionError::Backpressure)
            }
            Err(SendTimeoutError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }
}

enum Inbound {
    Message(ClientMessage),
    /// Undecodable frame; the reader has stopped.
    Invalid {
        error: ConnectionError,
        raw: Option<String>,
    },
}

/// How the dispatch loop ended.
enum Disconnect {
    /// Peer went away or the connection was cancelled.
    Ended,
    /// Flush queued envelopes, then close.
    Graceful(ConnectionError),
    /// Close without flushing.
    Fatal(ConnectionError),
}

impl From<ConnectionError> for Disconnect {
    fn from(err: ConnectionError) -> Self {
        Disconnect::Fatal(err)
    }
}

/// Serve one accepted connection until it closes.
///
/// `reader` yields inbound frames, `writer` accepts outbound ones. Returns
/// once every task of the connection has finished and it has left the
/// registry.
pub async fn serve_connection<R, W>(
    server: Arc<Server>,
    reader: R,
    writer: W,
    peer: Option<SocketAddr>,
) where
    R: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    W: Sink<Frame, Error = TransportError> + Send + 'static,
{
    let config = server.options().connection.clone();
    let close = CancellationToken::new();
    let mut writer = Box::pin(writer);

    let Some(conn_id) = server.registry().register(peer, close.clone()).await else {
        let _ = time::timeout(config.write_wait, writer.close()).await;
        return;
    };
    debug!(conn_id, ?peer, "connection accepted");

    let (out_tx, out_rx) = mpsc::channel(config.outbound_queue_size);
    let outbox = Outbox {
        tx: out_tx,
        write_wait: config.write_wait,
        close: close.clone(),
    };
    let mut writer_task = tokio::spawn(write_loop(writer, out_rx, config.clone(), close.clone()));

    let (commands_tx, commands_rx) = command_channel(config.command_queue_size, close.clone());
    let mut connection = Connection {
        server: server.clone(),
        conn_id,
        outbox: outbox.clone(),
        close: close.clone(),
        state: ConnectionState::New,
        session: None,
        user: UserIdCell::default(),
        subscriptions: SubscriptionManager::new(commands_tx),
        commands: commands_rx,
    };

    let mut reader_task: Option<JoinHandle<Result<(), ConnectionError>>> = None;
    let disconnect = match connection.greet().await {
        Ok(()) => {
            let (in_tx, in_rx) = mpsc::channel(config.inbound_queue_size);
            let reader_close = close.clone();
            let reader_outbox = outbox.clone();
            let reader_config = config.clone();
            reader_task = Some(tokio::spawn(async move {
                let result = read_loop(
                    Box::pin(reader),
                    in_tx,
                    reader_outbox,
                    reader_config,
                    reader_close.clone(),
                )
                .await;
                if result.is_err() {
                    reader_close.cancel();
                }
                result
            }));
            connection.run(in_rx).await
        }
        Err(err) => Disconnect::Fatal(err),
    };

    // ==================== Teardown ====================

    if !connection.subscriptions.is_empty() {
        debug!(
            conn_id,
            subscriptions = connection.subscriptions.len(),
            "stopping subscriptions"
        );
    }
    connection.subscriptions.stop_all();
    connection.state = ConnectionState::Closed;
    server.registry().unregister(conn_id).await;

    let mut reason = match disconnect {
        Disconnect::Ended => None,
        Disconnect::Graceful(err) => Some(err),
        Disconnect::Fatal(err) => {
            close.cancel();
            Some(err)
        }
    };
    if !close.is_cancelled() {
        let _ = outbox.push(Outbound::Close).await;
    }
    drop(outbox);
    drop(connection.outbox);

    let writer_result = match time::timeout(config.write_wait, &mut writer_task).await {
        Ok(joined) => joined.ok(),
        Err(_) => {
            close.cancel();
            writer_task.await.ok()
        }
    };
    close.cancel();

    if let Some(task) = reader_task {
        task.abort();
        if let Ok(Err(err)) = task.await {
            reason.get_or_insert(err);
        }
    }
    if let Some(Err(err)) = writer_result {
        reason.get_or_insert(err);
    }

    let session = connection.session.as_deref().unwrap_or("-");
    match reason {
        Some(err) => info!(conn_id, session, "connection closed: {}", err),
        None => info!(conn_id, session, "connection closed"),
    }
}

struct Connection {
    server: Arc<Server>,
    conn_id: u64,
    outbox: Outbox,
    close: CancellationToken,
    state: ConnectionState,
    session: Option<String>,
    user: UserIdCell,
    subscriptions: SubscriptionManager,
    commands: CommandReceiver,
}

impl Connection {
    /// Send the `{server_id}` greeting; the connection then waits for `connect`.
    async fn greet(&mut self) -> Result<(), ConnectionError> {
        let hello = encode_server_hello(&self.server.options().server_id)?;
        self.outbox.push(Outbound::Text(hello)).await?;
        self.state = ConnectionState::Handshaking;
        Ok(())
    }

    async fn run(&mut self, mut inbound: mpsc::Receiver<Inbound>) -> Disconnect {
        loop {
            let step = tokio::select! {
                biased;
                _ = self.close.cancelled() => return Disconnect::Ended,
                Some(command) = self.commands.recv() => self.apply_publication(command).await,
                message = inbound.recv() => match message {
                    None => return Disconnect::Ended,
                    Some(Inbound::Message(message)) => self.dispatch(message).await,
                    Some(Inbound::Invalid { error, raw }) => self.reject(error, raw).await,
                },
            };
            if let Err(disconnect) = step {
                return disconnect;
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<(), Disconnect> {
        debug!(conn_id = self.conn_id, kind = message.kind(), "dispatch");
        match (self.state, message) {
            (ConnectionState::Handshaking, ClientMessage::Connect { version, support, .. }) => {
                self.handshake(version, support).await
            }
            (ConnectionState::Connected, message @ ClientMessage::Connect { .. }) => {
                self.protocol_error("Already connected", &message).await
            }
            // Keepalive is handled by the reader
            (_, ClientMessage::Ping { .. } | ClientMessage::Pong { .. }) => Ok(()),
            (
                ConnectionState::Connected,
                ClientMessage::Method {
                    id,
                    method,
                    params,
                    random_seed,
                },
            ) => self.call_method(id, method, params, random_seed).await,
            (ConnectionState::Connected, ClientMessage::Sub { id, name, params }) => {
                let server = self.server.clone();
                let session = self.session.clone().unwrap_or_default();
                if let Some(reply) = self.subscriptions.subscribe(
                    server.publications(),
                    id,
                    name,
                    params,
                    &session,
                    self.user.get(),
                ) {
                    self.outbox.send(&reply).await?;
                }
                Ok(())
            }
            (ConnectionState::Connected, ClientMessage::Unsub { id }) => {
                for event in self.subscriptions.unsubscribe(&id) {
                    self.outbox.send(&event).await?;
                }
                Ok(())
            }
            (_, message) => self.protocol_error("Must connect first", &message).await,
        }
    }

    async fn handshake(&mut self, version: String, support: Vec<String>) -> Result<(), Disconnect> {
        let server = self.server.clone();
        let options = server.options();

        if !options.accepts_version(&version, &support) {
            let proposed = options.negotiate_fallback(&support);
            info!(
                conn_id = self.conn_id,
                requested = %version,
                proposed = %proposed,
                "handshake failed"
            );
            self.outbox
                .send(&ServerMessage::Failed { version: proposed })
                .await?;
            return Err(Disconnect::Graceful(ConnectionError::HandshakeFailed {
                requested: version,
            }));
        }

        let mut session = None;
        for _ in 0..MAX_SESSION_ATTEMPTS {
            let candidate = random_id(options.connection.session_id_length);
            if server
                .registry()
                .claim_session(self.conn_id, candidate.clone())
                .await
            {
                session = Some(candidate);
                break;
            }
            warn!(conn_id = self.conn_id, "session id already in use, regenerating");
        }
        let session = session.ok_or(ConnectionError::SessionUnavailable)?;

        self.session = Some(session.clone());
        self.state = ConnectionState::Connected;
        self.outbox
            .send(&ServerMessage::Connected {
                session: session.clone(),
            })
            .await?;
        info!(conn_id = self.conn_id, session = %session, version = %version, "client connected");
        Ok(())
    }

    async fn call_method(
        &mut self,
        id: String,
        method: String,
        params: Vec<Value>,
        random_seed: Option<Value>,
    ) -> Result<(), Disconnect> {
        let invocation = MethodInvocation::new(
            id.clone(),
            method.clone(),
            params,
            random_seed,
            self.session.clone().unwrap_or_default(),
            self.user.clone(),
        );
        let mut completion = MethodCompletion::new(id);
        let server = self.server.clone();
        let close = self.close.clone();

        let outcome = tokio::select! {
            _ = close.cancelled() => return Err(Disconnect::Ended),
            outcome = server.methods().invoke(invocation) => outcome,
        };
        if let Err(err) = &outcome {
            debug!(conn_id = self.conn_id, method = %method, "method failed: {}", err);
        }
        if let Some(result) = completion.result(outcome) {
            self.outbox.send(&result).await?;
        }

        // Publication writes queued while the method ran go out before `updated`
        while let Ok(command) = self.commands.try_recv() {
            self.apply_publication(command).await?;
        }
        if let Some(updated) = completion.updated() {
            self.outbox.send(&updated).await?;
        }
        debug_assert!(completion.is_complete());
        Ok(())
    }

    async fn apply_publication(&mut self, command: PublicationCommand) -> Result<(), Disconnect> {
        for event in self.subscriptions.apply(command) {
            self.outbox.send(&event).await?;
        }
        Ok(())
    }

    /// Recoverable protocol misuse: report it, keep the connection.
    async fn protocol_error(
        &mut self,
        reason: &str,
        message: &ClientMessage,
    ) -> Result<(), Disconnect> {
        debug!(conn_id = self.conn_id, kind = message.kind(), "{}", reason);
        self.outbox
            .send(&ServerMessage::Error {
                reason: reason.to_string(),
                offending_message: serde_json::to_value(message).ok(),
            })
            .await?;
        Ok(())
    }

    /// Undecodable envelope: best-effort `error`, then close.
    async fn reject(
        &mut self,
        error: ConnectionError,
        raw: Option<String>,
    ) -> Result<(), Disconnect> {
        warn!(conn_id = self.conn_id, "bad request: {}", error);
        let offending_message = raw.and_then(|raw| serde_json::from_str::<Value>(&raw).ok());
        self.outbox
            .send(&ServerMessage::Error {
                reason: "Bad request".to_string(),
                offending_message,
            })
            .await?;
        Err(Disconnect::Graceful(error))
    }
}

// ==================== Reader ====================

async fn read_loop<S>(
    mut stream: S,
    inbound: mpsc::Sender<Inbound>,
    outbox: Outbox,
    config: ConnectionConfig,
    close: CancellationToken,
) -> Result<(), ConnectionError>
where
    S: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    let mut deadline = Instant::now() + config.pong_wait;
    loop {
        let next = tokio::select! {
            _ = close.cancelled() => return Ok(()),
            next = time::timeout_at(deadline, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => return Err(ConnectionError::LivenessTimeout),
            Ok(None) => return Ok(()),
            Ok(Some(frame)) => frame?,
        };

        let text = match frame.into_text(config.max_message_size) {
            Ok(Some(text)) => text,
            Ok(None) => return Ok(()),
            Err(error) => {
                forward(&inbound, &close, Inbound::Invalid { error, raw: None }).await;
                return Ok(());
            }
        };
        let message = match decode_client_message(&text) {
            Ok(message) => message,
            Err(error) => {
                let invalid = Inbound::Invalid {
                    error,
                    raw: Some(text),
                };
                forward(&inbound, &close, invalid).await;
                return Ok(());
            }
        };

        match message {
            ClientMessage::Ping { id } => outbox.send(&ServerMessage::Pong { id }).await?,
            ClientMessage::Pong { .. } => deadline = Instant::now() + config.pong_wait,
            message => {
                if !forward(&inbound, &close, Inbound::Message(message)).await {
                    return Ok(());
                }
            }
        }
    }
}

/// Hand an envelope to the dispatch loop. `false` once it is gone.
async fn forward(inbound: &mpsc::Sender<Inbound>, close: &CancellationToken, item: Inbound) -> bool {
    tokio::select! {
        _ = close.cancelled() => false,
        sent = inbound.send(item) => sent.is_ok(),
    }
}

// ==================== Writer ====================

async fn write_loop<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Outbound>,
    config: ConnectionConfig,
    close: CancellationToken,
) -> Result<(), ConnectionError>
where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    let result = pump_writes(&mut sink, &mut queue, &config, &close).await;
    if result.is_err() {
        close.cancel();
    }
    let _ = time::timeout(config.write_wait, sink.close()).await;
    result
}

async fn pump_writes<S>(
    sink: &mut S,
    queue: &mut mpsc::Receiver<Outbound>,
    config: &ConnectionConfig,
    close: &CancellationToken,
) -> Result<(), ConnectionError>
where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    let ping = encode_server_message(&ServerMessage::Ping { id: None })?;
    // Fixed period, not reset by other writes: only the peer's pong moves the
    // reader's deadline, so a busy connection still needs its pings.
    let mut keepalive = time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = close.cancelled() => return Ok(()),
            _ = keepalive.tick() => {
                time::timeout(config.write_wait, sink.send(Frame::Text(ping.clone())))
                    .await
                    .map_err(|_| ConnectionError::WriteTimeout)??;
            }
            item = queue.recv() => {
                let Some(Outbound::Text(text)) = item else {
                    return Ok(());
                };
                let closing = time::timeout(config.write_wait, write_batch(sink, queue, text))
                    .await
                    .map_err(|_| ConnectionError::WriteTimeout)??;
                if closing {
                    return Ok(());
                }
            }
        }
    }
}

/// Write `first` plus whatever is already queued, then flush once. Returns
/// `true` if a close request was reached.
async fn write_batch<S>(
    sink: &mut S,
    queue: &mut mpsc::Receiver<Outbound>,
    first: String,
) -> Result<bool, TransportError>
where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    sink.feed(Frame::Text(first)).await?;
    let mut closing = false;
    for _ in 1..MAX_WRITE_BATCH {
        match queue.try_recv() {
            Ok(Outbound::Text(text)) => sink.feed(Frame::Text(text)).await?,
            Ok(Outbound::Close) => {
                closing = true;
                break;
            }
            Err(_) => break,
        }
    }
    sink.flush().await?;
    Ok(closing)
}
