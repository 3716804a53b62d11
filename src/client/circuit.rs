use std::{
    cmp::max,
    collections::{HashMap, VecDeque},
    fmt::Display,
    future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    io::{self, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, oneshot, watch},
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{Instrument, debug, debug_span, error, info, trace, warn};

use crate::{
    client::{
        ClientError,
        channel::{ChannelCore, ChannelInfo, ChannelLink},
        ids::IdTable,
        subscription::SubscriptionShared,
    },
    config::Config,
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType},
    messages::{
        self, CommandCodec, ErrorCondition, Handshake, HandshakeError, Incoming, Message,
        encode_all,
    },
};

/// Circuits are shared by every channel on the same server at the same priority
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    pub address: SocketAddr,
    pub priority: u16,
}

impl Display for CircuitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (priority {})", self.address, self.priority)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Gave up reconnecting; the circuit will not be used again
    Dead,
}

pub(crate) enum CircuitRequest {
    Attach(Arc<ChannelCore>),
    Detach {
        cid: u32,
    },
    Read {
        cid: u32,
        data_type: DbrType,
        deadline: Instant,
        reply: oneshot::Sender<Result<Dbr, ClientError>>,
    },
    Write {
        cid: u32,
        value: Dbr,
        deadline: Instant,
        /// `None` asks the server not to acknowledge
        reply: Option<oneshot::Sender<Result<(), ClientError>>>,
    },
    Subscribe {
        cid: u32,
        handle: u64,
    },
    Unsubscribe {
        cid: u32,
        handle: u64,
    },
}

impl std::fmt::Debug for CircuitRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attach(core) => write!(f, "Attach({})", core.name),
            Self::Detach { cid } => write!(f, "Detach({cid})"),
            Self::Read { cid, data_type, .. } => write!(f, "Read({cid}, {data_type})"),
            Self::Write { cid, reply, .. } => {
                write!(f, "Write({cid}, notify={})", reply.is_some())
            }
            Self::Subscribe { cid, handle } => write!(f, "Subscribe({cid}, {handle})"),
            Self::Unsubscribe { cid, handle } => write!(f, "Unsubscribe({cid}, {handle})"),
        }
    }
}

/// Things a circuit reports back to its context
#[derive(Debug)]
pub(crate) enum CircuitEvent {
    /// The circuit gave up; these channels need a new server
    Dead {
        key: CircuitKey,
        id: u64,
        channels: Vec<Arc<ChannelCore>>,
    },
    /// The server disowned a channel
    ChannelLost(Arc<ChannelCore>),
}

/// The context's handle on a running circuit task
#[derive(Debug, Clone)]
pub(crate) struct CircuitHandle {
    pub key: CircuitKey,
    pub id: u64,
    requests: mpsc::Sender<CircuitRequest>,
    state: watch::Receiver<CircuitState>,
    cancel: CancellationToken,
}

impl CircuitHandle {
    pub fn spawn(
        key: CircuitKey,
        id: u64,
        config: Arc<Config>,
        events: mpsc::UnboundedSender<CircuitEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(64);
        let (state_tx, state) = watch::channel(CircuitState::Unconnected);
        let now = Instant::now();
        let internal = CircuitInternal {
            key,
            id,
            config,
            requests_tx: requests_tx.clone(),
            requests_rx,
            events,
            state: state_tx,
            cancel: cancel.clone(),
            channels: IdTable::default(),
            pending: IdTable::default(),
            subscriptions: IdTable::default(),
            restart_queue: VecDeque::new(),
            next_restart_at: now,
            last_received_message_at: now,
            last_echo_sent_at: now,
            failed_attempts: 0,
        };
        let span = debug_span!("circuit", server = %key.address, priority = key.priority);
        tokio::spawn(internal.run().instrument(span));
        CircuitHandle {
            key,
            id,
            requests: requests_tx,
            state,
            cancel,
        }
    }

    pub async fn attach(&self, core: Arc<ChannelCore>) -> Result<(), ClientError> {
        self.requests
            .send(CircuitRequest::Attach(core))
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    pub fn state(&self) -> CircuitState {
        *self.state.borrow()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
struct CircuitChannel {
    core: Arc<ChannelCore>,
    server_id: Option<u32>,
    native: Option<(DbrBasicType, u32)>,
    /// Subscription handle to server subscription id, for subscriptions live on the server
    active: HashMap<u64, u32>,
    /// Subscriptions have to be restarted, paced, once the channel reconnects
    needs_restart: bool,
}

enum PendingKind {
    Read(oneshot::Sender<Result<Dbr, ClientError>>),
    Write(oneshot::Sender<Result<(), ClientError>>),
}

struct PendingIo {
    cid: u32,
    deadline: Instant,
    kind: PendingKind,
}

impl PendingIo {
    fn fail(self, error: ClientError) {
        match self.kind {
            PendingKind::Read(reply) => {
                let _ = reply.send(Err(error));
            }
            PendingKind::Write(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }

    fn timed_out(self) {
        let error = match self.kind {
            PendingKind::Read(_) => ClientError::ChannelReadError,
            PendingKind::Write(_) => ClientError::WriteTimeout,
        };
        self.fail(error);
    }
}

#[derive(Debug)]
struct ActiveSubscription {
    cid: u32,
    handle: u64,
    shared: Arc<SubscriptionShared>,
    /// Sent EVENT_CANCEL, waiting for the server to confirm
    cancelling: bool,
}

/// Why a connected session ended
enum SessionEnd {
    Cancelled,
    Lost,
}

type FramedStream = FramedRead<OwnedReadHalf, CommandCodec>;

/// Open the TCP connection and run the version handshake
async fn connect(
    key: CircuitKey,
    config: &Config,
) -> Result<(FramedStream, OwnedWriteHalf, u16), ClientError> {
    let timed_out = || io::Error::new(io::ErrorKind::TimedOut, "connection timed out");
    let tcp = tokio::time::timeout(config.connection_timeout, TcpStream::connect(key.address))
        .await
        .map_err(|_| timed_out())??;
    tcp.set_nodelay(true)?;
    let (reader, mut writer) = tcp.into_split();
    // Allow for the DBR metadata on top of the largest array
    let codec = CommandCodec::client(config.max_array_bytes + 64);
    let mut framed = FramedRead::with_capacity(reader, codec, 16384usize);

    let mut handshake = Handshake::new(key.priority, &config.client_name, &config.host_name);
    let opening: Vec<Message> = std::iter::from_fn(|| handshake.next_handshake_command()).collect();
    writer.write_all(&encode_all(&opening)).await?;

    let reply = tokio::time::timeout(config.connection_timeout, framed.next())
        .await
        .map_err(|_| timed_out())?;
    let message = match reply {
        None => return Err(HandshakeError::Closed.into()),
        Some(Err(e)) => return Err(HandshakeError::Malformed(e.to_string()).into()),
        Some(Ok(Incoming::Malformed { error, .. })) => {
            return Err(HandshakeError::Malformed(error.to_string()).into());
        }
        Some(Ok(Incoming::Message(message))) => message,
    };
    let complete = handshake.on_handshake_response(message)?;
    Ok((framed, writer, complete.server_version))
}

/// Write everything the session queues, in order, until the socket fails
async fn write_messages(
    key: CircuitKey,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Vec<Message>>,
) {
    while let Some(messages) = outgoing.recv().await {
        for message in &messages {
            trace!("Sending {message:?}");
        }
        if let Err(e) = writer.write_all(&encode_all(&messages)).await {
            error!("Failed to write messages to {key}: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Inner circuit state, owned by the circuit task
struct CircuitInternal {
    key: CircuitKey,
    id: u64,
    config: Arc<Config>,
    /// Handed to channels so they can reach us directly
    requests_tx: mpsc::Sender<CircuitRequest>,
    requests_rx: mpsc::Receiver<CircuitRequest>,
    events: mpsc::UnboundedSender<CircuitEvent>,
    state: watch::Sender<CircuitState>,
    cancel: CancellationToken,
    channels: IdTable<CircuitChannel>,
    pending: IdTable<PendingIo>,
    subscriptions: IdTable<ActiveSubscription>,
    /// (cid, handle) pairs waiting for their paced restart
    restart_queue: VecDeque<(u32, u64)>,
    next_restart_at: Instant,
    last_received_message_at: Instant,
    last_echo_sent_at: Instant,
    failed_attempts: u32,
}

impl CircuitInternal {
    async fn run(mut self) {
        debug!("Starting circuit to {}", self.key);
        loop {
            self.set_state(CircuitState::Connecting);
            let config = self.config.clone();
            let connecting = connect(self.key, &config);
            tokio::pin!(connecting);
            let result = loop {
                select! {
                    _ = self.cancel.cancelled() => {
                        self.shut_down();
                        return;
                    }
                    result = &mut connecting => break result,
                    Some(request) = self.requests_rx.recv() => {
                        self.handle_request(request);
                    }
                }
            };

            match result {
                Ok((framed, writer, server_version)) => {
                    info!("Connected to {} (protocol version {server_version})", self.key);
                    self.failed_attempts = 0;
                    match self.session(framed, writer).await {
                        SessionEnd::Cancelled => {
                            self.shut_down();
                            return;
                        }
                        SessionEnd::Lost => self.on_disconnect(),
                    }
                }
                Err(e) => {
                    self.failed_attempts += 1;
                    warn!(
                        "Failed to connect to {} (attempt {}): {e}",
                        self.key, self.failed_attempts
                    );
                    if self.failed_attempts >= self.config.circuit_death_attempts {
                        self.die();
                        return;
                    }
                    self.set_state(CircuitState::Disconnected);
                    // Nothing is connected, so a failed attempt leaves channels Disconnected
                    for (_, channel) in self.channels.iter() {
                        channel.core.disconnected();
                    }
                    let retry_at = Instant::now() + self.backoff();
                    loop {
                        select! {
                            _ = self.cancel.cancelled() => {
                                self.shut_down();
                                return;
                            }
                            _ = tokio::time::sleep_until(retry_at.into()) => break,
                            Some(request) = self.requests_rx.recv() => {
                                self.handle_request(request);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Delay before the next connection attempt, doubling from the minimum search
    /// interval up to the maximum
    fn backoff(&self) -> Duration {
        let exponent = self.failed_attempts.saturating_sub(1).min(16);
        self.config
            .min_retry_search_interval
            .saturating_mul(1 << exponent)
            .min(self.config.max_retry_search_interval)
    }

    fn set_state(&self, state: CircuitState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == CircuitState::Connected
    }

    async fn session(&mut self, mut framed: FramedStream, writer: OwnedWriteHalf) -> SessionEnd {
        let now = Instant::now();
        self.last_received_message_at = now;
        self.last_echo_sent_at = now;
        self.set_state(CircuitState::Connected);
        let activity_period = self.config.connection_timeout / 2;
        let cancel = self.cancel.clone();

        // A server that stops reading must not stall deadlines, echoes or requests
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(
            write_messages(self.key, writer, outgoing_rx).instrument(tracing::Span::current()),
        );

        let mut messages_out = self.on_connected();
        let end = loop {
            if !messages_out.is_empty() && outgoing.send(messages_out).is_err() {
                break SessionEnd::Lost;
            }

            let next_timing_stop =
                max(self.last_echo_sent_at, self.last_received_message_at) + activity_period;
            let io_deadline = self.next_io_deadline();
            let restart_at = self.next_restart_at;
            let restarts_waiting = !self.restart_queue.is_empty();
            messages_out = select! {
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                _ = &mut writer_task => break SessionEnd::Lost,
                incoming = framed.next() => match incoming {
                    Some(Ok(Incoming::Message(message))) => {
                        self.last_received_message_at = Instant::now();
                        self.handle_message(message)
                    }
                    Some(Ok(Incoming::Malformed { command, error })) => {
                        self.last_received_message_at = Instant::now();
                        warn!("Skipping malformed command {command} from server: {error}");
                        Vec::new()
                    }
                    Some(Err(e)) => {
                        error!("Lost sync with server stream: {e}");
                        break SessionEnd::Lost;
                    }
                    None => {
                        debug!("Server closed the circuit");
                        break SessionEnd::Lost;
                    }
                },
                Some(request) = self.requests_rx.recv() => self.handle_request(request),
                _ = tokio::time::sleep_until(next_timing_stop.into()) => {
                    if self.last_echo_sent_at <= self.last_received_message_at {
                        self.last_echo_sent_at = Instant::now();
                        vec![Message::Echo]
                    } else {
                        // We sent an echo already, this is the termination time
                        error!("Received no reply from server, assuming connection dead");
                        break SessionEnd::Lost;
                    }
                },
                _ = io_deadline => {
                    self.expire_pending(Instant::now());
                    Vec::new()
                },
                _ = tokio::time::sleep_until(restart_at.into()), if restarts_waiting => {
                    self.restart_next_subscription()
                },
            };
        };
        // Dropping the write half closes our side of the socket
        writer_task.abort();
        end
    }

    /// Sleep until the earliest outstanding read or write deadline
    fn next_io_deadline(&self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        match self.pending.iter().map(|(_, io)| io.deadline).min() {
            None => Box::pin(future::pending()),
            Some(deadline) => Box::pin(tokio::time::sleep_until(deadline.into())),
        }
    }

    fn expire_pending(&mut self, now: Instant) {
        for (ioid, io) in self.pending.release_where(|io| io.deadline <= now) {
            debug!("Request {ioid} on channel {} timed out", io.cid);
            io.timed_out();
        }
    }

    /// Freshly connected: (re)create every channel we hold
    fn on_connected(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        for (cid, channel) in self.channels.iter() {
            if channel.core.is_closed() {
                continue;
            }
            debug!("Creating channel '{}' cid: {cid}", channel.core.name);
            messages.push(
                messages::CreateChannel {
                    client_id: cid,
                    channel_name: channel.core.name.clone(),
                    ..Default::default()
                }
                .into(),
            );
            channel.core.waiting_for_connect();
        }
        messages
    }

    fn on_disconnect(&mut self) {
        self.set_state(CircuitState::Disconnecting);
        for (_, io) in self.pending.drain() {
            io.fail(ClientError::Disconnected);
        }
        // The server forgets subscriptions along with the connection
        for (subid, subscription) in self.subscriptions.drain() {
            trace!(
                "Dropping server subscription {subid} for handle {}",
                subscription.handle
            );
        }
        self.restart_queue.clear();
        for (_, channel) in self.channels.iter_mut() {
            channel.server_id = None;
            channel.needs_restart = channel.needs_restart || !channel.active.is_empty();
            channel.active.clear();
            channel.core.disconnected();
        }
        self.set_state(CircuitState::Disconnected);
    }

    /// Give up on the server and hand every channel back to the context
    fn die(&mut self) {
        error!(
            "Circuit to {} failed {} times; giving up",
            self.key, self.failed_attempts
        );
        self.set_state(CircuitState::Dead);
        let mut channels: Vec<Arc<ChannelCore>> = self
            .channels
            .drain()
            .map(|(_, channel)| {
                channel.core.detach();
                channel.core
            })
            .collect();
        // Nothing more gets in; whatever is queued is answered here
        self.requests_rx.close();
        while let Ok(request) = self.requests_rx.try_recv() {
            match request {
                CircuitRequest::Attach(core) => channels.push(core),
                CircuitRequest::Read { reply, .. } => {
                    let _ = reply.send(Err(ClientError::Disconnected));
                }
                CircuitRequest::Write {
                    reply: Some(reply), ..
                } => {
                    let _ = reply.send(Err(ClientError::Disconnected));
                }
                _ => {}
            }
        }
        let _ = self.events.send(CircuitEvent::Dead {
            key: self.key,
            id: self.id,
            channels,
        });
    }

    /// Context is shutting down
    fn shut_down(&mut self) {
        debug!("Circuit to {} shutting down", self.key);
        for (_, io) in self.pending.drain() {
            io.fail(ClientError::ContextDisconnected);
        }
        self.subscriptions.drain().for_each(drop);
        self.channels.drain().for_each(drop);
        self.set_state(CircuitState::Disconnected);
    }

    fn handle_request(&mut self, request: CircuitRequest) -> Vec<Message> {
        trace!("Circuit request: {request:?}");
        match request {
            CircuitRequest::Attach(core) => {
                if core.is_closed() {
                    return Vec::new();
                }
                let name = core.name.clone();
                let cid = self.channels.register(CircuitChannel {
                    core: core.clone(),
                    server_id: None,
                    native: None,
                    active: HashMap::new(),
                    needs_restart: false,
                });
                core.attach(ChannelLink {
                    requests: self.requests_tx.clone(),
                    cid,
                    circuit: self.key,
                });
                if !self.is_connected() {
                    return Vec::new();
                }
                debug!("Creating channel '{name}' cid: {cid}");
                core.waiting_for_connect();
                vec![
                    messages::CreateChannel {
                        client_id: cid,
                        channel_name: name,
                        ..Default::default()
                    }
                    .into(),
                ]
            }
            CircuitRequest::Detach { cid } => self.detach_channel(cid),
            CircuitRequest::Read {
                cid,
                data_type,
                deadline,
                reply,
            } => {
                let Some((server_id, (_, native_count))) = self.connected_channel(cid) else {
                    let _ = reply.send(Err(ClientError::Disconnected));
                    return Vec::new();
                };
                let ioid = self.pending.register(PendingIo {
                    cid,
                    deadline,
                    kind: PendingKind::Read(reply),
                });
                let _span = debug_span!("handle_request", cid = cid).entered();
                debug!("Sending read request {ioid} as {data_type}");
                vec![
                    messages::ReadNotify {
                        data_type,
                        data_count: native_count,
                        server_id,
                        client_ioid: ioid,
                    }
                    .into(),
                ]
            }
            CircuitRequest::Write {
                cid,
                value,
                deadline,
                reply,
            } => {
                let Some((server_id, _)) = self.connected_channel(cid) else {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(ClientError::Disconnected));
                    }
                    return Vec::new();
                };
                let _span = debug_span!("handle_request", cid = cid).entered();
                match reply {
                    Some(reply) => {
                        let ioid = self.pending.register(PendingIo {
                            cid,
                            deadline,
                            kind: PendingKind::Write(reply),
                        });
                        debug!("Sending write request {ioid}");
                        vec![messages::Write::new(server_id, ioid, &value, true).into()]
                    }
                    None => vec![messages::Write::new(server_id, 0, &value, false).into()],
                }
            }
            CircuitRequest::Subscribe { cid, handle } => {
                let already_active = self
                    .channels
                    .get(cid)
                    .is_none_or(|channel| channel.active.contains_key(&handle));
                if already_active || self.connected_channel(cid).is_none() {
                    // Picked up when the channel connects
                    return Vec::new();
                }
                self.start_subscription(cid, handle).into_iter().collect()
            }
            CircuitRequest::Unsubscribe { cid, handle } => {
                self.restart_queue.retain(|&(_, h)| h != handle);
                let Some(channel) = self.channels.get_mut(cid) else {
                    return Vec::new();
                };
                let Some(subid) = channel.active.remove(&handle) else {
                    return Vec::new();
                };
                let server_id = channel.server_id;
                self.cancel_subscription(subid, server_id)
                    .into_iter()
                    .collect()
            }
        }
    }

    /// Server id and native type of a channel that is ready for IO
    fn connected_channel(&self, cid: u32) -> Option<(u32, (DbrBasicType, u32))> {
        let channel = self.channels.get(cid)?;
        Some((channel.server_id?, channel.native?))
    }

    fn start_subscription(&mut self, cid: u32, handle: u64) -> Option<Message> {
        let channel = self.channels.get_mut(cid)?;
        let server_id = channel.server_id?;
        let (native_type, native_count) = channel.native?;
        let shared = channel.core.subscription(handle)?;
        if shared.is_cancelled() {
            return None;
        }
        let data_type = shared
            .data_type
            .unwrap_or(DbrType::new(native_type, DbrCategory::Time));
        let mask = shared.mask;
        let subid = self.subscriptions.register(ActiveSubscription {
            cid,
            handle,
            shared,
            cancelling: false,
        });
        channel.active.insert(handle, subid);
        debug!("Starting subscription {subid} (handle {handle}) on channel {cid}");
        Some(
            messages::EventAdd {
                data_type,
                data_count: native_count,
                server_id,
                subscription_id: subid,
                mask,
            }
            .into(),
        )
    }

    /// Ask the server to stop a subscription, or just forget it if there is no server
    fn cancel_subscription(&mut self, subid: u32, server_id: Option<u32>) -> Option<Message> {
        let Some(server_id) = server_id else {
            self.subscriptions.release(subid);
            return None;
        };
        let subscription = self.subscriptions.get_mut(subid)?;
        subscription.cancelling = true;
        let data_type = subscription
            .shared
            .data_type
            .unwrap_or(DbrType::new(DbrBasicType::Long, DbrCategory::Basic));
        Some(
            messages::EventCancel {
                data_type,
                data_count: 0,
                server_id,
                subscription_id: subid,
            }
            .into(),
        )
    }

    fn detach_channel(&mut self, cid: u32) -> Vec<Message> {
        let Some(channel) = self.channels.release(cid) else {
            return Vec::new();
        };
        debug!("Clearing channel '{}' cid: {cid}", channel.core.name);
        for (_, io) in self.pending.release_where(|io| io.cid == cid) {
            io.fail(ClientError::ChannelClosed);
        }
        self.restart_queue.retain(|&(c, _)| c != cid);
        let mut messages = Vec::new();
        for subid in channel.active.values() {
            messages.extend(self.cancel_subscription(*subid, channel.server_id));
        }
        if let Some(server_id) = channel.server_id {
            messages.push(
                messages::ClearChannel {
                    server_id,
                    client_id: cid,
                }
                .into(),
            );
        }
        messages
    }

    /// Start the next queued subscription restart, if there is one still wanted
    fn restart_next_subscription(&mut self) -> Vec<Message> {
        while let Some((cid, handle)) = self.restart_queue.pop_front() {
            let wanted = self
                .channels
                .get(cid)
                .is_some_and(|channel| !channel.active.contains_key(&handle));
            if !wanted {
                continue;
            }
            if let Some(message) = self.start_subscription(cid, handle) {
                self.next_restart_at = Instant::now() + self.config.restart_subs_period;
                return vec![message];
            }
        }
        Vec::new()
    }

    fn handle_message(&mut self, message: Message) -> Vec<Message> {
        trace!("Received message: {message:?}");
        match message {
            Message::AccessRights(msg) => {
                let _span = debug_span!("handle_message", cid = &msg.client_id).entered();
                let Some(channel) = self.channels.get(msg.client_id) else {
                    debug!("Got message for closed/uncreated channel");
                    return Vec::new();
                };
                debug!("Got AccessRights update: {}", msg.access_rights);
                channel.core.set_access(msg.access_rights);
                Vec::new()
            }
            Message::CreateChannelResponse(msg) => {
                let _span = debug_span!("handle_message", cid = &msg.client_id).entered();
                let Some(channel) = self.channels.get_mut(msg.client_id) else {
                    debug!("Got message for closed/uncreated channel: {msg:?}");
                    return Vec::new();
                };
                channel.server_id = Some(msg.server_id);
                channel.native = Some((msg.data_type, msg.data_count));
                let previous = channel.core.connected(ChannelInfo {
                    native_type: msg.data_type,
                    native_count: msg.data_count,
                    server: self.key.address,
                });
                if let Some(previous) = previous
                    && previous != msg.data_type
                {
                    warn!(
                        "Channel '{}' changed native type from {previous:?} to {:?}",
                        channel.core.name, msg.data_type
                    );
                }
                let handles = channel.core.subscription_handles();
                if channel.needs_restart {
                    channel.needs_restart = false;
                    self.restart_queue
                        .extend(handles.into_iter().map(|h| (msg.client_id, h)));
                    Vec::new()
                } else {
                    handles
                        .into_iter()
                        .filter_map(|h| self.start_subscription(msg.client_id, h))
                        .collect()
                }
            }
            Message::CreateChannelFailure(msg) => {
                let Some(channel) = self.channels.release(msg.client_id) else {
                    warn!(
                        "Got channel failure message for a nonexistent channel {}",
                        msg.client_id
                    );
                    return Vec::new();
                };
                warn!("Server refused to create channel '{}'", channel.core.name);
                channel.core.create_failed();
                Vec::new()
            }
            Message::ReadNotifyResponse(msg) => {
                let Some(io) = self.pending.release(msg.client_ioid) else {
                    debug!("Dropping response to unknown or expired read {}", msg.client_ioid);
                    return Vec::new();
                };
                let PendingKind::Read(reply) = io.kind else {
                    warn!("Got ReadNotifyResponse for write request {}", msg.client_ioid);
                    return Vec::new();
                };
                let result = match ErrorCondition::from_status(msg.status) {
                    Some(ErrorCondition::Normal) => {
                        Dbr::from_bytes(msg.data_type, msg.data_count as usize, &msg.data)
                            .map_err(ClientError::from)
                    }
                    Some(condition) => Err(ClientError::Server(condition)),
                    None => Err(ClientError::Server(ErrorCondition::Internal)),
                };
                let _ = reply.send(result);
                Vec::new()
            }
            Message::WriteNotifyResponse(msg) => {
                let Some(io) = self.pending.release(msg.client_ioid) else {
                    debug!("Dropping response to unknown or expired write {}", msg.client_ioid);
                    return Vec::new();
                };
                let PendingKind::Write(reply) = io.kind else {
                    warn!("Got WriteNotifyResponse for read request {}", msg.client_ioid);
                    return Vec::new();
                };
                let result = match ErrorCondition::from_status(msg.status) {
                    Some(ErrorCondition::Normal) => Ok(()),
                    Some(condition) => Err(ClientError::Server(condition)),
                    None => Err(ClientError::Server(ErrorCondition::Internal)),
                };
                let _ = reply.send(result);
                Vec::new()
            }
            Message::EventAddResponse(msg) => self.handle_event(msg),
            Message::ServerDisconnect(msg) => {
                let cid = msg.client_id;
                let Some(channel) = self.channels.release(cid) else {
                    debug!("Server disconnected unknown channel {cid}");
                    return Vec::new();
                };
                info!("Server disconnected channel '{}'", channel.core.name);
                for (_, io) in self.pending.release_where(|io| io.cid == cid) {
                    io.fail(ClientError::Disconnected);
                }
                self.subscriptions.release_where(|s| s.cid == cid);
                self.restart_queue.retain(|&(c, _)| c != cid);
                channel.core.detach();
                let _ = self.events.send(CircuitEvent::ChannelLost(channel.core));
                Vec::new()
            }
            Message::ECAError(msg) => {
                let condition = msg.condition().unwrap_or(ErrorCondition::Internal);
                let request = &msg.original_request;
                warn!(
                    "Server error for command {}: {condition} ({})",
                    request.command, msg.error_message
                );
                match request.command {
                    15 | 19 => {
                        if let Some(io) = self.pending.release(request.field_4_parameter_2) {
                            io.fail(ClientError::Server(condition));
                        }
                    }
                    1 => {
                        let subid = request.field_4_parameter_2;
                        if let Some(subscription) = self.subscriptions.release(subid)
                            && let Some(channel) = self.channels.get_mut(subscription.cid)
                        {
                            channel.active.remove(&subscription.handle);
                        }
                    }
                    _ => {}
                }
                Vec::new()
            }
            Message::Echo => Vec::new(), // Echo just bumps our last_received message counter
            Message::Version(_) => {
                trace!("Ignoring VERSION message in normal circuit lifecycle");
                Vec::new()
            }
            Message::ClearChannel(msg) => {
                trace!("Server confirmed clearing channel {}", msg.client_id);
                Vec::new()
            }
            msg => {
                warn!("Got unexpected message from server: {msg:?}");
                Vec::new()
            }
        }
    }

    fn handle_event(&mut self, msg: messages::EventAddResponse) -> Vec<Message> {
        let subid = msg.subscription_id;
        let Some(subscription) = self.subscriptions.get(subid) else {
            trace!("Dropping event for unknown subscription {subid}");
            return Vec::new();
        };
        if msg.data.is_empty() && msg.data_count == 0 {
            // The server has ended the subscription, possibly because we asked it to
            if !subscription.cancelling {
                debug!("Server terminated subscription {subid}");
            }
            if let Some(subscription) = self.subscriptions.release(subid)
                && let Some(channel) = self.channels.get_mut(subscription.cid)
                && channel.active.get(&subscription.handle) == Some(&subid)
            {
                channel.active.remove(&subscription.handle);
            }
            return Vec::new();
        }
        if subscription.cancelling {
            return Vec::new();
        }
        match ErrorCondition::from_status(msg.status_code) {
            Some(ErrorCondition::Normal) => {}
            condition => {
                warn!("Subscription {subid} reported failure: {condition:?}");
                return Vec::new();
            }
        }
        match Dbr::from_bytes(msg.data_type, msg.data_count as usize, &msg.data) {
            Ok(dbr) => {
                trace!("Got subscription {subid} update: {dbr:?}");
                if let Some(channel) = self.channels.get(subscription.cid) {
                    channel.core.note_alarm(&dbr);
                }
                subscription.shared.push(dbr);
            }
            Err(e) => error!("Got invalid subscription response from server: {e}"),
        }
        Vec::new()
    }
}
