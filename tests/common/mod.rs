#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use casession::{
    Context, ContextBuilder,
    dbr::DbrType,
    messages::{self, Access, CAMessage, CommandCodec, ErrorCondition, Incoming, Message, encode_all},
    pvgroup::PvGroup,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::{broadcast::error::RecvError, mpsc},
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, level_filters::LevelFilter};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A command the server received, and on which connection
#[derive(Debug, Clone)]
pub struct Received {
    pub at: Instant,
    pub connection: u64,
    pub message: Message,
}

#[derive(Debug, Default)]
struct Log {
    received: Vec<Received>,
    searches: HashMap<String, Vec<Instant>>,
}

/// A small CA server on loopback, serving a [`PvGroup`] and recording what it sees
pub struct TestServer {
    pub group: PvGroup,
    pub search_address: SocketAddr,
    pub tcp_address: SocketAddr,
    log: Arc<Mutex<Log>>,
    /// Cancelled to drop every open connection; replaced for the next ones
    connections: Arc<Mutex<CancellationToken>>,
    listening: CancellationToken,
    silent_reads: Arc<Mutex<HashSet<String>>>,
    stalls: Arc<Mutex<HashSet<String>>>,
}

impl TestServer {
    pub async fn start(group: PvGroup) -> TestServer {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = TestServer {
            group,
            search_address: udp.local_addr().unwrap(),
            tcp_address: listener.local_addr().unwrap(),
            log: Default::default(),
            connections: Arc::new(Mutex::new(CancellationToken::new())),
            listening: CancellationToken::new(),
            silent_reads: Default::default(),
            stalls: Default::default(),
        };
        tokio::spawn(answer_searches(
            udp,
            server.group.clone(),
            server.tcp_address.port(),
            server.log.clone(),
            server.listening.clone(),
        ));
        tokio::spawn(accept_connections(
            listener,
            server.group.clone(),
            server.log.clone(),
            server.connections.clone(),
            server.listening.clone(),
            server.silent_reads.clone(),
            server.stalls.clone(),
        ));
        server
    }

    /// A client context that only searches this server
    pub fn context_builder(&self) -> ContextBuilder {
        Context::builder()
            .broadcast_to(vec![self.search_address])
            .watch_beacons(false)
            .client_name("tester")
            .host_name("localhost")
    }

    pub fn searches_for(&self, name: &str) -> Vec<Instant> {
        self.log
            .lock()
            .unwrap()
            .searches
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn received(&self) -> Vec<Received> {
        self.log.lock().unwrap().received.clone()
    }

    /// Wait until the server has received a matching command
    pub async fn wait_for(&self, predicate: impl Fn(&Received) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.received().iter().any(&predicate) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Drop every open circuit, as if the server had crashed and come back
    pub fn kill_connections(&self) {
        let mut current = self.connections.lock().unwrap();
        current.cancel();
        *current = CancellationToken::new();
    }

    /// Stop answering searches and accepting connections, and drop open ones
    pub fn stop_listening(&self) {
        self.listening.cancel();
        self.kill_connections();
    }

    /// Never answer reads of this PV
    pub fn ignore_reads(&self, name: &str) {
        self.silent_reads.lock().unwrap().insert(name.to_string());
    }

    /// Stop reading from a connection once it has created this PV, leaving it open
    pub fn stall_after_create(&self, name: &str) {
        self.stalls.lock().unwrap().insert(name.to_string());
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

async fn answer_searches(
    udp: UdpSocket,
    group: PvGroup,
    tcp_port: u16,
    log: Arc<Mutex<Log>>,
    listening: CancellationToken,
) {
    let mut buf = vec![0u8; 0xFFFF];
    loop {
        let (size, from) = select! {
            biased;
            _ = listening.cancelled() => break,
            r = udp.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(_) => continue,
            },
        };
        let Ok(messages) = Message::parse_many_server_messages(&buf[..size]) else {
            continue;
        };
        let mut replies: Vec<Message> = Vec::new();
        for message in messages {
            let Message::Search(search) = message else {
                continue;
            };
            log.lock()
                .unwrap()
                .searches
                .entry(search.channel_name.clone())
                .or_default()
                .push(Instant::now());
            if group.contains(&search.channel_name) {
                if replies.is_empty() {
                    replies.push(messages::Version::default().into());
                }
                replies.push(search.respond(Some(Ipv4Addr::LOCALHOST), tcp_port).into());
            }
        }
        if !replies.is_empty() {
            let _ = udp.send_to(&encode_all(&replies), from).await;
        }
    }
}

async fn accept_connections(
    listener: TcpListener,
    group: PvGroup,
    log: Arc<Mutex<Log>>,
    connections: Arc<Mutex<CancellationToken>>,
    listening: CancellationToken,
    silent_reads: Arc<Mutex<HashSet<String>>>,
    stalls: Arc<Mutex<HashSet<String>>>,
) {
    let mut next_id = 0;
    loop {
        let stream = select! {
            biased;
            _ = listening.cancelled() => break,
            r = listener.accept() => match r {
                Ok((stream, _)) => stream,
                Err(_) => continue,
            },
        };
        if listening.is_cancelled() {
            break;
        }
        next_id += 1;
        let connection = Connection {
            id: next_id,
            group: group.clone(),
            log: log.clone(),
            silent_reads: silent_reads.clone(),
            stalls: stalls.clone(),
            channels: HashMap::new(),
            monitors: HashMap::new(),
            next_sid: 100,
        };
        let kill = connections.lock().unwrap().clone();
        tokio::spawn(connection.serve(stream, kill));
    }
    debug!("Test server stopped listening");
}

struct Connection {
    id: u64,
    group: PvGroup,
    log: Arc<Mutex<Log>>,
    silent_reads: Arc<Mutex<HashSet<String>>>,
    stalls: Arc<Mutex<HashSet<String>>>,
    /// Server id to PV name
    channels: HashMap<u32, String>,
    monitors: HashMap<u32, (DbrType, CancellationToken)>,
    next_sid: u32,
}

impl Connection {
    async fn serve(mut self, stream: TcpStream, kill: CancellationToken) {
        let (reader, mut writer) = stream.into_split();
        let mut framed = FramedRead::new(reader, CommandCodec::server(1 << 20));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Message>();
        loop {
            let mut stall = false;
            let replies = select! {
                _ = kill.cancelled() => break,
                Some(event) = events_rx.recv() => vec![event],
                incoming = framed.next() => match incoming {
                    Some(Ok(Incoming::Message(message))) => {
                        self.log.lock().unwrap().received.push(Received {
                            at: Instant::now(),
                            connection: self.id,
                            message: message.clone(),
                        });
                        if let Message::CreateChannel(create) = &message {
                            stall = self.stalls.lock().unwrap().contains(&create.channel_name);
                        }
                        self.handle(message, &events_tx)
                    }
                    Some(Ok(Incoming::Malformed { .. })) => Vec::new(),
                    _ => break,
                },
            };
            if !replies.is_empty() && writer.write_all(&encode_all(&replies)).await.is_err() {
                break;
            }
            if stall {
                debug!("Connection {} no longer reading", self.id);
                kill.cancelled().await;
                break;
            }
        }
        for (_, (_, token)) in self.monitors.drain() {
            token.cancel();
        }
    }

    fn handle(&mut self, message: Message, events: &mpsc::UnboundedSender<Message>) -> Vec<Message> {
        match message {
            Message::Version(_) => vec![messages::Version::default().into()],
            Message::CreateChannel(create) => {
                let Some((native_type, count)) = self.group.native(&create.channel_name) else {
                    return vec![
                        messages::CreateChannelFailure {
                            client_id: create.client_id,
                        }
                        .into(),
                    ];
                };
                self.next_sid += 1;
                self.channels.insert(self.next_sid, create.channel_name);
                vec![
                    messages::AccessRights {
                        client_id: create.client_id,
                        access_rights: Access::ReadWrite,
                    }
                    .into(),
                    messages::CreateChannelResponse {
                        data_type: native_type,
                        data_count: count as u32,
                        client_id: create.client_id,
                        server_id: self.next_sid,
                    }
                    .into(),
                ]
            }
            Message::ReadNotify(read) => {
                let Some(name) = self.channels.get(&read.server_id) else {
                    return Vec::new();
                };
                if self.silent_reads.lock().unwrap().contains(name) {
                    return Vec::new();
                }
                match self.group.read_as(name, read.data_type) {
                    Ok(dbr) => vec![messages::ReadNotifyResponse::new(read.client_ioid, &dbr).into()],
                    Err(condition) => vec![
                        messages::ECAError {
                            client_id: read.server_id,
                            status: condition.to_status(),
                            original_request: read.to_raw(),
                            error_message: condition.to_string(),
                        }
                        .into(),
                    ],
                }
            }
            Message::Write(write) => {
                let Some(name) = self.channels.get(&write.server_id) else {
                    return Vec::new();
                };
                let result = write
                    .value()
                    .map_err(|_| ErrorCondition::NoConvert)
                    .and_then(|dbr| self.group.write(name, &dbr));
                if !write.notify {
                    return Vec::new();
                }
                let status = match result {
                    Ok(()) => ErrorCondition::Normal,
                    Err(condition) => condition,
                };
                vec![
                    messages::WriteNotifyResponse {
                        data_type: write.data_type,
                        data_count: write.data_count,
                        status: status.to_status(),
                        client_ioid: write.client_ioid,
                    }
                    .into(),
                ]
            }
            Message::EventAdd(add) => {
                let Some(name) = self.channels.get(&add.server_id).cloned() else {
                    return Vec::new();
                };
                let token = CancellationToken::new();
                self.monitors
                    .insert(add.subscription_id, (add.data_type, token.clone()));
                let initial = match self.group.read_as(&name, add.data_type) {
                    Ok(dbr) => vec![messages::EventAddResponse::new(add.subscription_id, &dbr).into()],
                    Err(_) => Vec::new(),
                };
                if let Some(mut updates) = self.group.subscribe(&name) {
                    let events = events.clone();
                    tokio::spawn(async move {
                        loop {
                            let update = select! {
                                _ = token.cancelled() => break,
                                update = updates.recv() => update,
                            };
                            match update {
                                Ok(dbr) => {
                                    let Ok(dbr) = dbr.convert_to(add.data_type) else {
                                        continue;
                                    };
                                    let event =
                                        messages::EventAddResponse::new(add.subscription_id, &dbr);
                                    if events.send(event.into()).is_err() {
                                        break;
                                    }
                                }
                                Err(RecvError::Lagged(_)) => continue,
                                Err(RecvError::Closed) => break,
                            }
                        }
                    });
                }
                initial
            }
            Message::EventCancel(cancel) => match self.monitors.remove(&cancel.subscription_id) {
                Some((data_type, token)) => {
                    token.cancel();
                    vec![messages::EventAddResponse::cancelled(data_type, cancel.subscription_id).into()]
                }
                None => Vec::new(),
            },
            Message::ClearChannel(clear) => {
                self.channels.remove(&clear.server_id);
                vec![clear.into()]
            }
            Message::Echo => vec![Message::Echo],
            _ => Vec::new(),
        }
    }
}
