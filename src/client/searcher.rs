use std::{
    collections::HashMap,
    future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    time::{Duration, Instant},
};
use tokio::{
    io,
    net::UdpSocket,
    select,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    client::{
        ClientError,
        search_cache::{Lookup, SearchCache},
    },
    config::Config,
    messages::{self, AsBytes, Message},
};

pub(crate) enum ResolveReply {
    Found(SocketAddr),
    Wait(broadcast::Receiver<SocketAddr>),
}

enum SearchRequest {
    Resolve {
        name: String,
        reply: oneshot::Sender<ResolveReply>,
    },
    /// A server went away; stop handing out its address
    Invalidate(SocketAddr),
    /// A server disowned a name
    Forget(String),
    /// Something changed on the network, search for missing names now
    ResetBackoff,
}

pub struct SearcherBuilder {
    config: Config,
    stop_token: CancellationToken,
    /// The socket that is UDP bound to receive replies
    bind_address: SocketAddr,
}

impl Default for SearcherBuilder {
    fn default() -> Self {
        SearcherBuilder {
            config: Config::default(),
            stop_token: CancellationToken::new(),
            bind_address: SocketAddr::new(IpAddr::V4([0, 0, 0, 0].into()), 0),
        }
    }
}

impl SearcherBuilder {
    pub fn new() -> Self {
        SearcherBuilder::default()
    }
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
    pub fn stop_token(mut self, token: CancellationToken) -> Self {
        self.stop_token = token.child_token();
        self
    }
    pub fn search_port(mut self, port: u16) -> Self {
        self.config.server_port = port;
        self
    }
    pub fn broadcast_to(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.config.broadcast_addresses = Some(addresses);
        self
    }
    pub fn bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub async fn start(self) -> Result<Searcher, io::Error> {
        let socket = UdpSocket::bind(self.bind_address).await?;
        socket.set_broadcast(true)?;
        let broadcast_addresses = self.config.broadcast_addresses();
        if broadcast_addresses.is_empty() {
            warn!("No search addresses configured; names will never resolve");
        }

        let (requests, incoming) = mpsc::channel(32);
        let internal = SearcherInternal {
            cache: SearchCache::new(&self.config),
            waiters: HashMap::new(),
            broadcast_addresses,
            datagram_bytes: self.config.search_datagram_bytes,
        };
        let stop = self.stop_token.clone();
        tokio::spawn(internal.run(socket, incoming, stop));

        Ok(Searcher {
            requests,
            stop_token: self.stop_token,
        })
    }
}

/// Handle to the task that resolves PV names to server addresses.
///
/// Clones share the same task and cache.
#[derive(Debug, Clone)]
pub struct Searcher {
    requests: mpsc::Sender<SearchRequest>,
    stop_token: CancellationToken,
}

impl Searcher {
    pub async fn start() -> Result<Searcher, io::Error> {
        SearcherBuilder::new().start().await
    }

    /// Get the SocketAddr for the server serving a specific PV
    ///
    /// Fails with [`ClientError::NameNotFound`] if no server answers within `timeout`.
    /// Concurrent calls for the same name share a single search.
    pub async fn resolve(&self, name: &str, timeout: Duration) -> Result<SocketAddr, ClientError> {
        tokio::time::timeout(timeout, self.wait_for(name))
            .await
            .map_err(|_| ClientError::NameNotFound(name.to_string()))?
    }

    /// Wait for a name to resolve, however long that takes
    pub(crate) async fn wait_for(&self, name: &str) -> Result<SocketAddr, ClientError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(SearchRequest::Resolve {
            name: name.to_string(),
            reply,
        })
        .await?;
        match reply_rx.await.map_err(|_| ClientError::ContextDisconnected)? {
            ResolveReply::Found(address) => Ok(address),
            ResolveReply::Wait(mut receiver) => receiver
                .recv()
                .await
                .map_err(|_| ClientError::ContextDisconnected),
        }
    }

    pub(crate) async fn invalidate(&self, address: SocketAddr) -> Result<(), ClientError> {
        self.send(SearchRequest::Invalidate(address)).await
    }

    pub(crate) async fn forget(&self, name: &str) -> Result<(), ClientError> {
        self.send(SearchRequest::Forget(name.to_string())).await
    }

    pub(crate) async fn reset_backoff(&self) -> Result<(), ClientError> {
        self.send(SearchRequest::ResetBackoff).await
    }

    async fn send(&self, request: SearchRequest) -> Result<(), ClientError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ClientError::ContextDisconnected)
    }

    pub fn stop(&self) {
        self.stop_token.cancel();
    }
    pub fn is_cancelled(&self) -> bool {
        self.stop_token.is_cancelled()
    }
}

/// Pack searches into as few datagrams as fit, each led by a VERSION message
fn pack_datagrams(searches: Vec<messages::Search>, max_bytes: usize) -> Vec<Vec<u8>> {
    let header = messages::Version::default().as_bytes();
    let mut datagrams = Vec::new();
    let mut current = header.clone();
    for search in searches {
        let bytes = search.as_bytes();
        if current.len() > header.len() && current.len() + bytes.len() > max_bytes {
            datagrams.push(std::mem::replace(&mut current, header.clone()));
        }
        current.extend(bytes);
    }
    if current.len() > header.len() {
        datagrams.push(current);
    }
    datagrams
}

/// Handle searcher internal state, inside a single Async context
struct SearcherInternal {
    cache: SearchCache,
    /// Callers waiting on each unresolved name
    waiters: HashMap<String, broadcast::Sender<SocketAddr>>,
    /// Interfaces to broadcast onto
    broadcast_addresses: Vec<SocketAddr>,
    datagram_bytes: usize,
}

impl SearcherInternal {
    async fn run(
        mut self,
        socket: UdpSocket,
        mut incoming: mpsc::Receiver<SearchRequest>,
        stop: CancellationToken,
    ) {
        let mut buffer = vec![0u8; 0xFFFF];
        loop {
            let mut requests = Vec::new();
            let mut searches = Vec::new();
            select! {
                _ = stop.cancelled() => break,
                count = incoming.recv_many(&mut requests, 32) => {
                    if count == 0 {
                        break;
                    }
                    let now = Instant::now();
                    for request in requests {
                        self.handle_request(request, now, &mut searches);
                    }
                },
                result = socket.recv_from(&mut buffer) => match result {
                    Ok((size, sender)) => self.handle_response(&buffer[..size], sender),
                    Err(e) => warn!("Error waiting for search responses: {e}"),
                },
                _ = self.next_attempt() => self.handle_tick(Instant::now(), &mut searches),
            };
            if !searches.is_empty() {
                self.send_searches(&socket, searches).await;
            }
        }
        debug!("Searcher stopped");
    }

    /// Wait until it's time for the next tracked attempt
    fn next_attempt(&self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        match self.cache.next_wake() {
            None => Box::pin(future::pending()),
            Some(instant) => Box::pin(tokio::time::sleep_until(instant.into())),
        }
    }

    fn handle_request(
        &mut self,
        request: SearchRequest,
        now: Instant,
        searches: &mut Vec<messages::Search>,
    ) {
        match request {
            SearchRequest::Resolve { name, reply } => {
                let answer = match self.cache.request(&name, now) {
                    Lookup::Resolved(address) => ResolveReply::Found(address),
                    Lookup::Pending => ResolveReply::Wait(self.waiter(&name)),
                    Lookup::Search(search) => {
                        debug!("Sending search for {name}");
                        searches.push(search);
                        ResolveReply::Wait(self.waiter(&name))
                    }
                };
                let _ = reply.send(answer);
            }
            SearchRequest::Invalidate(address) => {
                let names = self.cache.invalidate(address);
                if !names.is_empty() {
                    debug!("Forgot {} names served by {address}", names.len());
                }
            }
            SearchRequest::Forget(name) => self.cache.forget(&name),
            SearchRequest::ResetBackoff => {
                trace!("Resetting search backoff");
                self.cache.reset_backoff(now);
            }
        }
    }

    fn waiter(&mut self, name: &str) -> broadcast::Receiver<SocketAddr> {
        self.waiters
            .entry(name.to_string())
            .or_insert_with(|| broadcast::Sender::new(1))
            .subscribe()
    }

    fn handle_response(&mut self, response: &[u8], sender: SocketAddr) {
        let Ok(messages) = Message::parse_many_client_messages(response) else {
            warn!("Received unparseable search response from {sender}");
            return;
        };
        let now = Instant::now();
        for message in messages {
            let response = match message {
                Message::SearchResponse(search_response) => search_response,
                Message::Version(_) => continue,
                Message::NotFound(not_found) => {
                    trace!("{sender} does not serve search {}", not_found.search_id);
                    continue;
                }
                m => {
                    warn!("Received unexpected search response: {m:?}");
                    continue;
                }
            };
            let server_origin = SocketAddr::new(
                response.server_ip.map(IpAddr::V4).unwrap_or(sender.ip()),
                response.port_number,
            );
            let Some(pv_name) = self.cache.on_response(response.search_id, server_origin, now)
            else {
                trace!("Received unrequested or duplicate search response");
                continue;
            };
            debug!("Found server for {pv_name}: {server_origin}");
            if let Some(reporter) = self.waiters.remove(&pv_name) {
                let _ = reporter.send(server_origin);
            }
        }
    }

    fn handle_tick(&mut self, now: Instant, searches: &mut Vec<messages::Search>) {
        // Names whose every waiter has given up are no longer searched for
        let abandoned: Vec<String> = self
            .waiters
            .iter()
            .filter(|(_, reporter)| reporter.receiver_count() == 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in abandoned {
            debug!("Abandoning search for {name}");
            self.waiters.remove(&name);
            self.cache.abandon(&name);
        }

        let tick = self.cache.tick(now);
        for search in &tick.searches {
            trace!("Sending retry search for: {}", search.channel_name);
        }
        for name in &tick.retired {
            trace!("Retired cached address for {name}");
        }
        searches.extend(tick.searches);
    }

    async fn send_searches(&self, socket: &UdpSocket, searches: Vec<messages::Search>) {
        for datagram in pack_datagrams(searches, self.datagram_bytes) {
            for addr in &self.broadcast_addresses {
                trace!("Sending search packet to: {addr}");
                if let Err(e) = socket.send_to(&datagram, *addr).await {
                    warn!("Failed to send search to {addr}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn searches_are_packed_under_datagram_limit() {
        let searches: Vec<_> = (0..100)
            .map(|i| messages::Search {
                search_id: i,
                channel_name: format!("BL99I-EA-DET-{i:02}:CAM:ArrayCounter_RBV"),
                ..Default::default()
            })
            .collect();
        let datagrams = pack_datagrams(searches, 1472);
        assert!(datagrams.len() > 1);
        let mut seen = 0;
        for datagram in &datagrams {
            assert!(datagram.len() <= 1472);
            let messages = Message::parse_many_server_messages(datagram).unwrap();
            assert!(matches!(messages[0], Message::Version(_)));
            seen += messages[1..]
                .iter()
                .filter(|m| matches!(m, Message::Search(_)))
                .count();
        }
        assert_eq!(seen, 100);
    }

    #[test]
    fn no_searches_no_datagrams() {
        assert!(pack_datagrams(Vec::new(), 1472).is_empty());
    }
}
