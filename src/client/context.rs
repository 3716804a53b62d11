use std::{
    collections::{HashMap, hash_map::Entry},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io, select,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    client::{
        Channel, ClientError, Searcher, SearcherBuilder,
        beacons::watch_beacons,
        channel::{ChannelCore, ChannelOptions},
        circuit::{CircuitEvent, CircuitHandle, CircuitKey, CircuitState},
    },
    config::{Config, resolve_timeout},
    utils::get_default_timeout,
};

/// Per-channel settings for [`Context::get_channel_with`]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Circuit priority; channels at different priorities never share a circuit
    pub priority: u16,
    /// Default timeout for operations on this channel
    pub default_timeout: Option<Duration>,
}

pub struct ContextBuilder {
    config: Config,
    stop_token: CancellationToken,
    bind_address: SocketAddr,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        ContextBuilder {
            config: Config::default(),
            stop_token: CancellationToken::new(),
            bind_address: SocketAddr::new(IpAddr::V4([0, 0, 0, 0].into()), 0),
        }
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        ContextBuilder::default()
    }
    /// Replace every tunable at once
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
    pub fn min_retry_search_interval(mut self, interval: Duration) -> Self {
        self.config.min_retry_search_interval = interval;
        self
    }
    pub fn max_retry_search_interval(mut self, interval: Duration) -> Self {
        self.config.max_retry_search_interval = interval;
        self
    }
    pub fn search_retirement_age(mut self, age: Duration) -> Self {
        self.config.search_retirement_age = age;
        self
    }
    pub fn retry_retired_searches_interval(mut self, interval: Duration) -> Self {
        self.config.retry_retired_searches_interval = interval;
        self
    }
    pub fn restart_subs_period(mut self, period: Duration) -> Self {
        self.config.restart_subs_period = period;
        self
    }
    pub fn circuit_death_attempts(mut self, attempts: u32) -> Self {
        self.config.circuit_death_attempts = attempts.max(1);
        self
    }
    pub fn event_add_batch_max_bytes(mut self, bytes: usize) -> Self {
        self.config.event_add_batch_max_bytes = bytes;
        self
    }
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }
    pub fn max_array_bytes(mut self, bytes: usize) -> Self {
        self.config.max_array_bytes = bytes;
        self
    }
    pub fn search_port(mut self, port: u16) -> Self {
        self.config.server_port = port;
        self
    }
    pub fn repeater_port(mut self, port: u16) -> Self {
        self.config.repeater_port = port;
        self
    }
    pub fn broadcast_to(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.config.broadcast_addresses = Some(addresses);
        self
    }
    pub fn watch_beacons(mut self, watch: bool) -> Self {
        self.config.watch_beacons = watch;
        self
    }
    pub fn client_name(mut self, name: &str) -> Self {
        self.config.client_name = name.to_string();
        self
    }
    pub fn host_name(mut self, name: &str) -> Self {
        self.config.host_name = name.to_string();
        self
    }
    pub fn bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = address;
        self
    }
    pub fn stop_token(mut self, token: CancellationToken) -> Self {
        self.stop_token = token.child_token();
        self
    }

    pub async fn start(self) -> Result<Context, io::Error> {
        let config = Arc::new(self.config);
        let stop = self.stop_token;
        let searcher = SearcherBuilder::new()
            .config((*config).clone())
            .bind_address(self.bind_address)
            .stop_token(stop.clone())
            .start()
            .await?;
        if config.watch_beacons
            && let Err(e) = watch_beacons(config.repeater_port, searcher.clone(), stop.child_token())
        {
            warn!(
                "Could not listen for beacons on port {}: {e}",
                config.repeater_port
            );
        }

        let (requests_tx, requests_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let internal = ContextInternal {
            config: config.clone(),
            searcher: searcher.clone(),
            stop: stop.clone(),
            requests_tx: requests_tx.clone(),
            events_tx,
            channels: HashMap::new(),
            circuits: HashMap::new(),
            next_circuit_id: 0,
        };
        tokio::spawn(internal.run(requests_rx, events_rx));

        Ok(Context {
            config,
            searcher,
            requests: requests_tx,
            stop,
        })
    }
}

enum ContextRequest {
    GetChannel {
        name: String,
        settings: ChannelSettings,
        reply: oneshot::Sender<Channel>,
    },
    Resolved {
        core: Arc<ChannelCore>,
        address: SocketAddr,
    },
    Circuits(oneshot::Sender<Vec<(CircuitKey, CircuitState)>>),
}

/// A client session: owns name resolution and every circuit it opens.
///
/// Dropping the context, or calling [`Context::shutdown`], closes every circuit and
/// fails any further operation on its channels with
/// [`ClientError::ContextDisconnected`]. Contexts share nothing with each other.
pub struct Context {
    config: Arc<Config>,
    searcher: Searcher,
    requests: mpsc::Sender<ContextRequest>,
    stop: CancellationToken,
}

impl Context {
    pub async fn start() -> Result<Context, io::Error> {
        ContextBuilder::new().start().await
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the channel for a PV name at the default priority.
    ///
    /// This returns immediately; the channel connects in the background, and
    /// operations on it wait for that to happen.
    pub async fn get_channel(&self, name: &str) -> Result<Channel, ClientError> {
        self.get_channel_with(name, ChannelSettings::default())
            .await
    }

    pub async fn get_channel_with(
        &self,
        name: &str,
        settings: ChannelSettings,
    ) -> Result<Channel, ClientError> {
        let (reply, channel) = oneshot::channel();
        self.send(ContextRequest::GetChannel {
            name: name.to_string(),
            settings,
            reply,
        })
        .await?;
        channel.await.map_err(|_| ClientError::ContextDisconnected)
    }

    /// Find which server hosts a name, without creating a channel
    pub async fn resolve(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<SocketAddr, ClientError> {
        if self.stop.is_cancelled() {
            return Err(ClientError::ContextDisconnected);
        }
        let timeout = resolve_timeout(
            timeout,
            None,
            self.config.default_timeout,
            get_default_timeout(),
        );
        self.searcher.resolve(name, timeout).await
    }

    /// The circuits currently in the registry, with their state
    pub async fn circuits(&self) -> Result<Vec<(CircuitKey, CircuitState)>, ClientError> {
        let (reply, circuits) = oneshot::channel();
        self.send(ContextRequest::Circuits(reply)).await?;
        circuits.await.map_err(|_| ClientError::ContextDisconnected)
    }

    async fn send(&self, request: ContextRequest) -> Result<(), ClientError> {
        if self.stop.is_cancelled() {
            return Err(ClientError::ContextDisconnected);
        }
        self.requests
            .send(request)
            .await
            .map_err(|_| ClientError::ContextDisconnected)
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Coordinator task: the only place the channel and circuit registries change
struct ContextInternal {
    config: Arc<Config>,
    searcher: Searcher,
    stop: CancellationToken,
    /// Resolver tasks report back through this
    requests_tx: mpsc::Sender<ContextRequest>,
    events_tx: mpsc::UnboundedSender<CircuitEvent>,
    channels: HashMap<(String, u16), Arc<ChannelCore>>,
    circuits: HashMap<CircuitKey, CircuitHandle>,
    next_circuit_id: u64,
}

impl ContextInternal {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<ContextRequest>,
        mut events: mpsc::UnboundedReceiver<CircuitEvent>,
    ) {
        loop {
            select! {
                _ = self.stop.cancelled() => break,
                Some(request) = requests.recv() => self.handle_request(request).await,
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
        debug!("Context shutting down");
        for circuit in self.circuits.values() {
            circuit.stop();
        }
        for core in self.channels.values() {
            core.context_closed();
        }
    }

    async fn handle_request(&mut self, request: ContextRequest) {
        match request {
            ContextRequest::GetChannel {
                name,
                settings,
                reply,
            } => {
                let key = (name.clone(), settings.priority);
                if let Some(core) = self.channels.get(&key)
                    && !core.is_closed()
                {
                    let _ = reply.send(Channel::new(core.clone(), settings.default_timeout));
                    return;
                }
                debug!("Creating channel for {name}");
                let core = Arc::new(ChannelCore::new(
                    &name,
                    ChannelOptions {
                        priority: settings.priority,
                        context_timeout: self.config.default_timeout,
                        max_batch_bytes: self.config.event_add_batch_max_bytes,
                    },
                    self.stop.clone(),
                ));
                self.channels.insert(key, core.clone());
                let _ = reply.send(Channel::new(core.clone(), settings.default_timeout));
                self.search_for(core);
            }
            ContextRequest::Resolved { core, address } => {
                if core.is_closed() {
                    return;
                }
                let key = CircuitKey {
                    address,
                    priority: core.priority,
                };
                let circuit = self.circuit_for(key);
                if circuit.attach(core.clone()).await.is_err() {
                    debug!("Circuit {key} went away before {} attached", core.name);
                    self.remove_circuit(key, circuit.id);
                    self.search_for(core);
                }
            }
            ContextRequest::Circuits(reply) => {
                let circuits = self
                    .circuits
                    .iter()
                    .map(|(key, circuit)| (*key, circuit.state()))
                    .collect();
                let _ = reply.send(circuits);
            }
        }
    }

    async fn handle_event(&mut self, event: CircuitEvent) {
        match event {
            CircuitEvent::Dead { key, id, channels } => {
                warn!("Circuit {key} is dead; searching again for {} channels", channels.len());
                self.remove_circuit(key, id);
                let _ = self.searcher.invalidate(key.address).await;
                for core in channels {
                    self.search_for(core);
                }
            }
            CircuitEvent::ChannelLost(core) => {
                let _ = self.searcher.forget(&core.name).await;
                self.search_for(core);
            }
        }
    }

    fn circuit_for(&mut self, key: CircuitKey) -> CircuitHandle {
        match self.circuits.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                info!("Opening circuit to {key}");
                self.next_circuit_id += 1;
                let circuit = CircuitHandle::spawn(
                    key,
                    self.next_circuit_id,
                    self.config.clone(),
                    self.events_tx.clone(),
                    self.stop.child_token(),
                );
                entry.insert(circuit).clone()
            }
        }
    }

    /// Drop a circuit from the registry, unless it has already been replaced
    fn remove_circuit(&mut self, key: CircuitKey, id: u64) {
        if let Entry::Occupied(entry) = self.circuits.entry(key)
            && entry.get().id == id
        {
            trace!("Removing circuit {key} from registry");
            entry.remove().stop();
        }
    }

    /// Wait in the background for the channel's name to resolve
    fn search_for(&self, core: Arc<ChannelCore>) {
        if !core.mark_searching() {
            return;
        }
        let searcher = self.searcher.clone();
        let requests = self.requests_tx.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            let address = select! {
                _ = core.closed().cancelled() => return,
                _ = stop.cancelled() => return,
                result = searcher.wait_for(&core.name) => match result {
                    Ok(address) => address,
                    Err(e) => {
                        debug!("Stopped searching for {}: {e}", core.name);
                        return;
                    }
                },
            };
            let _ = requests
                .send(ContextRequest::Resolved { core, address })
                .await;
        });
    }
}
