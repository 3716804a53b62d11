use std::{
    collections::HashMap,
    fmt::Debug,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{
        ClientError,
        circuit::{CircuitKey, CircuitRequest},
        subscription::{DeliveryMode, Subscription, SubscriptionShared, spawn_delivery},
    },
    config::resolve_timeout,
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue, Status},
    messages::{Access, MonitorMask},
    utils::get_default_timeout,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for a server to claim the name
    Searching,
    /// Assigned to a circuit that is not connected yet
    Created,
    /// Create request sent, waiting for the server to answer
    WaitingForConnect,
    Connected,
    /// Lost the server; recovery is automatic
    Disconnected,
    Closed,
}

/// What the server told us about the channel when it connected
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub native_type: DbrBasicType,
    pub native_count: u32,
    pub server: SocketAddr,
}

/// Changes in a channel's connection, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(ChannelInfo),
    Disconnected,
    AccessRights(Access),
    Closed,
}

/// How a channel reaches its circuit
#[derive(Debug, Clone)]
pub(crate) struct ChannelLink {
    pub requests: mpsc::Sender<CircuitRequest>,
    pub cid: u32,
    pub circuit: CircuitKey,
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelStatus {
    state: ChannelState,
    link: Option<ChannelLink>,
    info: Option<ChannelInfo>,
    access: Access,
    create_failed: bool,
}

/// Channel state shared between the caller's handles, the context and the circuit
pub(crate) struct ChannelCore {
    pub name: String,
    pub priority: u16,
    context_timeout: Option<Duration>,
    max_batch_bytes: usize,
    status: watch::Sender<ChannelStatus>,
    events: broadcast::Sender<ConnectionEvent>,
    subscriptions: Mutex<HashMap<u64, Arc<SubscriptionShared>>>,
    next_handle: AtomicU64,
    last_alarm: Mutex<Option<Status>>,
    closed: CancellationToken,
    context_stop: CancellationToken,
}

impl Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct ChannelOptions {
    pub priority: u16,
    pub context_timeout: Option<Duration>,
    pub max_batch_bytes: usize,
}

impl ChannelCore {
    pub fn new(name: &str, options: ChannelOptions, context_stop: CancellationToken) -> Self {
        ChannelCore {
            name: name.to_string(),
            priority: options.priority,
            context_timeout: options.context_timeout,
            max_batch_bytes: options.max_batch_bytes,
            status: watch::Sender::new(ChannelStatus {
                state: ChannelState::Searching,
                link: None,
                info: None,
                access: Access::None,
                create_failed: false,
            }),
            events: broadcast::Sender::new(32),
            subscriptions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            last_alarm: Mutex::new(None),
            closed: CancellationToken::new(),
            context_stop,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.status.borrow().state
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Apply a change unless the channel is closed. Returns whether it applied.
    fn update(&self, change: impl FnOnce(&mut ChannelStatus) -> bool) -> bool {
        self.status.send_if_modified(|status| {
            if status.state == ChannelState::Closed {
                return false;
            }
            change(status)
        })
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Start looking for a server again
    pub fn mark_searching(&self) -> bool {
        self.update(|status| {
            status.state = ChannelState::Searching;
            status.link = None;
            status.create_failed = false;
            true
        })
    }

    pub fn attach(&self, link: ChannelLink) {
        self.update(|status| {
            status.state = ChannelState::Created;
            status.link = Some(link);
            true
        });
    }

    pub fn waiting_for_connect(&self) {
        self.update(|status| {
            status.state = ChannelState::WaitingForConnect;
            true
        });
    }

    /// Returns the native type from the previous connection, if any
    pub fn connected(&self, info: ChannelInfo) -> Option<DbrBasicType> {
        let mut previous = None;
        let changed = self.update(|status| {
            previous = status.info.map(|i| i.native_type);
            status.state = ChannelState::Connected;
            status.info = Some(info);
            true
        });
        if changed {
            self.emit(ConnectionEvent::Connected(info));
        }
        previous
    }

    /// The circuit under this channel went away. Only a connected channel reports it.
    pub fn disconnected(&self) {
        let mut was_connected = false;
        self.update(|status| {
            was_connected = status.state == ChannelState::Connected;
            status.state = ChannelState::Disconnected;
            true
        });
        if was_connected {
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    /// As [`ChannelCore::disconnected`], and forget the circuit too
    pub fn detach(&self) {
        self.disconnected();
        self.update(|status| {
            status.link = None;
            true
        });
    }

    pub fn create_failed(&self) {
        self.update(|status| {
            status.create_failed = true;
            status.link = None;
            status.state = ChannelState::Disconnected;
            true
        });
    }

    pub fn set_access(&self, access: Access) {
        let changed = self.update(|status| {
            let changed = status.access != access;
            status.access = access;
            changed
        });
        if changed {
            self.emit(ConnectionEvent::AccessRights(access));
        }
    }

    pub fn note_alarm(&self, dbr: &Dbr) {
        if let Some(status) = dbr.status() {
            *self.last_alarm.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
        }
    }

    pub fn subscription(&self, handle: u64) -> Option<Arc<SubscriptionShared>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }

    pub fn subscription_handles(&self) -> Vec<u64> {
        let mut handles: Vec<u64> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        handles.sort_unstable();
        handles
    }

    /// The owning context has gone away
    pub fn context_closed(&self) {
        let _ = self.close();
    }

    /// Close the channel, handing back the circuit link if this call closed it
    fn close(&self) -> Option<Option<ChannelLink>> {
        let mut link = None;
        let mut closed_now = false;
        self.status.send_if_modified(|status| {
            if status.state == ChannelState::Closed {
                return false;
            }
            closed_now = true;
            status.state = ChannelState::Closed;
            link = status.link.take();
            true
        });
        if !closed_now {
            return None;
        }
        self.closed.cancel();
        let subscriptions: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, subscription) in subscriptions {
            subscription.cancel();
        }
        self.emit(ConnectionEvent::Closed);
        Some(link)
    }
}

/// Client handle for one named PV.
///
/// Handles are cheap to clone and all refer to the same channel. Operations wait for
/// the channel to connect, up to their timeout. The default timeout belongs to the
/// handle, so handles for one name may differ in it.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
    default_timeout: Option<Duration>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.core.name)
            .field("state", &self.core.state())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(core: Arc<ChannelCore>, default_timeout: Option<Duration>) -> Self {
        Channel {
            core,
            default_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    pub fn info(&self) -> Option<ChannelInfo> {
        self.core.status.borrow().info
    }

    pub fn access(&self) -> Access {
        self.core.status.borrow().access
    }

    /// Alarm status from the most recent value that carried one
    pub fn last_alarm(&self) -> Option<Status> {
        *self
            .core
            .last_alarm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.core.events.subscribe()
    }

    fn timeout(&self, timeout: Option<Duration>) -> Duration {
        resolve_timeout(
            timeout,
            self.default_timeout,
            self.core.context_timeout,
            get_default_timeout(),
        )
    }

    fn ensure_usable(&self) -> Result<(), ClientError> {
        if self.core.context_stop.is_cancelled() {
            Err(ClientError::ContextDisconnected)
        } else if self.core.is_closed() {
            Err(ClientError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    /// The error for a circuit that vanished mid-request
    fn lost(&self) -> ClientError {
        self.ensure_usable().err().unwrap_or(ClientError::Disconnected)
    }

    async fn connected_link(
        &self,
        deadline: Instant,
    ) -> Result<(ChannelLink, ChannelInfo), ClientError> {
        let mut status = self.core.status.subscribe();
        loop {
            self.ensure_usable()?;
            {
                let current = status.borrow_and_update();
                if current.create_failed {
                    return Err(ClientError::ChannelCreateFailed(self.core.name.clone()));
                }
                if let (ChannelState::Connected, Some(link), Some(info)) =
                    (current.state, &current.link, current.info)
                {
                    return Ok((link.clone(), info));
                }
            }
            select! {
                _ = self.core.context_stop.cancelled() => return Err(ClientError::ContextDisconnected),
                _ = self.core.closed.cancelled() => return Err(ClientError::ChannelClosed),
                changed = tokio::time::timeout_at(deadline.into(), status.changed()) => match changed {
                    Err(_) => return Err(ClientError::ConnectTimeout(self.core.name.clone())),
                    Ok(Err(_)) => return Err(ClientError::ContextDisconnected),
                    Ok(Ok(())) => continue,
                },
            }
        }
    }

    pub async fn wait_for_connection(
        &self,
        timeout: Option<Duration>,
    ) -> Result<ChannelInfo, ClientError> {
        let deadline = Instant::now() + self.timeout(timeout);
        self.connected_link(deadline).await.map(|(_, info)| info)
    }

    /// Read the current value.
    ///
    /// With no `data_type` the value is requested in its native type with alarm status
    /// and timestamp.
    pub async fn read(
        &self,
        data_type: Option<DbrType>,
        timeout: Option<Duration>,
    ) -> Result<Dbr, ClientError> {
        let deadline = Instant::now() + self.timeout(timeout);
        let (link, info) = self.connected_link(deadline).await?;
        let data_type =
            data_type.unwrap_or(DbrType::new(info.native_type, DbrCategory::Time));
        let (reply, result) = oneshot::channel();
        let request = async {
            link.requests
                .send(CircuitRequest::Read {
                    cid: link.cid,
                    data_type,
                    deadline,
                    reply,
                })
                .await
                .map_err(|_| self.lost())?;
            result.await.map_err(|_| self.lost())?
        };
        // The circuit expires requests itself, unless it is too busy to answer
        let dbr = tokio::time::timeout_at(deadline.into(), request)
            .await
            .map_err(|_| ClientError::ChannelReadError)??;
        self.core.note_alarm(&dbr);
        Ok(dbr)
    }

    /// Write a value and wait for the server to acknowledge it
    pub async fn write(
        &self,
        value: impl Into<DbrValue>,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        let deadline = Instant::now() + self.timeout(timeout);
        let (link, _) = self.connected_link(deadline).await?;
        let (reply, result) = oneshot::channel();
        let request = async {
            link.requests
                .send(CircuitRequest::Write {
                    cid: link.cid,
                    value: Dbr::Basic(value.into()),
                    deadline,
                    reply: Some(reply),
                })
                .await
                .map_err(|_| self.lost())?;
            result.await.map_err(|_| self.lost())?
        };
        tokio::time::timeout_at(deadline.into(), request)
            .await
            .map_err(|_| ClientError::WriteTimeout)?
    }

    /// Write a value without asking the server for acknowledgement
    pub async fn write_no_wait(&self, value: impl Into<DbrValue>) -> Result<(), ClientError> {
        let deadline = Instant::now() + self.timeout(None);
        let (link, _) = self.connected_link(deadline).await?;
        let request = link.requests.send(CircuitRequest::Write {
            cid: link.cid,
            value: Dbr::Basic(value.into()),
            deadline,
            reply: None,
        });
        tokio::time::timeout_at(deadline.into(), request)
            .await
            .map_err(|_| ClientError::WriteTimeout)?
            .map_err(|_| self.lost())
    }

    /// Subscribe to changes, delivering batches of events to `callback`.
    ///
    /// The subscription is registered immediately and starts on the server as soon as
    /// the channel connects; it is re-established automatically after reconnects.
    pub async fn subscribe<F>(
        &self,
        data_type: Option<DbrType>,
        mask: MonitorMask,
        mode: DeliveryMode,
        callback: F,
    ) -> Result<Subscription, ClientError>
    where
        F: FnMut(Vec<Dbr>) + Send + 'static,
    {
        self.ensure_usable()?;
        let handle = self.core.next_handle.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SubscriptionShared::new(
            handle,
            data_type,
            mask,
            mode,
            self.core.max_batch_bytes,
        ));
        self.core
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, shared.clone());
        spawn_delivery(shared.clone(), callback);

        let link = self.core.status.borrow().link.clone();
        if let Some(link) = link {
            let _ = link
                .requests
                .send(CircuitRequest::Subscribe {
                    cid: link.cid,
                    handle,
                })
                .await;
        }
        debug!("Subscribed to {} (handle {handle})", self.core.name);
        Ok(Subscription {
            shared,
            channel: self.clone(),
        })
    }

    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), ClientError> {
        let handle = subscription.shared.handle;
        subscription.shared.cancel();
        self.ensure_usable()?;
        let removed = self
            .core
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        if removed.is_none() {
            return Ok(());
        }
        let link = self.core.status.borrow().link.clone();
        if let Some(link) = link {
            let _ = link
                .requests
                .send(CircuitRequest::Unsubscribe {
                    cid: link.cid,
                    handle,
                })
                .await;
        }
        Ok(())
    }

    /// Close the channel. Closing an already closed channel does nothing.
    pub async fn close(&self) {
        let Some(link) = self.core.close() else {
            return;
        };
        debug!("Closing channel {}", self.core.name);
        if let Some(link) = link
            && link
                .requests
                .send(CircuitRequest::Detach { cid: link.cid })
                .await
                .is_err()
        {
            warn!("Circuit for {} was already gone", self.core.name);
        }
    }

    pub(crate) fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }
}
