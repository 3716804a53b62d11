use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::{select, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    client::{Channel, ClientError},
    dbr::{Dbr, DbrType},
    messages::MonitorMask,
};

/// How undelivered events are treated when the callback falls behind
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Scalars collapse to the newest value. Array updates are all kept until
    /// they exceed the batch size, then the oldest are dropped.
    #[default]
    Coalesce,
    /// Only ever deliver the newest event
    LatestOnly,
    /// Deliver every event, however far behind the callback is
    Lossless,
}

/// Events waiting for delivery, with their encoded sizes
#[derive(Debug)]
pub(crate) struct EventQueue {
    events: VecDeque<(usize, Dbr)>,
    bytes: usize,
    mode: DeliveryMode,
    max_batch_bytes: usize,
    dropped: u64,
}

impl EventQueue {
    pub fn new(mode: DeliveryMode, max_batch_bytes: usize) -> Self {
        EventQueue {
            events: VecDeque::new(),
            bytes: 0,
            mode,
            max_batch_bytes,
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: Dbr) {
        let size = event.encoded_len();
        let replace = match self.mode {
            DeliveryMode::LatestOnly => true,
            DeliveryMode::Coalesce => event.is_scalar(),
            DeliveryMode::Lossless => false,
        };
        if replace {
            self.dropped += self.events.len() as u64;
            self.events.clear();
            self.bytes = 0;
        }
        self.events.push_back((size, event));
        self.bytes += size;

        if self.mode == DeliveryMode::Coalesce {
            while self.bytes > self.max_batch_bytes && self.events.len() > 1 {
                if let Some((size, _)) = self.events.pop_front() {
                    self.bytes -= size;
                    self.dropped += 1;
                }
            }
        }
    }

    /// Take the oldest events that fit in one batch.
    ///
    /// A single event bigger than the batch limit is delivered on its own.
    pub fn take_batch(&mut self) -> Vec<Dbr> {
        let mut batch = Vec::new();
        let mut batch_bytes = 0;
        while let Some((size, _)) = self.events.front() {
            if !batch.is_empty() && batch_bytes + size > self.max_batch_bytes {
                break;
            }
            let Some((size, event)) = self.events.pop_front() else {
                break;
            };
            batch_bytes += size;
            self.bytes -= size;
            batch.push(event);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// State shared between a subscription's owner, its circuit and its delivery task
#[derive(Debug)]
pub(crate) struct SubscriptionShared {
    pub handle: u64,
    /// Requested type; `None` asks for the native type with timestamps
    pub data_type: Option<DbrType>,
    pub mask: MonitorMask,
    queue: Mutex<EventQueue>,
    ready: Notify,
    cancel: CancellationToken,
}

impl SubscriptionShared {
    pub fn new(
        handle: u64,
        data_type: Option<DbrType>,
        mask: MonitorMask,
        mode: DeliveryMode,
        max_batch_bytes: usize,
    ) -> Self {
        SubscriptionShared {
            handle,
            data_type,
            mask,
            queue: Mutex::new(EventQueue::new(mode, max_batch_bytes)),
            ready: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue an event from the circuit for delivery
    pub fn push(&self, event: Dbr) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        self.ready.notify_one();
    }

    fn take_batch(&self) -> Vec<Dbr> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take_batch()
    }

    pub fn dropped(&self) -> u64 {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dropped()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Run the callback for every batch of events until the subscription is cancelled
pub(crate) fn spawn_delivery<F>(shared: Arc<SubscriptionShared>, mut callback: F)
where
    F: FnMut(Vec<Dbr>) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            select! {
                _ = shared.cancel.cancelled() => break,
                _ = shared.ready.notified() => {},
            }
            loop {
                let batch = shared.take_batch();
                if batch.is_empty() || shared.is_cancelled() {
                    break;
                }
                trace!(
                    "Delivering {} events for subscription {}",
                    batch.len(),
                    shared.handle
                );
                callback(batch);
            }
        }
    });
}

/// A live subscription on a [`Channel`].
///
/// Dropping this does not stop delivery; call [`Subscription::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub(crate) shared: Arc<SubscriptionShared>,
    pub(crate) channel: Channel,
}

impl Subscription {
    pub fn mask(&self) -> MonitorMask {
        self.shared.mask
    }

    /// Events discarded by coalescing so far
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped()
    }

    pub async fn unsubscribe(self) -> Result<(), ClientError> {
        let channel = self.channel.clone();
        channel.unsubscribe(self).await
    }
}
