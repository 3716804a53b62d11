//! The client session: name resolution, circuits and channels.
//!
//! A [`Context`] owns everything. Ask it for a [`Channel`] by name and use that to
//! read, write and subscribe; searching, connecting, reconnecting and resubscribing
//! all happen behind it.

mod beacons;
mod channel;
mod circuit;
mod context;
mod error;
mod ids;
mod search_cache;
mod searcher;
mod subscription;

pub use channel::{Channel, ChannelInfo, ChannelState, ConnectionEvent};
pub use circuit::{CircuitKey, CircuitState};
pub use context::{ChannelSettings, Context, ContextBuilder};
pub use error::ClientError;
pub use searcher::{Searcher, SearcherBuilder};
pub use subscription::{DeliveryMode, Subscription};
