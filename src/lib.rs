//! Pure-rust client session layer for the EPICS [Channel Access protocol].
//!
//! This crate finds which server hosts a named process variable, multiplexes
//! channels to it over shared TCP circuits, matches responses and subscription events
//! back to their callers, and recovers from lost servers without callers having to
//! notice. It does not depend on the C-based [epics-base] project.
//!
//! The pieces are:
//!
//! - Mapping and serialization/deserialization of message types, in module
//!   [messages], including the framing codec and circuit handshake.
//! - Representing data for transferring back and forth (["DBR" types]) in module
//!   [dbr].
//! - The client runtime in [client]: a [`Context`] owning name resolution and the
//!   circuit registry, handing out [`Channel`] handles for reads, writes and
//!   subscriptions.
//! - Tunables in [config], defaulting from the standard `EPICS_CA_*` environment.
//! - [pvgroup], an explicit registration table of PVs with typed accessors, for the
//!   serving side of tests and tools.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use casession::{Context, DeliveryMode, messages::MonitorMask};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), casession::ClientError> {
//!     let context = Context::start().await?;
//!     let channel = context.get_channel("BL99P-EA-TEST-01:COUNT").await?;
//!     let value = channel.read(None, Some(Duration::from_secs(5))).await?;
//!     println!("{}: {:?}", channel.name(), value.value());
//!
//!     let subscription = channel
//!         .subscribe(None, MonitorMask::default(), DeliveryMode::default(), |batch| {
//!             for event in batch {
//!                 println!("update: {:?}", event.value());
//!             }
//!         })
//!         .await?;
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!     subscription.unsubscribe().await?;
//!     channel.close().await;
//!     Ok(())
//! }
//! ```
//!
//! [Channel Access protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod client;
pub mod config;
pub mod dbr;
pub mod messages;
pub mod pvgroup;

mod utils;

pub use crate::client::{
    Channel, ChannelState, ClientError, Context, ContextBuilder, DeliveryMode, Subscription,
};
pub use crate::config::Config;
