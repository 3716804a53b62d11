//! Tunables for a client [`Context`](crate::client::Context).
//!
//! Defaults come from the CA environment variables where one exists, read through
//! [`crate::utils`], and otherwise from fixed values that keep the first search for a
//! name fast while bounding the broadcast load from names that never resolve.

use std::{net::SocketAddr, time::Duration};

use crate::utils::{
    get_default_beacon_port, get_default_connection_timeout, get_default_max_array_bytes,
    get_default_max_search_interval, get_default_server_port, get_target_broadcast_ips,
};

/// Largest UDP payload that avoids fragmentation on a standard ethernet MTU
pub const DEFAULT_SEARCH_DATAGRAM_BYTES: usize = 1472;

#[derive(Debug, Clone)]
pub struct Config {
    /// First retry interval for an unanswered search
    pub min_retry_search_interval: Duration,
    /// Retry interval never grows past this
    pub max_retry_search_interval: Duration,
    /// Resolved names idle this long are forgotten; unresolved names this old are
    /// only retried at `retry_retired_searches_interval`
    pub search_retirement_age: Duration,
    pub retry_retired_searches_interval: Duration,
    /// Minimum gap between subscription restarts after a reconnect
    pub restart_subs_period: Duration,
    /// Consecutive failed connects before a circuit is declared dead
    pub circuit_death_attempts: u32,
    /// Cap on the encoded size of one subscription delivery batch
    pub event_add_batch_max_bytes: usize,
    /// Context-wide operation timeout; the global default applies when unset
    pub default_timeout: Option<Duration>,
    /// Circuit silence before an echo is sent, and the deadline for its reply
    pub connection_timeout: Duration,
    pub max_array_bytes: usize,
    pub server_port: u16,
    pub repeater_port: u16,
    /// Where searches are sent. `None` means work it out from the environment
    pub broadcast_addresses: Option<Vec<SocketAddr>>,
    pub search_datagram_bytes: usize,
    pub client_name: String,
    pub host_name: String,
    /// Listen for server beacons on `repeater_port`
    pub watch_beacons: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_retry_search_interval: Duration::from_millis(30),
            max_retry_search_interval: get_default_max_search_interval(),
            search_retirement_age: Duration::from_secs(480),
            retry_retired_searches_interval: Duration::from_secs(60),
            restart_subs_period: Duration::from_millis(100),
            circuit_death_attempts: 3,
            event_add_batch_max_bytes: 1 << 16,
            default_timeout: None,
            connection_timeout: get_default_connection_timeout(),
            max_array_bytes: get_default_max_array_bytes(),
            server_port: get_default_server_port(),
            repeater_port: get_default_beacon_port(),
            broadcast_addresses: None,
            search_datagram_bytes: DEFAULT_SEARCH_DATAGRAM_BYTES,
            client_name: whoami::username(),
            host_name: whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string()),
            watch_beacons: true,
        }
    }
}

impl Config {
    pub fn broadcast_addresses(&self) -> Vec<SocketAddr> {
        self.broadcast_addresses
            .clone()
            .unwrap_or_else(|| get_target_broadcast_ips(self.server_port))
    }
}

/// Pick the timeout for an operation.
///
/// The most specific setting wins: the operation's own, then the channel default,
/// then the context default, then the global default.
pub fn resolve_timeout(
    operation: Option<Duration>,
    channel: Option<Duration>,
    context: Option<Duration>,
    global: Duration,
) -> Duration {
    operation.or(channel).or(context).unwrap_or(global)
}
