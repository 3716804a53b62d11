use num::{FromPrimitive, traits::WrappingAdd};
use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    env,
    io::{self},
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Bind a UDP socket that other processes on this host may also bind
///
/// Beacons arrive on a well-known port that several clients (and a repeater)
/// commonly share.
pub(crate) fn new_reusable_udp_socket<T: ToSocketAddrs>(address: T) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to bind"))?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_seconds(name: &str, default: f32, minimum: f32) -> Duration {
    env_parse::<f32>(name)
        .and_then(|v| Duration::try_from_secs_f32(v.max(minimum)).ok())
        .unwrap_or(Duration::from_secs_f32(default))
}

/// Get the server listen port, either from environment or default 5064
pub fn get_default_server_port() -> u16 {
    env_parse("EPICS_CA_SERVER_PORT")
        .unwrap_or(5064u16)
        .max(5000u16)
}

/// Get the beacon broadcast port, either from environment or default 5065
pub fn get_default_beacon_port() -> u16 {
    env_parse("EPICS_CA_REPEATER_PORT")
        .unwrap_or(5065u16)
        .max(5000u16)
}

/// Get the target list of broadcast IPs, by reading the environment and interfaces
///
/// Hostnames are resolved if in the environment setting, so this will re-resolve
pub fn get_target_broadcast_ips(default_search_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    // Work out if we want to automatically include all local broadcast
    let use_auto_address = env::var("EPICS_CA_AUTO_ADDR_LIST")
        .map(|v| !v.eq_ignore_ascii_case("no"))
        .unwrap_or(true);
    if use_auto_address {
        ips.extend(
            datalink::interfaces()
                .into_iter()
                .filter(|i| !i.is_loopback())
                .flat_map(|i| i.ips.into_iter())
                .filter(|i| i.is_ipv4())
                .flat_map(|f| (f.broadcast(), default_search_port).to_socket_addrs())
                .flatten(),
        );
    }
    if let Ok(addr_list) = env::var("EPICS_CA_ADDR_LIST") {
        for add in addr_list.split_ascii_whitespace() {
            let resolved = if add.contains(':') {
                add.to_socket_addrs()
            } else {
                (add, default_search_port).to_socket_addrs()
            };
            match resolved {
                Ok(addr) => {
                    debug!("Adding search IP: {add}");
                    ips.extend(addr);
                }
                Err(e) => warn!("Failed to convert '{add}' to address: {e}"),
            }
        }
    }
    ips
}

/// Seconds of circuit silence before the server is presumed gone
pub fn get_default_connection_timeout() -> Duration {
    env_seconds("EPICS_CA_CONN_TMO", 30.0, 0.1)
}

/// Upper bound on the interval between repeated searches for a missing name
pub fn get_default_max_search_interval() -> Duration {
    env_seconds("EPICS_CA_MAX_SEARCH_PERIOD", 5.0, 1.0)
}

/// Largest payload accepted from a server
pub fn get_default_max_array_bytes() -> usize {
    env_parse("EPICS_CA_MAX_ARRAY_BYTES")
        .unwrap_or(16 * 1024 * 1024usize)
        .max(16384)
}

/// Timeout used when neither the operation, channel nor context gives one
pub fn get_default_timeout() -> Duration {
    env_seconds("CAPROTO_DEFAULT_TIMEOUT", 2.0, 0.0)
}
