use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use tokio::{io, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    client::Searcher,
    messages::{CAMessage, RsrvIsUp},
    utils::new_reusable_udp_socket,
};

/// What a beacon tells us about the server that sent it
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BeaconChange {
    /// First beacon from this server
    NewServer,
    /// The beacon id went backwards, so the server restarted
    Restarted,
    Unchanged,
}

/// Servers we have seen broadcasting, with their last beacon id
#[derive(Debug, Default)]
pub(crate) struct BeaconTracker {
    observed: HashMap<SocketAddr, (u32, Instant)>,
}

impl BeaconTracker {
    pub fn observe(&mut self, server: SocketAddr, beacon_id: u32, now: Instant) -> BeaconChange {
        match self.observed.insert(server, (beacon_id, now)) {
            None => BeaconChange::NewServer,
            Some((previous, _)) if beacon_id < previous => BeaconChange::Restarted,
            Some(_) => BeaconChange::Unchanged,
        }
    }
}

/// Watch for broadcast beacons, and prompt searches when the set of servers changes
pub(crate) fn watch_beacons(
    port: u16,
    searcher: Searcher,
    stop: CancellationToken,
) -> Result<(), io::Error> {
    // Bind the socket first, so that we know early if it fails
    let socket = new_reusable_udp_socket(SocketAddr::new([0, 0, 0, 0].into(), port))?;

    tokio::spawn(async move {
        let mut buf: Vec<u8> = vec![0; 0xFFFF];
        let mut tracker = BeaconTracker::default();
        loop {
            select! {
                _ = stop.cancelled() => break,
                r = socket.recv_from(&mut buf) => match r {
                    Ok((size, addr)) => {
                        let Ok((_, beacon)) = RsrvIsUp::parse(&buf[..size]) else {
                            continue;
                        };
                        trace!("Observed beacon: {beacon:?}");
                        let server_ip = beacon.server_ip.map(IpAddr::V4).unwrap_or(addr.ip());
                        let server = SocketAddr::new(server_ip, beacon.server_port);
                        match tracker.observe(server, beacon.beacon_id, Instant::now()) {
                            BeaconChange::Unchanged => {}
                            change => {
                                debug!("Beacon from {server}: {change:?}, searching again");
                                if searcher.reset_backoff().await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Got unresumable error whilst watching beacons: {e:?}");
                        break;
                    }
                }
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restarts_are_detected() {
        let mut tracker = BeaconTracker::default();
        let server = "10.1.2.3:5064".parse().unwrap();
        let now = Instant::now();
        assert_eq!(tracker.observe(server, 40, now), BeaconChange::NewServer);
        assert_eq!(tracker.observe(server, 41, now), BeaconChange::Unchanged);
        assert_eq!(tracker.observe(server, 0, now), BeaconChange::Restarted);
    }
}
