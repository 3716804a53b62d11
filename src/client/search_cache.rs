//! Name resolution bookkeeping, independent of any socket.
//!
//! Every method takes the current time explicitly; the [`Searcher`](super::Searcher)
//! task owns the only instance and drives it from its select loop.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{config::Config, messages::Search, utils::wrapping_inplace_add};

/// Earlier search ids kept live per name, so late replies still count
const RETAINED_SEARCH_IDS: usize = 8;

#[derive(Debug)]
struct Resolution {
    address: SocketAddr,
    resolved_at: Instant,
    last_access: Instant,
}

#[derive(Debug)]
struct Unresolved {
    first_attempt: Instant,
    next_retry: Instant,
    interval: Duration,
    search_ids: Vec<u32>,
}

/// What the caller should do about a name it wants
#[derive(Debug, PartialEq)]
pub enum Lookup {
    Resolved(SocketAddr),
    /// A search is already outstanding; wait for it
    Pending,
    /// Broadcast this search
    Search(Search),
}

/// Work produced by a maintenance pass
#[derive(Debug, Default)]
pub struct Tick {
    pub searches: Vec<Search>,
    /// Resolved names evicted for being idle
    pub retired: Vec<String>,
}

#[derive(Debug)]
pub struct SearchCache {
    resolved: HashMap<String, Resolution>,
    unresolved: HashMap<String, Unresolved>,
    in_flight: HashMap<u32, String>,
    next_search_id: u32,
    min_interval: Duration,
    max_interval: Duration,
    retirement_age: Duration,
    retired_retry_interval: Duration,
}

impl SearchCache {
    pub fn new(config: &Config) -> Self {
        SearchCache {
            resolved: HashMap::new(),
            unresolved: HashMap::new(),
            in_flight: HashMap::new(),
            next_search_id: 0,
            min_interval: config.min_retry_search_interval,
            max_interval: config
                .max_retry_search_interval
                .max(config.min_retry_search_interval),
            retirement_age: config.search_retirement_age,
            retired_retry_interval: config.retry_retired_searches_interval,
        }
    }

    /// A resolved address that has not been idle past retirement. Counts as a use.
    pub fn lookup(&mut self, name: &str, now: Instant) -> Option<SocketAddr> {
        let entry = self.resolved.get_mut(name)?;
        if now.saturating_duration_since(entry.last_access) > self.retirement_age {
            debug!("Resolution of {name} is stale, forgetting it");
            self.resolved.remove(name);
            return None;
        }
        entry.last_access = now;
        Some(entry.address)
    }

    pub fn request(&mut self, name: &str, now: Instant) -> Lookup {
        if let Some(address) = self.lookup(name, now) {
            return Lookup::Resolved(address);
        }
        if self.unresolved.contains_key(name) {
            return Lookup::Pending;
        }
        self.unresolved.insert(
            name.to_string(),
            Unresolved {
                first_attempt: now,
                next_retry: now + self.min_interval,
                interval: self.min_interval,
                search_ids: Vec::new(),
            },
        );
        Lookup::Search(self.new_search(name))
    }

    /// The latest attempt for `name` went unanswered: back off before the next one
    pub fn note_unresolved(&mut self, name: &str, now: Instant) {
        let Some(entry) = self.unresolved.get_mut(name) else {
            return;
        };
        let age = now.saturating_duration_since(entry.first_attempt);
        entry.interval = if age > self.retirement_age {
            self.retired_retry_interval
        } else {
            (entry.interval * 2).clamp(self.min_interval, self.max_interval)
        };
        entry.next_retry = now + entry.interval;
        trace!("No reply for {name}, next search in {:?}", entry.interval);
    }

    pub fn tick(&mut self, now: Instant) -> Tick {
        let mut tick = Tick::default();

        let age = self.retirement_age;
        self.resolved.retain(|name, entry| {
            let keep = now.saturating_duration_since(entry.last_access) <= age;
            if !keep {
                debug!(
                    "Retiring resolution of {name} after {:.0?} (resolved {:.0?} ago)",
                    now - entry.last_access,
                    now - entry.resolved_at
                );
                tick.retired.push(name.clone());
            }
            keep
        });

        let due: Vec<String> = self
            .unresolved
            .iter()
            .filter(|(_, entry)| entry.next_retry <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in due {
            self.note_unresolved(&name, now);
            tick.searches.push(self.new_search(&name));
        }
        tick
    }

    /// Record a search reply. Returns the name it resolved, unless the reply was
    /// stale or a duplicate.
    pub fn on_response(
        &mut self,
        search_id: u32,
        address: SocketAddr,
        now: Instant,
    ) -> Option<String> {
        let name = self.in_flight.remove(&search_id)?;
        if let Some(entry) = self.unresolved.remove(&name) {
            for id in entry.search_ids {
                self.in_flight.remove(&id);
            }
        }
        self.resolved.insert(
            name.clone(),
            Resolution {
                address,
                resolved_at: now,
                last_access: now,
            },
        );
        Some(name)
    }

    /// Stop searching for a name nobody wants any more
    pub fn abandon(&mut self, name: &str) {
        if let Some(entry) = self.unresolved.remove(name) {
            for id in entry.search_ids {
                self.in_flight.remove(&id);
            }
        }
    }

    pub fn forget(&mut self, name: &str) {
        self.resolved.remove(name);
    }

    /// Drop every resolution pointing at `address`, returning the names dropped
    pub fn invalidate(&mut self, address: SocketAddr) -> Vec<String> {
        let names: Vec<String> = self
            .resolved
            .iter()
            .filter(|(_, entry)| entry.address == address)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            self.resolved.remove(name);
        }
        names
    }

    /// Search for every unresolved name again as soon as possible
    pub fn reset_backoff(&mut self, now: Instant) {
        for entry in self.unresolved.values_mut() {
            entry.first_attempt = now;
            entry.interval = self.min_interval;
            entry.next_retry = now;
        }
    }

    /// When [`SearchCache::tick`] next has something to do
    pub fn next_wake(&self) -> Option<Instant> {
        let retries = self.unresolved.values().map(|e| e.next_retry);
        let retirements = self
            .resolved
            .values()
            .map(|e| e.last_access + self.retirement_age + Duration::from_millis(1));
        retries.chain(retirements).min()
    }

    pub fn is_resolved(&self, name: &str) -> bool {
        self.resolved.contains_key(name)
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.unresolved.contains_key(name)
    }

    fn new_search(&mut self, name: &str) -> Search {
        let search_id = wrapping_inplace_add(&mut self.next_search_id);
        if let Some(entry) = self.unresolved.get_mut(name) {
            entry.search_ids.push(search_id);
            if entry.search_ids.len() > RETAINED_SEARCH_IDS {
                let old = entry.search_ids.remove(0);
                self.in_flight.remove(&old);
            }
        }
        self.in_flight.insert(search_id, name.to_string());
        Search {
            search_id,
            channel_name: name.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            min_retry_search_interval: Duration::from_millis(30),
            max_retry_search_interval: Duration::from_secs(5),
            search_retirement_age: Duration::from_secs(480),
            retry_retired_searches_interval: Duration::from_secs(60),
            ..Default::default()
        }
    }

    fn addr() -> SocketAddr {
        "10.0.0.1:5064".parse().unwrap()
    }

    fn search_id(lookup: Lookup) -> u32 {
        match lookup {
            Lookup::Search(search) => search.search_id,
            other => panic!("Expected a search, got {other:?}"),
        }
    }

    /// Run ticks at millisecond resolution and collect when searches went out
    fn search_times(cache: &mut SearchCache, start: Instant, until: Duration) -> Vec<Duration> {
        let mut times = Vec::new();
        let mut now = start;
        while now - start < until {
            if !cache.tick(now).searches.is_empty() {
                times.push(now - start);
            }
            now = cache
                .next_wake()
                .unwrap_or(now + Duration::from_millis(1))
                .max(now + Duration::from_millis(1));
        }
        times
    }

    #[test]
    fn concurrent_requests_share_one_search() {
        let mut cache = SearchCache::new(&config());
        let now = Instant::now();
        let id = search_id(cache.request("X", now));
        assert_eq!(cache.request("X", now), Lookup::Pending);
        assert!(cache.tick(now).searches.is_empty());

        assert_eq!(cache.on_response(id, addr(), now), Some("X".to_string()));
        assert_eq!(cache.request("X", now), Lookup::Resolved(addr()));
        // Duplicate reply
        assert_eq!(cache.on_response(id, addr(), now), None);
        assert!(cache.is_resolved("X") && !cache.is_pending("X"));
    }

    #[test]
    fn retry_backoff_is_bounded() {
        let config = config();
        let mut cache = SearchCache::new(&config);
        let start = Instant::now();
        search_id(cache.request("MISSING", start));
        let times = search_times(&mut cache, start, Duration::from_secs(60));

        assert!(times[0] >= config.min_retry_search_interval);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(gaps.iter().all(|g| *g <= config.max_retry_search_interval));
        assert!(gaps.iter().all(|g| *g >= config.min_retry_search_interval));
        assert_eq!(gaps.last(), Some(&config.max_retry_search_interval));
    }

    #[test]
    fn long_unresolved_names_slow_down() {
        let config = config();
        let mut cache = SearchCache::new(&config);
        let start = Instant::now();
        search_id(cache.request("GONE", start));
        let times = search_times(&mut cache, start, Duration::from_secs(900));
        let late: Vec<_> = times
            .windows(2)
            .filter(|w| w[0] > config.search_retirement_age + config.max_retry_search_interval)
            .map(|w| w[1] - w[0])
            .collect();
        assert!(!late.is_empty());
        assert!(late.iter().all(|g| *g == config.retry_retired_searches_interval));
    }

    #[test]
    fn idle_resolutions_retire() {
        let config = config();
        let mut cache = SearchCache::new(&config);
        let start = Instant::now();
        let id = search_id(cache.request("PV", start));
        cache.on_response(id, addr(), start);

        let before = start + config.search_retirement_age;
        assert!(cache.tick(before).retired.is_empty());
        assert_eq!(cache.lookup("PV", before), Some(addr()));

        // Access refreshed the entry, so retirement is measured from `before`
        let after = before + config.search_retirement_age + Duration::from_secs(1);
        assert_eq!(cache.tick(after).retired, vec!["PV".to_string()]);
        assert!(matches!(cache.request("PV", after), Lookup::Search(_)));
    }

    #[test]
    fn late_reply_to_earlier_attempt_resolves() {
        let mut cache = SearchCache::new(&config());
        let start = Instant::now();
        let first = search_id(cache.request("SLOW", start));
        let retry = cache.tick(start + Duration::from_millis(31));
        assert_eq!(retry.searches.len(), 1);
        assert_ne!(retry.searches[0].search_id, first);

        assert_eq!(
            cache.on_response(first, addr(), start + Duration::from_millis(40)),
            Some("SLOW".to_string())
        );
        // The retry's reply is now a duplicate
        assert_eq!(
            cache.on_response(retry.searches[0].search_id, addr(), start),
            None
        );
    }

    #[test]
    fn invalidation_and_backoff_reset() {
        let mut cache = SearchCache::new(&config());
        let start = Instant::now();
        let id = search_id(cache.request("A", start));
        cache.on_response(id, addr(), start);
        assert_eq!(cache.invalidate(addr()), vec!["A".to_string()]);
        assert!(!cache.is_resolved("A"));

        search_id(cache.request("B", start));
        let later = start + Duration::from_secs(30);
        assert_eq!(cache.tick(later).searches.len(), 1);
        let soon = later + Duration::from_millis(40);
        assert!(cache.tick(soon).searches.is_empty());
        cache.reset_backoff(soon);
        assert_eq!(cache.tick(soon).searches.len(), 1);

        cache.abandon("B");
        assert!(!cache.is_pending("B"));
        assert_eq!(cache.next_wake(), None);
    }
}
