use std::collections::{HashMap, hash_map::Entry};

use crate::utils::wrapping_inplace_add;

/// Correlation ids mapped to whatever is waiting on them.
///
/// Ids come from a wrapping counter, so an id is only handed out again after the
/// whole id space has been cycled through, and never while it is still registered.
#[derive(Debug)]
pub(crate) struct IdTable<V> {
    next: u32,
    entries: HashMap<u32, V>,
}

impl<V> Default for IdTable<V> {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl<V> IdTable<V> {
    pub fn starting_at(first: u32) -> Self {
        IdTable {
            next: first,
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, value: V) -> u32 {
        loop {
            let id = wrapping_inplace_add(&mut self.next);
            if let Entry::Vacant(entry) = self.entries.entry(id) {
                entry.insert(value);
                return id;
            }
        }
    }

    pub fn release(&mut self, id: u32) -> Option<V> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<&V> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut V> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &V)> {
        self.entries.iter().map(|(id, v)| (*id, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut V)> {
        self.entries.iter_mut().map(|(id, v)| (*id, v))
    }

    /// Release every id whose entry matches
    pub fn release_where(&mut self, mut predicate: impl FnMut(&V) -> bool) -> Vec<(u32, V)> {
        let ids: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, v)| predicate(v))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|v| (id, v)))
            .collect()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (u32, V)> + '_ {
        self.entries.drain()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_increase() {
        let mut table = IdTable::default();
        assert_eq!(table.register("a"), 1);
        assert_eq!(table.register("b"), 2);
        assert_eq!(table.release(1), Some("a"));
        assert_eq!(table.register("c"), 3);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn wraparound_skips_registered_ids() {
        let mut table = IdTable::starting_at(u32::MAX - 1);
        let held = table.register(());
        assert_eq!(held, u32::MAX - 1);
        assert_eq!(table.register(()), u32::MAX);
        assert_eq!(table.register(()), 0);
        table.release(u32::MAX);
        // Force the counter back around onto the held id
        table.next = u32::MAX - 1;
        assert_eq!(table.register(()), u32::MAX);
        assert!(table.contains(held));
    }

    #[test]
    fn randomized_register_release_never_duplicates() {
        let mut rng = fastrand::Rng::with_seed(0x5EED);
        for start in [1, u32::MAX - 200] {
            let mut table = IdTable::starting_at(start);
            let mut live: HashSet<u32> = HashSet::new();
            for _ in 0..5000 {
                if live.is_empty() || rng.u8(..) < 150 {
                    let id = table.register(());
                    assert!(live.insert(id), "id {id} handed out while registered");
                } else {
                    let victim = *live.iter().nth(rng.usize(..live.len())).unwrap();
                    live.remove(&victim);
                    assert!(table.release(victim).is_some());
                }
                assert_eq!(table.len(), live.len());
            }
        }
    }
}
