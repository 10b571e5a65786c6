//! Bounded IP -> hostname cache used to pre-tag a connection with the
//! hostname most recently resolved to its destination address.
//!
//! Grounded on the reference's `ip_lru.c`: a hit moves the entry to the
//! front by delete-then-reinsert, and capacity is enforced only at insert
//! time by dropping the single oldest entry.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

pub struct ReverseDnsLru {
    capacity: usize,
    entries: HashMap<IpAddr, String>,
    // Back is most-recently-used; front is the next eviction candidate.
    recency: VecDeque<IpAddr>,
}

impl ReverseDnsLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or overwrites `ip -> hostname`, moving it to the front. On
    /// overflow, evicts exactly the single oldest entry.
    pub fn add(&mut self, ip: IpAddr, hostname: String) {
        if self.entries.contains_key(&ip) {
            self.bump(ip);
        } else {
            self.recency.push_back(ip);
        }
        self.entries.insert(ip, hostname);

        if self.entries.len() > self.capacity {
            if let Some(oldest) = self.recency.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    /// Looks up `ip`, moving it to the front on a hit. Returns an owned copy
    /// so the caller can retain it past later evictions.
    pub fn find(&mut self, ip: &IpAddr) -> Option<String> {
        let hostname = self.entries.get(ip).cloned()?;
        self.bump(*ip);
        Some(hostname)
    }

    fn bump(&mut self, ip: IpAddr) {
        if let Some(pos) = self.recency.iter().position(|&k| k == ip) {
            self.recency.remove(pos);
        }
        self.recency.push_back(ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn find_after_add_hits_and_moves_to_front() {
        let mut lru = ReverseDnsLru::new(3);
        lru.add(ip(1), "a.example".into());
        assert_eq!(lru.find(&ip(1)), Some("a.example".into()));
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut lru = ReverseDnsLru::new(2);
        lru.add(ip(1), "a".into());
        lru.add(ip(2), "b".into());
        lru.add(ip(3), "c".into());
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.find(&ip(1)), None);
        assert_eq!(lru.find(&ip(2)), Some("b".into()));
        assert_eq!(lru.find(&ip(3)), Some("c".into()));
    }

    #[test]
    fn touching_an_entry_saves_it_from_eviction() {
        let mut lru = ReverseDnsLru::new(2);
        lru.add(ip(1), "a".into());
        lru.add(ip(2), "b".into());
        assert_eq!(lru.find(&ip(1)), Some("a".into()));
        lru.add(ip(3), "c".into());
        assert_eq!(lru.find(&ip(2)), None);
        assert_eq!(lru.find(&ip(1)), Some("a".into()));
    }

    #[test]
    fn overwrite_does_not_multiply_entries() {
        let mut lru = ReverseDnsLru::new(4);
        lru.add(ip(1), "a".into());
        lru.add(ip(1), "a2".into());
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.find(&ip(1)), Some("a2".into()));
    }
}
