//! Rolling packet counters keyed by (interface, src port, dst port).
//!
//! Counts only increase and are eventually consistent with the stream:
//! writers increment under a striped lock, readers snapshot. The key space
//! is bounded; arrivals past the cap land in a single overflow bucket
//! instead of growing the maps.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CounterKey {
    pub iface: String,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub tcp_packets: u64,
    pub http_requests: u64,
    pub http_responses: u64,
    pub tls_hellos: u64,
    pub unparsed: u64,
}

impl Counts {
    pub fn total(&self) -> u64 {
        self.tcp_packets + self.http_requests + self.http_responses + self.tls_hellos + self.unparsed
    }

    fn merge(&mut self, other: &Counts) {
        self.tcp_packets += other.tcp_packets;
        self.http_requests += other.http_requests;
        self.http_responses += other.http_responses;
        self.tls_hellos += other.tls_hellos;
        self.unparsed += other.unparsed;
    }
}

const SHARDS: usize = 8;

pub struct PacketCounters {
    shards: Vec<Mutex<HashMap<CounterKey, Counts>>>,
    max_keys: usize,
    overflow: AtomicU64,
}

impl PacketCounters {
    pub fn new(max_keys: usize) -> PacketCounters {
        PacketCounters {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            max_keys,
            overflow: AtomicU64::new(0),
        }
    }

    pub fn add(&self, key: CounterKey, delta: Counts) {
        let shard = &self.shards[self.shard_of(&key)];
        let mut map = shard.lock().unwrap();
        if map.len() >= self.max_keys / SHARDS && !map.contains_key(&key) {
            self.overflow.fetch_add(delta.total(), Ordering::Relaxed);
            return;
        }
        map.entry(key).or_default().merge(&delta);
    }

    pub fn add_tcp_packet(&self, iface: &str, src_port: u16, dst_port: u16) {
        self.add(
            CounterKey {
                iface: iface.to_string(),
                src_port,
                dst_port,
            },
            Counts {
                tcp_packets: 1,
                ..Default::default()
            },
        );
    }

    /// Stable snapshot of all keys, plus the overflow total.
    pub fn snapshot(&self) -> (BTreeMap<CounterKey, Counts>, u64) {
        let mut out = BTreeMap::new();
        for shard in &self.shards {
            for (key, counts) in shard.lock().unwrap().iter() {
                out.insert(key.clone(), *counts);
            }
        }
        (out, self.overflow.load(Ordering::Relaxed))
    }

    /// Sum over every key, one row per interface.
    pub fn totals_by_interface(&self) -> BTreeMap<String, Counts> {
        let mut out: BTreeMap<String, Counts> = BTreeMap::new();
        let (snapshot, _) = self.snapshot();
        for (key, counts) in snapshot {
            out.entry(key.iface).or_default().merge(&counts);
        }
        out
    }

    fn shard_of(&self, key: &CounterKey) -> usize {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        h.finish() as usize % SHARDS
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(port: u16) -> CounterKey {
        CounterKey {
            iface: "eth0".to_string(),
            src_port: port,
            dst_port: 80,
        }
    }

    #[test]
    fn counts_accumulate_per_key() {
        let counters = PacketCounters::new(1024);
        counters.add_tcp_packet("eth0", 5000, 80);
        counters.add_tcp_packet("eth0", 5000, 80);
        counters.add(
            key(5000),
            Counts {
                http_requests: 1,
                ..Default::default()
            },
        );
        let (snapshot, overflow) = counters.snapshot();
        assert_eq!(0, overflow);
        let counts = snapshot.get(&key(5000)).unwrap();
        assert_eq!(2, counts.tcp_packets);
        assert_eq!(1, counts.http_requests);
    }

    #[test]
    fn overflow_absorbs_keys_past_the_cap() {
        let counters = PacketCounters::new(SHARDS); // one key per shard
        for port in 0..64 {
            counters.add_tcp_packet("eth0", port, 80);
        }
        let (snapshot, overflow) = counters.snapshot();
        let kept: u64 = snapshot.values().map(|c| c.total()).sum();
        assert_eq!(64, kept + overflow);
        assert!(overflow > 0);
    }
}
