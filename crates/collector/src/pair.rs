//! The terminal collector: pair cache and latency joiner.
//!
//! HTTP halves are turned into partial witnesses and matched by pair key
//! with atomic take-or-insert semantics, so the two halves may race in from
//! different chains without double-emitting. Stragglers are promoted to
//! unpaired witnesses by a periodic sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use http_inference::{build_request, build_response, Built};
use records::{
    Content, Direction, Endpoints, Observed, PairKey, Record, TcpMeta, TlsClientHello,
    TlsServerHello,
};
use witness::Witness;

use crate::Collector;

/// One completed (or expired) witness, ready for upload.
#[derive(Debug, Clone)]
pub struct WitnessReport {
    pub witness: Witness,
    pub pair_key: PairKey,
    pub iface: String,
    pub direction: Direction,
    /// Endpoints in request direction when the request half was seen.
    pub endpoints: Endpoints,
    /// Capture time of the first packet of the pair.
    pub witness_time: DateTime<Utc>,
    /// Response first-packet time minus request last-packet time, for
    /// paired witnesses.
    pub latency_ms: Option<f64>,
    pub x_forwarded_for: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TcpReport {
    pub iface: String,
    pub direction: Direction,
    pub meta: TcpMeta,
}

#[derive(Debug, Clone)]
pub enum TlsHello {
    Client(TlsClientHello),
    Server(TlsServerHello),
}

#[derive(Debug, Clone)]
pub struct TlsReport {
    pub iface: String,
    pub direction: Direction,
    pub hello: TlsHello,
}

#[derive(Debug, Clone)]
pub enum Report {
    Witness(WitnessReport),
    Tcp(TcpReport),
    Tls(TlsReport),
}

/// Downstream of the pair cache: the batch uploader, or a HAR writer.
pub trait ReportSink: Send {
    fn deliver(&mut self, report: Report) -> anyhow::Result<()>;
    fn close(&mut self) -> anyhow::Result<()>;
}

struct CacheEntry {
    built: Built,
    iface: String,
    direction: Direction,
    endpoints: Endpoints,
    is_request: bool,
    observed: Observed,
    inserted_at: DateTime<Utc>,
}

const SHARDS: usize = 8;

struct Shard(Mutex<HashMap<PairKey, CacheEntry>>);

/// Terminal collector shared by every chain. Clones share one cache and one
/// sink; close is idempotent and drains the cache exactly once.
pub struct PairCollector {
    shards: Arc<Vec<Shard>>,
    sink: Arc<Mutex<Box<dyn ReportSink>>>,
    pair_expiration: ChronoDuration,
    closed: Arc<AtomicBool>,
}

impl Clone for PairCollector {
    fn clone(&self) -> PairCollector {
        PairCollector {
            shards: self.shards.clone(),
            sink: self.sink.clone(),
            pair_expiration: self.pair_expiration,
            closed: self.closed.clone(),
        }
    }
}

impl PairCollector {
    pub fn new(sink: Box<dyn ReportSink>, pair_expiration: std::time::Duration) -> PairCollector {
        PairCollector {
            shards: Arc::new((0..SHARDS).map(|_| Shard(Mutex::new(HashMap::new()))).collect()),
            sink: Arc::new(Mutex::new(sink)),
            pair_expiration: ChronoDuration::from_std(pair_expiration)
                .expect("pair expiration fits chrono"),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn shard(&self, key: &PairKey) -> &Shard {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        key.hash(&mut h);
        &self.shards[h.finish() as usize % SHARDS]
    }

    fn deliver(&self, report: Report) -> anyhow::Result<()> {
        self.sink.lock().unwrap().deliver(report)
    }

    /// Atomic take-or-insert: either the other half was cached (pair and
    /// emit) or this half takes its place.
    fn join(&self, record: &Record, built: Built, is_request: bool, observed: Observed) -> anyhow::Result<()> {
        let key = built.pair_key;
        let endpoints = *record.content.endpoints();

        let emission = {
            let mut map = self.shard(&key).0.lock().unwrap();
            match map.remove(&key) {
                Some(entry) if entry.is_request != is_request => {
                    Some(self.pair_up(key, entry, built, is_request, &record.iface, record.direction, endpoints, observed))
                }
                Some(same_side) => {
                    // A duplicate half for this key; emit the stale one
                    // unpaired and cache the newcomer.
                    map.insert(
                        key,
                        CacheEntry {
                            built,
                            iface: record.iface.to_string(),
                            direction: record.direction,
                            endpoints,
                            is_request,
                            observed,
                            inserted_at: Utc::now(),
                        },
                    );
                    Some(unpaired(same_side))
                }
                None => {
                    map.insert(
                        key,
                        CacheEntry {
                            built,
                            iface: record.iface.to_string(),
                            direction: record.direction,
                            endpoints,
                            is_request,
                            observed,
                            inserted_at: Utc::now(),
                        },
                    );
                    None
                }
            }
        };

        match emission {
            Some(Ok(report)) => self.deliver(Report::Witness(report)),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "dropping witness on merge failure");
                Ok(())
            }
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn pair_up(
        &self,
        key: PairKey,
        cached: CacheEntry,
        built: Built,
        newcomer_is_request: bool,
        iface: &str,
        direction: Direction,
        endpoints: Endpoints,
        observed: Observed,
    ) -> Result<WitnessReport, witness::Error> {
        let mut merged = built.witness;
        let x_forwarded_for = built
            .x_forwarded_for
            .or_else(|| cached.built.x_forwarded_for.clone());
        merged.merge(cached.built.witness)?;

        // Latency and endpoints are oriented by which half is the request.
        let (request_endpoints, latency_ms, request_iface, request_direction) =
            if newcomer_is_request {
                // Cached half is the response; it arrived first, so latency
                // is ill-defined. Swap endpoints to request direction.
                (endpoints, None, iface.to_string(), direction)
            } else {
                let latency = observed.first - cached.observed.last;
                (
                    cached.endpoints,
                    latency.num_microseconds().map(|us| us as f64 / 1000.0),
                    cached.iface,
                    cached.direction,
                )
            };

        Ok(WitnessReport {
            witness: merged,
            pair_key: key,
            iface: request_iface,
            direction: request_direction,
            endpoints: request_endpoints,
            witness_time: observed.first.min(cached.observed.first),
            latency_ms,
            x_forwarded_for,
        })
    }

    /// Promote entries older than the pair expiration to unpaired witnesses.
    pub fn sweep(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut expired = Vec::new();
        for shard in self.shards.iter() {
            let mut map = shard.0.lock().unwrap();
            let old: Vec<PairKey> = map
                .iter()
                .filter(|(_, entry)| now - entry.inserted_at > self.pair_expiration)
                .map(|(key, _)| *key)
                .collect();
            for key in old {
                if let Some(entry) = map.remove(&key) {
                    expired.push(entry);
                }
            }
        }
        for entry in expired {
            match unpaired(entry) {
                Ok(report) => self.deliver(Report::Witness(report))?,
                Err(err) => tracing::warn!(error = %err, "dropping expired witness"),
            }
        }
        Ok(())
    }

    fn drain(&self) -> anyhow::Result<()> {
        // Everything still cached is emitted unpaired.
        self.sweep(Utc::now() + self.pair_expiration + ChronoDuration::seconds(1))
    }
}

fn unpaired(entry: CacheEntry) -> Result<WitnessReport, witness::Error> {
    Ok(WitnessReport {
        witness: entry.built.witness,
        pair_key: entry.built.pair_key,
        iface: entry.iface,
        direction: entry.direction,
        endpoints: entry.endpoints,
        witness_time: entry.observed.first,
        latency_ms: None,
        x_forwarded_for: entry.built.x_forwarded_for,
    })
}

impl Collector for PairCollector {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        match &record.content {
            Content::Request(req) => {
                let observed = req.observed;
                match build_request(req) {
                    Ok(built) => self.join(&record, built, true, observed),
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping request witness");
                        Ok(())
                    }
                }
            }
            Content::Response(resp) => {
                let observed = resp.observed;
                match build_response(resp) {
                    Ok(built) => self.join(&record, built, false, observed),
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping response witness");
                        Ok(())
                    }
                }
            }
            Content::TcpMeta(meta) => self.deliver(Report::Tcp(TcpReport {
                iface: record.iface.to_string(),
                direction: record.direction,
                meta: *meta,
            })),
            Content::TlsClientHello(hello) => self.deliver(Report::Tls(TlsReport {
                iface: record.iface.to_string(),
                direction: record.direction,
                hello: TlsHello::Client(hello.clone()),
            })),
            Content::TlsServerHello(hello) => self.deliver(Report::Tls(TlsReport {
                iface: record.iface.to_string(),
                direction: record.direction,
                hello: TlsHello::Server(hello.clone()),
            })),
            // Raw spans were already counted upstream.
            Content::Unparsed(_) => Ok(()),
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.drain()?;
        self.sink.lock().unwrap().close()
    }
}
