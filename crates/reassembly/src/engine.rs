//! The reassembly engine: filtered packets in, ordered half-stream bytes out
//! (through the harness), plus TCP metadata and drop accounting.
//!
//! Capture often starts mid-connection, so streams are force-accepted
//! without a SYN: the sequence number of the first observed byte defines the
//! stream origin. Out-of-order segments are buffered under page budgets;
//! when a budget or the flush timer is hit, the oldest gap is skipped
//! forward and counted rather than stalling delivery.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use capture::{CapturedPacket, Datalink};
use records::{
    Content, Direction, Endpoints, Observed, PacketCounters, Record, StreamId, TcpMeta,
};

use crate::harness::{Harness, Registry};

#[derive(Debug, Clone)]
pub struct Config {
    /// Total page budget for this assembler, before `buffer_share`.
    pub total_pages: usize,
    /// Page budget for any single connection.
    pub per_conn_pages: usize,
    pub page_bytes: usize,
    /// Fraction of `total_pages` this assembler may use, when several share
    /// one global budget.
    pub buffer_share: f64,
    /// Force delivery through a stalled gap after this long.
    pub flush_timeout: Duration,
    /// Drop an idle stream entirely after this long.
    pub close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            total_pages: 100_000,
            per_conn_pages: 4096,
            page_bytes: 1900,
            buffer_share: 1.0,
            flush_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(90),
        }
    }
}

impl Config {
    /// Timers are evaluated on this period.
    pub fn tick_interval(&self) -> Duration {
        self.flush_timeout / 4
    }

    fn page_budget(&self) -> usize {
        (self.total_pages as f64 * self.buffer_share) as usize
    }
}

// Stream ids are process-global so two assemblers never collide.
static NEXT_STREAM: AtomicU64 = AtomicU64::new(1);

/// Bidirectional flow key: the 4-tuple normalized so both directions map to
/// the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    lo: (IpAddr, u16),
    hi: (IpAddr, u16),
}

impl FlowKey {
    fn of(e: &Endpoints) -> FlowKey {
        let src = (e.src_ip, e.src_port);
        let dst = (e.dst_ip, e.dst_port);
        if src <= dst {
            FlowKey { lo: src, hi: dst }
        } else {
            FlowKey { lo: dst, hi: src }
        }
    }
}

struct Half {
    harness: Harness,
    endpoints: Endpoints,
    /// Absolute sequence number of the stream origin; None until the first
    /// byte (or SYN) is observed in this direction.
    base: Option<u32>,
    /// Next offset (relative to base) to deliver.
    next_offset: u32,
    /// Out-of-order segments keyed by relative offset.
    segments: BTreeMap<u32, (Vec<u8>, DateTime<Utc>)>,
    pages: usize,
    fin: bool,
    done: bool,
    last_progress: DateTime<Utc>,
}

impl Half {
    fn new(registry: Arc<Registry>, stream: StreamId, endpoints: Endpoints, now: DateTime<Utc>) -> Half {
        Half {
            harness: Harness::new(registry, stream, endpoints),
            endpoints,
            base: None,
            next_offset: 0,
            segments: BTreeMap::new(),
            pages: 0,
            fin: false,
            done: false,
            last_progress: now,
        }
    }
}

struct Connection {
    stream: StreamId,
    /// Endpoints of the first observed packet; that direction is half 0.
    origin: Endpoints,
    halves: [Half; 2],
    last_activity: DateTime<Utc>,
}

pub struct Reassembler {
    cfg: Config,
    registry: Arc<Registry>,
    iface: Arc<str>,
    direction: Direction,
    counters: Arc<PacketCounters>,
    conns: HashMap<FlowKey, Connection>,
    pages_in_use: usize,
    /// Bytes that never reached a half-stream: non-TCP, no network layer.
    dropped_bytes: u64,
    gaps: u64,
    panics: u64,
}

impl Reassembler {
    pub fn new(
        cfg: Config,
        registry: Arc<Registry>,
        iface: Arc<str>,
        direction: Direction,
        counters: Arc<PacketCounters>,
    ) -> Reassembler {
        Reassembler {
            cfg,
            registry,
            iface,
            direction,
            counters,
            conns: HashMap::new(),
            pages_in_use: 0,
            dropped_bytes: 0,
            gaps: 0,
            panics: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    pub fn active_connections(&self) -> usize {
        self.conns.len()
    }

    /// Process one captured frame. A panic in per-packet handling is caught
    /// and counted; the engine keeps running.
    pub fn handle_packet(&mut self, packet: &CapturedPacket) -> Vec<Record> {
        match catch_unwind(AssertUnwindSafe(|| self.handle_inner(packet))) {
            Ok(records) => records,
            Err(payload) => {
                self.panics += 1;
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(
                    iface = %self.iface,
                    panics = self.panics,
                    panic = %message,
                    "caught panic while handling a packet; continuing"
                );
                Vec::new()
            }
        }
    }

    fn handle_inner(&mut self, packet: &CapturedPacket) -> Vec<Record> {
        let sliced = match slice_packet(packet) {
            Some(sliced) => sliced,
            None => {
                self.dropped_bytes += packet.data.len() as u64;
                return Vec::new();
            }
        };
        let Sliced {
            endpoints,
            seq,
            syn,
            ack,
            fin,
            rst,
            payload,
        } = sliced;

        self.counters
            .add_tcp_packet(&self.iface, endpoints.src_port, endpoints.dst_port);

        let key = FlowKey::of(&endpoints);
        let mut out = Vec::new();

        if !self.conns.contains_key(&key) {
            let stream = StreamId(NEXT_STREAM.fetch_add(1, Ordering::Relaxed));
            let conn = Connection {
                stream,
                origin: endpoints,
                halves: [
                    Half::new(self.registry.clone(), stream, endpoints, packet.ts),
                    Half::new(self.registry.clone(), stream, endpoints.flipped(), packet.ts),
                ],
                last_activity: packet.ts,
            };
            self.conns.insert(key, conn);
            out.push(self.record(Content::TcpMeta(TcpMeta {
                stream,
                endpoints,
                observed: Observed::at(packet.ts),
                syn,
                ack,
                fin,
                rst,
                payload_len: payload.len(),
            })));
        }

        let conn = self.conns.get_mut(&key).expect("connection just ensured");
        conn.last_activity = packet.ts;
        let half_index = if endpoints == conn.origin { 0 } else { 1 };
        let half = &mut conn.halves[half_index];

        if half.base.is_none() {
            // First bytes observed in this direction define the origin. A
            // SYN consumes one sequence number before data.
            half.base = Some(if syn { seq.wrapping_add(1) } else { seq });
        }

        if !payload.is_empty() && !half.done {
            let base = half.base.expect("base set above");
            let start = if syn { seq.wrapping_add(1) } else { seq };
            let offset = start.wrapping_sub(base);
            let added = buffer_segment(half, offset, payload, packet.ts, self.cfg.page_bytes);
            self.pages_in_use += added;
            deliver_ready(half, &mut out, &mut |c| wrap(&self.iface, self.direction, c), &mut self.pages_in_use, self.cfg.page_bytes);

            if half.pages > self.cfg.per_conn_pages || self.pages_in_use > self.cfg.page_budget() {
                self.gaps += 1;
                skip_gap(half, &mut out, &mut |c| wrap(&self.iface, self.direction, c), &mut self.pages_in_use, self.cfg.page_bytes);
            }
        }

        if fin {
            half.fin = true;
        }
        if half.fin && half.segments.is_empty() && !half.done {
            finish_half(half, packet.ts, &mut out, &mut |c| wrap(&self.iface, self.direction, c));
        }

        if rst {
            let stream = conn.stream;
            for half in conn.halves.iter_mut() {
                finish_half(half, packet.ts, &mut out, &mut |c| {
                    wrap(&self.iface, self.direction, c)
                });
                self.pages_in_use = self.pages_in_use.saturating_sub(half.pages);
                half.pages = 0;
                half.segments.clear();
            }
            self.conns.remove(&key);
            tracing::trace!(stream = %stream, "connection reset");
        } else if conn.halves.iter().all(|h| h.done) {
            self.conns.remove(&key);
        }

        out
    }

    /// Periodic timer pass: force delivery through stalled gaps, drop idle
    /// streams.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Record> {
        let mut out = Vec::new();
        let flush = ChronoDuration::from_std(self.cfg.flush_timeout).expect("small duration");
        let close = ChronoDuration::from_std(self.cfg.close_timeout).expect("small duration");

        let mut dead = Vec::new();
        for (key, conn) in self.conns.iter_mut() {
            if now - conn.last_activity > close {
                for half in conn.halves.iter_mut() {
                    finish_half(half, now, &mut out, &mut |c| {
                        wrap(&self.iface, self.direction, c)
                    });
                    self.pages_in_use = self.pages_in_use.saturating_sub(half.pages);
                    half.pages = 0;
                    half.segments.clear();
                }
                dead.push(*key);
                continue;
            }
            for half in conn.halves.iter_mut() {
                if half.done {
                    continue;
                }
                if !half.segments.is_empty() && now - half.last_progress > flush {
                    self.gaps += 1;
                    skip_gap(half, &mut out, &mut |c| wrap(&self.iface, self.direction, c), &mut self.pages_in_use, self.cfg.page_bytes);
                }
                if half.fin && half.segments.is_empty() {
                    finish_half(half, now, &mut out, &mut |c| {
                        wrap(&self.iface, self.direction, c)
                    });
                }
            }
            if conn.halves.iter().all(|h| h.done) {
                dead.push(*key);
            }
        }
        for key in dead {
            self.conns.remove(&key);
        }
        out
    }

    /// End of input: flush and close every stream so parsers see EOF and
    /// finalize.
    pub fn finish(&mut self) -> Vec<Record> {
        let now = Utc::now();
        let mut out = Vec::new();
        for (_, mut conn) in self.conns.drain() {
            for half in conn.halves.iter_mut() {
                // Deliver what is in order, skip through remaining gaps, and
                // end the harness.
                while !half.segments.is_empty() {
                    skip_gap(half, &mut out, &mut |c| wrap(&self.iface, self.direction, c), &mut self.pages_in_use, self.cfg.page_bytes);
                }
                finish_half(half, now, &mut out, &mut |c| {
                    wrap(&self.iface, self.direction, c)
                });
            }
        }
        if self.dropped_bytes > 0 || self.gaps > 0 || self.panics > 0 {
            tracing::info!(
                iface = %self.iface,
                dropped_bytes = self.dropped_bytes,
                gaps = self.gaps,
                panics = self.panics,
                "reassembly finished"
            );
        }
        out
    }

    fn record(&self, content: Content) -> Record {
        wrap(&self.iface, self.direction, content)
    }
}

fn wrap(iface: &Arc<str>, direction: Direction, content: Content) -> Record {
    Record {
        iface: iface.clone(),
        direction,
        content,
    }
}

fn pages_of(len: usize, page_bytes: usize) -> usize {
    ((len + page_bytes - 1) / page_bytes).max(1)
}

/// Sequence-space comparison: is `a` strictly before `b`, modulo wraparound.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

struct Sliced<'a> {
    endpoints: Endpoints,
    seq: u32,
    syn: bool,
    ack: bool,
    fin: bool,
    rst: bool,
    payload: &'a [u8],
}

/// Laminate a captured frame down to its TCP segment, if it has one.
fn slice_packet(packet: &CapturedPacket) -> Option<Sliced<'_>> {
    let sliced = match packet.datalink {
        Datalink::Ethernet => etherparse::SlicedPacket::from_ethernet(&packet.data).ok()?,
        Datalink::Loopback => {
            // 4-byte protocol family header precedes the IP payload.
            etherparse::SlicedPacket::from_ip(packet.data.get(4..)?).ok()?
        }
        Datalink::Raw => etherparse::SlicedPacket::from_ip(&packet.data).ok()?,
    };

    let (src_ip, dst_ip) = match sliced.net.as_ref()? {
        etherparse::NetSlice::Ipv4(v4) => (
            IpAddr::V4(v4.header().source_addr()),
            IpAddr::V4(v4.header().destination_addr()),
        ),
        etherparse::NetSlice::Ipv6(v6) => (
            IpAddr::V6(v6.header().source_addr()),
            IpAddr::V6(v6.header().destination_addr()),
        ),
    };

    let tcp = match sliced.transport.as_ref()? {
        etherparse::TransportSlice::Tcp(tcp) => tcp,
        _ => return None,
    };

    Some(Sliced {
        endpoints: Endpoints {
            src_ip,
            src_port: tcp.source_port(),
            dst_ip,
            dst_port: tcp.destination_port(),
        },
        seq: tcp.sequence_number(),
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        payload: tcp.payload(),
    })
}

/// Buffer one segment, trimming what was already delivered. Returns pages
/// added.
fn buffer_segment(
    half: &mut Half,
    mut offset: u32,
    mut payload: &[u8],
    ts: DateTime<Utc>,
    page_bytes: usize,
) -> usize {
    // Entirely already delivered?
    let end = offset.wrapping_add(payload.len() as u32);
    if !seq_lt(half.next_offset, end) {
        return 0;
    }
    // Trim the front overlap with delivered bytes.
    if seq_lt(offset, half.next_offset) {
        let advance = half.next_offset.wrapping_sub(offset) as usize;
        payload = &payload[advance..];
        offset = half.next_offset;
    }
    // Duplicate offsets keep the longer payload.
    if let Some((existing, _)) = half.segments.get(&offset) {
        if existing.len() >= payload.len() {
            return 0;
        }
        let old_pages = pages_of(existing.len(), page_bytes);
        let new_pages = pages_of(payload.len(), page_bytes);
        half.segments.insert(offset, (payload.to_vec(), ts));
        half.pages += new_pages - old_pages;
        return new_pages - old_pages;
    }
    let pages = pages_of(payload.len(), page_bytes);
    half.segments.insert(offset, (payload.to_vec(), ts));
    half.pages += pages;
    pages
}

/// Deliver every buffered segment that is now in order.
fn deliver_ready(
    half: &mut Half,
    out: &mut Vec<Record>,
    wrap: &mut impl FnMut(Content) -> Record,
    pages_in_use: &mut usize,
    page_bytes: usize,
) {
    loop {
        let first = match half.segments.keys().next() {
            Some(&offset) if !seq_lt(half.next_offset, offset) => offset,
            _ => return,
        };
        let (data, ts) = half.segments.remove(&first).expect("key just observed");
        let pages = pages_of(data.len(), page_bytes);
        half.pages = half.pages.saturating_sub(pages);
        *pages_in_use = pages_in_use.saturating_sub(pages);

        // A segment may begin at or before next_offset; skip the re-covered
        // prefix.
        let skip = half.next_offset.wrapping_sub(first) as usize;
        if skip >= data.len() {
            continue;
        }
        let fresh = &data[skip..];
        half.next_offset = half.next_offset.wrapping_add(fresh.len() as u32);
        half.last_progress = ts;
        for content in half.harness.feed(fresh, ts, false) {
            out.push(wrap(content));
        }
    }
}

/// Jump the delivery cursor to the oldest buffered segment, abandoning the
/// gap before it, then deliver.
fn skip_gap(
    half: &mut Half,
    out: &mut Vec<Record>,
    wrap: &mut impl FnMut(Content) -> Record,
    pages_in_use: &mut usize,
    page_bytes: usize,
) {
    if let Some(&first) = half.segments.keys().next() {
        if seq_lt(half.next_offset, first) {
            tracing::trace!(
                skipped = first.wrapping_sub(half.next_offset),
                "skipping forward over a reassembly gap"
            );
            half.next_offset = first;
        }
        deliver_ready(half, out, wrap, pages_in_use, page_bytes);
    }
}

fn finish_half(
    half: &mut Half,
    now: DateTime<Utc>,
    out: &mut Vec<Record>,
    wrap: &mut impl FnMut(Content) -> Record,
) {
    if half.done {
        return;
    }
    half.done = true;
    for content in half.harness.feed(&[], now, true) {
        out.push(wrap(content));
    }
}


/// Drive a reassembler from a packet channel until end-of-input, forwarding
/// records downstream. Timer evaluation happens on the tick interval; the
/// channel closing (capture stopped) flushes and closes all streams.
pub async fn run(
    mut reassembler: Reassembler,
    mut packets: mpsc::Receiver<CapturedPacket>,
    out: mpsc::Sender<Record>,
) {
    let mut ticker = tokio::time::interval(reassembler.cfg.tick_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            maybe = packets.recv() => match maybe {
                Some(packet) => {
                    for record in reassembler.handle_packet(&packet) {
                        if out.send(record).await.is_err() {
                            return;
                        }
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                for record in reassembler.tick(Utc::now()) {
                    if out.send(record).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    for record in reassembler.finish() {
        if out.send(record).await.is_err() {
            return;
        }
    }
}
