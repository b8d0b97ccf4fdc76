//! Observation records shared across the capture pipeline: everything a
//! stream parser can emit, plus the identifiers used to pair the two halves
//! of an HTTP transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use xxhash_rust::xxh3::Xxh3;

pub mod counters;
pub use counters::{CounterKey, Counts, PacketCounters};

/// Surrogate id of a TCP connection, assigned the first time the reassembler
/// sees either direction of a 4-tuple. Both half-streams of a connection
/// share one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Opaque id matching the two halves of one HTTP transaction. Derived from
/// the bidirectional stream id and the message sequence within the stream,
/// so request k and response k of a connection collide exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairKey(u64);

impl PairKey {
    pub fn derive(stream: StreamId, seq: u32) -> PairKey {
        let mut h = Xxh3::new();
        h.update(&stream.0.to_le_bytes());
        h.update(&seq.to_le_bytes());
        PairKey(h.digest())
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Whether a worker observes the host's server-side traffic (inbound) or
/// traffic the host originates (outbound).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Source and destination of the first packet of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl Endpoints {
    /// The same connection viewed from the opposite direction.
    pub fn flipped(&self) -> Endpoints {
        Endpoints {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

/// Capture timestamps of the first and last packet contributing to an
/// observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observed {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

impl Observed {
    pub fn at(ts: DateTime<Utc>) -> Observed {
        Observed { first: ts, last: ts }
    }

    pub fn extend(&mut self, ts: DateTime<Utc>) {
        if ts < self.first {
            self.first = ts;
        }
        if ts > self.last {
            self.last = ts;
        }
    }
}

/// Multi-valued, case-preserving header collection. Lookup is
/// case-insensitive and returns the first value, which we treat as
/// representative of all occurrences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub stream: StreamId,
    /// Message index within the stream; pairs with the response of the same
    /// index.
    pub seq: u32,
    pub endpoints: Endpoints,
    pub observed: Observed,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub host: String,
    pub headers: Headers,
    pub cookies: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Set when an upstream hop already decompressed the body, in which case
    /// the Content-Encoding header must not be re-applied.
    pub body_decompressed: bool,
}

impl HttpRequest {
    pub fn pair_key(&self) -> PairKey {
        PairKey::derive(self.stream, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub stream: StreamId,
    pub seq: u32,
    pub endpoints: Endpoints,
    pub observed: Observed,
    pub status: u16,
    pub headers: Headers,
    pub cookies: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub body_decompressed: bool,
}

impl HttpResponse {
    pub fn pair_key(&self) -> PairKey {
        PairKey::derive(self.stream, self.seq)
    }
}

/// Lightweight connection diagnostics emitted once per observed TCP segment
/// carrying interesting flags, and on connection creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpMeta {
    pub stream: StreamId,
    pub endpoints: Endpoints,
    pub observed: Observed,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload_len: usize,
}

/// TLS protocol versions surfaced from handshake hints. No payload is ever
/// decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    Ssl3,
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsClientHello {
    pub stream: StreamId,
    pub endpoints: Endpoints,
    pub observed: Observed,
    pub sni: Option<String>,
    pub offered_versions: Vec<TlsVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsServerHello {
    pub stream: StreamId,
    pub endpoints: Endpoints,
    pub observed: Observed,
    pub selected_version: Option<TlsVersion>,
}

/// Bytes no registered parser accepted. Only the length is retained, for
/// counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBytes {
    pub stream: StreamId,
    pub endpoints: Endpoints,
    pub observed: Observed,
    pub len: usize,
}

/// Everything a half-stream can yield.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Content {
    Request(HttpRequest),
    Response(HttpResponse),
    TcpMeta(TcpMeta),
    TlsClientHello(TlsClientHello),
    TlsServerHello(TlsServerHello),
    Unparsed(RawBytes),
}

impl Content {
    pub fn endpoints(&self) -> &Endpoints {
        match self {
            Content::Request(r) => &r.endpoints,
            Content::Response(r) => &r.endpoints,
            Content::TcpMeta(m) => &m.endpoints,
            Content::TlsClientHello(h) => &h.endpoints,
            Content::TlsServerHello(h) => &h.endpoints,
            Content::Unparsed(r) => &r.endpoints,
        }
    }

    pub fn stream(&self) -> StreamId {
        match self {
            Content::Request(r) => r.stream,
            Content::Response(r) => r.stream,
            Content::TcpMeta(m) => m.stream,
            Content::TlsClientHello(h) => h.stream,
            Content::TlsServerHello(h) => h.stream,
            Content::Unparsed(r) => r.stream,
        }
    }

    /// Present only for the HTTP halves that participate in pairing.
    pub fn pair_key(&self) -> Option<PairKey> {
        match self {
            Content::Request(r) => Some(r.pair_key()),
            Content::Response(r) => Some(r.pair_key()),
            _ => None,
        }
    }
}

/// A record as it flows through a collector chain: content plus the
/// interface and direction of the worker that captured it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub iface: Arc<str>,
    pub direction: Direction,
    pub content: Content,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_and_response_of_same_index_share_a_pair_key() {
        let stream = StreamId(42);
        assert_eq!(
            PairKey::derive(stream, 3),
            PairKey::derive(stream, 3),
        );
        assert_ne!(PairKey::derive(stream, 3), PairKey::derive(stream, 4));
        assert_ne!(
            PairKey::derive(StreamId(42), 3),
            PairKey::derive(StreamId(43), 3),
        );
    }

    #[test]
    fn header_lookup_is_case_insensitive_first_value() {
        let mut headers = Headers::default();
        headers.push("X-Thing", "first");
        headers.push("x-thing", "second");
        assert_eq!(Some("first"), headers.get("X-THING"));
        assert_eq!(2, headers.get_all("x-thing").count());
    }

    #[test]
    fn observed_extend_widens_both_ends() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        let mut obs = Observed::at(t1);
        obs.extend(t0);
        obs.extend(t1);
        assert_eq!(t0, obs.first);
        assert_eq!(t1, obs.last);
    }
}
