//! Wire shapes of uploaded reports. Field names and encodings here are a
//! contract with the ingestion service; treat every rename as a breaking
//! change.

use std::collections::BTreeMap;

use chrono::SecondsFormat;
use collector::{TcpReport, TlsHello, TlsReport, WitnessReport};
use records::{Direction, TlsVersion};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct WitnessRow {
    pub direction: Direction,
    pub origin_addr: String,
    pub origin_port: u16,
    pub destination_addr: String,
    pub destination_port: u16,
    /// Base64-url encoded canonical serialization of the witness tree.
    pub witness_proto: String,
    pub client_witness_time: String,
    /// Canonical hash of the witness tree, stable between implementations.
    pub hash: String,
    /// The pair key, opaque.
    pub id: String,
    pub tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_forwarded_for: Option<String>,
}

impl WitnessRow {
    pub fn from_report(report: &WitnessReport, tags: &BTreeMap<String, String>) -> WitnessRow {
        WitnessRow {
            direction: report.direction,
            origin_addr: report.endpoints.src_ip.to_string(),
            origin_port: report.endpoints.src_port,
            destination_addr: report.endpoints.dst_ip.to_string(),
            destination_port: report.endpoints.dst_port,
            witness_proto: report.witness.encode(),
            client_witness_time: report
                .witness_time
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            hash: report.witness.canonical_hash().to_string(),
            id: report.pair_key.to_string(),
            tags: tags.clone(),
            processing_latency_ms: report.latency_ms,
            x_forwarded_for: report.x_forwarded_for.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TcpRow {
    pub stream: String,
    pub direction: Direction,
    pub origin_addr: String,
    pub origin_port: u16,
    pub destination_addr: String,
    pub destination_port: u16,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload_len: usize,
    pub observed_at: String,
}

impl TcpRow {
    pub fn from_report(report: &TcpReport) -> TcpRow {
        TcpRow {
            stream: report.meta.stream.to_string(),
            direction: report.direction,
            origin_addr: report.meta.endpoints.src_ip.to_string(),
            origin_port: report.meta.endpoints.src_port,
            destination_addr: report.meta.endpoints.dst_ip.to_string(),
            destination_port: report.meta.endpoints.dst_port,
            syn: report.meta.syn,
            ack: report.meta.ack,
            fin: report.meta.fin,
            rst: report.meta.rst,
            payload_len: report.meta.payload_len,
            observed_at: report
                .meta
                .observed
                .first
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TlsRow {
    pub stream: String,
    pub direction: Direction,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<TlsVersion>,
    pub observed_at: String,
}

impl TlsRow {
    pub fn from_report(report: &TlsReport) -> TlsRow {
        match &report.hello {
            TlsHello::Client(hello) => TlsRow {
                stream: hello.stream.to_string(),
                direction: report.direction,
                kind: "client_hello",
                sni: hello.sni.clone(),
                versions: hello.offered_versions.clone(),
                observed_at: hello
                    .observed
                    .first
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
            },
            TlsHello::Server(hello) => TlsRow {
                stream: hello.stream.to_string(),
                direction: report.direction,
                kind: "server_hello",
                sni: None,
                versions: hello.selected_version.into_iter().collect(),
                observed_at: hello
                    .observed
                    .first
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
            },
        }
    }
}

/// One upload body; either the witness list or the metadata lists are
/// populated, never both, since the two batchers flush independently.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportsBody {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub witness_reports: Vec<WitnessRow>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tcp_connection_reports: Vec<TcpRow>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tls_handshake_reports: Vec<TlsRow>,
}

impl ReportsBody {
    pub fn is_empty(&self) -> bool {
        self.witness_reports.is_empty()
            && self.tcp_connection_reports.is_empty()
            && self.tls_handshake_reports.is_empty()
    }

    pub fn len(&self) -> usize {
        self.witness_reports.len()
            + self.tcp_connection_reports.len()
            + self.tls_handshake_reports.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use records::{Endpoints, PairKey, StreamId};
    use std::net::{IpAddr, Ipv4Addr};
    use witness::{Method, Witness};

    #[test]
    fn witness_row_wire_fields_are_stable() {
        let report = WitnessReport {
            witness: Witness::new(Method {
                verb: "GET".to_string(),
                path: "/".to_string(),
                host: "h".to_string(),
            }),
            pair_key: PairKey::derive(StreamId(1), 0),
            iface: "eth0".to_string(),
            direction: Direction::Inbound,
            endpoints: Endpoints {
                src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                src_port: 40000,
                dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                dst_port: 80,
            },
            witness_time: Utc::now(),
            latency_ms: Some(12.5),
            x_forwarded_for: None,
        };
        let tags = BTreeMap::from([("env".to_string(), "test".to_string())]);
        let row = WitnessRow::from_report(&report, &tags);
        let json = serde_json::to_value(&row).unwrap();

        assert_eq!("inbound", json["direction"]);
        assert_eq!("10.0.0.1", json["origin_addr"]);
        assert_eq!(40000, json["origin_port"]);
        assert_eq!("10.0.0.2", json["destination_addr"]);
        assert_eq!(80, json["destination_port"]);
        assert!(json["witness_proto"].is_string());
        assert!(json["hash"].is_string());
        assert!(json["id"].is_string());
        assert_eq!("test", json["tags"]["env"]);
        // The encoded witness round-trips through base64-url.
        let decoded = base64::decode_config(
            json["witness_proto"].as_str().unwrap(),
            base64::URL_SAFE_NO_PAD,
        )
        .unwrap();
        let tree: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!("GET", tree["method"]["verb"]);
    }
}
