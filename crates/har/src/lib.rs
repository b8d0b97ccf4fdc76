//! HAR 1.2 sink: an alternate tail for the collector tee that writes one
//! archive per interface instead of uploading.
//!
//! Pairs are matched internally by pair key, and sampling hashes the pair
//! key so a transaction is either fully present or fully absent. Archives
//! with no entries are not written at all.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use chrono::SecondsFormat;
use xxhash_rust::xxh3::xxh3_64;

use collector::Collector;
use records::{Content, HttpRequest, HttpResponse, PairKey, Record};

mod model;
pub use model::{Creator, Entry, Har, Log};

pub const CREATOR_NAME: &str = "apitap";

pub struct HarSink {
    outdir: PathBuf,
    sample_rate: f64,
    /// Completed entries per interface.
    entries: HashMap<String, Vec<Entry>>,
    /// Halves awaiting their counterpart.
    pending: HashMap<PairKey, Pending>,
    written: bool,
}

struct Pending {
    iface: String,
    request: Option<HttpRequest>,
    response: Option<HttpResponse>,
}

impl HarSink {
    pub fn new(outdir: impl Into<PathBuf>, sample_rate: f64) -> HarSink {
        HarSink {
            outdir: outdir.into(),
            sample_rate: sample_rate.clamp(0.0, 1.0),
            entries: HashMap::new(),
            pending: HashMap::new(),
            written: false,
        }
    }

    fn admit(&self, key: &PairKey) -> bool {
        let basis = xxh3_64(&key.to_string().into_bytes());
        ((basis >> 11) as f64 / (1u64 << 53) as f64) < self.sample_rate
    }

    fn on_half(&mut self, iface: &str, key: PairKey, request: Option<HttpRequest>, response: Option<HttpResponse>) {
        let slot = self.pending.entry(key).or_insert_with(|| Pending {
            iface: iface.to_string(),
            request: None,
            response: None,
        });
        if let Some(request) = request {
            slot.iface = iface.to_string();
            slot.request = Some(request);
        }
        if let Some(response) = response {
            slot.response = Some(response);
        }
        if slot.request.is_some() && slot.response.is_some() {
            let done = self.pending.remove(&key).expect("slot just updated");
            self.push_entry(done);
        }
    }

    fn push_entry(&mut self, pending: Pending) {
        // Entries without a request have nothing to anchor a HAR row on.
        let request = match &pending.request {
            Some(request) => request,
            None => return,
        };
        let entry = model::entry(request, pending.response.as_ref());
        self.entries.entry(pending.iface).or_default().push(entry);
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        // Unpaired requests still become entries; responses alone do not.
        let pending: Vec<Pending> = self.pending.drain().map(|(_, p)| p).collect();
        for half in pending {
            self.push_entry(half);
        }

        fs::create_dir_all(&self.outdir)?;
        for (iface, entries) in self.entries.drain() {
            if entries.is_empty() {
                continue;
            }
            let path = self.outdir.join(format!("akita_{}.har", iface));
            let har = Har {
                log: Log {
                    version: "1.2".to_string(),
                    creator: Creator {
                        name: CREATOR_NAME.to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                    entries,
                },
            };
            let file = fs::File::create(&path)?;
            serde_json::to_writer(std::io::BufWriter::new(file), &har)?;
            tracing::info!(path = %path.display(), "wrote HAR archive");
        }
        Ok(())
    }
}

impl Collector for HarSink {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        match record.content {
            Content::Request(request) => {
                let key = request.pair_key();
                if self.admit(&key) {
                    self.on_half(&record.iface, key, Some(request), None);
                }
            }
            Content::Response(response) => {
                let key = response.pair_key();
                if self.admit(&key) {
                    self.on_half(&record.iface, key, None, Some(response));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if self.written {
            return Ok(());
        }
        self.written = true;
        self.flush()
    }
}

/// Format a capture timestamp the way HAR consumers expect.
pub(crate) fn har_time(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use records::{Direction, Endpoints, Headers, Observed, StreamId};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn endpoints() -> Endpoints {
        Endpoints {
            src_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            src_port: 50000,
            dst_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            dst_port: 8080,
        }
    }

    fn request_record(stream: u64) -> Record {
        Record {
            iface: Arc::from("lo"),
            direction: Direction::Inbound,
            content: Content::Request(HttpRequest {
                stream: StreamId(stream),
                seq: 0,
                endpoints: endpoints(),
                observed: Observed::at(Utc::now()),
                method: "GET".to_string(),
                path: "/widgets".to_string(),
                query: Some("page=2".to_string()),
                host: "localhost:8080".to_string(),
                headers: Headers(vec![("Accept".to_string(), "*/*".to_string())]),
                cookies: vec![],
                body: vec![],
                body_decompressed: false,
            }),
        }
    }

    fn response_record(stream: u64) -> Record {
        Record {
            iface: Arc::from("lo"),
            direction: Direction::Inbound,
            content: Content::Response(HttpResponse {
                stream: StreamId(stream),
                seq: 0,
                endpoints: endpoints().flipped(),
                observed: Observed::at(Utc::now()),
                status: 200,
                headers: Headers(vec![(
                    "Content-Type".to_string(),
                    "text/html".to_string(),
                )]),
                cookies: vec![],
                body: b"<html></html>".to_vec(),
                body_decompressed: false,
            }),
        }
    }

    #[test]
    fn paired_traffic_becomes_har_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = HarSink::new(dir.path(), 1.0);
        sink.process(request_record(1)).unwrap();
        sink.process(response_record(1)).unwrap();
        sink.close().unwrap();

        let path = dir.path().join("akita_lo.har");
        let har: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!("1.2", har["log"]["version"]);
        assert_eq!(CREATOR_NAME, har["log"]["creator"]["name"]);
        let entries = har["log"]["entries"].as_array().unwrap();
        assert_eq!(1, entries.len());
        assert_eq!(
            "http://localhost:8080/widgets?page=2",
            entries[0]["request"]["url"]
        );
        assert_eq!(200, entries[0]["response"]["status"]);
    }

    #[test]
    fn empty_archives_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = HarSink::new(dir.path(), 1.0);
        sink.close().unwrap();
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none() || {
            // create_dir_all may have made the directory itself; no .har files.
            !fs::read_dir(dir.path())
                .unwrap()
                .any(|e| e.unwrap().path().extension().map_or(false, |x| x == "har"))
        });
    }

    #[test]
    fn zero_sample_rate_drops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = HarSink::new(dir.path(), 0.0);
        sink.process(request_record(2)).unwrap();
        sink.process(response_record(2)).unwrap();
        sink.close().unwrap();
        assert!(!dir.path().join("akita_lo.har").exists());
    }
}
