//! Packet-counter stage: tallies HTTP requests, responses, TLS hellos and
//! unparsed spans per (interface, src port, dst port). TCP metadata is
//! excluded here; segments are counted at the reassembler.

use std::sync::Arc;

use records::{Content, CounterKey, Counts, PacketCounters, Record};

use crate::Collector;

pub struct Counting {
    counters: Arc<PacketCounters>,
    next: Box<dyn Collector>,
}

impl Counting {
    pub fn new(counters: Arc<PacketCounters>, next: Box<dyn Collector>) -> Counting {
        Counting { counters, next }
    }
}

impl Collector for Counting {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        let delta = match &record.content {
            Content::Request(_) => Some(Counts {
                http_requests: 1,
                ..Default::default()
            }),
            Content::Response(_) => Some(Counts {
                http_responses: 1,
                ..Default::default()
            }),
            Content::TlsClientHello(_) => Some(Counts {
                tls_hellos: 1,
                ..Default::default()
            }),
            Content::Unparsed(_) => Some(Counts {
                unparsed: 1,
                ..Default::default()
            }),
            Content::TcpMeta(_) | Content::TlsServerHello(_) => None,
        };
        if let Some(delta) = delta {
            let endpoints = record.content.endpoints();
            self.counters.add(
                CounterKey {
                    iface: record.iface.to_string(),
                    src_port: endpoints.src_port,
                    dst_port: endpoints.dst_port,
                },
                delta,
            );
        }
        self.next.process(record)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.next.close()
    }
}
