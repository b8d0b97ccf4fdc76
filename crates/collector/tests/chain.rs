//! A whole chain wired the way the controller wires it: filters in front,
//! counters behind them, the shared pair cache at the end.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use regex::Regex;

use collector::{
    CloseGuard, Collector, Counting, PairCollector, PathFilter, Report, ReportSink,
    SelfTrafficFilter, WitnessReport,
};
use records::{
    Content, Direction, Endpoints, Headers, HttpRequest, HttpResponse, Observed, PacketCounters,
    Record, StreamId,
};

#[derive(Clone, Default)]
struct SinkSpy(Arc<Mutex<Vec<Report>>>);

impl SinkSpy {
    fn witnesses(&self) -> Vec<WitnessReport> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| match r {
                Report::Witness(w) => Some(w.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ReportSink for SinkSpy {
    fn deliver(&mut self, report: Report) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(report);
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn endpoints() -> Endpoints {
    Endpoints {
        src_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        src_port: 40000,
        dst_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)),
        dst_port: 8080,
    }
}

fn request(stream: u64, path: &str) -> Record {
    Record {
        iface: Arc::from("eth0"),
        direction: Direction::Inbound,
        content: Content::Request(HttpRequest {
            stream: StreamId(stream),
            seq: 0,
            endpoints: endpoints(),
            observed: Observed::at(Utc::now()),
            method: "GET".to_string(),
            path: path.to_string(),
            query: None,
            host: "svc.example".to_string(),
            headers: Headers(vec![("Accept".to_string(), "*/*".to_string())]),
            cookies: vec![],
            body: vec![],
            body_decompressed: false,
        }),
    }
}

fn response(stream: u64, status: u16) -> Record {
    Record {
        iface: Arc::from("eth0"),
        direction: Direction::Inbound,
        content: Content::Response(HttpResponse {
            stream: StreamId(stream),
            seq: 0,
            endpoints: endpoints().flipped(),
            observed: Observed::at(Utc::now()),
            status,
            headers: Headers(vec![("Server".to_string(), "test".to_string())]),
            cookies: vec![],
            body: vec![],
            body_decompressed: false,
        }),
    }
}

fn build(spy: &SinkSpy, counters: Arc<PacketCounters>) -> (Box<dyn Collector>, PairCollector) {
    let pair = PairCollector::new(Box::new(spy.clone()), std::time::Duration::from_secs(60));
    let terminal: Box<dyn Collector> = Box::new(CloseGuard(pair.clone()));
    let counting = Box::new(Counting::new(counters, terminal));
    let self_filter = Box::new(SelfTrafficFilter::new(counting));
    let chain: Box<dyn Collector> = Box::new(PathFilter::new(
        vec![Regex::new("^/healthz$").unwrap()],
        self_filter,
    ));
    (chain, pair)
}

#[test]
fn pairs_flow_through_and_health_checks_do_not() {
    let spy = SinkSpy::default();
    let counters = Arc::new(PacketCounters::new(1024));
    let (mut chain, mut pair) = build(&spy, counters.clone());

    // A health check: suppressed whole.
    chain.process(request(1, "/healthz")).unwrap();
    chain.process(response(1, 200)).unwrap();

    // Real traffic: emitted as one paired witness.
    chain.process(request(2, "/v1/items")).unwrap();
    chain.process(response(2, 200)).unwrap();

    chain.close().unwrap();
    pair.close().unwrap();

    let witnesses = spy.witnesses();
    assert_eq!(1, witnesses.len());
    assert_eq!("/v1/items", witnesses[0].witness.method.path);
    assert!(witnesses[0].witness.is_paired());

    // Counters saw only the unfiltered pair.
    let totals = counters.totals_by_interface();
    assert_eq!(1, totals["eth0"].http_requests);
    assert_eq!(1, totals["eth0"].http_responses);
}

#[test]
fn worker_close_does_not_drain_the_shared_terminal() {
    let spy = SinkSpy::default();
    let counters = Arc::new(PacketCounters::new(1024));
    let (mut chain, mut pair) = build(&spy, counters);

    chain.process(request(5, "/pending")).unwrap();
    // The worker chain closing must not flush the shared pair cache.
    chain.close().unwrap();
    assert!(spy.witnesses().is_empty());

    // The controller's single close drains it as an unpaired witness.
    pair.close().unwrap();
    let witnesses = spy.witnesses();
    assert_eq!(1, witnesses.len());
    assert!(!witnesses[0].witness.has_response());
}
