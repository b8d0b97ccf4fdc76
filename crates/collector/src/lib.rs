//! The record-processing chain: single-method sinks composed at startup.
//!
//! Every stage owns its downstream and implements the same two-method
//! contract, so filters, samplers, the rate limiter, counters, and fan-out
//! compose freely in front of the terminal pair cache.

mod count;
mod filter;
mod pair;
mod rate_limit;
mod sampler;

pub use count::Counting;
pub use filter::{HostFilter, PathFilter, SelfTrafficFilter};
pub use pair::{PairCollector, Report, ReportSink, TcpReport, TlsHello, TlsReport, WitnessReport};
pub use rate_limit::{RateLimited, SharedLimiter};
pub use sampler::Sampler;

use records::Record;

/// A single-method sink in the processing chain.
pub trait Collector: Send {
    fn process(&mut self, record: Record) -> anyhow::Result<()>;

    /// Flush and release resources. Close is idempotent and always reached
    /// during shutdown.
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Fan-out to two downstreams. Both always see every record; the first
/// error is returned and the second is logged.
pub struct Tee {
    left: Box<dyn Collector>,
    right: Box<dyn Collector>,
}

impl Tee {
    pub fn new(left: Box<dyn Collector>, right: Box<dyn Collector>) -> Tee {
        Tee { left, right }
    }
}

impl Collector for Tee {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        let first = self.left.process(record.clone());
        let second = self.right.process(record);
        match (first, second) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(err)) => Err(err),
            (Err(first), Err(second)) => {
                tracing::warn!(error = %second, "second tee branch also failed");
                Err(first)
            }
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        let first = self.left.close();
        let second = self.right.close();
        if let Err(err) = &second {
            if first.is_ok() {
                return second;
            }
            tracing::warn!(error = %err, "second tee branch failed to close");
        }
        first
    }
}

/// Terminal stage that discards everything; used where a chain needs an
/// explicit end without side effects.
pub struct Discard;

impl Collector for Discard {
    fn process(&mut self, _record: Record) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A collector shared by several chains. Each chain holds a clone; process
/// serializes on the inner lock.
pub struct Shared<C: Collector>(std::sync::Arc<std::sync::Mutex<C>>);

impl<C: Collector> Shared<C> {
    pub fn new(inner: C) -> Shared<C> {
        Shared(std::sync::Arc::new(std::sync::Mutex::new(inner)))
    }
}

impl<C: Collector> Clone for Shared<C> {
    fn clone(&self) -> Shared<C> {
        Shared(self.0.clone())
    }
}

impl<C: Collector> Collector for Shared<C> {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        self.0.lock().unwrap().process(record)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.0.lock().unwrap().close()
    }
}

/// Shields a shared terminal from per-worker shutdown: process forwards,
/// close is a no-op. The controller closes the real terminal once, after
/// every worker has drained.
pub struct CloseGuard<C: Collector>(pub C);

impl<C: Collector> Collector for CloseGuard<C> {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        self.0.process(record)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Collector;
    use chrono::Utc;
    use records::{
        Content, Direction, Endpoints, Headers, HttpRequest, HttpResponse, Observed, Record,
        StreamId,
    };
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::{Arc, Mutex};

    /// Downstream that remembers everything it saw.
    #[derive(Clone, Default)]
    pub struct Remember(pub Arc<Mutex<Vec<Record>>>);

    impl Remember {
        pub fn seen(&self) -> Vec<Record> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Collector for Remember {
        fn process(&mut self, record: Record) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(record);
            Ok(())
        }

        fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    pub fn endpoints() -> Endpoints {
        Endpoints {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port: 40000,
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dst_port: 8080,
        }
    }

    pub fn request_record(stream: u64, seq: u32, path: &str, host: &str) -> Record {
        Record {
            iface: Arc::from("eth0"),
            direction: Direction::Inbound,
            content: Content::Request(HttpRequest {
                stream: StreamId(stream),
                seq,
                endpoints: endpoints(),
                observed: Observed::at(Utc::now()),
                method: "GET".to_string(),
                path: path.to_string(),
                query: None,
                host: host.to_string(),
                headers: Headers(vec![("Accept".to_string(), "*/*".to_string())]),
                cookies: vec![],
                body: vec![],
                body_decompressed: false,
            }),
        }
    }

    pub fn response_record(stream: u64, seq: u32, status: u16) -> Record {
        Record {
            iface: Arc::from("eth0"),
            direction: Direction::Inbound,
            content: Content::Response(HttpResponse {
                stream: StreamId(stream),
                seq,
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
}
