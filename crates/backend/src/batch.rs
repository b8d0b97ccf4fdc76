//! Size- and time-bounded batching in front of the upload client.
//!
//! Two independent batchers: witness reports, and TCP/TLS metadata. Each
//! flushes when it reaches `max_batch`, when the flush interval elapses, or
//! at close. A flushed batch is attempted exactly once; on failure it is
//! dropped, bounding loss to one batch rather than stalling the stream.

use std::sync::Arc;
use std::time::Duration;

use collector::{Report, ReportSink, WitnessReport};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::client::{Client, LearnSession};
use crate::wire::{ReportsBody, TcpRow, TlsRow, WitnessRow};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> BatchConfig {
        BatchConfig {
            max_batch: 120,
            flush_interval: Duration::from_secs(30),
        }
    }
}

const QUEUE_DEPTH: usize = 1024;

/// Receiving ends of the two batch queues, consumed by [`run_uploader`].
pub struct UploadQueues {
    witness_rx: mpsc::Receiver<WitnessReport>,
    meta_rx: mpsc::Receiver<Report>,
}

/// The sink side handed to the pair collector. Delivery never blocks: the
/// chains run on capture-critical tasks, so when an uploader falls behind,
/// reports are shed and counted instead of stalling the pipeline.
pub struct BatchingSink {
    witness_tx: Option<mpsc::Sender<WitnessReport>>,
    meta_tx: Option<mpsc::Sender<Report>>,
    shed: u64,
}

impl BatchingSink {
    pub fn channels() -> (BatchingSink, UploadQueues) {
        let (witness_tx, witness_rx) = mpsc::channel(QUEUE_DEPTH);
        let (meta_tx, meta_rx) = mpsc::channel(QUEUE_DEPTH);
        (
            BatchingSink {
                witness_tx: Some(witness_tx),
                meta_tx: Some(meta_tx),
                shed: 0,
            },
            UploadQueues { witness_rx, meta_rx },
        )
    }

    fn shed_one(&mut self, what: &'static str) {
        self.shed += 1;
        if self.shed.is_power_of_two() {
            tracing::warn!(total_shed = self.shed, what, "upload queue full; shedding reports");
        }
    }
}

impl ReportSink for BatchingSink {
    fn deliver(&mut self, report: Report) -> anyhow::Result<()> {
        match report {
            Report::Witness(witness) => {
                if let Some(tx) = &self.witness_tx {
                    if tx.try_send(witness).is_err() {
                        self.shed_one("witness");
                    }
                }
            }
            meta @ (Report::Tcp(_) | Report::Tls(_)) => {
                if let Some(tx) = &self.meta_tx {
                    if tx.try_send(meta).is_err() {
                        self.shed_one("metadata");
                    }
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        // Dropping the senders is end-of-input; the uploader flushes what it
        // holds and exits.
        self.witness_tx = None;
        self.meta_tx = None;
        Ok(())
    }
}

/// Drive both batch loops until their queues close and drain.
pub async fn run_uploader(
    client: Arc<Client>,
    service: String,
    session: LearnSession,
    cfg: BatchConfig,
    queues: UploadQueues,
) {
    tokio::join!(
        witness_loop(&client, &service, &session, &cfg, queues.witness_rx),
        meta_loop(&client, &service, &session, &cfg, queues.meta_rx),
    );
}

async fn witness_loop(
    client: &Client,
    service: &str,
    session: &LearnSession,
    cfg: &BatchConfig,
    mut rx: mpsc::Receiver<WitnessReport>,
) {
    let mut rows: Vec<WitnessRow> = Vec::new();
    let mut ticker = tokio::time::interval(cfg.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(report) => {
                    rows.push(WitnessRow::from_report(&report, &session.tags));
                    if rows.len() >= cfg.max_batch {
                        flush(client, service, session, witness_body(&mut rows)).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !rows.is_empty() {
                    flush(client, service, session, witness_body(&mut rows)).await;
                }
            }
        }
    }
    if !rows.is_empty() {
        flush(client, service, session, witness_body(&mut rows)).await;
    }
}

async fn meta_loop(
    client: &Client,
    service: &str,
    session: &LearnSession,
    cfg: &BatchConfig,
    mut rx: mpsc::Receiver<Report>,
) {
    let mut body = ReportsBody::default();
    let mut ticker = tokio::time::interval(cfg.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(report) => {
                    match report {
                        Report::Tcp(tcp) => body.tcp_connection_reports.push(TcpRow::from_report(&tcp)),
                        Report::Tls(tls) => body.tls_handshake_reports.push(TlsRow::from_report(&tls)),
                        Report::Witness(_) => {}
                    }
                    if body.len() >= cfg.max_batch {
                        flush(client, service, session, std::mem::take(&mut body)).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !body.is_empty() {
                    flush(client, service, session, std::mem::take(&mut body)).await;
                }
            }
        }
    }
    if !body.is_empty() {
        flush(client, service, session, std::mem::take(&mut body)).await;
    }
}

fn witness_body(rows: &mut Vec<WitnessRow>) -> ReportsBody {
    ReportsBody {
        witness_reports: std::mem::take(rows),
        ..Default::default()
    }
}

/// One attempt per batch; failures are logged and the batch is gone.
async fn flush(client: &Client, service: &str, session: &LearnSession, body: ReportsBody) {
    let count = body.len();
    match client.upload_reports(service, &session.id, &body).await {
        Ok(()) => tracing::debug!(count, "uploaded report batch"),
        Err(err) if err.is_throttled() => {
            tracing::warn!(
                count,
                "the backend is throttling uploads; partial results are expected. \
                 Lower --rate-limit to stay within your plan"
            );
        }
        Err(err) => {
            tracing::warn!(count, error = %err, "dropping report batch after failed upload");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use records::{Direction, Endpoints, PairKey, StreamId};
    use std::net::{IpAddr, Ipv4Addr};
    use witness::{Method, Witness};

    fn witness_report(n: u64) -> WitnessReport {
        WitnessReport {
            witness: Witness::new(Method {
                verb: "GET".to_string(),
                path: format!("/{}", n),
                host: "h".to_string(),
            }),
            pair_key: PairKey::derive(StreamId(n), 0),
            iface: "eth0".to_string(),
            direction: Direction::Inbound,
            endpoints: Endpoints {
                src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                src_port: 1,
                dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                dst_port: 2,
            },
            witness_time: Utc::now(),
            latency_ms: None,
            x_forwarded_for: None,
        }
    }

    #[tokio::test]
    async fn sink_routes_and_close_signals_eof() {
        let (mut sink, mut queues) = BatchingSink::channels();
        sink.deliver(Report::Witness(witness_report(1))).unwrap();
        sink.close().unwrap();

        assert!(queues.witness_rx.recv().await.is_some());
        // Closed and drained.
        assert!(queues.witness_rx.recv().await.is_none());
        assert!(queues.meta_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_sheds_instead_of_blocking() {
        let (mut sink, _queues) = BatchingSink::channels();
        for n in 0..(QUEUE_DEPTH as u64 + 10) {
            sink.deliver(Report::Witness(witness_report(n))).unwrap();
        }
        assert_eq!(10, sink.shed);
    }
}
