//! The run controller: wires capture, reassembly, chains, and sinks into
//! per-(interface × direction) workers, supervises them, and drains the
//! whole pipeline on shutdown.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use backend::{run_uploader, BatchConfig, BatchingSink};
use capture::FilterPair;
use collector::{
    CloseGuard, Collector, Counting, HostFilter, PairCollector, PathFilter, Report, ReportSink,
    Sampler, SelfTrafficFilter, Shared, SharedLimiter, Tee,
};
use har::HarSink;
use http_inference::{HttpRequestFactory, HttpResponseFactory};
use reassembly::{tls::TlsFactory, Reassembler, Registry};
use records::{Direction, PacketCounters};

use crate::cli::Cli;
use crate::exec;

const COUNTER_KEY_CAP: usize = 4096;
const RECORD_QUEUE_DEPTH: usize = 512;
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Sink for runs with no remote configured; the HAR tee (if any) is then the
/// only output.
struct NullSink;

impl ReportSink for NullSink {
    fn deliver(&mut self, _report: Report) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

enum StopCause {
    Interrupt,
    Subcommand(i32),
    WorkerError,
    Drained,
}

pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let ifaces = capture::discover(&cli.interfaces)?;
    let filters = capture::make_filters(&ifaces, cli.bpf.as_deref(), cli.port, true)?;

    tracing::info!(
        interfaces = ?ifaces.keys().collect::<Vec<_>>(),
        port = ?cli.port,
        bpf = ?cli.bpf,
        remote = cli.remote().is_some(),
        har = ?cli.har_dir,
        "starting capture"
    );
    for (name, pair) in &filters {
        if pair.outbound.is_none() {
            tracing::warn!(
                iface = %name,
                "no outbound filter could be derived; all traffic will be treated as inbound"
            );
        }
    }
    if cli.remote().is_none() && cli.har_dir.is_none() {
        tracing::warn!("no backend or HAR output configured; witnesses will be discarded");
    }

    let path_exclusions = compile(&cli.path_exclusions).context("compiling --path-exclusions")?;
    let host_exclusions = compile(&cli.host_exclusions).context("compiling --host-exclusions")?;

    let counters = Arc::new(PacketCounters::new(COUNTER_KEY_CAP));
    let registry = Arc::new(Registry::new(vec![
        Box::new(HttpRequestFactory),
        Box::new(HttpResponseFactory),
        Box::new(TlsFactory),
    ]));

    // Terminal backend collector, shared by every chain.
    let mut uploader = None;
    let sink: Box<dyn ReportSink> = match cli.remote() {
        Some((url, service, key)) => {
            let client = Arc::new(backend::Client::new(url, key, cli.client_id.clone())?);
            let session = client
                .resolve_learn_session(&service, &cli.session, &cli.tag_map())
                .await
                .context("resolving the learn session")?;
            tracing::info!(session = %session.id, service = %service, "resolved learn session");
            let (sink, queues) = BatchingSink::channels();
            let batch_cfg = BatchConfig {
                max_batch: cli.max_batch,
                flush_interval: cli.flush_interval,
            };
            uploader = Some(tokio::spawn(run_uploader(
                client, service, session, batch_cfg, queues,
            )));
            Box::new(sink)
        }
        None => Box::new(NullSink),
    };
    let pair = PairCollector::new(sink, cli.pair_expiration);
    let har = cli
        .har_dir
        .as_ref()
        .map(|dir| Shared::new(HarSink::new(dir, 1.0)));
    let limiter = cli
        .rate_limit
        .map(|wpm| SharedLimiter::new(wpm, cli.rate_limit_epoch));

    let reassembly_cfg = reassembly::Config {
        flush_timeout: cli.stream_flush_timeout,
        close_timeout: cli.stream_close_timeout,
        ..Default::default()
    };

    let stop = CancellationToken::new();
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(8);
    let mut workers = Vec::new();

    let started = start_workers(
        &cli,
        &ifaces,
        &filters,
        &reassembly_cfg,
        &registry,
        &counters,
        &pair,
        &har,
        &limiter,
        &path_exclusions,
        &host_exclusions,
        &stop,
        &err_tx,
        &mut workers,
    );
    if let Err(err) = started {
        stop.cancel();
        for worker in workers {
            let _ = worker.await;
        }
        return Err(err);
    }
    drop(err_tx);

    // Periodic promotion of expired pair-cache entries.
    let sweeper = {
        let pair = pair.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = pair.sweep(Utc::now()) {
                            tracing::warn!(error = %err, "pair-cache sweep failed");
                        }
                    }
                }
            }
        })
    };

    let cause = wait_for_stop(&cli, &mut err_rx).await;
    let exit_code = match &cause {
        StopCause::Interrupt => {
            tracing::info!("interrupted; stopping capture");
            0
        }
        StopCause::Subcommand(code) => {
            tracing::info!(code, "subcommand finished; stopping capture");
            *code
        }
        StopCause::WorkerError => 1,
        StopCause::Drained => 0,
    };

    // Stop is idempotent; grace lets in-flight packets drain through the
    // reassemblers before the join.
    stop.cancel();
    tokio::time::sleep(cli.stop_grace).await;
    for worker in workers {
        let _ = worker.await;
    }
    let _ = sweeper.await;

    // Closing the terminal drains the pair cache into the uploader queues,
    // whose closure in turn flushes the final batches.
    let mut pair_closer = pair;
    pair_closer.close().context("closing the backend collector")?;
    if let Some(mut har) = har {
        har.close().context("closing the HAR sink")?;
    }
    if let Some(uploader) = uploader {
        let _ = uploader.await;
    }

    summarize(&counters);
    Ok(exit_code)
}

fn compile(patterns: &[String]) -> anyhow::Result<Vec<regex::Regex>> {
    patterns
        .iter()
        .map(|p| regex::Regex::new(p).with_context(|| format!("invalid regex '{}'", p)))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn start_workers(
    cli: &Cli,
    ifaces: &std::collections::BTreeMap<String, capture::Interface>,
    filters: &std::collections::BTreeMap<String, FilterPair>,
    reassembly_cfg: &reassembly::Config,
    registry: &Arc<Registry>,
    counters: &Arc<PacketCounters>,
    pair: &PairCollector,
    har: &Option<Shared<HarSink>>,
    limiter: &Option<SharedLimiter>,
    path_exclusions: &[regex::Regex],
    host_exclusions: &[regex::Regex],
    stop: &CancellationToken,
    err_tx: &mpsc::Sender<anyhow::Error>,
    workers: &mut Vec<tokio::task::JoinHandle<()>>,
) -> anyhow::Result<()> {
    for name in ifaces.keys() {
        let filter_pair = &filters[name];
        let mut directions = vec![(Direction::Inbound, filter_pair.inbound.clone())];
        if let Some(outbound) = &filter_pair.outbound {
            directions.push((Direction::Outbound, outbound.clone()));
        }

        for (direction, bpf) in directions {
            let packets = capture::live_capture(name, &bpf, stop.child_token())
                .with_context(|| format!("opening capture on {}", name))?;
            let (record_tx, mut record_rx) = mpsc::channel(RECORD_QUEUE_DEPTH);

            let reassembler = Reassembler::new(
                reassembly_cfg.clone(),
                registry.clone(),
                Arc::from(name.as_str()),
                direction,
                counters.clone(),
            );
            workers.push(tokio::spawn(reassembly::run(
                reassembler,
                packets,
                record_tx,
            )));

            let mut chain = build_chain(
                cli,
                limiter,
                counters.clone(),
                pair.clone(),
                har.clone(),
                path_exclusions,
                host_exclusions,
            );
            let err_tx = err_tx.clone();
            workers.push(tokio::spawn(async move {
                while let Some(record) = record_rx.recv().await {
                    if let Err(err) = chain.process(record) {
                        let _ = err_tx.send(err).await;
                    }
                }
                if let Err(err) = chain.close() {
                    let _ = err_tx.send(err).await;
                }
            }));
        }
    }
    Ok(())
}

/// Compose one chain instance: filters, then sampling or rate limiting,
/// then counters, ending at the shared terminal (and the HAR tee when a
/// local archive was requested).
fn build_chain(
    cli: &Cli,
    limiter: &Option<SharedLimiter>,
    counters: Arc<PacketCounters>,
    pair: PairCollector,
    har: Option<Shared<HarSink>>,
    path_exclusions: &[regex::Regex],
    host_exclusions: &[regex::Regex],
) -> Box<dyn Collector> {
    let terminal: Box<dyn Collector> = match har {
        Some(har) => Box::new(Tee::new(
            Box::new(CloseGuard(pair)),
            Box::new(CloseGuard(har)),
        )),
        None => Box::new(CloseGuard(pair)),
    };

    let mut chain: Box<dyn Collector> = Box::new(Counting::new(counters, terminal));
    if let Some(limiter) = limiter {
        chain = Box::new(limiter.child(chain));
    }
    if let Some(rate) = cli.sample_rate {
        chain = Box::new(Sampler::new(rate, chain));
    }
    chain = Box::new(SelfTrafficFilter::new(chain));
    if !host_exclusions.is_empty() {
        chain = Box::new(HostFilter::new(host_exclusions.to_vec(), chain));
    }
    if !path_exclusions.is_empty() {
        chain = Box::new(PathFilter::new(path_exclusions.to_vec(), chain));
    }
    chain
}

async fn wait_for_stop(cli: &Cli, err_rx: &mut mpsc::Receiver<anyhow::Error>) -> StopCause {
    match &cli.command {
        Some(command) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => StopCause::Interrupt,
                result = exec::run_subcommand(command, cli.exec_user.as_deref()) => match result {
                    Ok(code) => StopCause::Subcommand(code),
                    Err(err) => {
                        tracing::error!(error = %err, "failed to run the subcommand");
                        StopCause::Subcommand(1)
                    }
                },
                Some(err) = err_rx.recv() => {
                    tracing::error!(error = %err, "worker failed; stopping");
                    StopCause::WorkerError
                }
            }
        }
        None => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => StopCause::Interrupt,
                maybe = err_rx.recv() => match maybe {
                    Some(err) => {
                        tracing::error!(error = %err, "worker failed; stopping");
                        StopCause::WorkerError
                    }
                    // Every worker finished on its own: the sources drained.
                    None => StopCause::Drained,
                },
            }
        }
    }
}

fn summarize(counters: &PacketCounters) {
    let totals = counters.totals_by_interface();
    let mut any_http = false;
    for (iface, counts) in &totals {
        any_http |= counts.http_requests > 0 || counts.http_responses > 0;
        tracing::info!(
            iface = %iface,
            tcp_packets = counts.tcp_packets,
            http_requests = counts.http_requests,
            http_responses = counts.http_responses,
            tls_hellos = counts.tls_hellos,
            unparsed = counts.unparsed,
            "capture summary"
        );
    }
    if !any_http {
        tracing::warn!(
            "no HTTP traffic was observed on any interface; \
             check --port, --bpf, and that traffic is plaintext HTTP/1.x"
        );
    }
}
