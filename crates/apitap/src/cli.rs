use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::LogArgs;

/// Passively observe API traffic on this host and report typed, obfuscated
/// witnesses to an ingestion service or a local HAR archive.
#[derive(Debug, clap::Parser)]
#[command(name = "apitap", version)]
pub struct Cli {
    /// Interfaces to capture on. Defaults to every up interface with an
    /// address that accepts a capture handle.
    #[arg(long = "interface", value_name = "NAME")]
    pub interfaces: Vec<String>,

    /// Verbatim BPF expression to capture with. Mutually exclusive with
    /// --port.
    #[arg(long, value_name = "EXPR", conflicts_with = "port")]
    pub bpf: Option<String>,

    /// Capture traffic to or from this port on a local address.
    #[arg(long)]
    pub port: Option<u16>,

    /// Drop requests (and their responses) whose path matches any of these
    /// regular expressions.
    #[arg(long = "path-exclusions", value_name = "REGEX")]
    pub path_exclusions: Vec<String>,

    /// Drop requests (and their responses) whose Host matches any of these
    /// regular expressions.
    #[arg(long = "host-exclusions", value_name = "REGEX")]
    pub host_exclusions: Vec<String>,

    /// Deterministically sample this fraction of transactions.
    #[arg(long = "sample-rate", conflicts_with = "rate_limit")]
    pub sample_rate: Option<f64>,

    /// Cap captured witnesses at this many per minute.
    #[arg(long = "rate-limit", value_name = "WITNESSES_PER_MINUTE")]
    pub rate_limit: Option<f64>,

    /// Ingestion service base URL. With --service, enables remote upload.
    #[arg(long, env = "APITAP_URL")]
    pub url: Option<url::Url>,

    /// Service whose traffic this capture session belongs to.
    #[arg(long)]
    pub service: Option<String>,

    /// Capture session name; created on the service, or resolved if it
    /// already exists.
    #[arg(long, default_value = "apitap-capture")]
    pub session: String,

    /// Bearer credential for the ingestion service.
    #[arg(long = "api-key", env = "APITAP_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Client id attached to every backend call.
    #[arg(long = "client-id", default_value = "apitap-cli")]
    pub client_id: String,

    /// Directory to write one HAR archive per interface into.
    #[arg(long = "har-dir", value_name = "DIR")]
    pub har_dir: Option<PathBuf>,

    /// Subcommand to run while capturing; apitap exits with its code.
    #[arg(short = 'c', long = "command")]
    pub command: Option<String>,

    /// User to run the subcommand as. Required when invoked via sudo.
    #[arg(short = 'u', long = "user")]
    pub exec_user: Option<String>,

    /// key=value tags attached to the session and every witness.
    #[arg(long = "tags", value_name = "KEY=VALUE", value_parser = parse_tag)]
    pub tags: Vec<(String, String)>,

    /// Stream flush timeout: force delivery through a stalled gap.
    #[arg(long = "stream-flush-timeout", value_parser = humantime::parse_duration, default_value = "10s")]
    pub stream_flush_timeout: Duration,

    /// Stream close timeout: drop an idle stream entirely.
    #[arg(long = "stream-close-timeout", value_parser = humantime::parse_duration, default_value = "90s")]
    pub stream_close_timeout: Duration,

    /// How long an unpaired half waits for its counterpart.
    #[arg(long = "pair-expiration", value_parser = humantime::parse_duration, default_value = "1m")]
    pub pair_expiration: Duration,

    /// Upload batches at least this often.
    #[arg(long = "flush-interval", value_parser = humantime::parse_duration, default_value = "30s")]
    pub flush_interval: Duration,

    /// Upload a batch as soon as it holds this many reports.
    #[arg(long = "max-batch", default_value_t = 120)]
    pub max_batch: usize,

    /// Rate-limit epoch length.
    #[arg(long = "rate-limit-epoch", value_parser = humantime::parse_duration, default_value = "5m")]
    pub rate_limit_epoch: Duration,

    /// Grace period between the stop signal and joining workers.
    #[arg(long = "stop-grace", value_parser = humantime::parse_duration, default_value = "5s")]
    pub stop_grace: Duration,

    /// Enable debug output (same as --log-level debug).
    #[arg(long)]
    pub debug: bool,

    #[clap(flatten)]
    pub log: LogArgs,
}

impl Cli {
    pub fn tag_map(&self) -> BTreeMap<String, String> {
        self.tags.iter().cloned().collect()
    }

    /// Remote upload is configured only when all three of URL, service and
    /// credential are present.
    pub fn remote(&self) -> Option<(url::Url, String, String)> {
        match (&self.url, &self.service, &self.api_key) {
            (Some(url), Some(service), Some(key)) => {
                Some((url.clone(), service.clone(), key.clone()))
            }
            _ => None,
        }
    }
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("tag '{}' is not of the form key=value", raw))
}
