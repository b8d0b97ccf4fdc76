//! The ingestion-service client: learn-session resolution and batched
//! report upload with at-most-once-per-flush semantics.

mod batch;
mod client;
mod wire;

pub use batch::{run_uploader, BatchConfig, BatchingSink, UploadQueues};
pub use client::{Client, LearnSession};
pub use wire::{ReportsBody, TcpRow, TlsRow, WitnessRow};

/// Upload-path errors, classified so the controller can tell throttling
/// (surface a hint) from transient failures (drop the batch and move on).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backend throttled the upload (HTTP 429); partial results are expected")]
    Throttled,

    #[error("backend returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("transient backend error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid backend URL: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Error::Throttled)
    }
}
