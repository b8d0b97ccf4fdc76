//! HTTP/1.x recognition and typed shape inference.
//!
//! Framing turns half-stream bytes into request/response records; inference
//! decodes bodies (decompression, charset, content-type dispatch) into typed
//! data trees; building assembles obfuscated partial witnesses from records.

mod body;
mod build;
mod framing;
mod infer;
mod sanitize;

pub use body::{decode_body, parse_encoding_chain, transcode_utf8, trial_decompress, Compression};
pub use build::{build_request, build_response, Built};
pub use framing::{HttpRequestFactory, HttpResponseFactory};
pub use infer::{bytes_sample, infer_body, interpret, BodyEntry};
pub use sanitize::sanitize_json;

use std::io;

/// Body-processing failures. None of these abort a record: the witness is
/// still emitted, at worst without its body.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("unsupported content encoding: '{0}'")]
    UnsupportedEncoding(String),

    #[error("failed to decompress body: {0}")]
    Decompress(#[source] io::Error),

    #[error("unknown charset: '{0}'")]
    UnknownCharset(String),

    #[error("failed to decode JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to decode YAML body: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("multipart body without a boundary parameter")]
    MissingBoundary,
}
