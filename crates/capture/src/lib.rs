//! Interface enumeration, BPF filter derivation, and the live packet source.
//!
//! This crate owns the only code that touches libpcap. Everything downstream
//! consumes timestamped frames through a bounded channel and never sees a
//! capture handle.

mod bpf;
mod iface;
mod source;

pub use bpf::{make_filters, FilterPair};
pub use iface::{discover, Interface};
pub use source::{live_capture, CapturedPacket, Datalink};

/// Capture-layer errors, classified so the controller can distinguish fatal
/// permission problems from per-interface noise.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("permission denied opening capture on {iface}: {message}")]
    PermissionDenied { iface: String, message: String },

    #[error("interface {0} is not available for capture")]
    InterfaceNotAvailable(String),

    #[error("packet capture not implemented here: {0}")]
    NotImplemented(String),

    #[error("a BPF expression and a port filter cannot be combined; drop one")]
    ConflictingFilters,

    #[error("no usable capture interfaces were found")]
    NoInterfaces,

    #[error(transparent)]
    Pcap(#[from] pcap::Error),
}

impl Error {
    /// Permission failures are fatal and deserve remediation hints; most
    /// other capture errors degrade to warnings unless every interface fails.
    pub fn is_permission(&self) -> bool {
        matches!(self, Error::PermissionDenied { .. })
    }
}

/// Classify a raw pcap error for one interface. libpcap reports both
/// conditions as string-typed errors, so matching on the message is the only
/// portable signal.
pub(crate) fn classify(iface: &str, err: pcap::Error) -> Error {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("permission") || lowered.contains("not permitted") {
        Error::PermissionDenied {
            iface: iface.to_string(),
            message,
        }
    } else if lowered.contains("not supported") || lowered.contains("not implemented") {
        Error::NotImplemented(message)
    } else {
        Error::Pcap(err)
    }
}
