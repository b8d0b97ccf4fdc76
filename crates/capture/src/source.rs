use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{classify, Error};

/// Link layer of a captured frame, needed to find the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datalink {
    Ethernet,
    /// BSD-style loopback with a 4-byte protocol family header.
    Loopback,
    /// Raw IP with no link header.
    Raw,
}

/// One captured frame with its observation timestamp.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub ts: DateTime<Utc>,
    pub datalink: Datalink,
    pub data: Vec<u8>,
}

// Poll granularity of the capture loop; the stop token is checked at least
// this often even on a quiet interface.
const POLL_TIMEOUT_MS: i32 = 100;

const CHANNEL_DEPTH: usize = 512;

/// Open a live capture on `iface` with the given BPF expression, and stream
/// packets until the stop token fires or the driver reports end-of-input.
///
/// The capture loop runs on a blocking thread; the returned channel closing
/// is the end-of-input signal downstream. Stopping is idempotent: the token
/// is polled between reads and the handle is dropped on exit either way.
pub fn live_capture(
    iface: &str,
    bpf: &str,
    stop: CancellationToken,
) -> Result<mpsc::Receiver<CapturedPacket>, Error> {
    let mut cap = pcap::Capture::from_device(iface)
        .map_err(|e| classify(iface, e))?
        .promisc(true)
        .timeout(POLL_TIMEOUT_MS)
        .open()
        .map_err(|e| classify(iface, e))?;

    if !bpf.is_empty() {
        cap.filter(bpf, true).map_err(|e| classify(iface, e))?;
    }

    let linktype = cap.get_datalink();
    let datalink = if linktype == pcap::Linktype::ETHERNET {
        Datalink::Ethernet
    } else if linktype == pcap::Linktype::NULL || linktype == pcap::Linktype::LOOP {
        Datalink::Loopback
    } else {
        Datalink::Raw
    };

    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let name = iface.to_string();

    tokio::task::spawn_blocking(move || {
        loop {
            if stop.is_cancelled() {
                break;
            }
            match cap.next_packet() {
                Ok(packet) => {
                    let captured = CapturedPacket {
                        ts: capture_time(packet.header),
                        datalink,
                        data: packet.data.to_vec(),
                    };
                    // Blocking send is the backpressure signal: a slow
                    // consumer slows the capture thread, and libpcap's own
                    // ring absorbs the burst.
                    if tx.blocking_send(captured).is_err() {
                        break;
                    }
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => break,
                Err(err) => {
                    tracing::warn!(iface = %name, error = %err, "capture read failed; stopping source");
                    break;
                }
            }
        }
        if let Ok(stats) = cap.stats() {
            tracing::debug!(
                iface = %name,
                received = stats.received,
                dropped = stats.dropped,
                if_dropped = stats.if_dropped,
                "capture finished"
            );
        }
    });

    Ok(rx)
}

/// Prefer the driver's capture timestamp; fall back to wall clock when the
/// driver supplies none.
fn capture_time(header: &pcap::PacketHeader) -> DateTime<Utc> {
    if header.ts.tv_sec == 0 && header.ts.tv_usec == 0 {
        return Utc::now();
    }
    match Utc.timestamp_opt(header.ts.tv_sec as i64, (header.ts.tv_usec as u32) * 1000) {
        chrono::LocalResult::Single(ts) => ts,
        _ => Utc::now(),
    }
}
