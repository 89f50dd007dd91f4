//! Kernel capture boundary.
//!
//! Opens the monitored interface in promiscuous mode with a BPF filter and
//! runs a dedicated OS thread that decodes each frame and hands it to the
//! aggregator over a bounded channel. The producer never blocks: when the
//! channel is full the packet is dropped and counted. The sensor only
//! listens; it never transmits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::CaptureError;
use crate::packet::{self, DecodedPacket};

pub const DEFAULT_BPF_FILTER: &str = "ip or ip6";

/// Shared capture counters, readable from the health surface.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub running: AtomicBool,
    pub packets_captured: AtomicU64,
    /// Channel-full drops.
    pub packets_dropped: AtomicU64,
    /// Frames the decoder rejected.
    pub decode_errors: AtomicU64,
}

/// A running capture thread. `stop()` flags the loop and joins it; the
/// pcap read timeout bounds how long that takes.
pub struct CaptureHandle {
    interface: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<CaptureStats>,
}

impl CaptureHandle {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
        }
    }
}

/// Open `interface` promiscuously, apply `filter`, and start the capture
/// thread feeding `tx`. Failure leaves the pipeline up with capture
/// disabled; the error lands in health.
pub fn start(
    interface: &str,
    filter: &str,
    tx: mpsc::Sender<DecodedPacket>,
    stats: Arc<CaptureStats>,
) -> Result<CaptureHandle, CaptureError> {
    let devices = pcap::Device::list().map_err(|e| CaptureError::OpenFailed {
        interface: interface.to_string(),
        reason: format!("device enumeration failed: {e}"),
    })?;
    let device = devices
        .into_iter()
        .find(|d| d.name == interface)
        .ok_or_else(|| CaptureError::InterfaceNotFound(interface.to_string()))?;

    let mut cap = pcap::Capture::from_device(device)
        .map_err(|e| CaptureError::OpenFailed {
            interface: interface.to_string(),
            reason: e.to_string(),
        })?
        .promisc(true)
        .snaplen(65_535)
        // Read timeout so the loop can observe the stop flag.
        .timeout(500)
        .open()
        .map_err(|e| CaptureError::OpenFailed {
            interface: interface.to_string(),
            reason: e.to_string(),
        })?;

    cap.filter(filter, true).map_err(|e| CaptureError::BadFilter {
        filter: filter.to_string(),
        reason: e.to_string(),
    })?;

    info!(interface, filter, "Capture started (promiscuous)");
    stats.running.store(true, Ordering::Release);

    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
        let stop = stop.clone();
        let stats = stats.clone();
        std::thread::Builder::new()
            .name("netinsight-capture".to_string())
            .spawn(move || capture_loop(cap, tx, stop, stats))
            .map_err(|e| CaptureError::OpenFailed {
                interface: interface.to_string(),
                reason: format!("capture thread spawn failed: {e}"),
            })?
    };

    Ok(CaptureHandle {
        interface: interface.to_string(),
        stop,
        thread: Some(thread),
        stats,
    })
}

fn capture_loop(
    mut cap: pcap::Capture<pcap::Active>,
    tx: mpsc::Sender<DecodedPacket>,
    stop: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
) {
    while !stop.load(Ordering::Acquire) {
        match cap.next_packet() {
            Ok(frame) => {
                let ts = frame_timestamp(frame.header);
                match packet::decode_ethernet(frame.data, ts) {
                    Some(decoded) => {
                        stats.packets_captured.fetch_add(1, Ordering::Relaxed);
                        match tx.try_send(decoded) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    None => {
                        stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(pcap::Error::TimeoutExpired) => {}
            Err(e) => {
                warn!(error = %e, "Capture read failed; stopping capture loop");
                break;
            }
        }
    }
    stats.running.store(false, Ordering::Release);
    info!("Capture loop exited");
}

fn frame_timestamp(header: &pcap::PacketHeader) -> DateTime<Utc> {
    Utc.timestamp_opt(header.ts.tv_sec as i64, (header.ts.tv_usec as u32) * 1_000)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_interface_is_reported_not_fatal() {
        let stats = Arc::new(CaptureStats::default());
        let (tx, _rx) = mpsc::channel(16);
        let result = start("netinsight-test-no-such-if", DEFAULT_BPF_FILTER, tx, stats.clone());
        match result {
            Err(CaptureError::InterfaceNotFound(name)) => {
                assert_eq!(name, "netinsight-test-no-such-if");
            }
            // Without capture privileges even enumeration can fail; that
            // path must also surface as a CaptureError.
            Err(CaptureError::OpenFailed { .. }) => {}
            Err(other) => panic!("unexpected error kind: {other}"),
            Ok(_) => panic!("opening a nonexistent interface must fail"),
        }
        assert!(!stats.running.load(Ordering::Relaxed));
    }
}
