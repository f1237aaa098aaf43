//! Datagram ingress: one trusted and one untrusted UDP listener.
//!
//! Trusted datagrams are published as-is (topic = first byte, sender =
//! source address). Untrusted datagrams must pass signature verification
//! first; no scheme has been decided yet, so verification rejects
//! everything and the listener only counts what it drops.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldhub_core::Metrics;

use crate::bus::Bus;
use crate::message::{Msg, Topic};

/// Wire bound on datagram size.
const MAX_DGRAM: usize = 1024;

/// Spawn a datagram listener on `addr`. A bind failure logs and ends
/// this ingress without taking the daemon down.
pub fn spawn_dgram(
    bus: Bus,
    addr: String,
    trusted: bool,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind(&addr).await {
            Ok(socket) => socket,
            Err(e) => {
                error!(addr, error = %e, "Datagram ingress failed to bind");
                return;
            }
        };
        info!(addr, trusted, "Datagram ingress listening");

        let mut buf = [0u8; MAX_DGRAM];
        loop {
            let (n, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(addr, error = %e, "Datagram read error");
                        continue;
                    }
                },
            };

            let payload = &buf[..n];
            if !trusted && !verify_datagram(payload) {
                metrics.incr_datagrams_rejected();
                debug!(peer = %peer, len = n, "Rejected unverified datagram");
                continue;
            }

            let text = String::from_utf8_lossy(payload)
                .trim_end_matches('\n')
                .to_string();
            let Some(topic) = Topic::of_text(&text) else {
                continue;
            };
            bus.publish(topic, Msg::now(peer.to_string(), text));
        }
        info!(addr, trusted, "Datagram ingress stopped");
    })
}

/// Signature verification for untrusted datagrams.
///
/// The signing scheme and key material are not yet defined, so nothing
/// verifies. TODO: implement once the receiver firmware settles on a
/// datagram signing scheme.
fn verify_datagram(_payload: &[u8]) -> bool {
    false
}
