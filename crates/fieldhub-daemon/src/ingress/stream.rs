//! Trusted line-oriented stream ingress.
//!
//! The first line of each connection names the sender; every subsequent
//! nonempty line is published on the bus under the topic given by its
//! first byte. No verification happens here: deployment behind loopback
//! or an authenticated transport is the operator's responsibility.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::ingress::line::{LineReader, MAX_LINE};
use crate::message::{Msg, Topic};

/// Spawn the trusted stream server on `addr`. A bind failure logs and
/// ends this ingress without taking the daemon down.
pub fn spawn_trusted_stream(
    bus: Bus,
    addr: String,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr, error = %e, "Trusted stream ingress failed to bind");
                return;
            }
        };
        info!(addr, "Trusted stream ingress listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let bus = bus.clone();
                        let child = cancel.child_token();
                        tokio::spawn(async move {
                            handle_trusted_stream(bus, stream, idle_timeout, child).await;
                            info!(peer = %peer, "Trusted stream connection closed");
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed on trusted stream ingress"),
                },
            }
        }
        info!("Trusted stream ingress stopped");
    })
}

async fn handle_trusted_stream(
    bus: Bus,
    stream: TcpStream,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut reader = LineReader::new(stream, MAX_LINE);

    let sender = match next_line(&mut reader, idle_timeout, &cancel).await {
        Some(identity) if !identity.is_empty() => identity,
        _ => return,
    };

    loop {
        let Some(line) = next_line(&mut reader, idle_timeout, &cancel).await else {
            return;
        };
        // The topic is the first byte of the message from the receiver.
        let Some(topic) = Topic::of_text(&line) else {
            continue;
        };
        bus.publish(topic, Msg::now(sender.clone(), line));
    }
}

/// One line with idle timeout and cancellation; `None` ends the
/// connection.
async fn next_line<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> Option<String> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        read = tokio::time::timeout(idle_timeout, reader.read_line_str()) => match read {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                warn!(error = %e, "Read error on trusted stream");
                None
            }
            Err(_) => {
                info!("Trusted stream connection idle, closing");
                None
            }
        },
    }
}
