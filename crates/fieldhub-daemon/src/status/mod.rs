//! Status responder: line-oriented TCP server answering operator
//! queries about the receiver fleet.
//!
//! Text commands list connected receivers only; `json`/`status` return a
//! snapshot of every record the registry has ever seen, keyed by serial.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ingress::line::{LineReader, MAX_LINE};
use crate::registry::{SgRegistry, SgSnapshot};

/// Commands the responder understands, as shown in the usage message.
const COMMANDS: &[&str] = &[
    "json", "port", "ports", "quit", "serno", "sernos", "status", "who",
];

/// Spawn the status server on `addr`. A bind failure logs and ends this
/// server without taking the daemon down.
pub fn spawn_status_server(
    registry: Arc<SgRegistry>,
    addr: String,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr, error = %e, "Status server failed to bind");
                return;
            }
        };
        info!(addr, "Status server listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&registry);
                        let child = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_status_conn(registry, stream, idle_timeout, child).await
                            {
                                warn!(peer = %peer, error = %e, "Status connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed on status server"),
                },
            }
        }
        info!("Status server stopped");
    })
}

async fn handle_status_conn(
    registry: Arc<SgRegistry>,
    stream: TcpStream,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half, MAX_LINE);

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = tokio::time::timeout(idle_timeout, reader.read_line_str()) => match read {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    info!("Status connection idle, closing");
                    return Ok(());
                }
            },
        };

        let reply = match line.trim() {
            "quit" => return Ok(()),
            "who" => connected_lines(&registry, Field::Both).await,
            "port" | "ports" => connected_lines(&registry, Field::Port).await,
            "serno" | "sernos" => connected_lines(&registry, Field::Serno).await,
            "status" | "json" => json_snapshot(&registry).await,
            _ => format!("Error: command must be one of: {}\n", COMMANDS.join(", ")),
        };
        write_half.write_all(reply.as_bytes()).await?;
    }
}

enum Field {
    Serno,
    Port,
    Both,
}

/// One line per connected receiver.
async fn connected_lines(registry: &SgRegistry, field: Field) -> String {
    let mut out = String::new();
    for record in registry.records().await {
        let snapshot = record.snapshot();
        if !snapshot.connected {
            continue;
        }
        match field {
            Field::Serno => out.push_str(&format!("{}\n", snapshot.serno)),
            Field::Port => out.push_str(&format!("{}\n", snapshot.tunnel_port)),
            Field::Both => {
                out.push_str(&format!("{},{}\n", snapshot.serno, snapshot.tunnel_port));
            }
        }
    }
    out
}

/// Every record, connected or not, keyed by serial.
async fn json_snapshot(registry: &SgRegistry) -> String {
    let mut by_serno: BTreeMap<String, SgSnapshot> = BTreeMap::new();
    for record in registry.records().await {
        let snapshot = record.snapshot();
        by_serno.insert(snapshot.serno.to_string(), snapshot);
    }
    match serde_json::to_string(&by_serno) {
        Ok(json) => format!("{json}\n"),
        Err(e) => {
            error!(error = %e, "Could not serialize status snapshot");
            "{}\n".to_string()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Serno;
    use crate::registry::SgState;
    use chrono::Utc;
    use tokio::io::{AsyncBufReadExt, BufReader};

    const IDLE: Duration = Duration::from_secs(5);

    async fn seeded_registry() -> Arc<SgRegistry> {
        let registry = Arc::new(SgRegistry::new());
        for (serial, port, connected) in [
            ("SG-0000000000AA", 40100, true),
            ("SG-0000000000BB", 40101, false),
        ] {
            let serno: Serno = serial.parse().unwrap();
            registry
                .load_or_create(&serno, || async move {
                    SgState {
                        ts_conn: Utc::now(),
                        ts_last_sync: None,
                        ts_next_sync: None,
                        tunnel_port: port,
                        connected,
                    }
                })
                .await;
        }
        registry
    }

    async fn start(registry: Arc<SgRegistry>, cancel: &CancellationToken) -> std::net::SocketAddr {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        let _server = spawn_status_server(registry, addr.to_string(), IDLE, cancel.clone());
        for _ in 0..100 {
            if TcpStream::connect(addr).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        addr
    }

    async fn query(addr: std::net::SocketAddr, command: &str, reply_lines: usize) -> Vec<String> {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(format!("{command}\n").as_bytes())
            .await
            .unwrap();
        let mut reader = BufReader::new(conn);
        let mut lines = Vec::new();
        for _ in 0..reply_lines {
            let mut line = String::new();
            tokio::time::timeout(IDLE, reader.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            lines.push(line.trim_end().to_string());
        }
        lines
    }

    #[tokio::test]
    async fn sernos_lists_connected_receivers_only() {
        let cancel = CancellationToken::new();
        let addr = start(seeded_registry().await, &cancel).await;

        let lines = query(addr, "sernos", 1).await;
        assert_eq!(lines, vec!["SG-0000000000AA"]);

        cancel.cancel();
    }

    #[tokio::test]
    async fn who_pairs_serno_and_port() {
        let cancel = CancellationToken::new();
        let addr = start(seeded_registry().await, &cancel).await;

        let lines = query(addr, "who", 1).await;
        assert_eq!(lines, vec!["SG-0000000000AA,40100"]);
        let ports = query(addr, "ports", 1).await;
        assert_eq!(ports, vec!["40100"]);

        cancel.cancel();
    }

    #[tokio::test]
    async fn json_includes_disconnected_records() {
        let cancel = CancellationToken::new();
        let addr = start(seeded_registry().await, &cancel).await;

        let lines = query(addr, "json", 1).await;
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["SG-0000000000AA"]["Connected"], true);
        assert_eq!(object["SG-0000000000BB"]["Connected"], false);
        assert_eq!(object["SG-0000000000BB"]["TunnelPort"], 40101);

        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_command_returns_usage() {
        let cancel = CancellationToken::new();
        let addr = start(seeded_registry().await, &cancel).await;

        let lines = query(addr, "bogus", 1).await;
        assert!(lines[0].starts_with("Error: command must be one of:"));
        assert!(lines[0].contains("json"));
        assert!(lines[0].contains("quit"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn quit_closes_the_connection() {
        let cancel = CancellationToken::new();
        let addr = start(seeded_registry().await, &cancel).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"quit\n").await.unwrap();
        let mut reader = BufReader::new(conn);
        let mut line = String::new();
        let n = tokio::time::timeout(IDLE, reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "connection should be closed after quit");

        cancel.cancel();
    }

    #[tokio::test]
    async fn commands_can_be_issued_repeatedly_on_one_connection() {
        let cancel = CancellationToken::new();
        let addr = start(seeded_registry().await, &cancel).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"sernos\n").await.unwrap();
        let mut reader = BufReader::new(conn);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "SG-0000000000AA");

        reader
            .get_mut()
            .write_all(b"ports\n")
            .await
            .unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "40100");

        cancel.cancel();
    }
}
