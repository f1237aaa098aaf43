//! Connection watcher: turns semaphore files into connect/disconnect
//! events.
//!
//! sshd maintains one semaphore file per connected receiver in a
//! well-known directory. Creation of a matching file publishes a
//! `connect`, removal a `disconnect`. After the watch is established,
//! files already present are reported as `connect` using their mtime;
//! a file appearing in that window may therefore be reported twice, so
//! subscribers treat duplicate connects as a no-op.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::message::{Msg, Serno, Topic};

/// Spawn the watcher task on `dir`. `pattern`'s first capture group must
/// be the receiver serial embedded in a semaphore file name.
pub fn spawn_watcher(
    bus: Bus,
    dir: PathBuf,
    pattern: Regex,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_watcher(bus, &dir, &pattern, cancel).await {
            error!(dir = %dir.display(), error = %e, "Connection watcher exited");
        }
    })
}

async fn run_watcher(
    bus: Bus,
    dir: &Path,
    pattern: &Regex,
    cancel: CancellationToken,
) -> notify::Result<()> {
    let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(256);

    // notify delivers on its own thread; bridge into the async world.
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.blocking_send(res);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    info!(dir = %dir.display(), "Connection watcher established");

    // Receivers already connected when we started: report them with the
    // semaphore's mtime as the connect time.
    bootstrap_existing(&bus, dir, pattern);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(Ok(event)) => handle_event(&bus, pattern, &event),
                Some(Err(e)) => warn!(error = %e, "Watch error"),
                None => break,
            },
        }
    }
    info!("Connection watcher stopped");
    Ok(())
}

fn handle_event(bus: &Bus, pattern: &Regex, event: &Event) {
    let topic = match event.kind {
        EventKind::Create(_) => Topic::CONNECT,
        EventKind::Remove(_) => Topic::DISCONNECT,
        _ => return,
    };
    for path in &event.paths {
        if let Some(serno) = semaphore_serno(pattern, path) {
            bus.publish(
                topic,
                Msg {
                    ts: Some(Utc::now()),
                    sender: serno.to_string(),
                    text: String::new(),
                },
            );
        }
    }
}

fn bootstrap_existing(bus: &Bus, dir: &Path, pattern: &Regex) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Could not enumerate semaphores");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(serno) = semaphore_serno(pattern, &path) else {
            continue;
        };
        let ts = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        bus.publish(
            Topic::CONNECT,
            Msg {
                ts: Some(ts),
                sender: serno.to_string(),
                text: String::new(),
            },
        );
    }
}

/// Serial number encoded in a semaphore path, if the file name matches.
fn semaphore_serno(pattern: &Regex, path: &Path) -> Option<Serno> {
    let name = path.file_name()?.to_str()?;
    let captures = pattern.captures(name)?;
    captures.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fieldhub_core::Metrics;
    use std::sync::Arc;

    fn sem_pattern() -> Regex {
        Regex::new(r"sem\.(SG-[0-9A-Za-z]{12})").unwrap()
    }

    #[test]
    fn semaphore_serno_extraction() {
        let pattern = sem_pattern();
        let serno = semaphore_serno(&pattern, Path::new("/dev/shm/sem.SG-0000000000AA"));
        assert_eq!(serno.unwrap().as_str(), "SG-0000000000AA");

        assert!(semaphore_serno(&pattern, Path::new("/dev/shm/sem.nope")).is_none());
        assert!(semaphore_serno(&pattern, Path::new("/dev/shm/other")).is_none());
    }

    #[tokio::test]
    async fn existing_semaphores_bootstrap_as_connects() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("sem.SG-0000000000AA"), b"").unwrap();
        std::fs::write(tmp.path().join("unrelated"), b"").unwrap();

        let bus = Bus::new(64, Arc::new(Metrics::new()));
        let mut sub = bus.subscribe(&[Topic::CONNECT]);
        bootstrap_existing(&bus, tmp.path(), &sem_pattern());

        let envelope = sub.recv().await.unwrap();
        assert_eq!(envelope.topic, Topic::CONNECT);
        assert_eq!(envelope.msg.sender, "SG-0000000000AA");
        assert!(envelope.msg.ts.is_some());
    }

    #[tokio::test]
    async fn create_and_remove_publish_connect_and_disconnect() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Bus::new(64, Arc::new(Metrics::new()));
        let mut sub = bus.subscribe(&[Topic::CONNECT, Topic::DISCONNECT]);
        let cancel = CancellationToken::new();
        let handle = spawn_watcher(
            bus.clone(),
            tmp.path().to_path_buf(),
            sem_pattern(),
            cancel.clone(),
        );

        // Give the watch a moment to establish before touching files.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let sem = tmp.path().join("sem.SG-0000000000AA");
        std::fs::write(&sem, b"").unwrap();

        let connect = tokio::time::timeout(std::time::Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for connect")
            .unwrap();
        assert_eq!(connect.topic, Topic::CONNECT);
        assert_eq!(connect.msg.sender, "SG-0000000000AA");

        std::fs::remove_file(&sem).unwrap();
        let disconnect = tokio::time::timeout(std::time::Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for disconnect")
            .unwrap();
        assert_eq!(disconnect.topic, Topic::DISCONNECT);
        assert_eq!(disconnect.msg.sender, "SG-0000000000AA");

        cancel.cancel();
        handle.await.unwrap();
    }
}
