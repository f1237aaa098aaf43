//! Message recorder: durably logs every bus message.
//!
//! Subscribes to all topics and appends one row per message. A store
//! write failure loses that one row; it is logged and counted, and the
//! daemon keeps running.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fieldhub_core::Metrics;

use crate::bus::Bus;
use crate::storage::Database;

/// Spawn the recorder task. The subscription is taken before the task
/// starts so no message published after this call can be missed.
pub fn spawn_recorder(
    bus: &Bus,
    db: Database,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut sub = bus.subscribe_all();
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                received = sub.recv() => match received {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            // Fill in defaults: stamp unstamped messages here, and let a
            // bare event's text be its topic tag.
            let ts = envelope.msg.ts.unwrap_or_else(Utc::now);
            let text = if envelope.msg.text.is_empty() {
                envelope.topic.0.to_string()
            } else {
                envelope.msg.text.clone()
            };

            match db.record_message(ts, &envelope.msg.sender, &text).await {
                Ok(()) => metrics.incr_messages_recorded(),
                Err(e) => {
                    metrics.incr_record_failures();
                    error!(
                        sender = %envelope.msg.sender,
                        topic = %envelope.topic,
                        error = %e,
                        "Failed to record message"
                    );
                }
            }
        }
        info!("Message recorder stopped");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::message::{Msg, Topic};

    async fn wait_for_rows(db: &Database, sender: &str, n: usize) -> Vec<crate::storage::LoggedMessage> {
        for _ in 0..100 {
            let rows = db.messages_for_sender(sender).await.unwrap();
            if rows.len() >= n {
                return rows;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("never saw {n} rows for {sender}");
    }

    #[tokio::test]
    async fn records_messages_with_given_timestamp() {
        let bus = Bus::new(64, Arc::new(Metrics::new()));
        let db = Database::open_in_memory().await.unwrap();
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();
        let handle = spawn_recorder(&bus, db.clone(), Arc::clone(&metrics), cancel.clone());

        bus.publish(Topic::GPS, Msg::now("SG-0000000000AA", "G,48.1,-123.4"));

        let rows = wait_for_rows(&db, "SG-0000000000AA", 1).await;
        assert_eq!(rows[0].message, "G,48.1,-123.4");
        assert_eq!(metrics.messages_recorded(), 1);
        assert_eq!(metrics.record_failures(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unstamped_empty_message_gets_now_and_topic_text() {
        let bus = Bus::new(64, Arc::new(Metrics::new()));
        let db = Database::open_in_memory().await.unwrap();
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();
        let handle = spawn_recorder(&bus, db.clone(), Arc::clone(&metrics), cancel.clone());

        let before = Utc::now();
        bus.publish(
            Topic::CONNECT,
            Msg {
                ts: None,
                sender: "SG-0000000000AA".to_string(),
                text: String::new(),
            },
        );

        let rows = wait_for_rows(&db, "SG-0000000000AA", 1).await;
        let after = Utc::now();
        assert_eq!(rows[0].message, "1");
        let ts = fieldhub_core::db::from_epoch_secs(rows[0].ts).unwrap();
        assert!(ts >= before - chrono::Duration::milliseconds(1) && ts <= after);

        cancel.cancel();
        handle.await.unwrap();
    }
}
