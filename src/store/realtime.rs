//! Realtime change subscription for a single approval row.
//!
//! Speaks the store's phoenix-framed websocket protocol: join a topic
//! scoped to `id=eq.<uuid>`, heartbeat every 25 s, forward the
//! post-image of every UPDATE event. The subscription is owned by the
//! coordinator through a cancel handle; dropping it tears down the
//! socket. A dropped connection is not reconnected — the coordinator
//! falls back to the local TTY and the deadline.

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::models::approval::ApprovalRequest;
use crate::store::APPROVALS_TABLE;

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(25);
const EVENT_BUFFER: usize = 16;

/// Open subscription to UPDATE events for one row. Delivery is
/// at-least-once; events after the first terminal one are ignored by
/// the consumer.
pub struct RowSubscription {
    events: mpsc::Receiver<ApprovalRequest>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RowSubscription {
    /// Next post-image row, or `None` once the feed has closed.
    pub async fn recv(&mut self) -> Option<ApprovalRequest> {
        self.events.recv().await
    }

    /// Close the subscription, releasing the socket.
    pub fn close(mut self) {
        self.shutdown_now();
    }

    fn shutdown_now(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

impl Drop for RowSubscription {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

/// Subscribe to row-change events for `request_id`.
pub async fn subscribe(
    store_url: &str,
    anon_key: &str,
    request_id: Uuid,
) -> anyhow::Result<RowSubscription> {
    let ws_url = websocket_url(store_url, anon_key)?;
    let (mut ws, _) = connect_async(&ws_url)
        .await
        .context("realtime connect failed")?;

    let topic = format!("realtime:{APPROVALS_TABLE}:{request_id}");
    let join = serde_json::json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {
            "config": {
                "postgres_changes": [{
                    "event": "UPDATE",
                    "schema": "public",
                    "table": APPROVALS_TABLE,
                    "filter": format!("id=eq.{request_id}"),
                }]
            }
        },
        "ref": "1",
    });
    ws.send(Message::Text(join.to_string()))
        .await
        .context("realtime join failed")?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat_ref: u64 = 2;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = ws.send(Message::Close(None)).await;
                    break;
                }
                _ = heartbeat.tick() => {
                    let beat = serde_json::json!({
                        "topic": "phoenix",
                        "event": "heartbeat",
                        "payload": {},
                        "ref": heartbeat_ref.to_string(),
                    });
                    heartbeat_ref += 1;
                    if ws.send(Message::Text(beat.to_string())).await.is_err() {
                        tracing::debug!("realtime heartbeat failed, closing subscription");
                        break;
                    }
                }
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(row) = parse_update_event(&text) {
                                if events_tx.send(row).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::debug!("realtime feed closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!("realtime read error: {e}");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(RowSubscription {
        events: events_rx,
        shutdown: Some(shutdown_tx),
        task,
    })
}

fn websocket_url(store_url: &str, anon_key: &str) -> anyhow::Result<String> {
    let base = store_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        anyhow::bail!("store url must be http(s): {base}");
    };
    Ok(format!(
        "{ws_base}/realtime/v1/websocket?apikey={anon_key}&vsn=1.0.0"
    ))
}

/// Pull the post-image row out of a change frame. Non-UPDATE frames
/// (join replies, heartbeat acks, system events) yield `None`.
fn parse_update_event(text: &str) -> Option<ApprovalRequest> {
    let frame: serde_json::Value = serde_json::from_str(text).ok()?;
    let payload = frame.get("payload")?;
    let data = payload.get("data").unwrap_or(payload);
    let change_type = data.get("type").and_then(|t| t.as_str());
    if change_type.is_some() && change_type != Some("UPDATE") {
        return None;
    }
    let record = data.get("record")?;
    serde_json::from_value(record.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::approval::ApprovalStatus;

    #[test]
    fn websocket_url_maps_schemes() {
        assert_eq!(
            websocket_url("https://store.example.com/", "anon").unwrap(),
            "wss://store.example.com/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert!(websocket_url("ftp://x", "k").is_err());
    }

    #[test]
    fn parses_update_frame_post_image() {
        let id = Uuid::new_v4();
        let frame = serde_json::json!({
            "topic": "realtime:approval_requests",
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "type": "UPDATE",
                    "record": {
                        "id": id,
                        "command": "rm -rf /",
                        "danger_reason": "Recursive force delete from root directory",
                        "severity": "critical",
                        "cwd": "/work",
                        "status": "approved",
                        "created_at": "2026-01-05T10:00:00+00:00",
                        "resolved_at": "2026-01-05T10:01:00+00:00",
                        "resolved_by": "alice",
                        "machine_id": "0123456789abcdef0123456789abcdef"
                    }
                }
            },
            "ref": null
        });
        let row = parse_update_event(&frame.to_string()).expect("update row");
        assert_eq!(row.id, id);
        assert_eq!(row.status, ApprovalStatus::Approved);
        assert_eq!(row.resolved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn ignores_join_reply_and_heartbeat_frames() {
        let join_reply = r#"{"topic":"realtime:x","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#;
        assert!(parse_update_event(join_reply).is_none());
        let heartbeat = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"2"}"#;
        assert!(parse_update_event(heartbeat).is_none());
    }

    #[test]
    fn ignores_insert_frames() {
        let frame = serde_json::json!({
            "payload": { "data": { "type": "INSERT", "record": {} } }
        });
        assert!(parse_update_event(&frame.to_string()).is_none());
    }
}
