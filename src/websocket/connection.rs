//! Socket pump for one WebSocket connection

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};

use super::client::{ClientHandle, HubConfig};

/// Drive `socket` until either side gives up or the client is closed
///
/// The writer drains the client's outbound queue and pings on a timer. The
/// reader discards application messages and only watches for pongs, which
/// push the read deadline back.
pub(crate) async fn pump(socket: WebSocket, client: ClientHandle, mut outbound: mpsc::Receiver<String>, config: HubConfig) {
    let (mut sender, mut receiver) = socket.split();
    let closed = client.closed_token();
    let write_timeout = config.write_timeout();
    let read_timeout = config.read_timeout();
    let ping_interval = config.ping_interval();

    let writer_closed = closed.clone();
    let writer_id = client.id().to_string();
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let frame = tokio::select! {
                _ = writer_closed.cancelled() => break,
                text = outbound.recv() => match text {
                    Some(text) => Message::Text(text),
                    None => break,
                },
                _ = ping.tick() => Message::Ping(Vec::new()),
            };

            match timeout(write_timeout, sender.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(client_id = %writer_id, error = %e, "WebSocket write failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(client_id = %writer_id, "WebSocket write timed out");
                    break;
                }
            }
        }

        let _ = timeout(write_timeout, sender.send(Message::Close(None))).await;
    });

    let reader_id = client.id().to_string();
    let mut recv_task = tokio::spawn(async move {
        let mut deadline = Instant::now() + read_timeout;
        loop {
            match timeout_at(deadline, receiver.next()).await {
                Err(_) => {
                    tracing::debug!(client_id = %reader_id, "WebSocket read deadline passed");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(client_id = %reader_id, error = %e, "WebSocket read error");
                    break;
                }
                Ok(Some(Ok(Message::Pong(_)))) => {
                    deadline = Instant::now() + read_timeout;
                }
                Ok(Some(Ok(Message::Close(_)))) => {
                    tracing::debug!(client_id = %reader_id, "Client requested close");
                    break;
                }
                // Inbound application messages are ignored
                Ok(Some(Ok(_))) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            closed.cancel();
            // Let the writer say goodbye, bounded by the write timeout
            if timeout(write_timeout, &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
    }

    client.close();
}
