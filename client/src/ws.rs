use anyhow::Context;
use futures_util::StreamExt;
use roomscope_shared::PushEvent;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::engine::EngineHandle;

fn parse_event(text: &str) -> Option<PushEvent> {
    match serde_json::from_str::<PushEvent>(text) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!("Failed to parse PushEvent: {}", err);
            None
        }
    }
}

/// Connect to the push channel. The receiver ends when the socket closes.
pub async fn connect_push_channel(url: &str) -> anyhow::Result<mpsc::UnboundedReceiver<PushEvent>> {
    let (stream, _) = connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    info!(url, "Push channel connected");

    let (tx, rx) = mpsc::unbounded_channel();
    let (_write, mut read) = stream.split();
    tokio::spawn(async move {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Some(event) = parse_event(&text) {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("Push channel error: {}", err);
                    break;
                }
            }
        }
        debug!("Push channel closed");
    });

    Ok(rx)
}

/// Feed push events into the engine until either side goes away
pub async fn forward_push_events(mut events: mpsc::UnboundedReceiver<PushEvent>, handle: EngineHandle) {
    while let Some(event) = events.recv().await {
        if handle.is_closed() {
            break;
        }
        handle.push_event(event);
    }
}
