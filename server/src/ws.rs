use crate::state::AppState;
use axum::{
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, StreamExt};
use roomscope_shared::PushEvent;
use std::net::SocketAddr;
use tokio::{select, sync::broadcast::error::RecvError};
use tracing::{error, info, warn};

/// GET /api/events - stream every push event as JSON text frames
pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

#[tracing::instrument(skip(socket, state), fields(client_addr = %addr))]
async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let mut events = state.subscribe();
    let (mut sender, mut reader) = socket.split();
    info!("Event stream opened.");

    loop {
        select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => {
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagging, events dropped.");
                }
                Err(RecvError::Closed) => break,
            },
            msg = reader.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(other)) => {
                    warn!("Ignoring client message on event stream: {other:?}");
                }
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    break;
                }
            },
        }
    }
    info!("Event stream closed.");
}

/// Returns false once the socket is gone
async fn send_event(sender: &mut (impl Sink<Message> + Unpin), event: &PushEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(err) => {
            error!("Failed to serialize event '{event:?}': {err}");
            true
        }
    }
}
