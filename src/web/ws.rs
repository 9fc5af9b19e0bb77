//! Websocket re-broadcaster.
//!
//! `/ws/executions/:id` sends one `catchup` frame with everything buffered so
//! far, then forwards live events until the execution ends. `/ws/events`
//! forwards start and terminal events for every execution.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
};
use serde::Serialize;
use serde_json::json;
use tokio_stream::{Stream, StreamExt};

use super::AppState;
use crate::core::{Attachment, ExecutionEvent, Interest};

/// Attach to one execution.
pub async fn execution_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, StatusCode> {
    // Attach before the upgrade so nothing produced meanwhile is lost.
    let attachment = state.dispatcher.attach(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(ws.on_upgrade(move |socket| stream_execution(socket, attachment)))
}

/// Lifecycle events for every execution.
pub async fn events_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let events = state.dispatcher.bus().subscribe(Interest::Lifecycle);
    ws.on_upgrade(move |mut socket| async move {
        forward(&mut socket, events.into_stream()).await;
    })
}

async fn stream_execution(mut socket: WebSocket, attachment: Attachment) {
    let Attachment {
        execution,
        catch_up,
        live,
    } = attachment;

    let frame = json!({
        "type": "catchup",
        "id": execution.id,
        "info": execution,
        "output": catch_up,
    });
    if send_json(&mut socket, &frame).await.is_err() {
        return;
    }

    if let Some(live) = live {
        forward(&mut socket, live.into_stream()).await;
    }

    if let Err(e) = socket.send(Message::Close(None)).await {
        tracing::trace!("Websocket close failed: {}", e);
    }
}

async fn forward<S>(socket: &mut WebSocket, mut events: S)
where
    S: Stream<Item = ExecutionEvent> + Unpin,
{
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    if send_json(socket, &event).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}
