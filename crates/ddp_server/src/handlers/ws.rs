use axum::{
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use ddp::{Frame, Server, TransportError, serve_connection};
use futures::{SinkExt, StreamExt, future};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Shared state for the DDP WebSocket endpoint
#[derive(Clone)]
pub struct WsState {
    pub server: Arc<Server>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<WsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_message_size = state.server.options().connection.max_message_size;
    debug!("WebSocket upgrade from {}", peer);
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state.server, peer))
}

/// Adapt an upgraded socket to the engine's frame stream and sink.
async fn handle_socket(socket: WebSocket, server: Arc<Server>, peer: SocketAddr) {
    let (ws_tx, ws_rx) = socket.split();

    let reader = ws_rx.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data.to_vec()))),
            Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
            // Transport-level keepalive is answered by the socket itself
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(e) => Some(Err(TransportError::new(e))),
        })
    });

    let writer = ws_tx
        .sink_map_err(TransportError::new)
        .with(|frame: Frame| {
            future::ready(Ok::<_, TransportError>(match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(data) => Message::Binary(data.into()),
                Frame::Close => Message::Close(None),
            }))
        });

    serve_connection(server, reader, writer, Some(peer)).await;
}
