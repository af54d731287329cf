use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use options_guard_manager::EngineApi;

/// Streams the active regime: the current state on connect, then every
/// reclassification.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(api): State<EngineApi>) -> Response {
    ws.on_upgrade(|socket| websocket_connection(socket, api))
}

async fn websocket_connection(mut socket: WebSocket, api: EngineApi) {
    let mut regime = api.subscribe_regime();

    let initial = serde_json::to_string(&*regime.borrow_and_update()).unwrap_or_default();
    if socket.send(Message::Text(initial)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            changed = regime.changed() => {
                if changed.is_err() {
                    break;
                }
                let json = serde_json::to_string(&*regime.borrow_and_update()).unwrap_or_default();
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    tracing::info!("WebSocket connection closed");
}
