use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use tether_common::{ClientCommand, ServerEvent, ServerMessage, Username};
use tracing::{debug, info, warn};

use crate::players::PlayerDirectory;
use crate::router::{Attached, EventRouter, Reply};
use crate::session::Session;
use crate::State;

pub async fn upgrade(
    ws: WebSocketUpgrade,
    Extension(state): Extension<State>,
    Path(username): Path<String>,
) -> Response {
    let identity = match Username::parse(&username) {
        Ok(identity) if state.players.player_exists(&identity).unwrap_or(false) => identity,
        _ => {
            debug!(%username, "refusing websocket for unknown player");
            return StatusCode::FORBIDDEN.into_response();
        }
    };
    ws.on_upgrade(move |socket| serve_socket(socket, state, identity))
}

async fn serve_socket(mut socket: WebSocket, state: State, identity: Username) {
    let router = state.router;
    let Some(Attached {
        mut session,
        mut notifications,
        cancel,
    }) = router.connect(identity)
    else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    if push(&mut socket, &router, &session, &Reply::Snapshot).await.is_ok() {
        loop {
            let reply = tokio::select! {
                _ = cancel.cancelled() => Reply::Close,
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => match ClientCommand::parse(&text) {
                        Ok(command) => router.handle_command(&mut session, command),
                        Err(error) => {
                            debug!(username = %session.identity(), %error, "ignoring malformed message");
                            Reply::Snapshot
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => {
                        debug!(username = %session.identity(), %error, "socket error");
                        break;
                    }
                },
                Some(notification) = notifications.recv() => {
                    router.handle_notification(&mut session, notification)
                }
            };
            if push(&mut socket, &router, &session, &reply).await.is_err() {
                break;
            }
            if reply == Reply::Close {
                info!(username = %session.identity(), "closing session");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }
    router.disconnect(&session);
}

/// Sends what `reply` asks for: an optional event, then a fresh snapshot.
async fn push(
    socket: &mut WebSocket,
    router: &EventRouter,
    session: &Session,
    reply: &Reply,
) -> Result<(), axum::Error> {
    let event = match reply {
        Reply::Close => return Ok(()),
        Reply::Renamed { from, to } => Some(ServerEvent::Renamed {
            from: from.clone(),
            to: to.clone(),
        }),
        Reply::Snapshot => None,
    };
    if let Some(event) = event {
        send(socket, &ServerMessage::Event(event)).await?;
    }
    match router.snapshot(session) {
        Ok(snapshot) => send(socket, &ServerMessage::Snapshot(snapshot)).await,
        Err(error) => {
            warn!(username = %session.identity(), %error, "cannot build snapshot");
            Ok(())
        }
    }
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(error) => {
            warn!(%error, "cannot encode outbound message");
            Ok(())
        }
    }
}
