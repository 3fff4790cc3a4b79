//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::game::UserId;
use crate::matchmaking::PairingOutcome;
use crate::sessions::{GameState, Preparation};
use crate::store::UserDirectory;
use crate::util::rate_limit::PlayerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::connections::{ConnectionId, Outbound};
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: UserId,
}

/// WebSocket upgrade handler. Only known users may connect.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let user_id = query.user_id;
    if state.users.find(user_id).is_none() {
        warn!(user_id = %user_id, "WebSocket rejected, unknown user");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    info!(user_id = %user_id, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let welcome = ServerMsg::Welcome {
        user_id,
        server_time: unix_millis(),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(user_id = %user_id, error = %e, "Failed to send welcome");
        return;
    }

    let outbound = state.connections.register(user_id);
    let connection_id = outbound.id();
    let writer = tokio::spawn(write_loop(user_id, ws_sink, outbound));

    let limiter = PlayerRateLimiter::new();
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !limiter.check_message() {
                    warn!(user_id = %user_id, "Rate limited client message");
                    continue;
                }
                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => {
                        if let Some(reply) = dispatch(&state, &limiter, user_id, msg) {
                            state.connections.send(user_id, reply);
                        }
                    }
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Failed to parse client message");
                        state
                            .connections
                            .send(user_id, ServerMsg::error("bad_message", e.to_string()));
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(user_id = %user_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(user_id = %user_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    disconnect(&state, user_id, connection_id);
    writer.abort();
    info!(user_id = %user_id, "WebSocket connection closed");
}

/// Forward queued server messages to the socket
async fn write_loop(
    user_id: UserId,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut outbound: Outbound,
) {
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = send_msg(&mut ws_sink, &msg).await {
            debug!(user_id = %user_id, error = %e, "WebSocket send failed");
            break;
        }
    }
    let _ = ws_sink.close().await;
}

/// Apply one client message. Returns a direct reply, if any.
pub fn dispatch(
    state: &AppState,
    limiter: &PlayerRateLimiter,
    user_id: UserId,
    msg: ClientMsg,
) -> Option<ServerMsg> {
    match msg {
        ClientMsg::JoinGame { board_id } => {
            if !limiter.check_join() {
                return Some(ServerMsg::error("rate_limited", "Too many join requests"));
            }
            if !state.matchmaking.enqueue(user_id, board_id) {
                return Some(ServerMsg::error("already_playing", "Already in a game"));
            }
            // Queued goes out first so a paired client sees it before game_started.
            state.connections.send(user_id, ServerMsg::Queued { board_id });
            match state.matchmaking.attempt_pair(user_id, board_id) {
                PairingOutcome::Aborted => {
                    Some(ServerMsg::error("pairing_failed", "Could not join the game"))
                }
                PairingOutcome::Waiting | PairingOutcome::Started(_) => None,
            }
        }

        ClientMsg::Moving { snap } => {
            if state.sessions.is_simulation_started_for(user_id) {
                return Some(ServerMsg::error("not_moving", "No game accepting moves"));
            }
            match state.sessions.prepare_simulation(user_id, snap) {
                Preparation::Rejected => {
                    Some(ServerMsg::error("not_moving", "No game accepting moves"))
                }
                Preparation::Waiting => None,
                Preparation::TeamReady(session_id) => {
                    if let Err(e) = state.sessions.start_simulation(session_id) {
                        error!(session_id = %session_id, error = %e, "Simulation did not start");
                    }
                    None
                }
            }
        }

        ClientMsg::Finish => {
            let Some(session) = state.sessions.session_for(user_id) else {
                return Some(ServerMsg::error("not_playing", "Not in a game"));
            };
            // Finishing a running round ends it for the whole team.
            if session.state() == GameState::Simulation {
                state.sessions.request_finish(session.id());
            }
            state.sessions.acknowledge_finish(user_id);
            None
        }

        ClientMsg::Ping { t } => Some(ServerMsg::Pong { t }),
    }
}

/// Release everything the user held. A socket that was already replaced by
/// a newer one leaves the user's queue entry and session alone.
pub fn disconnect(state: &AppState, user_id: UserId, connection_id: ConnectionId) {
    if !state.connections.unregister(user_id, connection_id) {
        return;
    }
    state.matchmaking.remove_waiter(user_id);
    state.sessions.remove_session_for_team(user_id);
}

async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}
