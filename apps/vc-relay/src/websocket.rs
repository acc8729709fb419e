use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codes::is_valid_room_code;
use crate::command::{CommandChannel, SocketFrame};
use crate::config::Config;
use crate::protocol::{
    parse_data_source_message, parse_local_player_name, DataSourceMessage, JoinResponseData,
    RelayMessage, CLOSE_NORMAL, CLOSE_POLICY,
};
use crate::registry::{allocate_room_code, SharedRoomStore};
use crate::room::{ClientHandle, Frame, JoinError, Room, SignalSource, TeardownReason};

#[derive(Clone)]
pub struct AppState {
    pub store: SharedRoomStore,
    pub config: Arc<Config>,
}

/// Data-source attach with the room code in the path: `/mcws/{roomId}`.
pub async fn data_source_path_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_data_source(socket, room_id, state))
}

#[derive(Debug, Deserialize)]
pub struct DataSourceParams {
    #[serde(rename = "roomId")]
    room_id: Option<String>,
}

/// Data-source attach with the room code in the query string:
/// `/mcws?roomId=..`. Some clients cannot put path segments in their
/// connect URL.
pub async fn data_source_query_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<DataSourceParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match params.room_id {
            Some(room_id) => handle_data_source(socket, room_id, state).await,
            None => close_socket(socket, CLOSE_POLICY, "A roomId is required.").await,
        }
    })
}

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    #[serde(rename = "roomId")]
    room_id: Option<String>,
    #[serde(rename = "playerCode")]
    player_code: Option<String>,
}

/// Browser attach: `/frontendws` opens a new room as its owner,
/// `/frontendws?roomId=..&playerCode=..` joins an existing one as a peer.
pub async fn frontend_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<JoinParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match (params.room_id, params.player_code) {
            (Some(room_id), Some(player_code)) => {
                handle_peer(socket, room_id, player_code, state).await
            }
            (None, None) => handle_owner(socket, state).await,
            _ => {
                close_socket(
                    socket,
                    CLOSE_POLICY,
                    "Joining requires both roomId and playerCode.",
                )
                .await
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Data source
// ---------------------------------------------------------------------------

async fn handle_data_source(socket: WebSocket, room_id: String, state: AppState) {
    if !is_valid_room_code(&room_id) {
        return close_socket(socket, CLOSE_POLICY, "Malformed room code.").await;
    }
    let Some(room) = state.store.get(&room_id) else {
        return close_socket(socket, CLOSE_POLICY, "Unknown room code.").await;
    };

    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let channel = Arc::new(CommandChannel::new(tx));

    if let Err(err) = room.bind_data_source(channel.clone()).await {
        warn!(room = %room_id, error = %err, "rejecting data source");
        return close_sink(sink, CLOSE_POLICY, "Room already has a data source.").await;
    }
    info!(room = %room_id, "data source connected");

    tokio::spawn(run_data_source_writer(sink, rx));

    // Handshake and polling run off the read loop so command responses can
    // flow while the handshake's own requests are in flight.
    {
        let room = room.clone();
        let channel = channel.clone();
        let config = state.config.clone();
        tokio::spawn(async move {
            match initialize_data_source(&room, &channel, &config).await {
                Ok(()) => room.run_poll_loop(config).await,
                Err(err) => {
                    warn!(room = %room.code(), error = %err, "data source handshake failed");
                    room.release_data_source().await;
                    channel.shutdown();
                }
            }
        });
    }

    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                debug!(room = %room_id, error = %err, "data source socket error");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            // Some clients send JSON in binary frames.
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(_) => break,
            _ => continue,
        };
        match parse_data_source_message(&text) {
            Ok(DataSourceMessage::CommandResponse {
                request_id,
                status_code,
                status_message,
            }) => channel.resolve(request_id, status_code, status_message),
            Err(err) => {
                debug!(room = %room_id, error = %err, "ignoring data-source message")
            }
        }
    }

    channel.shutdown();
    if room.is_active().await {
        info!(room = %room_id, "data source disconnected; closing room");
        state.store.remove(room.code());
        room.teardown(
            TeardownReason::HostDisconnected,
            Duration::from_millis(state.config.close_grace_ms),
        )
        .await;
    } else {
        // Handshake never completed; the room stays pending for another
        // attempt or the sweeper.
        room.release_data_source().await;
    }
}

/// Subscribe to command responses, resolve the owner's entity name, push
/// the room code in-game, then mark the room active.
async fn initialize_data_source(
    room: &Arc<Room>,
    channel: &Arc<CommandChannel>,
    config: &Config,
) -> anyhow::Result<()> {
    channel.subscribe_command_responses()?;
    let deadline = Duration::from_millis(config.command_timeout_ms);

    let response = channel.send("getlocalplayername", deadline).await?;
    let name = parse_local_player_name(&response)
        .ok_or_else(|| anyhow::anyhow!("data source reported an empty local player name"))?;

    channel
        .send(&format!("vcserver:notifyroomid {}", room.code()), deadline)
        .await?;

    room.activate(name).await;
    Ok(())
}

async fn run_data_source_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<SocketFrame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            SocketFrame::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            SocketFrame::Close => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_NORMAL,
                        reason: "".into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Browser connections
// ---------------------------------------------------------------------------

async fn handle_owner(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ClientHandle::new(tx);

    let code = allocate_room_code(&state.store);
    let room = Room::new(&code, handle.clone());
    state.store.insert(room.clone());
    info!(room = %code, "owner connected; room pending");

    tokio::spawn(run_frontend_writer(sink, rx));
    handle.send_code(&code);

    relay_client_frames(stream, &room, SignalSource::Owner).await;

    info!(room = %code, "owner disconnected; closing room");
    state.store.remove(&code);
    room.teardown(
        TeardownReason::OwnerClosed,
        Duration::from_millis(state.config.close_grace_ms),
    )
    .await;
}

async fn handle_peer(socket: WebSocket, room_id: String, player_code: String, state: AppState) {
    if !is_valid_room_code(&room_id) {
        return close_socket(socket, CLOSE_POLICY, "Malformed room code.").await;
    }
    let Some(room) = state.store.get(&room_id) else {
        return close_socket(socket, CLOSE_POLICY, "Unknown room code.").await;
    };

    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ClientHandle::new(tx);
    let handle_id = handle.id();

    let player_name = match room.register_peer(&player_code, handle.clone()).await {
        Ok(name) => name,
        Err(err) => {
            let reason = match err {
                JoinError::NotActive => "Room is not ready.",
                JoinError::InvalidCode => "Invalid player code.",
            };
            debug!(room = %room_id, error = %err, "rejecting peer");
            return close_sink(sink, CLOSE_POLICY, reason).await;
        }
    };

    tokio::spawn(run_frontend_writer(sink, rx));
    handle.send(RelayMessage::JoinResponse {
        data: JoinResponseData {
            player_name: player_name.clone(),
            room_id: room.code().to_string(),
        },
    });

    relay_client_frames(stream, &room, SignalSource::Peer(player_code)).await;

    debug!(room = %room_id, player = %player_name, "peer socket closed");
    room.peer_disconnected(&player_name, handle_id).await;
}

/// Pump inbound frames from a browser connection into the signal router
/// until the socket goes away.
async fn relay_client_frames(
    mut stream: SplitStream<WebSocket>,
    room: &Arc<Room>,
    source: SignalSource,
) {
    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                debug!(room = %room.code(), error = %err, "browser socket error");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<crate::protocol::ClientFrame>(&text) {
            Ok(crate::protocol::ClientFrame::Signal { target, payload }) => {
                room.route_signal(source.clone(), &target, payload).await
            }
            Err(err) => {
                warn!(room = %room.code(), error = %err, "dropping malformed client frame")
            }
        }
    }
}

async fn run_frontend_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Code { code } => {
                let text = json!({ "code": code }).to_string();
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Frame::Relay(message) => {
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Frame::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn close_sink(mut sink: SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
