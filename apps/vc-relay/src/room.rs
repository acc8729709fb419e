use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::codes::generate_player_code;
use crate::command::{CommandChannel, CommandError};
use crate::config::Config;
use crate::protocol::{
    PlayerJoinData, PlayerNameData, ProtocolError, RelayMessage, Snapshot, SyncMessage,
    CLOSE_HOST_GONE, CLOSE_NORMAL, CLOSE_POLICY,
};
use crate::sync::{diff_roster, SyncTracker};

/// Sentinel signal target addressing the room owner.
pub const OWNER_TARGET: &str = "owner";

/// Frames handed to a browser connection's socket writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Room code assignment, sent once to a new owner connection as a bare
    /// `{ "code": .. }` object.
    Code { code: String },
    Relay(RelayMessage),
    Close { code: u16, reason: String },
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Send-side handle for one browser connection (owner or peer). Sends never
/// block and never fail loudly: a gone connection drops frames.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Frame>,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, message: RelayMessage) {
        let _ = self.tx.send(Frame::Relay(message));
    }

    pub fn send_code(&self, code: &str) {
        let _ = self.tx.send(Frame::Code {
            code: code.to_string(),
        });
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Frame::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Code reserved, no data source bound yet.
    Pending,
    /// Data source bound and owner identity resolved.
    Active,
    /// Terminal; resources released.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("room already has a data source")]
    AlreadyBound,
    #[error("room is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("room is not active")]
    NotActive,
    #[error("unknown player code")]
    InvalidCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    HostDisconnected,
    OwnerClosed,
    Expired,
}

#[derive(Debug, Clone)]
pub enum SignalSource {
    Owner,
    Peer(String),
}

/// An in-game entity that needs to learn its freshly issued identity code
/// through the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinNotification {
    pub player_name: String,
    pub player_code: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Rpc(#[from] CommandError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct RoomState {
    phase: RoomPhase,
    owner: Option<ClientHandle>,
    channel: Option<Arc<CommandChannel>>,
    local_player_name: Option<String>,
    roster: Vec<String>,
    /// Identity code -> entity name.
    codes: HashMap<String, String>,
    /// Entity name -> authenticated peer connection.
    peers: HashMap<String, ClientHandle>,
    tracker: SyncTracker,
}

/// One session: a data source, the owning browser connection, and the peers
/// that joined with identity codes. All mutation goes through the inner
/// mutex; the poll timer, the data-source handler, and the peer handlers
/// all reach the state from their own tasks.
pub struct Room {
    code: String,
    created_at: Instant,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(code: &str, owner: ClientHandle) -> Arc<Self> {
        Arc::new(Self {
            code: code.to_string(),
            created_at: Instant::now(),
            state: Mutex::new(RoomState {
                phase: RoomPhase::Pending,
                owner: Some(owner),
                channel: None,
                local_player_name: None,
                roster: Vec::new(),
                codes: HashMap::new(),
                peers: HashMap::new(),
                tracker: SyncTracker::new(),
            }),
        })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub async fn phase(&self) -> RoomPhase {
        self.state.lock().await.phase
    }

    pub async fn is_active(&self) -> bool {
        self.phase().await == RoomPhase::Active
    }

    /// Reserve the data-source slot. A room accepts exactly one data source
    /// for its lifetime; a second connection attempt is rejected without
    /// touching the first.
    pub async fn bind_data_source(&self, channel: Arc<CommandChannel>) -> Result<(), BindError> {
        let mut state = self.state.lock().await;
        match state.phase {
            RoomPhase::Closed => Err(BindError::Closed),
            _ if state.channel.is_some() => Err(BindError::AlreadyBound),
            _ => {
                state.channel = Some(channel);
                Ok(())
            }
        }
    }

    /// Complete initialization: the owner's entity identity is resolved and
    /// the room becomes discoverable to joiners.
    pub async fn activate(&self, local_player_name: String) {
        let mut state = self.state.lock().await;
        if state.phase == RoomPhase::Pending {
            info!(room = %self.code, player = %local_player_name, "room active");
            state.local_player_name = Some(local_player_name);
            state.phase = RoomPhase::Active;
        }
    }

    /// Undo a failed initialization, leaving the room `Pending` and
    /// eligible for another data-source attempt or garbage collection.
    pub async fn release_data_source(&self) {
        let mut state = self.state.lock().await;
        if state.phase == RoomPhase::Pending {
            state.channel = None;
        }
    }

    /// Drive sync polls until the room closes or the channel drops. Polls
    /// run strictly one at a time: the next tick is not awaited until the
    /// previous poll has settled.
    pub async fn run_poll_loop(self: Arc<Self>, config: Arc<Config>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !self.is_active().await {
                break;
            }
            match self.poll_once(&config).await {
                Ok(()) => {}
                Err(PollError::Rpc(CommandError::ChannelClosed)) => break,
                // Transient: timeouts and malformed responses are retried on
                // the next tick and never abort the room.
                Err(err) => {
                    debug!(room = %self.code, error = %err, "sync poll failed; retrying next tick")
                }
            }
        }
    }

    async fn poll_once(&self, config: &Config) -> Result<(), PollError> {
        let (channel, wants_full) = {
            let state = self.state.lock().await;
            let channel = state.channel.clone().ok_or(CommandError::ChannelClosed)?;
            (channel, state.tracker.wants_full())
        };

        let raw = channel
            .send(
                &format!("vcserver:sync {}", wants_full),
                Duration::from_millis(config.sync_timeout_ms),
            )
            .await?;
        let message = SyncMessage::parse(&raw)?;
        let snapshot = Snapshot::decode(&message.d)?;

        let notifications = self.apply_snapshot(&message, &snapshot).await;

        for notification in notifications {
            let command = format!(
                "vcserver:notifyplayer {} {} {}",
                notification.player_name, self.code, notification.player_code
            );
            if let Err(err) = channel
                .send(&command, Duration::from_millis(config.command_timeout_ms))
                .await
            {
                warn!(
                    room = %self.code,
                    player = %notification.player_name,
                    error = %err,
                    "failed to deliver identity code in-game"
                );
            }
        }
        Ok(())
    }

    /// Apply one decoded sync response: derive join/leave events from the
    /// roster, forward the raw snapshot to the owner, and advance the
    /// sequence tracker. Returns the notify commands still owed to the data
    /// source.
    async fn apply_snapshot(
        &self,
        message: &SyncMessage,
        snapshot: &Snapshot,
    ) -> Vec<JoinNotification> {
        let mut state = self.state.lock().await;
        if state.phase != RoomPhase::Active {
            return Vec::new();
        }

        let mut notifications = Vec::new();

        if let Some(roster) = &snapshot.pl {
            let (joins, leaves) = diff_roster(&state.roster, roster);

            for name in joins {
                // The owner's own entity never gets an event or a code.
                if state.local_player_name.as_deref() == Some(name.as_str()) {
                    continue;
                }
                let player_code = issue_code(&mut state, &name);
                debug!(room = %self.code, player = %name, "player joined");
                if let Some(owner) = &state.owner {
                    owner.send(RelayMessage::PlayerJoin {
                        data: PlayerJoinData {
                            player_name: name.clone(),
                            player_code: player_code.clone(),
                        },
                    });
                }
                notifications.push(JoinNotification {
                    player_name: name,
                    player_code,
                });
            }

            for name in leaves {
                debug!(room = %self.code, player = %name, "player left");
                revoke_code(&mut state, &name);
                if let Some(peer) = state.peers.remove(&name) {
                    peer.close(CLOSE_NORMAL, "Player left the game.");
                }
                if let Some(owner) = &state.owner {
                    owner.send(RelayMessage::PlayerLeave {
                        data: PlayerNameData { player_name: name },
                    });
                }
            }

            state.roster = roster.clone();
        }

        if let Some(owner) = &state.owner {
            owner.send(RelayMessage::Sync {
                data: message.d.clone(),
            });
        }

        state.tracker.observe(message.s);
        notifications
    }

    /// Authenticate a joining peer by identity code. The resolved entity
    /// name is returned; a prior registration for the same name is replaced
    /// and closed.
    pub async fn register_peer(
        &self,
        player_code: &str,
        handle: ClientHandle,
    ) -> Result<String, JoinError> {
        let mut state = self.state.lock().await;
        if state.phase != RoomPhase::Active {
            return Err(JoinError::NotActive);
        }
        let name = state
            .codes
            .get(player_code)
            .cloned()
            .ok_or(JoinError::InvalidCode)?;
        if let Some(previous) = state.peers.insert(name.clone(), handle) {
            previous.close(CLOSE_NORMAL, "Replaced by a newer connection.");
        }
        info!(room = %self.code, player = %name, "peer authenticated");
        Ok(name)
    }

    /// A peer's socket went away. Distinct from a game-level leave: the
    /// entity may still be in the world.
    pub async fn peer_disconnected(&self, player_name: &str, handle_id: u64) {
        let mut state = self.state.lock().await;
        if state.phase == RoomPhase::Closed {
            return;
        }
        // Only deregister if this is still the registered connection; a
        // replacement may already have taken the slot.
        if state.peers.get(player_name).map(ClientHandle::id) != Some(handle_id) {
            return;
        }
        state.peers.remove(player_name);
        if let Some(owner) = &state.owner {
            owner.send(RelayMessage::PeerDisconnect {
                data: PlayerNameData {
                    player_name: player_name.to_string(),
                },
            });
        }
    }

    /// Forward an opaque signaling payload to its target, tagging it with
    /// the sender's code. Unroutable targets are dropped.
    pub async fn route_signal(&self, from: SignalSource, target: &str, payload: serde_json::Value) {
        let state = self.state.lock().await;
        if state.phase != RoomPhase::Active {
            debug!(room = %self.code, "dropping signal for inactive room");
            return;
        }
        let sender = match &from {
            SignalSource::Owner => OWNER_TARGET.to_string(),
            SignalSource::Peer(code) => code.clone(),
        };
        let message = RelayMessage::Signal {
            target: Some(target.to_string()),
            sender: Some(sender),
            payload,
        };
        if target == OWNER_TARGET {
            if let Some(owner) = &state.owner {
                owner.send(message);
            }
        } else {
            match state.codes.get(target).and_then(|name| state.peers.get(name)) {
                Some(peer) => peer.send(message),
                None => {
                    debug!(room = %self.code, %target, "dropping signal for unknown target")
                }
            }
        }
    }

    /// Cascading close: every owned connection is closed and all identity
    /// codes revoked. Idempotent; a closed room stays closed.
    pub async fn teardown(&self, reason: TeardownReason, close_grace: Duration) {
        let (owner, peers, channel) = {
            let mut state = self.state.lock().await;
            if state.phase == RoomPhase::Closed {
                return;
            }
            state.phase = RoomPhase::Closed;
            // Snapshot the peer set before closing anything.
            let peers: Vec<ClientHandle> = state.peers.drain().map(|(_, handle)| handle).collect();
            state.codes.clear();
            state.roster.clear();
            (state.owner.take(), peers, state.channel.take())
        };

        let (close_code, close_reason) = match reason {
            TeardownReason::HostDisconnected => (CLOSE_HOST_GONE, "The host has disconnected."),
            TeardownReason::OwnerClosed => (CLOSE_HOST_GONE, "The room owner has disconnected."),
            TeardownReason::Expired => {
                (CLOSE_POLICY, "Room expired before a data source connected.")
            }
        };

        for peer in peers {
            peer.close(close_code, close_reason);
        }
        if let Some(owner) = owner {
            owner.close(close_code, close_reason);
        }

        if let Some(channel) = channel {
            // Ask the remote side to close its own socket, then force it.
            if !matches!(reason, TeardownReason::HostDisconnected) && channel.is_open() {
                let _ = channel.send("closewebsocket", close_grace).await;
            }
            channel.shutdown();
        }
        info!(room = %self.code, ?reason, "room closed");
    }

    #[cfg(test)]
    async fn code_table(&self) -> HashMap<String, String> {
        self.state.lock().await.codes.clone()
    }

    #[cfg(test)]
    async fn wants_full(&self) -> bool {
        self.state.lock().await.tracker.wants_full()
    }
}

/// Issue an identity code for `name`, reusing the live one if it exists.
/// One entity holds at most one code at a time.
fn issue_code(state: &mut RoomState, name: &str) -> String {
    if let Some((code, _)) = state.codes.iter().find(|(_, n)| n.as_str() == name) {
        return code.clone();
    }
    loop {
        let code = generate_player_code();
        if !state.codes.contains_key(&code) {
            state.codes.insert(code.clone(), name.to_string());
            return code;
        }
    }
}

fn revoke_code(state: &mut RoomState, name: &str) {
    let revoked: Vec<String> = state
        .codes
        .iter()
        .filter(|(_, n)| n.as_str() == name)
        .map(|(code, _)| code.clone())
        .collect();
    for code in revoked {
        state.codes.remove(&code);
    }
}
