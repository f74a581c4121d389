//! Broadcast hub: per-game rooms and connection fan-out.
//!
//! The hub owns room membership and nothing else. Engines hand it read-only
//! snapshots and events; it never mutates round state. Each connection holds
//! at most one room membership, and join/leave for a given connection are
//! serialized by a per-connection lock so a reconnect racing a disconnect
//! cannot double-add or double-remove.

use crate::engine::round::{GameType, RoundRecord, RoundSnapshot};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identity attached to a connection. Viewers may be anonymous.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Opaque connection handle. Monotonic so ids are never reused within a
/// process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Events fanned out to connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    StateUpdate {
        snapshot: RoundSnapshot,
    },
    /// Authoritative crash result. Always broadcast before the generic
    /// state update for the same transition.
    FinalValue {
        crash_multiplier: f64,
        round_number: u64,
    },
    RoundCompleted {
        round_number: u64,
        crash_multiplier: f64,
        game_hash: String,
        server_seed: String,
        client_seed: String,
    },
    AutoCashoutTriggered {
        user_id: String,
        cashout_multiplier: f64,
        cashout_amount: f64,
    },
    BetPlaced {
        user_id: String,
        amount: f64,
        round_number: u64,
    },
    UserJoined {
        room_id: GameType,
        identity: Identity,
    },
    UserLeft {
        room_id: GameType,
        identity: Identity,
    },
    Heartbeat {
        timestamp_ms: u64,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl WireEvent {
    pub fn from_record(record: &RoundRecord) -> Self {
        WireEvent::RoundCompleted {
            round_number: record.round_number,
            crash_multiplier: record.crash_multiplier,
            game_hash: record.game_hash.clone(),
            server_seed: record.server_seed.clone(),
            client_seed: record.client_seed.clone(),
        }
    }
}

struct ConnectionEntry {
    sender: mpsc::UnboundedSender<WireEvent>,
    identity: Identity,
    room: Option<GameType>,
    last_seen: Instant,
    /// Serializes join/leave/disconnect for this connection.
    membership: Arc<Mutex<()>>,
}

#[derive(Default)]
struct Room {
    members: HashSet<ConnectionId>,
    /// Recent events replayed to new members: last state update plus a
    /// bounded ring of completed rounds.
    last_state: Option<WireEvent>,
    recent_rounds: VecDeque<WireEvent>,
}

/// Connection registry and room-keyed event fan-out.
pub struct BroadcastHub {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<GameType, Room>,
    next_id: AtomicU64,
    history_limit: usize,
}

impl BroadcastHub {
    pub fn new(history_limit: usize) -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            next_id: AtomicU64::new(1),
            history_limit,
        }
    }

    /// Register a connection and hand back its id plus the receiving end of
    /// its event queue. The caller pumps the receiver into its transport.
    pub fn register(&self, identity: Identity) -> (ConnectionId, mpsc::UnboundedReceiver<WireEvent>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            id,
            ConnectionEntry {
                sender: tx,
                identity,
                room: None,
                last_seen: Instant::now(),
                membership: Arc::new(Mutex::new(())),
            },
        );
        info!(connection = %id, total = self.connections.len(), "connection registered");
        (id, rx)
    }

    fn membership_lock(&self, conn: ConnectionId) -> Option<Arc<Mutex<()>>> {
        self.connections.get(&conn).map(|e| e.membership.clone())
    }

    /// Move a connection into a room, leaving any previous room first.
    /// Recent history and the latest state snapshot are replayed to the new
    /// member so it catches up before the next live broadcast.
    pub async fn join(&self, conn: ConnectionId, game_type: GameType) {
        let Some(lock) = self.membership_lock(conn) else {
            return;
        };
        let _guard = lock.lock().await;

        self.remove_from_current_room(conn);

        let identity = match self.connections.get_mut(&conn) {
            Some(mut entry) => {
                entry.room = Some(game_type);
                entry.identity.clone()
            }
            None => return,
        };

        let replay: Vec<WireEvent> = {
            let mut room = self.rooms.entry(game_type).or_default();
            room.members.insert(conn);
            room.recent_rounds
                .iter()
                .cloned()
                .chain(room.last_state.iter().cloned())
                .collect()
        };
        for event in replay {
            self.send_to_connection(conn, event);
        }

        debug!(connection = %conn, room = %game_type, "joined room");
        self.broadcast(game_type, WireEvent::UserJoined {
            room_id: game_type,
            identity,
        });
    }

    /// Leave the current room, if any, with a `user_left` broadcast there.
    pub async fn leave(&self, conn: ConnectionId) {
        let Some(lock) = self.membership_lock(conn) else {
            return;
        };
        let _guard = lock.lock().await;
        self.remove_from_current_room(conn);
    }

    /// Drop the connection entirely (transport closed).
    pub async fn disconnect(&self, conn: ConnectionId) {
        if let Some(lock) = self.membership_lock(conn) {
            let _guard = lock.lock().await;
            self.remove_from_current_room(conn);
        }
        if self.connections.remove(&conn).is_some() {
            info!(connection = %conn, remaining = self.connections.len(), "connection closed");
        }
    }

    fn remove_from_current_room(&self, conn: ConnectionId) {
        let (room_id, identity) = {
            let Some(mut entry) = self.connections.get_mut(&conn) else {
                return;
            };
            let Some(room_id) = entry.room.take() else {
                return;
            };
            (room_id, entry.identity.clone())
        };
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            room.members.remove(&conn);
        }
        self.broadcast(room_id, WireEvent::UserLeft {
            room_id,
            identity,
        });
    }

    /// Fan an event to every open connection in the room. Connections whose
    /// queue is gone are pruned lazily here, on the failed send.
    pub fn broadcast(&self, game_type: GameType, event: WireEvent) {
        let members: Vec<ConnectionId> = match self.rooms.get_mut(&game_type) {
            Some(mut room) => {
                self.record_for_replay(&mut room, &event);
                room.members.iter().copied().collect()
            }
            None => return,
        };

        let mut dead = Vec::new();
        for conn in members {
            let delivered = self
                .connections
                .get(&conn)
                .map(|entry| entry.sender.send(event.clone()).is_ok())
                .unwrap_or(false);
            if !delivered {
                dead.push(conn);
            }
        }
        for conn in dead {
            debug!(connection = %conn, "pruning unreachable connection");
            self.prune(conn, game_type);
        }
    }

    fn record_for_replay(&self, room: &mut Room, event: &WireEvent) {
        match event {
            WireEvent::StateUpdate { .. } => {
                room.last_state = Some(event.clone());
            }
            WireEvent::RoundCompleted { .. } => {
                room.recent_rounds.push_back(event.clone());
                while room.recent_rounds.len() > self.history_limit {
                    room.recent_rounds.pop_front();
                }
            }
            _ => {}
        }
    }

    /// Targeted delivery to one user's connections in a room (auto-cash-out
    /// notifications and action replies).
    pub fn send_to_user(&self, game_type: GameType, user_id: &str, event: WireEvent) {
        let members: Vec<ConnectionId> = match self.rooms.get(&game_type) {
            Some(room) => room.members.iter().copied().collect(),
            None => return,
        };
        for conn in members {
            let matches = self
                .connections
                .get(&conn)
                .map(|e| e.identity.user_id.as_deref() == Some(user_id))
                .unwrap_or(false);
            if matches {
                self.send_to_connection(conn, event.clone());
            }
        }
    }

    /// Direct send to one connection (replies on the requesting socket).
    pub fn send_to_connection(&self, conn: ConnectionId, event: WireEvent) {
        if let Some(entry) = self.connections.get(&conn) {
            if entry.sender.send(event).is_err() {
                let room = entry.room;
                drop(entry);
                if let Some(room) = room {
                    self.prune(conn, room);
                } else {
                    self.connections.remove(&conn);
                }
            }
        }
    }

    fn prune(&self, conn: ConnectionId, room_id: GameType) {
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            room.members.remove(&conn);
        }
        self.connections.remove(&conn);
    }

    /// Record liveness for a connection (transport-level pong or message).
    pub fn touch(&self, conn: ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(&conn) {
            entry.last_seen = Instant::now();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_size(&self, game_type: GameType) -> usize {
        self.rooms.get(&game_type).map(|r| r.members.len()).unwrap_or(0)
    }

    /// One liveness pass: emit a heartbeat to everyone and drop connections
    /// that have been silent past the timeout.
    pub async fn heartbeat_pass(&self, timeout: Duration) {
        let now = Instant::now();
        let timestamp_ms = chrono::Utc::now().timestamp_millis() as u64;

        let mut stale = Vec::new();
        for entry in self.connections.iter() {
            if now.duration_since(entry.last_seen) > timeout {
                stale.push(*entry.key());
            } else {
                let _ = entry.sender.send(WireEvent::Heartbeat { timestamp_ms });
            }
        }
        for conn in stale {
            warn!(connection = %conn, "heartbeat timeout, dropping connection");
            self.disconnect(conn).await;
        }
    }
}
