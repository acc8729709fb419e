use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::codes::generate_room_code;
use crate::config::Config;
use crate::room::{Room, RoomPhase, TeardownReason};

/// Lookup surface for live rooms. Handlers receive this injected rather
/// than reaching for a global, so tests can run against their own store.
pub trait RoomStore: Send + Sync + 'static {
    fn get(&self, code: &str) -> Option<Arc<Room>>;
    fn insert(&self, room: Arc<Room>);
    fn remove(&self, code: &str) -> Option<Arc<Room>>;
    fn contains(&self, code: &str) -> bool;
    fn codes(&self) -> Vec<String>;
    fn len(&self) -> usize;
}

pub type SharedRoomStore = Arc<dyn RoomStore>;

/// In-memory store keyed by room code.
#[derive(Default)]
pub struct MemoryRoomStore {
    rooms: DashMap<String, Arc<Room>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomStore for MemoryRoomStore {
    fn get(&self, code: &str) -> Option<Arc<Room>> {
        self.rooms.get(code).map(|entry| entry.clone())
    }

    fn insert(&self, room: Arc<Room>) {
        self.rooms.insert(room.code().to_string(), room);
    }

    fn remove(&self, code: &str) -> Option<Arc<Room>> {
        self.rooms.remove(code).map(|(_, room)| room)
    }

    fn contains(&self, code: &str) -> bool {
        self.rooms.contains_key(code)
    }

    fn codes(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.rooms.len()
    }
}

/// Draw room codes until one misses the store. The code space is small but
/// the live-room count is tiny next to it, so a couple of draws suffice.
pub fn allocate_room_code(store: &SharedRoomStore) -> String {
    loop {
        let code = generate_room_code();
        if !store.contains(&code) {
            return code;
        }
    }
}

/// One garbage-collection pass: rooms still `Pending` past the TTL never
/// got a data source and are expired. Returns how many were removed.
pub async fn sweep_once(store: &SharedRoomStore, ttl: Duration, close_grace: Duration) -> usize {
    let mut expired = 0;
    for code in store.codes() {
        let Some(room) = store.get(&code) else {
            continue;
        };
        if room.phase().await == RoomPhase::Pending && room.age() > ttl {
            debug!(room = %code, "expiring room with no data source");
            store.remove(&code);
            room.teardown(TeardownReason::Expired, close_grace).await;
            expired += 1;
        }
    }
    expired
}

/// Periodic sweeper task, spawned once at startup.
pub async fn run_sweeper(store: SharedRoomStore, config: Arc<Config>) {
    let ttl = Duration::from_secs(config.pending_room_ttl_seconds);
    let close_grace = Duration::from_millis(config.close_grace_ms);
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.sweep_interval_seconds.max(1)));
    loop {
        interval.tick().await;
        let expired = sweep_once(&store, ttl, close_grace).await;
        if expired > 0 {
            info!(expired, live = store.len(), "swept expired rooms");
        }
    }
}
