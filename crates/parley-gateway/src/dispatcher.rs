use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use parley_types::events::ServerEvent;

/// Identifies one live socket. A user may hold several.
pub type ConnId = Uuid;

struct ConnectionEntry {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Result of registering a socket.
pub struct Registration {
    pub conn_id: ConnId,
    pub rx: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Tracks live connections and rooms, and fans events out to them.
///
/// Lock order is always `connections` before `rooms`.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Events every connection receives (presence).
    broadcast_tx: broadcast::Sender<ServerEvent>,

    connections: RwLock<HashMap<ConnId, ConnectionEntry>>,

    /// conversation_id -> joined connections
    rooms: RwLock<HashMap<Uuid, HashSet<ConnId>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Send to every connection.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    pub async fn register(&self, user_id: Uuid) -> Registration {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .await
            .insert(conn_id, ConnectionEntry { user_id, tx });
        Registration { conn_id, rx }
    }

    /// Drop a connection from every room. Returns the user it belonged to.
    pub async fn unregister(&self, conn_id: ConnId) -> Option<Uuid> {
        let mut connections = self.inner.connections.write().await;
        let entry = connections.remove(&conn_id)?;

        let mut rooms = self.inner.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });

        Some(entry.user_id)
    }

    pub async fn join(&self, conn_id: ConnId, room: Uuid) {
        self.inner
            .rooms
            .write()
            .await
            .entry(room)
            .or_default()
            .insert(conn_id);
    }

    pub async fn leave(&self, conn_id: ConnId, room: Uuid) {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(members) = rooms.get_mut(&room) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(&room);
            }
        }
    }

    pub async fn in_room(&self, conn_id: ConnId, room: Uuid) -> bool {
        self.inner
            .rooms
            .read()
            .await
            .get(&room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    /// Join every live connection of `user_id` to `room`.
    pub async fn join_user(&self, user_id: Uuid, room: Uuid) {
        let connections = self.inner.connections.read().await;
        let mut rooms = self.inner.rooms.write().await;
        let members = rooms.entry(room).or_default();
        for (conn_id, entry) in connections.iter() {
            if entry.user_id == user_id {
                members.insert(*conn_id);
            }
        }
        if members.is_empty() {
            rooms.remove(&room);
        }
    }

    /// Remove every live connection of `user_id` from `room`.
    pub async fn evict_user(&self, user_id: Uuid, room: Uuid) {
        let connections = self.inner.connections.read().await;
        let mut rooms = self.inner.rooms.write().await;
        if let Some(members) = rooms.get_mut(&room) {
            members.retain(|conn_id| connections.get(conn_id).is_none_or(|c| c.user_id != user_id));
            if members.is_empty() {
                rooms.remove(&room);
            }
        }
    }

    pub async fn drop_room(&self, room: Uuid) {
        self.inner.rooms.write().await.remove(&room);
    }

    /// Deliver to every connection in `room`, optionally skipping one.
    pub async fn send_to_room(&self, room: Uuid, event: ServerEvent, exclude: Option<ConnId>) {
        let connections = self.inner.connections.read().await;
        let rooms = self.inner.rooms.read().await;
        let Some(members) = rooms.get(&room) else {
            return;
        };
        for conn_id in members {
            if Some(*conn_id) == exclude {
                continue;
            }
            if let Some(entry) = connections.get(conn_id) {
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    pub async fn send_to_conn(&self, conn_id: ConnId, event: ServerEvent) {
        if let Some(entry) = self.inner.connections.read().await.get(&conn_id) {
            let _ = entry.tx.send(event);
        }
    }

    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        let connections = self.inner.connections.read().await;
        for entry in connections.values().filter(|c| c.user_id == user_id) {
            let _ = entry.tx.send(event.clone());
        }
    }

    pub async fn rooms_of(&self, conn_id: ConnId) -> Vec<Uuid> {
        let rooms = self.inner.rooms.read().await;
        let mut joined: Vec<Uuid> = rooms
            .iter()
            .filter(|(_, members)| members.contains(&conn_id))
            .map(|(room, _)| *room)
            .collect();
        joined.sort();
        joined
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner
            .connections
            .read()
            .await
            .values()
            .any(|c| c.user_id == user_id)
    }
}
