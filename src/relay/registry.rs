//! Room registry: which connections are in which room.
//!
//! Every read and write of room membership goes through one mutex, including
//! the member walk done by [`RoomRegistry::broadcast`]. Delivery only does a
//! `try_send` onto each peer's bounded queue, so the lock is never held across
//! an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::types::{ConnectionId, OutboundMessage, Peer, RelayError, RoomId};

/// Members of one room. Emptied rooms are kept around.
#[derive(Debug, Default)]
struct Room {
    peers: Vec<Peer>,
}

#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<RoomId, Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RoomId, Room>> {
        // membership stays consistent even if a holder panicked; no operation
        // leaves a half-updated room behind
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// true if the room has ever been entered, even if it is empty now
    pub fn exists(&self, room: &RoomId) -> bool {
        self.lock().contains_key(room)
    }

    /// Number of connections currently in `room`, 0 for unknown rooms
    pub fn client_count(&self, room: &RoomId) -> usize {
        self.lock().get(room).map_or(0, |r| r.peers.len())
    }

    /// Number of room entries, empty ones included
    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    /// Add a connection to a room, creating the room on first use.
    ///
    /// Callers register each connection once; duplicates are not filtered.
    pub fn register(&self, room: &RoomId, peer: Peer) {
        let mut rooms = self.lock();
        let entry = rooms.entry(room.clone()).or_insert_with(|| {
            info!("Room created: {}", room);
            Room::default()
        });
        info!("{} registered in room {}", peer.id, room);
        entry.peers.push(peer);
    }

    /// Remove a connection from a room. The room entry itself is kept.
    pub fn unregister(&self, room: &RoomId, id: ConnectionId) {
        let mut rooms = self.lock();
        if let Some(entry) = rooms.get_mut(room) {
            let before = entry.peers.len();
            entry.peers.retain(|p| p.id != id);
            if entry.peers.len() != before {
                info!("{} left room {} ({} remaining)", id, room, entry.peers.len());
            }
        }
    }

    /// Hand `msg` to every member of `room` except `sender`.
    ///
    /// A member whose queue is closed or full is dropped from the room; the
    /// rest still get the message. Returns how many members it was handed to.
    pub fn broadcast(
        &self,
        room: &RoomId,
        sender: ConnectionId,
        msg: &OutboundMessage,
    ) -> usize {
        let mut rooms = self.lock();
        let Some(entry) = rooms.get_mut(room) else {
            return 0;
        };

        let mut delivered = 0;
        entry.peers.retain(|peer| {
            if peer.id == sender {
                return true;
            }
            match peer.tx.try_send(msg.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) => {
                    let reason = match e {
                        TrySendError::Full(_) => "queue full",
                        TrySendError::Closed(_) => "connection gone",
                    };
                    warn!(
                        "{} ({}), removing it from room {}",
                        RelayError::DeliveryFailed(peer.id),
                        reason,
                        room
                    );
                    false
                }
            }
        });

        debug!(
            "Relayed {} bytes from {} to {} peer(s) in {}",
            msg.len(),
            sender,
            delivered,
            room
        );
        delivered
    }

    #[cfg(test)]
    fn is_member(&self, room: &RoomId, id: ConnectionId) -> bool {
        self.lock()
            .get(room)
            .is_some_and(|r| r.peers.iter().any(|p| p.id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn room(s: &str) -> RoomId {
        RoomId::parse(s).unwrap()
    }

    fn peer() -> (Peer, mpsc::Receiver<OutboundMessage>) {
        peer_with_capacity(16)
    }

    fn peer_with_capacity(capacity: usize) -> (Peer, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Peer::new(ConnectionId::next(), tx), rx)
    }

    #[test]
    fn unknown_room_is_absent_and_empty() {
        let registry = RoomRegistry::new();
        assert!(!registry.exists(&room("never-seen")));
        assert_eq!(registry.client_count(&room("never-seen")), 0);
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn register_creates_room() {
        let registry = RoomRegistry::new();
        let (a, _rx) = peer();
        let id = a.id;

        registry.register(&room("abc"), a);

        assert!(registry.exists(&room("abc")));
        assert_eq!(registry.client_count(&room("abc")), 1);
        assert!(registry.is_member(&room("abc"), id));
    }

    #[test]
    fn unregister_keeps_empty_room() {
        let registry = RoomRegistry::new();
        let (a, _rx) = peer();
        let id = a.id;

        registry.register(&room("abc"), a);
        registry.unregister(&room("abc"), id);

        assert!(!registry.is_member(&room("abc"), id));
        assert!(registry.exists(&room("abc")));
        assert_eq!(registry.client_count(&room("abc")), 0);
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let registry = RoomRegistry::new();
        let (a, _rx) = peer();
        let id = a.id;
        registry.register(&room("abc"), a);

        registry.unregister(&room("nope"), id);
        registry.unregister(&room("abc"), ConnectionId::next());

        assert!(!registry.exists(&room("nope")));
        assert_eq!(registry.client_count(&room("abc")), 1);
    }

    #[test]
    fn broadcast_skips_sender_and_other_rooms() {
        let registry = RoomRegistry::new();
        let (a, mut rx_a) = peer();
        let (b, mut rx_b) = peer();
        let (c, mut rx_c) = peer();
        let sender = a.id;

        registry.register(&room("abc"), a);
        registry.register(&room("abc"), b);
        registry.register(&room("xyz"), c);

        let delivered = registry.broadcast(&room("abc"), sender, &OutboundMessage::from("X"));

        assert_eq!(delivered, 1);
        assert_eq!(rx_b.try_recv().unwrap(), OutboundMessage::from("X"));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn broadcast_to_unknown_room_is_noop() {
        let registry = RoomRegistry::new();
        let msg = OutboundMessage::from("X");
        let delivered = registry.broadcast(&room("nope"), ConnectionId::next(), &msg);
        assert_eq!(delivered, 0);
        assert!(!registry.exists(&room("nope")));
    }

    #[test]
    fn failed_delivery_removes_only_that_peer() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = peer();
        let (b, rx_b) = peer();
        let (c, mut rx_c) = peer();
        let (sender, gone) = (a.id, b.id);

        registry.register(&room("abc"), a);
        registry.register(&room("abc"), b);
        registry.register(&room("abc"), c);

        // b's writer is gone
        drop(rx_b);

        let delivered = registry.broadcast(&room("abc"), sender, &OutboundMessage::from("first"));
        assert_eq!(delivered, 1);
        assert_eq!(rx_c.try_recv().unwrap(), OutboundMessage::from("first"));
        assert!(!registry.is_member(&room("abc"), gone));
        assert_eq!(registry.client_count(&room("abc")), 2);

        let delivered = registry.broadcast(&room("abc"), sender, &OutboundMessage::from("second"));
        assert_eq!(delivered, 1);
        assert_eq!(rx_c.try_recv().unwrap(), OutboundMessage::from("second"));
    }

    #[test]
    fn stalled_peer_is_dropped_when_its_queue_fills() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = peer();
        let (b, mut rx_b) = peer_with_capacity(2);
        let (c, mut rx_c) = peer();
        let (sender, stalled) = (a.id, b.id);

        registry.register(&room("abc"), a);
        registry.register(&room("abc"), b);
        registry.register(&room("abc"), c);

        // b never drains its queue
        for i in 0..2 {
            let msg = OutboundMessage::from(i.to_string());
            assert_eq!(registry.broadcast(&room("abc"), sender, &msg), 2);
        }
        assert!(registry.is_member(&room("abc"), stalled));

        let msg = OutboundMessage::from("overflow");
        assert_eq!(registry.broadcast(&room("abc"), sender, &msg), 1);
        assert!(!registry.is_member(&room("abc"), stalled));
        assert_eq!(registry.client_count(&room("abc")), 2);

        for _ in 0..1000 {
            registry.broadcast(&room("abc"), sender, &OutboundMessage::from("spam"));
        }

        // nothing more is queued for b, and its queue is closed
        assert_eq!(rx_b.try_recv().unwrap(), OutboundMessage::from("0"));
        assert_eq!(rx_b.try_recv().unwrap(), OutboundMessage::from("1"));
        assert!(rx_b.try_recv().is_err());
        assert!(rx_b.is_closed());

        assert_eq!(rx_c.try_recv().unwrap(), OutboundMessage::from("0"));
        assert_eq!(rx_c.try_recv().unwrap(), OutboundMessage::from("1"));
        assert_eq!(rx_c.try_recv().unwrap(), OutboundMessage::from("overflow"));
    }

    #[test]
    fn dropped_peer_is_told_it_was_evicted() {
        let registry = RoomRegistry::new();
        let (a, _rx_a) = peer();
        let (tx, _rx_b) = mpsc::channel(1);
        let (b, mut evicted) = Peer::watched(ConnectionId::next(), tx);
        let sender = a.id;

        registry.register(&room("abc"), a);
        registry.register(&room("abc"), b);

        registry.broadcast(&room("abc"), sender, &OutboundMessage::from("fits"));
        assert!(evicted.try_recv().is_err());
        assert_eq!(registry.client_count(&room("abc")), 2);

        registry.broadcast(&room("abc"), sender, &OutboundMessage::from("overflows"));
        assert_eq!(registry.client_count(&room("abc")), 1);
        assert!(matches!(
            evicted.try_recv(),
            Err(tokio::sync::oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn clones_share_membership() {
        let registry = RoomRegistry::new();
        let other = registry.clone();
        let (a, _rx) = peer();

        other.register(&room("abc"), a);

        assert_eq!(registry.client_count(&room("abc")), 1);
    }

    #[test]
    fn concurrent_registration_is_serialized() {
        let registry = RoomRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut receivers = Vec::new();
                    for _ in 0..50 {
                        let (p, rx) = peer();
                        registry.register(&room("busy"), p);
                        receivers.push(rx);
                    }
                    receivers
                })
            })
            .collect();

        let receivers: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();

        assert_eq!(receivers.len(), 400);
        assert_eq!(registry.client_count(&room("busy")), 400);
    }
}
