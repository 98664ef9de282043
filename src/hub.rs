//! Room-scoped signaling relay
//!
//! The hub groups connections into rooms and forwards every frame a member
//! sends to all other members of the same room. It does not understand
//! negotiation; the only frame it decodes fully is the mandatory `join`.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::model::message::{self, CodecError, Signal};

/// Queue feeding one connection's writer task.
pub type Outbound = mpsc::Sender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl Deref for ConnectionId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("first message must be a room join")]
    JoinRequired,
    #[error("first message must be a room join: {0}")]
    MalformedJoin(#[source] CodecError),
    #[error("connection already joined room '{0}'")]
    AlreadyJoined(String),
    #[error("connection has not joined a room")]
    NotJoined,
    #[error("dropping frame: {0}")]
    Malformed(#[source] CodecError),
    #[error("dropping repeated join")]
    RepeatedJoin,
}

impl RelayError {
    /// Whether the error ends the connection. Only join handshake failures do.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::JoinRequired | RelayError::MalformedJoin(_) | RelayError::AlreadyJoined(_)
        )
    }
}

/// A connection registered with the hub. Dropped by handing it back to
/// [`RelayHub::disconnect`], which consumes it.
///
/// The outbound queue moves into the room table on join, so the room holds the
/// only sender. Evicting a member from its room closes its writer.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    tx: Option<Outbound>,
    room: Option<String>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }
}

/// Outcome of one fan-out. Failed deliveries are counted, never raised.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

/// Room table shared by every connection task.
///
/// Each room's membership lives behind its own map entry, so joins, leaves and
/// fan-out on one room are mutually exclusive while other rooms proceed. No
/// entry guard is ever held across an await.
#[derive(Debug, Clone, Default)]
pub struct RelayHub {
    rooms: Arc<DashMap<String, HashMap<ConnectionId, Outbound>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection in pre-join state.
    pub fn accept(&self, tx: Outbound) -> Connection {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!("Connection({}) accepted", *id);
        Connection {
            id,
            tx: Some(tx),
            room: None,
        }
    }

    /// Handle the mandatory first frame of a connection. On success the
    /// connection becomes a member of the room it named and the room name is
    /// returned. Any error here is fatal for the connection.
    pub fn handle_first_message(
        &self,
        conn: &mut Connection,
        raw: &str,
    ) -> Result<String, RelayError> {
        if let Some(room) = &conn.room {
            return Err(RelayError::AlreadyJoined(room.clone()));
        }

        let room = match message::decode(raw) {
            Ok(Some(Signal::Join { room })) => room,
            Ok(_) => return Err(RelayError::JoinRequired),
            Err(e) => return Err(RelayError::MalformedJoin(e)),
        };
        let tx = conn.tx.take().ok_or(RelayError::JoinRequired)?;

        let mut members = self.rooms.entry(room.clone()).or_default();
        members.insert(conn.id, tx);
        let size = members.len();
        drop(members);

        info!(
            "Connection({}) joined room '{}' (size={})",
            *conn.id, room, size
        );
        conn.room = Some(room.clone());
        Ok(room)
    }

    /// Forward `raw` verbatim to every other member of the sender's room.
    ///
    /// Delivery is a non-blocking push onto each recipient's queue. A full or
    /// closed queue counts as a failed delivery for that recipient only. A
    /// recipient whose queue is full has stalled: it is evicted from the room,
    /// which closes its queue so its writer ends the connection instead of
    /// carrying on with a gap in its stream.
    pub fn broadcast(&self, conn: &Connection, raw: &str) -> Result<FanOut, RelayError> {
        let room = conn.room.as_deref().ok_or(RelayError::NotJoined)?;

        let kind = message::message_type(raw).map_err(RelayError::Malformed)?;
        if kind == "join" {
            return Err(RelayError::RepeatedJoin);
        }

        let mut fan_out = FanOut::default();
        let Some(mut members) = self.rooms.get_mut(room) else {
            return Ok(fan_out);
        };

        let mut stalled = Vec::new();
        for (id, tx) in members.iter() {
            if *id == conn.id {
                continue;
            }

            match tx.try_send(raw.to_owned()) {
                Ok(()) => fan_out.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Connection({}) queue full on '{}' frame from Connection({}), evicting",
                        **id, kind, *conn.id
                    );
                    stalled.push(*id);
                    fan_out.failed += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Connection({}) is closing, skipping delivery", **id);
                    fan_out.failed += 1;
                }
            }
        }
        for id in &stalled {
            members.remove(id);
        }
        drop(members);

        debug!(
            "Relayed '{}' from Connection({}) in room '{}': {:?}",
            kind, *conn.id, room, fan_out
        );
        Ok(fan_out)
    }

    /// Remove a connection from its room, deleting the room when it empties.
    /// Consumes the connection so it can only happen once.
    pub fn disconnect(&self, conn: Connection) {
        let Connection { id, room, .. } = conn;
        let Some(room) = room else {
            debug!("Connection({}) closed before joining", *id);
            return;
        };

        if let Entry::Occupied(mut entry) = self.rooms.entry(room) {
            entry.get_mut().remove(&id);
            let remaining = entry.get().len();
            if remaining == 0 {
                let (room, _) = entry.remove_entry();
                info!("Room '{}' is now empty and closed", room);
            } else {
                info!(
                    "Connection({}) left room '{}' (size={})",
                    *id,
                    entry.key(),
                    remaining
                );
            }
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn contains_room(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|members| members.len()).unwrap_or(0)
    }

    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .rooms
            .get(room)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    fn join(hub: &RelayHub, room: &str) -> (Connection, Receiver<String>) {
        join_with_capacity(hub, room, 16)
    }

    fn join_with_capacity(
        hub: &RelayHub,
        room: &str,
        capacity: usize,
    ) -> (Connection, Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let mut conn = hub.accept(tx);
        let frame = format!(r#"{{"type":"join","room":"{room}"}}"#);
        hub.handle_first_message(&mut conn, &frame).unwrap();
        (conn, rx)
    }

    const OFFER: &str = r#"{"type":"offer","sdp":"v=0","sdpType":"offer"}"#;

    #[test]
    fn first_message_must_be_join() {
        let hub = RelayHub::new();
        let (tx, _rx) = mpsc::channel(1);
        let mut conn = hub.accept(tx);

        let err = hub.handle_first_message(&mut conn, OFFER).unwrap_err();
        assert!(matches!(err, RelayError::JoinRequired));
        assert!(err.is_fatal());

        let err = hub.handle_first_message(&mut conn, "{").unwrap_err();
        assert!(matches!(err, RelayError::MalformedJoin(_)));
        assert_eq!(hub.room_count(), 0);
        assert_eq!(conn.room(), None);
    }

    #[test]
    fn unknown_first_message_is_not_a_join() {
        let hub = RelayHub::new();
        let (tx, _rx) = mpsc::channel(1);
        let mut conn = hub.accept(tx);
        let err = hub
            .handle_first_message(&mut conn, r#"{"type":"hello"}"#)
            .unwrap_err();
        assert!(matches!(err, RelayError::JoinRequired));
    }

    #[test]
    fn broadcast_skips_sender_and_other_rooms() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = join(&hub, "r1");
        let (_b, mut b_rx) = join(&hub, "r1");
        let (_c, mut c_rx) = join(&hub, "r2");

        let fan_out = hub.broadcast(&a, OFFER).unwrap();
        assert_eq!(
            fan_out,
            FanOut {
                delivered: 1,
                failed: 0
            }
        );

        assert_eq!(b_rx.try_recv().unwrap(), OFFER);
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[test]
    fn frames_are_forwarded_verbatim_in_order() {
        let hub = RelayHub::new();
        let (a, _a_rx) = join(&hub, "r1");
        let (_b, mut b_rx) = join(&hub, "r1");

        let first = r#"{"type":"candidate",  "candidate":"c1","sdpMid":"0","sdpMLineIndex":0}"#;
        let second = r#"{"type":"future-kind","data":[1,2]}"#;
        hub.broadcast(&a, first).unwrap();
        hub.broadcast(&a, second).unwrap();

        assert_eq!(b_rx.try_recv().unwrap(), first);
        assert_eq!(b_rx.try_recv().unwrap(), second);
    }

    #[test]
    fn malformed_and_repeated_join_frames_are_dropped() {
        let hub = RelayHub::new();
        let (a, _a_rx) = join(&hub, "r1");
        let (_b, mut b_rx) = join(&hub, "r1");

        let err = hub.broadcast(&a, "not json").unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
        assert!(!err.is_fatal());

        let err = hub
            .broadcast(&a, r#"{"type":"join","room":"r2"}"#)
            .unwrap_err();
        assert!(matches!(err, RelayError::RepeatedJoin));

        assert!(b_rx.try_recv().is_err());
        assert_eq!(a.room(), Some("r1"));
    }

    #[test]
    fn full_recipient_does_not_block_the_others() {
        let hub = RelayHub::new();
        let (a, _a_rx) = join(&hub, "r1");
        let (_slow, _slow_rx) = join_with_capacity(&hub, "r1", 1);
        let (_fast, mut fast_rx) = join(&hub, "r1");

        assert_eq!(hub.broadcast(&a, OFFER).unwrap().delivered, 2);
        let fan_out = hub.broadcast(&a, OFFER).unwrap();
        assert_eq!(
            fan_out,
            FanOut {
                delivered: 1,
                failed: 1
            }
        );

        assert_eq!(hub.room_size("r1"), 2);
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn stalled_recipient_is_evicted_and_its_queue_closed() {
        let hub = RelayHub::new();
        let (a, _a_rx) = join(&hub, "r1");
        let (slow, mut slow_rx) = join_with_capacity(&hub, "r1", 1);
        let (_fast, _fast_rx) = join(&hub, "r1");

        hub.broadcast(&a, OFFER).unwrap();
        hub.broadcast(&a, OFFER).unwrap();
        assert_eq!(hub.room_size("r1"), 2);
        assert!(!hub.members("r1").contains(&slow.id()));

        // Later frames no longer count the evicted member.
        let fan_out = hub.broadcast(&a, OFFER).unwrap();
        assert_eq!(
            fan_out,
            FanOut {
                delivered: 1,
                failed: 0
            }
        );

        // What was queued before the stall still drains, then the queue ends.
        assert_eq!(slow_rx.try_recv().unwrap(), OFFER);
        assert!(matches!(
            slow_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // The owning task still hands the connection back exactly once.
        hub.disconnect(slow);
        assert_eq!(hub.room_size("r1"), 2);
    }

    #[test]
    fn closed_recipient_is_skipped() {
        let hub = RelayHub::new();
        let (a, _a_rx) = join(&hub, "r1");
        let (_b, b_rx) = join(&hub, "r1");
        drop(b_rx);

        let fan_out = hub.broadcast(&a, OFFER).unwrap();
        assert_eq!(fan_out.failed, 1);
        assert_eq!(fan_out.delivered, 0);
    }

    #[test]
    fn last_member_leaving_deletes_the_room() {
        let hub = RelayHub::new();
        let (a, _a_rx) = join(&hub, "r1");
        let (b, _b_rx) = join(&hub, "r1");
        assert_eq!(hub.room_size("r1"), 2);

        hub.disconnect(a);
        assert_eq!(hub.room_size("r1"), 1);
        hub.disconnect(b);
        assert!(!hub.contains_room("r1"));
        assert_eq!(hub.room_count(), 0);

        let (c, _c_rx) = join(&hub, "r1");
        assert_eq!(hub.members("r1"), vec![c.id()]);
    }

    #[test]
    fn disconnect_before_join_is_a_no_op() {
        let hub = RelayHub::new();
        let (_a, _a_rx) = join(&hub, "r1");
        let (tx, _rx) = mpsc::channel(1);
        let pending = hub.accept(tx);
        hub.disconnect(pending);
        assert_eq!(hub.room_size("r1"), 1);
    }

    #[test]
    fn second_join_on_the_same_connection_is_refused() {
        let hub = RelayHub::new();
        let (mut a, _a_rx) = join(&hub, "r1");
        let err = hub
            .handle_first_message(&mut a, r#"{"type":"join","room":"r2"}"#)
            .unwrap_err();
        assert!(matches!(err, RelayError::AlreadyJoined(room) if room == "r1"));
        assert!(!hub.contains_room("r2"));
    }
}
