//! Room records and the rendezvous store they live in
//!
//! A room carries one offer, one answer and two append-only candidate lists.
//! The initiator writes `offer` and `callerCandidates`, the responder writes
//! `answer` and `calleeCandidates`; nobody writes the other side's fields, so
//! stores need no transactions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::transport::{IceCandidate, SessionDescription};

/// Length of generated room ids (session codes)
pub const ROOM_ID_LEN: usize = 6;

/// Snapshots buffered per subscription before a slow reader starts lagging
const SUBSCRIPTION_CAPACITY: usize = 64;

/// Generate a numeric session code.
pub fn generate_room_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_ID_LEN)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Which side's candidate list a field refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKey {
    Caller,
    Callee,
}

impl CandidateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateKey::Caller => "callerCandidates",
            CandidateKey::Callee => "calleeCandidates",
        }
    }
}

/// Full room record, as every change notification delivers it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub caller_candidates: Vec<IceCandidate>,
    #[serde(default)]
    pub callee_candidates: Vec<IceCandidate>,
}

/// Partial update of a room. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFields {
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub caller_candidates: Option<Vec<IceCandidate>>,
    pub callee_candidates: Option<Vec<IceCandidate>>,
}

impl RoomFields {
    pub fn offer(offer: SessionDescription) -> Self {
        Self {
            offer: Some(offer),
            ..Default::default()
        }
    }

    pub fn answer(answer: SessionDescription) -> Self {
        Self {
            answer: Some(answer),
            ..Default::default()
        }
    }

    pub fn candidates(key: CandidateKey, candidates: Vec<IceCandidate>) -> Self {
        match key {
            CandidateKey::Caller => Self {
                caller_candidates: Some(candidates),
                ..Default::default()
            },
            CandidateKey::Callee => Self {
                callee_candidates: Some(candidates),
                ..Default::default()
            },
        }
    }
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn candidates(&self, key: CandidateKey) -> &[IceCandidate] {
        match key {
            CandidateKey::Caller => &self.caller_candidates,
            CandidateKey::Callee => &self.callee_candidates,
        }
    }

    /// Merge a partial update, enforcing write-once descriptions and
    /// append-only candidate lists.
    pub fn apply(&mut self, fields: RoomFields) -> Result<()> {
        set_once(&mut self.offer, fields.offer, "offer")?;
        set_once(&mut self.answer, fields.answer, "answer")?;
        extend_only(
            &mut self.caller_candidates,
            fields.caller_candidates,
            CandidateKey::Caller,
        )?;
        extend_only(
            &mut self.callee_candidates,
            fields.callee_candidates,
            CandidateKey::Callee,
        )?;
        Ok(())
    }
}

fn set_once(
    slot: &mut Option<SessionDescription>,
    value: Option<SessionDescription>,
    field: &str,
) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    match slot {
        Some(existing) if *existing != value => {
            anyhow::bail!("Room field '{}' is already set", field)
        }
        Some(_) => Ok(()),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}

fn extend_only(
    list: &mut Vec<IceCandidate>,
    value: Option<Vec<IceCandidate>>,
    key: CandidateKey,
) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if value.len() < list.len() || value[..list.len()] != list[..] {
        anyhow::bail!(
            "Room field '{}' can only grow by appending candidates",
            key.as_str()
        );
    }
    *list = value;
    Ok(())
}

/// Live view of one room. Every mutation of the room delivers the full
/// current record, not a diff.
///
/// Dropping the subscription (or calling [`RoomSubscription::unsubscribe`])
/// stops delivery; readers obtained from [`RoomSubscription::updates`] then
/// see the stream end.
pub struct RoomSubscription {
    room_id: String,
    tx: Option<broadcast::Sender<Room>>,
    feeder: Option<JoinHandle<()>>,
}

impl RoomSubscription {
    /// Build a subscription fed by `feeder`, which owns its own clone of `tx`
    /// and pushes snapshots into it until aborted.
    pub fn new(
        room_id: impl Into<String>,
        tx: broadcast::Sender<Room>,
        feeder: JoinHandle<()>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            tx: Some(tx),
            feeder: Some(feeder),
        }
    }

    /// Sender side for building a subscription.
    pub fn channel() -> broadcast::Sender<Room> {
        broadcast::channel(SUBSCRIPTION_CAPACITY).0
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// A new reader of subsequent snapshots.
    pub fn updates(&self) -> broadcast::Receiver<Room> {
        match &self.tx {
            Some(tx) => tx.subscribe(),
            // Closed subscription: hand out a reader that ends immediately
            None => broadcast::channel(1).1,
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        self.tx = None;
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Rendezvous store for room records.
///
/// Implementations only need eventual consistency: the two writers own
/// disjoint fields.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Persist a new room with the given fields; the store assigns the id.
    async fn create(&self, fields: RoomFields) -> Result<Room>;

    /// Fetch a room, `None` if it does not exist.
    async fn get(&self, id: &str) -> Result<Option<Room>>;

    /// Merge `fields` into the room and return the updated record.
    async fn update(&self, id: &str, fields: RoomFields) -> Result<Room>;

    /// Delete a room. Deleting a missing room succeeds.
    async fn destroy(&self, id: &str) -> Result<()>;

    /// Subscribe to changes of one room.
    async fn subscribe(&self, id: &str) -> Result<RoomSubscription>;
}

struct RoomEntry {
    room: Room,
    changes: broadcast::Sender<Room>,
}

/// In-process room store.
#[derive(Default, Clone)]
pub struct MemoryRoomStore {
    rooms: Arc<Mutex<HashMap<String, RoomEntry>>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rooms currently stored.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RoomEntry>> {
        // A poisoned map still holds consistent records; keep serving it
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn create(&self, fields: RoomFields) -> Result<Room> {
        let mut rooms = self.lock();
        let id = loop {
            let id = generate_room_id();
            if !rooms.contains_key(&id) {
                break id;
            }
        };
        let mut room = Room::new(id.clone());
        room.apply(fields)?;
        let (changes, _) = broadcast::channel(SUBSCRIPTION_CAPACITY);
        rooms.insert(
            id,
            RoomEntry {
                room: room.clone(),
                changes,
            },
        );
        Ok(room)
    }

    async fn get(&self, id: &str) -> Result<Option<Room>> {
        Ok(self.lock().get(id).map(|entry| entry.room.clone()))
    }

    async fn update(&self, id: &str, fields: RoomFields) -> Result<Room> {
        let mut rooms = self.lock();
        let entry = rooms
            .get_mut(id)
            .with_context(|| format!("Room {} not found", id))?;
        entry.room.apply(fields)?;
        // No subscribers is fine
        let _ = entry.changes.send(entry.room.clone());
        Ok(entry.room.clone())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        self.lock().remove(id);
        Ok(())
    }

    async fn subscribe(&self, id: &str) -> Result<RoomSubscription> {
        let mut changes = self
            .lock()
            .get(id)
            .map(|entry| entry.changes.subscribe())
            .with_context(|| format!("Room {} not found", id))?;

        let tx = RoomSubscription::channel();
        let feed = tx.clone();
        let feeder = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(room) => {
                        if feed.send(room).is_err() {
                            log::debug!("Room subscription has no readers");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Snapshots are cumulative, the next one covers the gap
                        log::debug!("Room subscription skipped {} snapshots", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(RoomSubscription::new(id, tx, feeder))
    }
}
