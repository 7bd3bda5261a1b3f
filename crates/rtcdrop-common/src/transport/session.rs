//! Transport session: one side's peer connection, data channel and room
//! subscription, plus the trickle-ICE candidate exchange through the room.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{TransportConfig, EVENT_QUEUE_CAPACITY};
use crate::signaling::room::{CandidateKey, Room, RoomFields, RoomStore, RoomSubscription};
use crate::transport::{
    ChannelHandle, DataChannel, IceCandidate, PeerConnection, PeerEvent, PeerTransport,
};

/// How often held-back remote candidates are retried
const CANDIDATE_RETRY: Duration = Duration::from_millis(50);

/// Remote candidates already handed to the transport.
///
/// The room is observed as a growing snapshot on every change, so the same
/// candidate shows up again and again; it is keyed by content because each
/// snapshot is freshly deserialized.
#[derive(Debug, Default)]
pub struct CandidateTracker {
    seen: HashSet<IceCandidate>,
}

impl CandidateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates of `snapshot` not returned by an earlier call, in order.
    pub fn unseen(&mut self, snapshot: &[IceCandidate]) -> Vec<IceCandidate> {
        snapshot
            .iter()
            .filter(|candidate| self.seen.insert((*candidate).clone()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Owns one peer connection for the lifetime of a sender or receiver session.
pub struct TransportSession {
    transport: Arc<dyn PeerTransport>,
    config: TransportConfig,
    connection: Option<Arc<dyn PeerConnection>>,
    channel: Arc<Mutex<Option<Arc<dyn DataChannel>>>>,
    subscription: Option<RoomSubscription>,
    local_candidates: Option<mpsc::Receiver<IceCandidate>>,
    incoming_channels: Option<mpsc::Receiver<ChannelHandle>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportSession {
    pub fn new(transport: Arc<dyn PeerTransport>, config: TransportConfig) -> Self {
        Self {
            transport,
            config,
            connection: None,
            channel: Arc::new(Mutex::new(None)),
            subscription: None,
            local_candidates: None,
            incoming_channels: None,
            tasks: Vec::new(),
        }
    }

    /// Create the peer connection and start routing its events.
    ///
    /// Opening twice without closing in between is an error.
    pub async fn open(&mut self) -> Result<Arc<dyn PeerConnection>> {
        if self.connection.is_some() {
            anyhow::bail!("Transport session is already open");
        }

        let (connection, peer_events) = self
            .transport
            .connect(&self.config)
            .await
            .context("Failed to create peer connection")?;

        let (candidate_tx, candidate_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (channel_tx, channel_rx) = mpsc::channel(1);
        self.tasks.push(tokio::spawn(route_peer_events(
            peer_events,
            candidate_tx,
            channel_tx,
            self.channel.clone(),
        )));

        self.local_candidates = Some(candidate_rx);
        self.incoming_channels = Some(channel_rx);
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// Create the outbound data channel (initiator side).
    pub async fn create_channel(&mut self, label: &str) -> Result<ChannelHandle> {
        let connection = self.connection.clone().context("Transport session is not open")?;
        let handle = connection.create_data_channel(label).await?;
        log::info!("Created data channel: {}", label);
        *lock(&self.channel) = Some(handle.channel.clone());
        Ok(handle)
    }

    /// Take the queue on which the remote side's data channel arrives
    /// (responder side).
    pub fn take_incoming_channel(&mut self) -> Option<mpsc::Receiver<ChannelHandle>> {
        self.incoming_channels.take()
    }

    /// Hold a room subscription for the lifetime of the session.
    pub fn attach_subscription(&mut self, subscription: RoomSubscription) {
        log::debug!("Watching room {}", subscription.room_id());
        if let Some(mut previous) = self.subscription.replace(subscription) {
            previous.unsubscribe();
        }
    }

    /// A new reader of room snapshots, if subscribed.
    pub fn room_updates(&self) -> Option<broadcast::Receiver<Room>> {
        self.subscription.as_ref().map(RoomSubscription::updates)
    }

    /// Run the two-way candidate exchange for the rest of the session.
    ///
    /// Local candidates are appended to `local_key` of the room; every room
    /// snapshot is scanned for `remote_key` candidates not applied yet.
    /// `room` seeds the remote side with what was already stored when the
    /// subscription started.
    pub fn exchange_candidates(
        &mut self,
        store: Arc<dyn RoomStore>,
        room: &Room,
        local_key: CandidateKey,
        remote_key: CandidateKey,
    ) -> Result<()> {
        log::info!("Collecting ICE candidates as {}", local_key.as_str());
        let connection = self.connection.clone().context("Transport session is not open")?;
        let updates = self
            .room_updates()
            .context("Room subscription required for candidate exchange")?;
        let local_candidates = self
            .local_candidates
            .take()
            .context("Candidate exchange already running")?;

        self.tasks.push(tokio::spawn(publish_local_candidates(
            store,
            room.id.clone(),
            room.candidates(local_key).to_vec(),
            local_key,
            local_candidates,
        )));
        self.tasks.push(tokio::spawn(apply_remote_candidates(
            connection,
            room.candidates(remote_key).to_vec(),
            remote_key,
            updates,
        )));
        Ok(())
    }

    /// Tie a task to the session so [`TransportSession::close`] stops it.
    pub fn spawn_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.connection.clone()
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        lock(&self.channel).clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Whether a connection exists and has not been closed.
    pub fn is_open(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| !connection.is_closed())
    }

    /// Stop all listeners, close the connection and drop the subscription.
    /// Calling it again is a no-op.
    pub async fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                log::warn!("Failed to close peer connection: {:#}", e);
            }
        }
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        *lock(&self.channel) = None;
        self.local_candidates = None;
        self.incoming_channels = None;
    }
}

fn lock<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Log state changes and fan candidates and incoming channels out to their
/// consumers.
async fn route_peer_events(
    mut events: mpsc::Receiver<PeerEvent>,
    candidates: mpsc::Sender<IceCandidate>,
    channels: mpsc::Sender<ChannelHandle>,
    channel_slot: Arc<Mutex<Option<Arc<dyn DataChannel>>>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::StateChanged(change) => log::info!("{}", change),
            PeerEvent::IceCandidate(candidate) => {
                log::debug!("Local ICE candidate: {}", candidate.candidate);
                if candidates.send(candidate).await.is_err() {
                    log::debug!("Candidate exchange stopped, dropping local candidate");
                }
            }
            PeerEvent::DataChannel(handle) => {
                log::info!("Remote data channel arrived: {}", handle.channel.label());
                *lock(&channel_slot) = Some(handle.channel.clone());
                if channels.send(handle).await.is_err() {
                    log::warn!("Failed to forward data channel - receiver dropped");
                }
            }
        }
    }
}

/// Append every local candidate to our list in the room. This side is the
/// only writer of `key`, so a full-list write per candidate is safe.
async fn publish_local_candidates(
    store: Arc<dyn RoomStore>,
    room_id: String,
    mut published: Vec<IceCandidate>,
    key: CandidateKey,
    mut candidates: mpsc::Receiver<IceCandidate>,
) {
    while let Some(candidate) = candidates.recv().await {
        published.push(candidate);
        if let Err(e) = store
            .update(&room_id, RoomFields::candidates(key, published.clone()))
            .await
        {
            log::warn!("Failed to publish ICE candidate to room {}: {:#}", room_id, e);
        }
    }
}

/// Feed remote candidates into the connection as they appear in room snapshots.
///
/// Transports reject candidates until the remote description is set, so
/// candidates seen earlier are held back and retried.
async fn apply_remote_candidates(
    connection: Arc<dyn PeerConnection>,
    seed: Vec<IceCandidate>,
    key: CandidateKey,
    mut updates: broadcast::Receiver<Room>,
) {
    let mut tracker = CandidateTracker::new();
    let mut pending = tracker.unseen(&seed);

    loop {
        if !pending.is_empty() && connection.has_remote_description().await {
            add_candidates(connection.as_ref(), std::mem::take(&mut pending)).await;
        }

        tokio::select! {
            update = updates.recv() => match update {
                Ok(room) => pending.extend(tracker.unseen(room.candidates(key))),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Skipped {} room snapshots", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(CANDIDATE_RETRY), if !pending.is_empty() => {}
        }
    }
}

async fn add_candidates(connection: &dyn PeerConnection, candidates: Vec<IceCandidate>) {
    for candidate in candidates {
        log::debug!("Remote ICE candidate: {}", candidate.candidate);
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            log::warn!("Failed to add remote ICE candidate: {:#}", e);
        }
    }
}
