//! Offer/answer handshake through a room
//!
//! Initiator: open connection and channel, create the offer, create the
//! room with it, start the candidate exchange, apply the offer locally,
//! then wait for the answer to show up in a room snapshot.
//!
//! Responder: look the room up by code, subscribe, open the connection,
//! start the candidate exchange, apply the offer remotely, create and apply
//! the answer, then write it into the room.

use anyhow::anyhow;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::TransferError;
use crate::signaling::room::{CandidateKey, Room, RoomFields, RoomStore};
use crate::transport::{ChannelHandle, PeerConnection, SessionDescription, TransportSession};

/// Progress of one side through the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    // Initiator
    CreatingOffer,
    AwaitingAnswer,
    // Responder
    LookingUpRoom,
    SettingRemote,
    CreatingAnswer,
    /// The data channel opened
    Connected,
    Failed,
    Closed,
}

impl SignalingState {
    /// Whether `next` is a legal successor of this state.
    ///
    /// `Failed` and `Closed` are reachable from anywhere; a finished
    /// handshake may start over.
    pub fn can_advance_to(self, next: SignalingState) -> bool {
        use SignalingState::*;
        match (self, next) {
            (_, Failed) | (_, Closed) => true,
            (Idle | Failed | Closed, CreatingOffer | LookingUpRoom) => true,
            (CreatingOffer, AwaitingAnswer) => true,
            (AwaitingAnswer, Connected) => true,
            (LookingUpRoom, SettingRemote) => true,
            (SettingRemote, CreatingAnswer) => true,
            (CreatingAnswer, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Idle => "idle",
            SignalingState::CreatingOffer => "creating offer",
            SignalingState::AwaitingAnswer => "awaiting answer",
            SignalingState::LookingUpRoom => "looking up room",
            SignalingState::SettingRemote => "setting remote description",
            SignalingState::CreatingAnswer => "creating answer",
            SignalingState::Connected => "connected",
            SignalingState::Failed => "failed",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared view of a [`SignalingState`]; the endpoint driver task holds a
/// clone to report the channel opening.
#[derive(Debug, Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<SignalingState>>,
}

impl StateHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(SignalingState::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> SignalingState {
        *self.tx.borrow()
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn advance(&self, next: SignalingState) -> bool {
        let current = self.get();
        if current == next {
            return true;
        }
        if !current.can_advance_to(next) {
            log::warn!("Ignoring signaling transition {} -> {}", current, next);
            return false;
        }
        log::debug!("Signaling: {} -> {}", current, next);
        self.tx.send_replace(next);
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<SignalingState> {
        self.tx.subscribe()
    }
}

/// What the initiator hands to its transfer driver.
#[derive(Debug)]
pub struct Initiated {
    pub code: String,
    pub channel: ChannelHandle,
    /// Resolves if the answer later found in the room cannot be applied
    pub failures: oneshot::Receiver<TransferError>,
}

/// What the responder hands to its transfer driver.
#[derive(Debug)]
pub struct Joined {
    /// The initiator's data channel arrives here once the connection is up
    pub channels: mpsc::Receiver<ChannelHandle>,
}

/// The answer to apply from a room snapshot, if any.
///
/// Applied only while the connection has no remote description; snapshots
/// arriving after the answer was applied carry the same answer again.
pub fn answer_to_apply(room: &Room, has_remote_description: bool) -> Option<SessionDescription> {
    if has_remote_description {
        return None;
    }
    room.answer.clone()
}

/// One side of the room handshake.
pub struct SignalingExchange {
    store: Arc<dyn RoomStore>,
    state: StateHandle,
    session_code: Option<String>,
}

impl SignalingExchange {
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self {
            store,
            state: StateHandle::new(),
            session_code: None,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state.get()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Code of the room this side created, if any.
    pub fn session_code(&self) -> Option<&str> {
        self.session_code.as_deref()
    }

    /// Run the initiator half. On error the session may hold a partially
    /// built connection; the caller decides when to close it.
    pub async fn initiate(
        &mut self,
        session: &mut TransportSession,
        label: &str,
    ) -> Result<Initiated, TransferError> {
        self.state.advance(SignalingState::CreatingOffer);
        let result = self.try_initiate(session, label).await;
        match &result {
            Ok(initiated) => {
                log::info!("Session created: {}", initiated.code);
                self.state.advance(SignalingState::AwaitingAnswer);
            }
            Err(e) => {
                log::error!("Failed to create session: {}", e);
                self.state.advance(SignalingState::Failed);
            }
        }
        result
    }

    async fn try_initiate(
        &mut self,
        session: &mut TransportSession,
        label: &str,
    ) -> Result<Initiated, TransferError> {
        let connection = session.open().await.map_err(TransferError::Negotiation)?;
        let channel = session
            .create_channel(label)
            .await
            .map_err(TransferError::Negotiation)?;
        let offer = connection
            .create_offer()
            .await
            .map_err(TransferError::Negotiation)?;
        log::debug!("Created offer");

        let room = self
            .store
            .create(RoomFields::offer(offer.clone()))
            .await
            .map_err(TransferError::Store)?;
        self.session_code = Some(room.id.clone());

        let subscription = self
            .store
            .subscribe(&room.id)
            .await
            .map_err(TransferError::Store)?;
        let answers = subscription.updates();
        session.attach_subscription(subscription);
        session
            .exchange_candidates(
                self.store.clone(),
                &room,
                CandidateKey::Caller,
                CandidateKey::Callee,
            )
            .map_err(TransferError::Negotiation)?;

        connection
            .set_local_description(offer)
            .await
            .map_err(TransferError::Negotiation)?;

        let (failure_tx, failures) = oneshot::channel();
        session.spawn_task(tokio::spawn(watch_for_answer(
            connection, answers, failure_tx,
        )));

        Ok(Initiated {
            code: room.id,
            channel,
            failures,
        })
    }

    /// Run the responder half against the room named `code`.
    ///
    /// A code that does not resolve to a room with an offer fails with
    /// [`TransferError::RoomNotFound`] before any connection or subscription
    /// is set up. Any later failure closes the session.
    pub async fn join(
        &mut self,
        code: &str,
        session: &mut TransportSession,
    ) -> Result<Joined, TransferError> {
        self.state.advance(SignalingState::LookingUpRoom);
        let room = match self.store.get(code).await {
            Ok(Some(room)) if room.offer.is_some() => room,
            Ok(_) => {
                log::error!("No session found for code {}", code);
                self.state.advance(SignalingState::Failed);
                return Err(TransferError::RoomNotFound(code.to_string()));
            }
            Err(e) => {
                self.state.advance(SignalingState::Failed);
                return Err(TransferError::Store(e));
            }
        };
        log::info!("Found session {}", code);

        match self.try_join(&room, session).await {
            Ok(joined) => Ok(joined),
            Err(e) => {
                log::error!("Failed to join session {}: {}", code, e);
                session.close().await;
                self.state.advance(SignalingState::Failed);
                Err(e)
            }
        }
    }

    async fn try_join(
        &mut self,
        room: &Room,
        session: &mut TransportSession,
    ) -> Result<Joined, TransferError> {
        let offer = room
            .offer
            .clone()
            .ok_or_else(|| TransferError::RoomNotFound(room.id.clone()))?;

        let subscription = self
            .store
            .subscribe(&room.id)
            .await
            .map_err(TransferError::Store)?;
        session.attach_subscription(subscription);
        // Candidates written between the lookup and the subscription only
        // show up in a fresh read
        let seed = match self.store.get(&room.id).await {
            Ok(Some(latest)) => latest,
            Ok(None) => room.clone(),
            Err(e) => return Err(TransferError::Store(e)),
        };
        let connection = session.open().await.map_err(TransferError::Negotiation)?;
        let channels = session
            .take_incoming_channel()
            .ok_or_else(|| TransferError::Negotiation(anyhow!("Incoming channel already taken")))?;
        session
            .exchange_candidates(
                self.store.clone(),
                &seed,
                CandidateKey::Callee,
                CandidateKey::Caller,
            )
            .map_err(TransferError::Negotiation)?;

        self.state.advance(SignalingState::SettingRemote);
        connection
            .set_remote_description(offer)
            .await
            .map_err(TransferError::Negotiation)?;

        self.state.advance(SignalingState::CreatingAnswer);
        let answer = connection
            .create_answer()
            .await
            .map_err(TransferError::Negotiation)?;
        connection
            .set_local_description(answer.clone())
            .await
            .map_err(TransferError::Negotiation)?;
        self.store
            .update(&room.id, RoomFields::answer(answer))
            .await
            .map_err(TransferError::Store)?;
        log::debug!("Answer written to room {}", room.id);

        Ok(Joined { channels })
    }

    /// Destroy the room this side created, if any. Errors are logged only.
    pub async fn hang_up(&mut self) {
        if let Some(code) = self.session_code.take() {
            match self.store.destroy(&code).await {
                Ok(()) => log::debug!("Deleted room {}", code),
                Err(e) => log::warn!("Failed to delete room {}: {:#}", code, e),
            }
        }
        self.state.advance(SignalingState::Closed);
    }
}

/// Apply the first answer that shows up in a room snapshot.
async fn watch_for_answer(
    connection: Arc<dyn PeerConnection>,
    mut updates: broadcast::Receiver<Room>,
    failures: oneshot::Sender<TransferError>,
) {
    loop {
        let room = match updates.recv().await {
            Ok(room) => room,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let has_remote = connection.has_remote_description().await;
        let Some(answer) = answer_to_apply(&room, has_remote) else {
            continue;
        };

        log::info!("Got answer, setting remote description");
        match connection.set_remote_description(answer).await {
            Ok(()) => return,
            Err(e) => {
                log::error!("Failed to apply answer: {:#}", e);
                let _ = failures.send(TransferError::Negotiation(e));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::signaling::room::MemoryRoomStore;
    use crate::transport::LoopbackTransport;

    fn room_with_answer() -> Room {
        let mut room = Room::new("123456");
        room.offer = Some(SessionDescription::offer("o"));
        room.answer = Some(SessionDescription::answer("a"));
        room
    }

    #[test]
    fn test_answer_applied_only_without_remote_description() {
        let room = room_with_answer();
        assert_eq!(
            answer_to_apply(&room, false),
            Some(SessionDescription::answer("a"))
        );
        assert_eq!(answer_to_apply(&room, true), None);
        assert_eq!(answer_to_apply(&Room::new("1"), false), None);
    }

    #[test]
    fn test_state_transitions() {
        use SignalingState::*;
        assert!(Idle.can_advance_to(CreatingOffer));
        assert!(CreatingOffer.can_advance_to(AwaitingAnswer));
        assert!(AwaitingAnswer.can_advance_to(Connected));
        assert!(Idle.can_advance_to(LookingUpRoom));
        assert!(CreatingAnswer.can_advance_to(Connected));
        assert!(Connected.can_advance_to(Closed));
        assert!(LookingUpRoom.can_advance_to(Failed));
        assert!(Failed.can_advance_to(LookingUpRoom));

        assert!(!Idle.can_advance_to(Connected));
        assert!(!AwaitingAnswer.can_advance_to(CreatingAnswer));
        assert!(!Closed.can_advance_to(Connected));
    }

    #[test]
    fn test_state_handle_rejects_illegal_transition() {
        let handle = StateHandle::new();
        assert!(!handle.advance(SignalingState::Connected));
        assert_eq!(handle.get(), SignalingState::Idle);
        assert!(handle.advance(SignalingState::CreatingOffer));
        assert_eq!(handle.get(), SignalingState::CreatingOffer);
    }

    #[tokio::test]
    async fn test_join_unknown_code_sets_nothing_up() {
        let store = Arc::new(MemoryRoomStore::new());
        let transport = Arc::new(LoopbackTransport::new());
        let mut session = TransportSession::new(transport.clone(), TransportConfig::default());
        let mut exchange = SignalingExchange::new(store);

        let err = exchange.join("nonexistent-code", &mut session).await.unwrap_err();
        assert!(matches!(err, TransferError::RoomNotFound(code) if code == "nonexistent-code"));
        assert_eq!(exchange.state(), SignalingState::Failed);
        assert_eq!(transport.connection_count(), 0);
        assert!(!session.is_subscribed());
    }

    #[tokio::test]
    async fn test_join_room_without_offer_is_not_found() {
        let store = Arc::new(MemoryRoomStore::new());
        let room = store.create(RoomFields::default()).await.unwrap();
        let transport = Arc::new(LoopbackTransport::new());
        let mut session = TransportSession::new(transport.clone(), TransportConfig::default());
        let mut exchange = SignalingExchange::new(store);

        let err = exchange.join(&room.id, &mut session).await.unwrap_err();
        assert!(matches!(err, TransferError::RoomNotFound(_)));
        assert_eq!(transport.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_through_memory_store() {
        let store = Arc::new(MemoryRoomStore::new());
        let transport = Arc::new(LoopbackTransport::new());

        let mut caller_session =
            TransportSession::new(transport.clone(), TransportConfig::default());
        let mut caller = SignalingExchange::new(store.clone());
        let mut initiated = caller.initiate(&mut caller_session, "FileSender").await.unwrap();
        assert_eq!(caller.state(), SignalingState::AwaitingAnswer);
        assert_eq!(caller.session_code(), Some(initiated.code.as_str()));

        let room = store.get(&initiated.code).await.unwrap().unwrap();
        assert!(room.offer.is_some());
        assert!(room.answer.is_none());

        let mut callee_session =
            TransportSession::new(transport.clone(), TransportConfig::default());
        let mut callee = SignalingExchange::new(store.clone());
        let mut joined = callee.join(&initiated.code, &mut callee_session).await.unwrap();
        assert_eq!(callee.state(), SignalingState::CreatingAnswer);

        let wait = std::time::Duration::from_secs(2);
        let incoming = tokio::time::timeout(wait, joined.channels.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.channel.label(), "FileSender");
        assert_eq!(
            initiated.channel.events.recv().await,
            Some(crate::transport::ChannelEvent::Open)
        );

        let room = store.get(&initiated.code).await.unwrap().unwrap();
        assert!(room.answer.is_some());

        caller.hang_up().await;
        assert_eq!(caller.state(), SignalingState::Closed);
        assert!(store.get(&initiated.code).await.unwrap().is_none());

        caller_session.close().await;
        callee_session.close().await;
    }
}
