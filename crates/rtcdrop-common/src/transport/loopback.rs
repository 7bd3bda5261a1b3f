//! In-process transport: peers created by the same [`LoopbackTransport`]
//! connect to each other without any network.
//!
//! Descriptions are synthetic (`loopback-offer <id>` / `loopback-answer <id>`)
//! and exist only so the handshake can carry them through a room store.
//! Applying the answer on the offering side links the two peers: each
//! outbound channel gets a twin on the answering side, delivered through a
//! [`PeerEvent::DataChannel`], and both ends see [`ChannelEvent::Open`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

use crate::config::{TransportConfig, EVENT_QUEUE_CAPACITY};
use crate::transport::{
    ChannelEvent, ChannelHandle, ChannelMessage, DataChannel, IceCandidate, PeerConnection,
    PeerEvent, PeerStateChange, PeerTransport, SdpType, SessionDescription,
};

const OFFER_PREFIX: &str = "loopback-offer ";
const ANSWER_PREFIX: &str = "loopback-answer ";

/// Synthetic host candidates emitted per local description
const CANDIDATES_PER_PEER: usize = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct Registry {
    peers: Vec<Arc<LoopbackPeer>>,
}

/// Transport whose connections talk to each other in memory.
///
/// Clones share one registry, so a sender and a receiver built from clones
/// of the same transport can find each other.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    registry: Arc<Mutex<Registry>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections created so far.
    pub fn connection_count(&self) -> usize {
        lock(&self.registry).peers.len()
    }

    /// Remote candidates applied to the `index`-th connection, in order.
    pub fn applied_candidates(&self, index: usize) -> Vec<IceCandidate> {
        lock(&self.registry)
            .peers
            .get(index)
            .map(|peer| lock(&peer.state).applied.clone())
            .unwrap_or_default()
    }

    fn peer(&self, id: usize) -> Option<Arc<LoopbackPeer>> {
        lock(&self.registry).peers.get(id).cloned()
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>)> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let mut registry = lock(&self.registry);
        let peer = Arc::new(LoopbackPeer {
            id: registry.peers.len(),
            transport: Arc::downgrade(&self.registry),
            events: tx,
            closed: AtomicBool::new(false),
            state: Mutex::new(PeerState::default()),
        });
        registry.peers.push(peer.clone());
        log::debug!(
            "Loopback peer {} created ({} ICE servers ignored)",
            peer.id,
            config.ice_servers.len()
        );
        let connection: Arc<dyn PeerConnection> = peer;
        Ok((connection, rx))
    }
}

#[derive(Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    channels: Vec<Arc<LoopbackChannel>>,
    applied: Vec<IceCandidate>,
}

struct LoopbackPeer {
    id: usize,
    transport: Weak<Mutex<Registry>>,
    events: mpsc::Sender<PeerEvent>,
    closed: AtomicBool,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            anyhow::bail!("Peer connection {} is closed", self.id);
        }
        Ok(())
    }

    async fn emit(&self, event: PeerEvent) {
        if self.events.send(event).await.is_err() {
            log::debug!("Loopback peer {} has no event listener", self.id);
        }
    }

    fn remote_peer(&self, description: &SessionDescription) -> Result<Arc<LoopbackPeer>> {
        let id = description
            .sdp
            .strip_prefix(ANSWER_PREFIX)
            .and_then(|id| id.trim().parse::<usize>().ok())
            .context("Failed to parse loopback answer")?;
        let registry = self.transport.upgrade().context("Loopback transport dropped")?;
        let transport = LoopbackTransport { registry };
        transport
            .peer(id)
            .with_context(|| format!("Unknown loopback peer {}", id))
    }

    /// Hand every outbound channel to `answerer` and open both ends.
    async fn link(&self, answerer: &LoopbackPeer) {
        let outbound = lock(&self.state).channels.clone();
        for local in outbound {
            let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
            let twin = Arc::new(LoopbackChannel::new(local.label.clone(), tx));
            local.pair_with(&twin);
            twin.pair_with(&local);
            lock(&answerer.state).channels.push(twin.clone());

            answerer
                .emit(PeerEvent::DataChannel(ChannelHandle {
                    channel: twin.clone(),
                    events: rx,
                }))
                .await;
            local.open().await;
            twin.open().await;
        }
        for peer in [self, answerer] {
            peer.emit(PeerEvent::StateChanged(PeerStateChange::Connection(
                "connected".to_string(),
            )))
            .await;
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let channel = Arc::new(LoopbackChannel::new(label.to_string(), tx));
        lock(&self.state).channels.push(channel.clone());
        Ok(ChannelHandle {
            channel,
            events: rx,
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!("{}{}", OFFER_PREFIX, self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let state = lock(&self.state);
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(format!("{}{}", ANSWER_PREFIX, self.id)))
            }
            _ => anyhow::bail!("Cannot create an answer without a remote offer"),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        lock(&self.state).local = Some(description);

        self.emit(PeerEvent::StateChanged(PeerStateChange::IceGathering(
            "gathering".to_string(),
        )))
        .await;
        for n in 0..CANDIDATES_PER_PEER {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    self.id * 10 + n,
                    50000 + self.id * 10 + n
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            };
            self.emit(PeerEvent::IceCandidate(candidate)).await;
        }
        self.emit(PeerEvent::StateChanged(PeerStateChange::IceGathering(
            "complete".to_string(),
        )))
        .await;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let answerer = match description.sdp_type {
            SdpType::Offer => {
                if !description.sdp.starts_with(OFFER_PREFIX) {
                    anyhow::bail!("Failed to parse loopback offer");
                }
                None
            }
            SdpType::Answer => Some(self.remote_peer(&description)?),
        };
        lock(&self.state).remote = Some(description);

        if let Some(answerer) = answerer {
            self.link(&answerer).await;
        }
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        if state.remote.is_none() {
            anyhow::bail!("Cannot add an ICE candidate before the remote description");
        }
        state.applied.push(candidate);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channels = std::mem::take(&mut lock(&self.state).channels);
        for channel in channels {
            channel.shut_down().await;
        }
        self.emit(PeerEvent::StateChanged(PeerStateChange::Connection(
            "closed".to_string(),
        )))
        .await;
        Ok(())
    }
}

/// One end of an in-memory channel pair.
struct LoopbackChannel {
    label: String,
    events: mpsc::Sender<ChannelEvent>,
    remote: Mutex<Weak<LoopbackChannel>>,
    open: AtomicBool,
    threshold: AtomicUsize,
}

impl LoopbackChannel {
    fn new(label: String, events: mpsc::Sender<ChannelEvent>) -> Self {
        Self {
            label,
            events,
            remote: Mutex::new(Weak::new()),
            open: AtomicBool::new(false),
            threshold: AtomicUsize::new(0),
        }
    }

    fn pair_with(&self, remote: &Arc<LoopbackChannel>) {
        *lock(&self.remote) = Arc::downgrade(remote);
    }

    async fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Open).await;
    }

    /// Close this end and its twin.
    async fn shut_down(&self) {
        let remote = lock(&self.remote).upgrade();
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Close).await;
        }
        if let Some(remote) = remote {
            if remote.open.swap(false, Ordering::SeqCst) {
                let _ = remote.events.send(ChannelEvent::Close).await;
            }
        }
    }

    async fn deliver(&self, message: ChannelMessage, len: usize) -> Result<()> {
        if !self.is_open() {
            anyhow::bail!("Data channel '{}' is not open", self.label);
        }
        let remote = lock(&self.remote)
            .upgrade()
            .context("Remote end of data channel is gone")?;
        remote
            .events
            .send(ChannelEvent::Message(message))
            .await
            .context("Remote end of data channel stopped listening")?;

        // Delivery is immediate, so the buffered amount falls back to zero
        // right away and crosses the threshold whenever this frame raised it
        // above.
        if len > self.threshold.load(Ordering::SeqCst)
            && self.events.try_send(ChannelEvent::BufferedAmountLow).is_err()
        {
            log::debug!("Dropped buffered-amount-low on '{}'", self.label);
        }
        Ok(())
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let len = text.len();
        self.deliver(ChannelMessage::Text(text), len).await
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        let len = data.len();
        self.deliver(ChannelMessage::Binary(data), len).await
    }

    /// Frames are handed to the remote end on send, so nothing stays queued.
    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::SeqCst);
    }
}
