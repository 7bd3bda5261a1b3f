//! webrtc-rs behind the peer transport traits
//!
//! This module contains:
//! - `WebRtcTransport`: builds peer connections from a `TransportConfig`
//! - `WebRtcPeerConnection`: forwards connection callbacks as `PeerEvent`s
//! - `WebRtcDataChannel`: forwards channel callbacks as `ChannelEvent`s

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use rtcdrop_common::config::{TransportConfig, EVENT_QUEUE_CAPACITY};
use rtcdrop_common::transport::{
    ChannelEvent, ChannelHandle, ChannelMessage, DataChannel, IceCandidate, PeerConnection,
    PeerEvent, PeerStateChange, PeerTransport, SdpType, SessionDescription,
};

// ============================================================================
// Conversions
// ============================================================================

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .context("Invalid session description")
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => anyhow::bail!("Unsupported session description type: {}", other),
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Creates webrtc-rs peer connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcTransport;

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>)> {
        // No servers means host candidates only
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: config.candidate_pool_size,
            ..Default::default()
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .context("Failed to create peer connection")?,
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        forward_peer_events(&peer_connection, events_tx);

        let connection: Arc<dyn PeerConnection> =
            Arc::new(WebRtcPeerConnection { peer_connection });
        Ok((connection, events_rx))
    }
}

/// Register connection callbacks that push into `tx`.
fn forward_peer_events(peer_connection: &RTCPeerConnection, tx: mpsc::Sender<PeerEvent>) {
    let ice_tx = tx.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate| {
        let ice_tx = ice_tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let event = PeerEvent::IceCandidate(from_rtc_candidate(init));
                    if ice_tx.send(event).await.is_err() {
                        log::warn!("Failed to send ICE candidate - receiver dropped");
                    }
                }
                Err(e) => log::warn!("Failed to serialize ICE candidate: {}", e),
            }
        })
    }));

    let dc_tx = tx.clone();
    peer_connection.on_data_channel(Box::new(move |dc| {
        let dc_tx = dc_tx.clone();
        let label = dc.label().to_string();
        Box::pin(async move {
            // Handlers go in before returning so no early message is missed
            let handle = WebRtcDataChannel::attach(dc).await;
            if dc_tx.send(PeerEvent::DataChannel(handle)).await.is_err() {
                log::warn!("Failed to forward data channel '{}' - receiver dropped", label);
            }
        })
    }));

    let state_tx = tx.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |state| {
        let state_tx = state_tx.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Connected => eprintln!("WebRTC connection established!"),
                RTCPeerConnectionState::Failed => log::error!("WebRTC connection failed"),
                _ => {}
            }
            let change = PeerStateChange::Connection(state.to_string());
            let _ = state_tx.send(PeerEvent::StateChanged(change)).await;
        })
    }));

    let state_tx = tx.clone();
    peer_connection.on_ice_connection_state_change(Box::new(move |state| {
        let state_tx = state_tx.clone();
        Box::pin(async move {
            let change = PeerStateChange::IceConnection(state.to_string());
            let _ = state_tx.send(PeerEvent::StateChanged(change)).await;
        })
    }));

    let state_tx = tx.clone();
    peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
        let state_tx = state_tx.clone();
        Box::pin(async move {
            let change = PeerStateChange::IceGathering(state.to_string());
            let _ = state_tx.send(PeerEvent::StateChanged(change)).await;
        })
    }));

    peer_connection.on_signaling_state_change(Box::new(move |state| {
        let state_tx = tx.clone();
        Box::pin(async move {
            let change = PeerStateChange::Signaling(state.to_string());
            let _ = state_tx.send(PeerEvent::StateChanged(change)).await;
        })
    }));
}

// ============================================================================
// Peer connection
// ============================================================================

pub struct WebRtcPeerConnection {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle> {
        let dc = self
            .peer_connection
            .create_data_channel(label, None)
            .await
            .context("Failed to create data channel")?;
        Ok(WebRtcDataChannel::attach(dc).await)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .context("Failed to set local description")
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .context("Failed to set remote description")
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .context("Failed to add ICE candidate")
    }

    fn is_closed(&self) -> bool {
        self.peer_connection.connection_state() == RTCPeerConnectionState::Closed
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")
    }
}

// ============================================================================
// Data channel
// ============================================================================

/// Largest message webrtc-sctp accepts for sending (its default
/// `max_message_size`)
const SCTP_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Cut `data` into messages of at most [`SCTP_MAX_MESSAGE_SIZE`] bytes
/// without copying.
fn split_message(mut data: Bytes) -> Vec<Bytes> {
    if data.len() <= SCTP_MAX_MESSAGE_SIZE {
        return vec![data];
    }
    let mut messages = Vec::with_capacity(data.len().div_ceil(SCTP_MAX_MESSAGE_SIZE));
    while !data.is_empty() {
        let len = data.len().min(SCTP_MAX_MESSAGE_SIZE);
        messages.push(data.split_to(len));
    }
    messages
}

pub struct WebRtcDataChannel {
    data_channel: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    /// Register the channel callbacks and wrap the channel.
    pub async fn attach(data_channel: Arc<RTCDataChannel>) -> ChannelHandle {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let label = data_channel.label().to_string();

        let open_tx = tx.clone();
        let open_label = label.clone();
        data_channel.on_open(Box::new(move || {
            eprintln!("Data channel '{}' opened", open_label);
            Box::pin(async move {
                let _ = open_tx.send(ChannelEvent::Open).await;
            })
        }));

        let message_tx = tx.clone();
        data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let message_tx = message_tx.clone();
            Box::pin(async move {
                let message = if msg.is_string {
                    ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelMessage::Binary(msg.data)
                };
                if message_tx.send(ChannelEvent::Message(message)).await.is_err() {
                    log::warn!("Failed to forward data channel message - receiver dropped");
                }
            })
        }));

        let low_tx = tx.clone();
        data_channel
            .on_buffered_amount_low(Box::new(move || {
                let low_tx = low_tx.clone();
                Box::pin(async move {
                    let _ = low_tx.send(ChannelEvent::BufferedAmountLow).await;
                })
            }))
            .await;

        let error_tx = tx.clone();
        let error_label = label.clone();
        data_channel.on_error(Box::new(move |err| {
            log::error!("Data channel '{}' error: {}", error_label, err);
            let error_tx = error_tx.clone();
            Box::pin(async move {
                let _ = error_tx.send(ChannelEvent::Error(err.to_string())).await;
            })
        }));

        data_channel.on_close(Box::new(move || {
            eprintln!("Data channel '{}' closed", label);
            let close_tx = tx.clone();
            Box::pin(async move {
                let _ = close_tx.send(ChannelEvent::Close).await;
            })
        }));

        ChannelHandle {
            channel: Arc::new(WebRtcDataChannel { data_channel }),
            events: rx,
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.data_channel.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.data_channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.data_channel
            .send_text(text)
            .await
            .context("Failed to send text message")?;
        Ok(())
    }

    /// Payloads above the SCTP message limit go out as several messages;
    /// the receiver reassembles by byte count, not by message.
    async fn send_binary(&self, data: Bytes) -> Result<()> {
        for message in split_message(data) {
            self.data_channel
                .send(&message)
                .await
                .context("Failed to send binary message")?;
        }
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.data_channel.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.data_channel
            .set_buffered_amount_low_threshold(threshold)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcdrop_common::core::sink::{FileSink, ReceivedFile};
    use rtcdrop_common::signaling::{MemoryRoomStore, RoomStore};
    use rtcdrop_common::{
        event_channel, FileReceiver, FileSender, FileSource, TransferConfig, TransferEvent,
    };
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(30);

    /// Host candidates only, no network services needed
    fn local_config() -> TransportConfig {
        TransportConfig {
            ice_servers: Vec::new(),
            candidate_pool_size: 0,
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Apply `events`' local candidates to `remote` and hand incoming data
    /// channels to the returned queue.
    fn relay_events(
        mut events: mpsc::Receiver<PeerEvent>,
        remote: Arc<dyn PeerConnection>,
    ) -> mpsc::Receiver<ChannelHandle> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::IceCandidate(candidate) => {
                        let _ = remote.add_ice_candidate(candidate).await;
                    }
                    PeerEvent::DataChannel(handle) => {
                        let _ = tx.send(handle).await;
                    }
                    PeerEvent::StateChanged(_) => {}
                }
            }
        });
        rx
    }

    #[derive(Default)]
    struct MemorySink {
        files: Mutex<Vec<ReceivedFile>>,
    }

    #[async_trait]
    impl FileSink for MemorySink {
        async fn save(&self, file: ReceivedFile) -> Result<Option<PathBuf>> {
            self.files.lock().unwrap().push(file);
            Ok(None)
        }
    }

    async fn outcome(events: &mut mpsc::UnboundedReceiver<TransferEvent>) -> TransferEvent {
        loop {
            let event = tokio::time::timeout(TIMEOUT, events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                TransferEvent::Completed(_) | TransferEvent::Failed(_) => return event,
                _ => {}
            }
        }
    }

    #[test]
    fn test_split_message_respects_sctp_limit() {
        let small = Bytes::from(payload(1000));
        assert_eq!(split_message(small.clone()), vec![small]);

        let data = Bytes::from(payload(256 * 1024 + 10));
        let messages = split_message(data.clone());
        let sizes: Vec<usize> = messages.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![65536, 65536, 65536, 65536, 10]);
        assert_eq!(messages.concat(), data.to_vec());
    }


    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.5 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };
        let init = to_rtc_candidate(candidate.clone());
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(from_rtc_candidate(init), candidate);
    }

    #[test]
    fn test_description_conversion() {
        let offer = to_rtc_description(SessionDescription::offer("v=0\r\n")).unwrap();
        assert_eq!(offer.sdp_type, RTCSdpType::Offer);
        assert_eq!(
            from_rtc_description(offer).unwrap(),
            SessionDescription::offer("v=0\r\n")
        );
    }

    #[tokio::test]
    async fn test_two_peers_exchange_a_large_binary_frame() {
        let transport = WebRtcTransport;
        let (offerer, offerer_events) = transport.connect(&local_config()).await.unwrap();
        let (answerer, answerer_events) = transport.connect(&local_config()).await.unwrap();

        let mut outbound = offerer.create_data_channel("FileSender").await.unwrap();
        assert_eq!(outbound.channel.label(), "FileSender");
        assert!(!outbound.channel.is_open());

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        assert!(answerer.has_remote_description().await);
        assert!(!offerer.has_remote_description().await);

        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        // Candidates queued so far are applied once both sides have descriptions
        let _ = relay_events(offerer_events, answerer.clone());
        let mut incoming = relay_events(answerer_events, offerer.clone());

        loop {
            let event = tokio::time::timeout(TIMEOUT, outbound.events.recv())
                .await
                .unwrap()
                .unwrap();
            if event == ChannelEvent::Open {
                break;
            }
        }
        let mut inbound = tokio::time::timeout(TIMEOUT, incoming.recv())
            .await
            .unwrap()
            .unwrap();

        // Four times the SCTP message limit in one frame
        let data = payload(256 * 1024);
        outbound
            .channel
            .send_binary(Bytes::from(data.clone()))
            .await
            .unwrap();

        let mut received = Vec::new();
        let mut messages = 0;
        while received.len() < data.len() {
            let event = tokio::time::timeout(TIMEOUT, inbound.events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ChannelEvent::Message(ChannelMessage::Binary(bytes)) = event {
                received.extend_from_slice(&bytes);
                messages += 1;
            }
        }
        assert_eq!(received, data);
        assert_eq!(messages, 4);

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
        assert!(offerer.is_closed());
    }

    #[tokio::test]
    async fn test_file_transfer_with_default_chunk_size() {
        let store: Arc<dyn RoomStore> = Arc::new(MemoryRoomStore::new());
        let config = TransferConfig {
            transport: local_config(),
            ..Default::default()
        };
        let sink = Arc::new(MemorySink::default());
        let mut sender = FileSender::new(store.clone(), Arc::new(WebRtcTransport), config.clone());
        let mut receiver =
            FileReceiver::new(store, Arc::new(WebRtcTransport), sink.clone(), config);

        let code = sender.create_session().await.unwrap();
        let (receive_events_tx, mut receive_events) = event_channel();
        receiver.receive(&code, receive_events_tx).await.unwrap();

        let data = payload(600 * 1024);
        let (send_events_tx, mut send_events) = event_channel();
        sender.send(
            FileSource::from_bytes("big.bin", "application/octet-stream", data.clone()),
            send_events_tx,
        );

        match outcome(&mut send_events).await {
            TransferEvent::Completed(None) => {}
            other => panic!("sender finished with {:?}", other),
        }
        match outcome(&mut receive_events).await {
            TransferEvent::Completed(None) => {}
            other => panic!("receiver finished with {:?}", other),
        }
        let files = sink.files.lock().unwrap().clone();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].metadata.name, "big.bin");
        assert_eq!(files[0].data.to_vec(), data);

        sender.close().await;
        receiver.close().await;
    }
}
