//! Sender and receiver endpoints
//!
//! Each endpoint owns one transport session and one signaling exchange, and
//! runs a single driver task that consumes its data channel's events in
//! order. Sends requested before the channel opens are queued and run, one
//! after another, once it does.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::TransferConfig;
use crate::core::events::{emit, format_bytes, EventSink, TransferEvent};
use crate::core::protocol::Frame;
use crate::core::receiver::{ChunkReceiver, ReceiveStep};
use crate::core::sender::send_file;
use crate::core::sink::FileSink;
use crate::core::source::FileSource;
use crate::error::TransferError;
use crate::signaling::exchange::{Initiated, Joined, SignalingExchange, SignalingState, StateHandle};
use crate::signaling::room::RoomStore;
use crate::transport::{ChannelEvent, ChannelHandle, PeerTransport, TransportSession};

/// A send waiting for the channel to open.
#[derive(Debug)]
pub struct PendingSendTask {
    pub source: FileSource,
    pub events: EventSink,
}

/// Initiating side: creates the session code and sends files.
pub struct FileSender {
    config: TransferConfig,
    exchange: SignalingExchange,
    session: TransportSession,
    queue: mpsc::UnboundedSender<PendingSendTask>,
    queued: Option<mpsc::UnboundedReceiver<PendingSendTask>>,
    driver: Option<JoinHandle<()>>,
}

impl FileSender {
    pub fn new(
        store: Arc<dyn RoomStore>,
        transport: Arc<dyn PeerTransport>,
        config: TransferConfig,
    ) -> Self {
        let (queue, queued) = mpsc::unbounded_channel();
        Self {
            session: TransportSession::new(transport, config.transport.clone()),
            exchange: SignalingExchange::new(store),
            config,
            queue,
            queued: Some(queued),
            driver: None,
        }
    }

    /// Create a room and return its code.
    ///
    /// While a session is live, further calls return the same code without
    /// creating anything new.
    pub async fn create_session(&mut self) -> Result<String, TransferError> {
        if let Some(code) = self.exchange.session_code() {
            let live = !matches!(
                self.exchange.state(),
                SignalingState::Failed | SignalingState::Closed
            );
            if live && self.session.is_open() {
                return Ok(code.to_string());
            }
        }
        self.config.validate()?;
        if self.exchange.session_code().is_some() || self.session.connection().is_some() {
            log::info!("Previous session is gone, starting a new one");
            self.close().await;
        }

        let Initiated {
            code,
            channel,
            failures,
        } = self
            .exchange
            .initiate(&mut self.session, &self.config.channel_label)
            .await?;

        let queued = match self.queued.take() {
            Some(queued) => queued,
            None => self.reset_queue(),
        };
        self.driver = Some(tokio::spawn(run_sender(
            channel,
            queued,
            failures,
            self.exchange.state_handle(),
            self.config.clone(),
        )));
        Ok(code)
    }

    /// Queue `source` for sending. Runs now if the channel is open, otherwise
    /// as soon as it opens. The outcome arrives on `events`.
    pub fn send(&self, source: FileSource, events: EventSink) {
        let task = PendingSendTask { source, events };
        if let Err(mpsc::error::SendError(task)) = self.queue.send(task) {
            emit(&task.events, TransferEvent::Failed(TransferError::ChannelClosed));
        }
    }

    pub fn session_code(&self) -> Option<&str> {
        self.exchange.session_code()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.exchange.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<SignalingState> {
        self.exchange.state_handle().subscribe()
    }

    /// Delete the room and tear the connection down. Safe to call at any time.
    pub async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.exchange.hang_up().await;
        self.session.close().await;
        if self.queued.is_none() {
            let queued = self.reset_queue();
            self.queued = Some(queued);
        }
    }

    fn reset_queue(&mut self) -> mpsc::UnboundedReceiver<PendingSendTask> {
        let (queue, queued) = mpsc::unbounded_channel();
        self.queue = queue;
        queued
    }
}

fn fail_pending(pending: &mut VecDeque<PendingSendTask>, reason: impl Fn() -> TransferError) {
    for task in pending.drain(..) {
        emit(&task.events, TransferEvent::Failed(reason()));
    }
}

/// Run one queued send to its end. Returns `false` once the channel is gone.
async fn run_task(
    handle: &mut ChannelHandle,
    task: PendingSendTask,
    config: &TransferConfig,
) -> bool {
    let PendingSendTask { source, events } = task;
    match send_file(&handle.channel, &mut handle.events, source, config, &events).await {
        Ok(()) => {
            emit(&events, TransferEvent::Completed(None));
            true
        }
        Err(e) => {
            log::error!("Send failed: {}", e);
            let closed = matches!(e, TransferError::ChannelClosed);
            emit(&events, TransferEvent::Failed(e));
            !closed
        }
    }
}

async fn run_sender(
    mut handle: ChannelHandle,
    mut queue: mpsc::UnboundedReceiver<PendingSendTask>,
    mut failures: oneshot::Receiver<TransferError>,
    state: StateHandle,
    config: TransferConfig,
) {
    let mut pending = VecDeque::new();
    let mut open = handle.channel.is_open();
    let mut negotiating = true;
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(ChannelEvent::Open) => {
                    log::info!("Data channel open");
                    state.advance(SignalingState::Connected);
                    open = true;
                    while let Some(task) = pending.pop_front() {
                        if !run_task(&mut handle, task, &config).await {
                            fail_pending(&mut pending, || TransferError::ChannelClosed);
                            return;
                        }
                    }
                }
                Some(ChannelEvent::Message(message)) => {
                    log::debug!("Ignoring message from receiver: {:?}", message);
                }
                Some(ChannelEvent::Error(e)) => log::warn!("Data channel error: {}", e),
                Some(ChannelEvent::BufferedAmountLow) => {}
                Some(ChannelEvent::Close) | None => {
                    log::info!("Data channel closed");
                    fail_pending(&mut pending, || TransferError::ChannelClosed);
                    return;
                }
            },
            task = queue.recv() => match task {
                Some(task) if failure.is_some() => {
                    let reason = failure.clone().unwrap_or_default();
                    let err = TransferError::Negotiation(anyhow::anyhow!(reason));
                    emit(&task.events, TransferEvent::Failed(err));
                }
                Some(task) if open => {
                    if !run_task(&mut handle, task, &config).await {
                        return;
                    }
                }
                Some(task) => {
                    log::info!(
                        "Waiting for the receiver before sending {}",
                        task.source.metadata.name
                    );
                    pending.push_back(task);
                }
                None => return,
            },
            result = &mut failures, if negotiating => {
                negotiating = false;
                if let Ok(err) = result {
                    let reason = format!("{:#}", err);
                    state.advance(SignalingState::Failed);
                    fail_pending(&mut pending, || {
                        TransferError::Negotiation(anyhow::anyhow!(reason.clone()))
                    });
                    failure = Some(reason);
                }
            }
        }
    }
}

/// Responding side: joins a session by code and saves what arrives.
pub struct FileReceiver {
    exchange: SignalingExchange,
    session: TransportSession,
    sink: Arc<dyn FileSink>,
    driver: Option<JoinHandle<()>>,
}

impl FileReceiver {
    pub fn new(
        store: Arc<dyn RoomStore>,
        transport: Arc<dyn PeerTransport>,
        sink: Arc<dyn FileSink>,
        config: TransferConfig,
    ) -> Self {
        Self {
            session: TransportSession::new(transport, config.transport),
            exchange: SignalingExchange::new(store),
            sink,
            driver: None,
        }
    }

    /// Join the session named `code`. Transfers arriving on it are reported
    /// on `events`; a failure to join is reported only through the result.
    pub async fn receive(&mut self, code: &str, events: EventSink) -> Result<(), TransferError> {
        if self.driver.is_some() || self.session.connection().is_some() {
            self.close().await;
        }

        let Joined { channels } = self.exchange.join(code.trim(), &mut self.session).await?;
        self.driver = Some(tokio::spawn(run_receiver(
            channels,
            self.exchange.state_handle(),
            self.sink.clone(),
            events,
        )));
        Ok(())
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.exchange.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<SignalingState> {
        self.exchange.state_handle().subscribe()
    }

    pub async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.exchange.hang_up().await;
        self.session.close().await;
    }
}

async fn run_receiver(
    mut channels: mpsc::Receiver<ChannelHandle>,
    state: StateHandle,
    sink: Arc<dyn FileSink>,
    events: EventSink,
) {
    let Some(ChannelHandle {
        channel,
        events: mut channel_events,
    }) = channels.recv().await
    else {
        log::warn!("Connection ended before a data channel arrived");
        return;
    };
    if channel.is_open() {
        state.advance(SignalingState::Connected);
    }

    let mut receiver = ChunkReceiver::new();
    while let Some(event) = channel_events.recv().await {
        match event {
            ChannelEvent::Open => {
                log::info!("Data channel open");
                state.advance(SignalingState::Connected);
            }
            ChannelEvent::Message(message) => {
                let Some(frame) = Frame::from_message(message) else {
                    continue;
                };
                match receiver.handle(frame) {
                    ReceiveStep::Nothing => {}
                    ReceiveStep::Started(metadata) => {
                        emit(&events, TransferEvent::Started(metadata))
                    }
                    ReceiveStep::Progress(percent) => {
                        emit(&events, TransferEvent::Progress(percent))
                    }
                    ReceiveStep::Complete(file) => match sink.save(file).await {
                        Ok(path) => emit(&events, TransferEvent::Completed(path)),
                        Err(e) => {
                            log::error!("Failed to save received file: {:#}", e);
                            emit(&events, TransferEvent::Failed(TransferError::Save(e)));
                        }
                    },
                }
            }
            ChannelEvent::BufferedAmountLow => {}
            ChannelEvent::Error(e) => log::warn!("Data channel error: {}", e),
            ChannelEvent::Close => break,
        }
    }

    log::info!("Data channel closed");
    if let Some(metadata) = receiver.metadata() {
        log::warn!(
            "Channel closed after {} of {} of {}",
            format_bytes(receiver.bytes_received()),
            format_bytes(metadata.size),
            metadata.name
        );
        receiver.reset();
        emit(&events, TransferEvent::Failed(TransferError::ChannelClosed));
    }
}
