//! Sending side of the transfer protocol
//!
//! [`ChunkSender`] is the pump: a state machine that decides, on each
//! buffered-amount-low signal and each completed read, whether to put one
//! chunk on the channel, request the next piece of the file, or finish.
//! [`send_file`] drives it with channel events and reads served by a
//! separate reader task.

use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::config::TransferConfig;
use crate::core::buffer::ByteCursorBuffer;
use crate::core::events::{emit, format_bytes, EventSink, TransferEvent};
use crate::core::protocol::{calc_percent, ControlFrame};
use crate::core::source::FileSource;
use crate::error::TransferError;
use crate::transport::{ChannelEvent, DataChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Nothing sent or read yet
    Idle,
    /// Buffered bytes left to send
    Draining,
    /// A read is outstanding; signals are ignored until it completes
    Reading,
    Finished,
    Failed,
}

/// What the driver must do next.
#[derive(Debug)]
pub enum PumpAction {
    Nothing,
    /// Put `chunk` on the channel and report `progress` percent
    Send { chunk: Bytes, progress: f64 },
    /// Request the next piece of the file
    Read,
    /// End of file: send `bye`
    Finish,
    Fail(io::Error),
}

/// Backpressure-driven chunk pump.
///
/// At most one chunk leaves per signal, and at most one read is in flight.
#[derive(Debug)]
pub struct ChunkSender {
    state: PumpState,
    buffer: ByteCursorBuffer,
    max_chunk_size: usize,
    bytes_sent: u64,
    total_size: u64,
}

impl ChunkSender {
    pub fn new(total_size: u64, max_chunk_size: usize) -> Self {
        Self {
            state: PumpState::Idle,
            buffer: ByteCursorBuffer::new(),
            max_chunk_size,
            bytes_sent: 0,
            total_size,
        }
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// The channel drained below its threshold (or the pump is being
    /// bootstrapped).
    pub fn on_buffered_amount_low(&mut self) -> PumpAction {
        match self.state {
            PumpState::Reading | PumpState::Finished | PumpState::Failed => PumpAction::Nothing,
            PumpState::Idle | PumpState::Draining => {
                if self.buffer.is_empty() {
                    self.state = PumpState::Reading;
                    PumpAction::Read
                } else {
                    self.next_chunk()
                }
            }
        }
    }

    /// A read completed: `Ok(None)` is end of file.
    ///
    /// Completions arriving while no read is outstanding are ignored.
    pub fn on_read(&mut self, result: io::Result<Option<Bytes>>) -> PumpAction {
        if self.state != PumpState::Reading {
            return PumpAction::Nothing;
        }
        match result {
            Ok(Some(piece)) if !piece.is_empty() => {
                self.buffer.append(piece);
                self.next_chunk()
            }
            Ok(_) => {
                self.state = PumpState::Finished;
                self.buffer.clear();
                PumpAction::Finish
            }
            Err(e) => {
                self.state = PumpState::Failed;
                self.buffer.clear();
                PumpAction::Fail(e)
            }
        }
    }

    fn next_chunk(&mut self) -> PumpAction {
        let chunk = self.buffer.read(self.max_chunk_size);
        self.bytes_sent += chunk.len() as u64;
        self.state = PumpState::Draining;
        PumpAction::Send {
            progress: calc_percent(self.bytes_sent, self.total_size),
            chunk,
        }
    }
}

/// Read up to `size` bytes, stopping short only at end of file.
async fn read_piece<R>(reader: &mut R, size: usize) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(Bytes::from(buf)))
}

/// Serve read requests until end of file, an error, or the requester
/// going away. A result nobody waits for any more is dropped.
fn spawn_reader(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    read_size: usize,
) -> (
    mpsc::Sender<()>,
    mpsc::Receiver<io::Result<Option<Bytes>>>,
) {
    let (request_tx, mut requests) = mpsc::channel::<()>(1);
    let (result_tx, results) = mpsc::channel(1);
    tokio::spawn(async move {
        while requests.recv().await.is_some() {
            let result = read_piece(reader.as_mut(), read_size).await;
            let done = !matches!(result, Ok(Some(_)));
            if result_tx.send(result).await.is_err() || done {
                break;
            }
        }
    });
    (request_tx, results)
}

fn reader_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "file reader stopped")
}

/// Wait until everything sent so far has left the channel's buffer, so
/// closing the connection afterwards cannot drop `bye`. A closed channel
/// ends the wait too: the receiver hangs up once it has the whole file.
async fn wait_for_drain(
    channel: &Arc<dyn DataChannel>,
    channel_events: &mut mpsc::Receiver<ChannelEvent>,
    threshold: usize,
) {
    // Signals queued before `bye` went out may be stale, so the buffered
    // amount is checked again after each one.
    while channel.buffered_amount().await > threshold {
        match channel_events.recv().await {
            Some(ChannelEvent::Close) | None => {
                log::debug!("Data channel closed while draining");
                return;
            }
            Some(ChannelEvent::Error(e)) => log::warn!("Data channel error: {}", e),
            Some(_) => {}
        }
    }
}

/// Send one file over an open channel.
///
/// Emits `Started` and `Progress` on `events`; the final outcome is the
/// return value, available once `bye` has drained from the channel. A read
/// failure does not send `bye`.
pub async fn send_file(
    channel: &Arc<dyn DataChannel>,
    channel_events: &mut mpsc::Receiver<ChannelEvent>,
    source: FileSource,
    config: &TransferConfig,
    events: &EventSink,
) -> Result<(), TransferError> {
    let FileSource { metadata, reader } = source;
    log::info!(
        "Sending {} ({}, {})",
        metadata.name,
        format_bytes(metadata.size),
        metadata.mime_type
    );

    channel
        .set_buffered_amount_low_threshold(config.buffered_amount_low_threshold)
        .await;
    let hello = ControlFrame::Hello {
        data: metadata.clone(),
    }
    .encode()
    .map_err(TransferError::Send)?;
    channel.send_text(hello).await.map_err(TransferError::Send)?;
    emit(events, TransferEvent::Started(metadata.clone()));

    let (read_requests, mut reads) = spawn_reader(reader, config.read_size);
    let mut reads_open = true;
    let mut pump = ChunkSender::new(metadata.size, config.max_chunk_size);
    let mut action = pump.on_buffered_amount_low();

    loop {
        match action {
            PumpAction::Nothing => {}
            PumpAction::Send { chunk, progress } => {
                log::trace!("Sending chunk of {} bytes", chunk.len());
                channel
                    .send_binary(chunk)
                    .await
                    .map_err(TransferError::Send)?;
                emit(events, TransferEvent::Progress(progress));
            }
            PumpAction::Read => {
                if read_requests.send(()).await.is_err() {
                    return Err(TransferError::Read(reader_gone()));
                }
            }
            PumpAction::Finish => {
                log::info!(
                    "Reached end of {}, sent {}",
                    metadata.name,
                    format_bytes(pump.bytes_sent())
                );
                let bye = ControlFrame::Bye.encode().map_err(TransferError::Send)?;
                channel.send_text(bye).await.map_err(TransferError::Send)?;
                wait_for_drain(channel, channel_events, config.buffered_amount_low_threshold)
                    .await;
                emit(events, TransferEvent::Progress(100.0));
                return Ok(());
            }
            PumpAction::Fail(e) => {
                log::error!("Failed to read {}: {}", metadata.name, e);
                return Err(TransferError::Read(e));
            }
        }

        action = tokio::select! {
            event = channel_events.recv() => match event {
                Some(ChannelEvent::BufferedAmountLow) => pump.on_buffered_amount_low(),
                Some(ChannelEvent::Message(message)) => {
                    log::debug!("Ignoring message from receiver: {:?}", message);
                    PumpAction::Nothing
                }
                Some(ChannelEvent::Error(e)) => {
                    log::warn!("Data channel error: {}", e);
                    PumpAction::Nothing
                }
                Some(ChannelEvent::Open) => PumpAction::Nothing,
                Some(ChannelEvent::Close) | None => return Err(TransferError::ChannelClosed),
            },
            read = reads.recv(), if reads_open => match read {
                Some(result) => pump.on_read(result),
                None => {
                    reads_open = false;
                    pump.on_read(Err(reader_gone()))
                }
            },
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_CHUNK_SIZE;
    use crate::core::events::event_channel;
    use crate::transport::ChannelMessage;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    /// Channel that records frames and keeps them buffered until the test
    /// acknowledges them.
    #[derive(Default)]
    struct RecordingChannel {
        frames: Mutex<Vec<ChannelMessage>>,
        buffered: AtomicUsize,
    }

    impl RecordingChannel {
        fn frames(&self) -> Vec<ChannelMessage> {
            self.frames.lock().unwrap().clone()
        }

        fn acknowledge(&self) {
            self.buffered.store(0, Ordering::SeqCst);
        }

        fn record(&self, message: ChannelMessage, len: usize) {
            self.frames.lock().unwrap().push(message);
            self.buffered.fetch_add(len, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DataChannel for RecordingChannel {
        fn label(&self) -> String {
            "files".to_string()
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn send_text(&self, text: String) -> anyhow::Result<()> {
            let len = text.len();
            self.record(ChannelMessage::Text(text), len);
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> anyhow::Result<()> {
            let len = data.len();
            self.record(ChannelMessage::Binary(data), len);
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn set_buffered_amount_low_threshold(&self, _threshold: usize) {}
    }

    async fn frames_after(channel: &RecordingChannel, seen: usize) -> Vec<ChannelMessage> {
        for _ in 0..1000 {
            let frames = channel.frames();
            if frames.len() > seen {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no frame after {}", seen);
    }

    /// Start sending ten bytes in 4-byte chunks and acknowledge every chunk.
    /// Returns once `bye` is buffered.
    async fn send_until_bye() -> (
        Arc<RecordingChannel>,
        mpsc::Sender<ChannelEvent>,
        JoinHandle<Result<(), TransferError>>,
    ) {
        let channel = Arc::new(RecordingChannel::default());
        let sending: Arc<dyn DataChannel> = channel.clone();
        let (signals, mut channel_events) = mpsc::channel(16);
        let (events, _events_rx) = event_channel();
        let config = TransferConfig {
            max_chunk_size: 4,
            read_size: 4,
            ..Default::default()
        };
        let source =
            FileSource::from_bytes("ten.bin", "application/octet-stream", b"0123456789".to_vec());
        let task = tokio::spawn(async move {
            send_file(&sending, &mut channel_events, source, &config, &events).await
        });

        // One signal per chunk, so each frame shows up on its own and no
        // signal is left over when `bye` goes out
        let bye = ChannelMessage::Text(ControlFrame::Bye.encode().unwrap());
        let mut seen = 0;
        loop {
            let frames = frames_after(&channel, seen).await;
            seen = frames.len();
            match frames.last() {
                Some(last) if *last == bye => break,
                Some(ChannelMessage::Binary(_)) => {
                    channel.acknowledge();
                    signals.send(ChannelEvent::BufferedAmountLow).await.unwrap();
                }
                _ => {}
            }
        }
        assert_eq!(seen, 5, "hello, three chunks, bye");
        (channel, signals, task)
    }

    #[tokio::test]
    async fn test_send_returns_once_bye_drains() {
        let (channel, signals, task) = send_until_bye().await;

        // A signal while `bye` is still buffered does not end the send
        signals.send(ChannelEvent::BufferedAmountLow).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        channel.acknowledge();
        signals.send(ChannelEvent::BufferedAmountLow).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_close_after_bye_ends_the_send() {
        let (_channel, signals, task) = send_until_bye().await;
        signals.send(ChannelEvent::Close).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    fn sent_len(action: &PumpAction) -> Option<usize> {
        match action {
            PumpAction::Send { chunk, .. } => Some(chunk.len()),
            _ => None,
        }
    }

    #[test]
    fn test_bootstrap_requests_read() {
        let mut pump = ChunkSender::new(10, 4);
        assert!(matches!(pump.on_buffered_amount_low(), PumpAction::Read));
        assert_eq!(pump.state(), PumpState::Reading);
        // Signals while the read is outstanding are dropped
        assert!(matches!(pump.on_buffered_amount_low(), PumpAction::Nothing));
    }

    #[test]
    fn test_one_chunk_per_signal() {
        let mut pump = ChunkSender::new(10, 4);
        pump.on_buffered_amount_low();
        let action = pump.on_read(Ok(Some(Bytes::from_static(b"0123456789"))));
        assert_eq!(sent_len(&action), Some(4));
        assert_eq!(pump.state(), PumpState::Draining);

        assert_eq!(sent_len(&pump.on_buffered_amount_low()), Some(4));
        assert_eq!(sent_len(&pump.on_buffered_amount_low()), Some(2));
        assert!(matches!(pump.on_buffered_amount_low(), PumpAction::Read));
        assert!(matches!(pump.on_read(Ok(None)), PumpAction::Finish));
        assert_eq!(pump.state(), PumpState::Finished);
        assert_eq!(pump.bytes_sent(), 10);
        assert!(matches!(pump.on_buffered_amount_low(), PumpAction::Nothing));
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut pump = ChunkSender::new(9, 2);
        pump.on_buffered_amount_low();
        let mut last = 0.0;
        let mut action = pump.on_read(Ok(Some(Bytes::from(vec![7u8; 9]))));
        while let PumpAction::Send { progress, .. } = action {
            assert!(progress >= last);
            last = progress;
            action = pump.on_buffered_amount_low();
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_read_error_fails_and_ignores_late_reads() {
        let mut pump = ChunkSender::new(10, 4);
        pump.on_buffered_amount_low();
        let action = pump.on_read(Err(io::Error::new(io::ErrorKind::Other, "disk gone")));
        assert!(matches!(action, PumpAction::Fail(_)));
        assert_eq!(pump.state(), PumpState::Failed);
        assert!(matches!(
            pump.on_read(Ok(Some(Bytes::from_static(b"late")))),
            PumpAction::Nothing
        ));
    }

    #[test]
    fn test_empty_file_finishes_immediately() {
        let mut pump = ChunkSender::new(0, MAX_CHUNK_SIZE);
        assert!(matches!(pump.on_buffered_amount_low(), PumpAction::Read));
        assert!(matches!(pump.on_read(Ok(None)), PumpAction::Finish));
        assert_eq!(pump.bytes_sent(), 0);
    }

    #[tokio::test]
    async fn test_read_piece_fills_to_size() {
        // A reader that hands out data in small slices
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut reader = tokio::io::BufReader::with_capacity(7, Cursor::new(data.clone()));

        let first = read_piece(&mut reader, 600).await.unwrap().unwrap();
        assert_eq!(first.len(), 600);
        let second = read_piece(&mut reader, 600).await.unwrap().unwrap();
        assert_eq!(second.len(), 400);
        assert!(read_piece(&mut reader, 600).await.unwrap().is_none());
        assert_eq!([first, second].concat(), data);
    }
}
