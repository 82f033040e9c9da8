use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};

use async_trait::async_trait;
use songbird::{
    input::{Input, RawAdapter},
    tracks::{PlayMode, TrackHandle},
    Call, Event, EventContext, EventHandler, TrackEvent,
};
use symphonia::core::io::MediaSource;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use crate::decoder::{CHANNEL_COUNT, FRAME_BYTES, SAMPLE_RATE_HZ};

/// 20 ms of 48 kHz stereo s16le audio.
pub const VOICE_FRAME_BYTES: usize = 960 * FRAME_BYTES;

/// Chunks buffered between the relay and the voice driver.
const SINK_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to a voice channel")]
    Disconnected,

    #[error("the voice sink was closed")]
    Closed,

    #[error("voice driver error: {0}")]
    Driver(String),
}

/// Capability interface of a destination's voice connection.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn set_speaking(&self, speaking: bool) -> Result<(), TransportError>;

    async fn open_sink(&self) -> Result<Box<dyn TransmitSink>, TransportError>;

    /// Resolves once everything written to the last sink has been played.
    async fn wait_for_playback_finish(&self) -> Result<(), TransportError>;
}

/// Accepts raw interleaved stereo s16le PCM at 48 kHz.
#[async_trait]
pub trait TransmitSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Marks the end of the stream.
    async fn flush(&mut self) -> Result<(), TransportError>;

    fn chunk_size(&self) -> usize {
        VOICE_FRAME_BYTES
    }
}

/// Plays sinks as live tracks of a songbird [`Call`].
pub struct SongbirdTransport {
    call: Arc<Mutex<Call>>,
    monitor: TrackMonitor,
}

impl SongbirdTransport {
    pub fn new(call: Arc<Mutex<Call>>) -> Self {
        Self {
            call,
            monitor: TrackMonitor::new(),
        }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn set_speaking(&self, speaking: bool) -> Result<(), TransportError> {
        // The driver sends the speaking opcode itself once audio flows.
        debug!(speaking, "speaking state changed");
        Ok(())
    }

    async fn open_sink(&self) -> Result<Box<dyn TransmitSink>, TransportError> {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let input: Input = RawAdapter::new(PcmStream::new(rx), SAMPLE_RATE_HZ, CHANNEL_COUNT).into();

        let track = {
            let mut call = self.call.lock().await;
            if call.current_connection().is_none() {
                return Err(TransportError::Disconnected);
            }
            call.play_input(input)
        };

        // The track cannot end before the sink is flushed or dropped, so the
        // end event is never missed.
        self.monitor.started();
        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(Event::Track(event), self.monitor.clone())
                .map_err(|e| TransportError::Driver(e.to_string()))?;
        }

        Ok(Box::new(SongbirdSink {
            tx: Some(tx),
            carry: None,
            track,
        }))
    }

    async fn wait_for_playback_finish(&self) -> Result<(), TransportError> {
        self.monitor.finished().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TrackStatus {
    Idle,
    Playing,
    Ended,
    Failed(String),
}

/// Follows the last track opened by a transport.
#[derive(Debug, Clone)]
struct TrackMonitor {
    status: Arc<watch::Sender<TrackStatus>>,
}

impl TrackMonitor {
    fn new() -> Self {
        let (status, _) = watch::channel(TrackStatus::Idle);
        Self {
            status: Arc::new(status),
        }
    }

    fn started(&self) {
        self.status.send_replace(TrackStatus::Playing);
    }

    /// Records how the track ended. Only the first report counts.
    fn ended(&self, outcome: Result<(), String>) {
        self.status.send_if_modified(|status| {
            if *status != TrackStatus::Playing {
                return false;
            }
            *status = match outcome {
                Ok(()) => TrackStatus::Ended,
                Err(reason) => TrackStatus::Failed(reason),
            };
            true
        });
    }

    async fn finished(&self) -> Result<(), TransportError> {
        let mut rx = self.status.subscribe();
        let status = rx
            .wait_for(|status| *status != TrackStatus::Playing)
            .await
            .map_err(|_| TransportError::Closed)?
            .clone();
        match status {
            TrackStatus::Failed(reason) => Err(TransportError::Driver(reason)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl EventHandler for TrackMonitor {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        // Errored tracks fire both `Error` and `End`; the play mode tells them apart.
        let error = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(e.to_string()),
                _ => None,
            }),
            _ => None,
        };
        self.ended(error.map_or(Ok(()), Err));
        Some(Event::Cancel)
    }
}

/// Something that can cut a live track short.
trait LiveTrack: Send {
    fn stop(&self);
}

impl LiveTrack for TrackHandle {
    fn stop(&self) {
        if let Err(e) = TrackHandle::stop(self) {
            debug!(track = %self.uuid(), "Could not stop the track: {e:?}");
        }
    }
}

struct SongbirdSink<T: LiveTrack = TrackHandle> {
    tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Low byte of a sample split across two writes.
    carry: Option<u8>,

    track: T,
}

#[async_trait]
impl<T: LiveTrack> TransmitSink for SongbirdSink<T> {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        let samples = s16le_to_f32le(&mut self.carry, chunk);
        if samples.is_empty() {
            return Ok(());
        }
        tx.send(samples).await.map_err(|_| TransportError::Closed)
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        // Dropping the sender ends the track once the buffered audio is played.
        self.tx.take();
        debug!("sink flushed");
        Ok(())
    }
}

impl<T: LiveTrack> Drop for SongbirdSink<T> {
    fn drop(&mut self) {
        // An unflushed sink was abandoned; its buffered audio must not outlive it.
        if self.tx.take().is_some() {
            self.track.stop();
        }
    }
}

/// Converts s16le samples into the f32le samples songbird's raw adapter reads.
fn s16le_to_f32le(carry: &mut Option<u8>, chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((chunk.len() / 2 + 1) * 4);
    let mut push = |lo: u8, hi: u8| {
        let sample = f32::from(i16::from_le_bytes([lo, hi])) / 32768.0;
        out.extend_from_slice(&sample.to_le_bytes());
    };

    let mut bytes = chunk;
    if let Some(lo) = carry.take() {
        match bytes.split_first() {
            Some((&hi, rest)) => {
                push(lo, hi);
                bytes = rest;
            }
            None => {
                *carry = Some(lo);
                return out;
            }
        }
    }

    let mut pairs = bytes.chunks_exact(2);
    for pair in &mut pairs {
        push(pair[0], pair[1]);
    }
    *carry = pairs.remainder().first().copied();
    out
}

/// Blocking reader over the chunks sent by a [`SongbirdSink`].
struct PcmStream {
    rx: parking_lot::Mutex<mpsc::Receiver<Vec<u8>>>,
    pending: Vec<u8>,
    pos: usize,
}

impl PcmStream {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx: parking_lot::Mutex::new(rx),
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for PcmStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.pending.len() {
            match self.rx.get_mut().blocking_recv() {
                Some(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Seek for PcmStream {
    fn seek(&mut self, _: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "live PCM streams cannot seek",
        ))
    }
}

impl MediaSource for PcmStream {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
