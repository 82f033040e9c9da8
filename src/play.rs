use std::{path::PathBuf, sync::Arc, time::Duration};

use serenity::prelude::TypeMapKey;
use tracing::{info, warn};

use crate::{
    decoder::{DecodeError, DecodeRequest, Decoder, DecoderProcess, FRAME_BYTES, SAMPLE_RATE_HZ},
    relay::{AudioRelay, RelayError},
    session::{PlaybackGuard, PlaybackSession},
    transport::{TransportError, VoiceTransport},
};

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("file `{}` does not exist", .0.display())]
    FileNotFound(PathBuf),

    #[error(transparent)]
    DecoderLaunch(DecodeError),

    #[error(transparent)]
    Playback(#[from] RelayError),

    #[error("playback was stopped")]
    Cancelled,

    #[error("playback exceeded {}", humantime::format_duration(*.0))]
    TimedOut(Duration),
}

impl PlaybackError {
    /// Short category shown next to the message in failure notices.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileNotFound(_) => "FileNotFound",
            Self::DecoderLaunch(_) => "DecoderLaunch",
            Self::Playback(RelayError::DecodeRead(_)) => "DecodeRead",
            Self::Playback(RelayError::TransportWrite(_)) => "TransportWrite",
            Self::Cancelled => "Cancelled",
            Self::TimedOut(_) => "TimedOut",
        }
    }
}

impl From<TransportError> for PlaybackError {
    fn from(e: TransportError) -> Self {
        Self::Playback(e.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    pub name: String,
    pub bytes: u64,
}

impl PlaybackReport {
    /// Length of the relayed audio, to the millisecond.
    pub fn duration(&self) -> Duration {
        let frames_per_milli = u64::from(SAMPLE_RATE_HZ) / 1000;
        Duration::from_millis(self.bytes / FRAME_BYTES as u64 / frames_per_milli)
    }

    /// e.g. "`two.wav` (2s)"
    pub fn summary(&self) -> String {
        format!(
            "`{}` ({})",
            self.name,
            humantime::format_duration(self.duration())
        )
    }
}

/// Runs play requests: existence check, session gate, decoder, relay.
#[derive(Debug, Clone, Default)]
pub struct Player {
    decoder: Decoder,
}

impl Player {
    pub fn new(decoder: Decoder) -> Self {
        Self { decoder }
    }

    /// Checks the source, waits for the session and launches the decoder.
    ///
    /// Nothing is spawned and the session is left untouched when the source
    /// does not exist.
    #[tracing::instrument(skip(self, session), fields(destination = %session.destination()))]
    pub async fn prepare(
        &self,
        request: DecodeRequest,
        session: &PlaybackSession,
    ) -> Result<PendingPlayback, PlaybackError> {
        if !request.is_readable().await {
            return Err(PlaybackError::FileNotFound(request.source_path().into()));
        }

        if session.is_playing() {
            info!("waiting for the current playback to finish");
        }
        let guard = session.begin().await;
        let decoder = self
            .decoder
            .spawn(&request)
            .map_err(PlaybackError::DecoderLaunch)?;

        Ok(PendingPlayback {
            request,
            decoder,
            guard,
        })
    }

    pub async fn play<T>(
        &self,
        request: DecodeRequest,
        session: &PlaybackSession,
        transport: Arc<T>,
    ) -> Result<PlaybackReport, PlaybackError>
    where
        T: VoiceTransport + ?Sized + 'static,
    {
        self.prepare(request, session).await?.run(transport).await
    }
}

impl TypeMapKey for Player {
    type Value = Arc<Self>;
}

/// A request that holds its session and has a running decoder.
#[derive(Debug)]
pub struct PendingPlayback {
    request: DecodeRequest,
    decoder: DecoderProcess,
    guard: PlaybackGuard,
}

impl PendingPlayback {
    pub fn request(&self) -> &DecodeRequest {
        &self.request
    }

    pub async fn run<T>(self, transport: Arc<T>) -> Result<PlaybackReport, PlaybackError>
    where
        T: VoiceTransport + ?Sized + 'static,
    {
        let Self {
            request,
            mut decoder,
            guard,
        } = self;

        match AudioRelay::new(transport).run(&mut decoder, guard).await {
            Ok(bytes) => {
                let report = PlaybackReport {
                    name: request.display_name(),
                    bytes,
                };
                info!(name = %report.name, bytes, "finished playing");
                Ok(report)
            }
            Err(e) => {
                warn!("Playback of {:?} failed: {e:?}", request.source_path());
                decoder.terminate().await;
                Err(e.into())
            }
        }
    }
}
