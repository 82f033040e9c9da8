use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    runtime::Handle,
};
use tracing::{debug, warn};

use crate::{
    decoder::{DecodeError, FRAME_BYTES},
    session::PlaybackGuard,
    transport::{TransportError, VoiceTransport},
};

/// A finite, non-restartable stream of interleaved stereo s16le PCM.
#[async_trait]
pub trait PcmSource: AsyncRead + Unpin + Send {
    /// Called after end-of-stream. Fails if the stream did not end cleanly.
    async fn finish(&mut self) -> Result<(), DecodeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    DecodeRead(#[from] DecodeError),

    #[error(transparent)]
    TransportWrite(#[from] TransportError),
}

/// Copies a [`PcmSource`] into a destination's voice sink.
pub struct AudioRelay<T: ?Sized> {
    transport: Arc<T>,
}

impl<T> AudioRelay<T>
where
    T: VoiceTransport + ?Sized + 'static,
{
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Returns the number of bytes written.
    #[tracing::instrument(skip_all, fields(destination = %session.destination()))]
    pub async fn run<S: PcmSource>(
        &self,
        source: &mut S,
        session: PlaybackGuard,
    ) -> Result<u64, RelayError> {
        let speaking = SpeakingGuard::new(Arc::clone(&self.transport));
        let result = self.transmit(source).await;
        let cleared = speaking.release().await;
        drop(session);

        let written = result?;
        cleared?;
        debug!(written, "relay finished");
        Ok(written)
    }

    async fn transmit<S: PcmSource>(&self, source: &mut S) -> Result<u64, RelayError> {
        self.transport.set_speaking(true).await?;
        let mut sink = self.transport.open_sink().await?;

        let mut buf = vec![0; sink.chunk_size().max(FRAME_BYTES)];
        let mut written = 0u64;
        loop {
            let n = source.read(&mut buf).await.map_err(DecodeError::from)?;
            if n == 0 {
                break;
            }
            sink.write(&buf[..n]).await?;
            written += n as u64;
        }

        source.finish().await?;
        if written % FRAME_BYTES as u64 != 0 {
            return Err(DecodeError::Truncated(written).into());
        }

        sink.flush().await?;
        self.transport.wait_for_playback_finish().await?;
        Ok(written)
    }
}

struct SpeakingGuard<T: VoiceTransport + ?Sized + 'static> {
    transport: Option<Arc<T>>,
}

impl<T: VoiceTransport + ?Sized + 'static> SpeakingGuard<T> {
    fn new(transport: Arc<T>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    async fn release(mut self) -> Result<(), TransportError> {
        match self.transport.take() {
            Some(transport) => transport.set_speaking(false).await,
            None => Ok(()),
        }
    }
}

impl<T: VoiceTransport + ?Sized + 'static> Drop for SpeakingGuard<T> {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.set_speaking(false).await {
                        warn!("Failed to clear the speaking state: {e:?}");
                    }
                });
            }
            Err(_) => warn!("No runtime left to clear the speaking state"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use serenity::model::id::GuildId;
    use tokio::io::{AsyncWriteExt, ReadBuf};

    use super::*;
    use crate::{
        session::{PlaybackSession, SessionState},
        transport::mock::{Recorded, RecordingTransport},
    };

    struct TestSource<R>(R);

    impl<R: AsyncRead + Unpin> AsyncRead for TestSource<R> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    #[async_trait]
    impl<R: AsyncRead + Unpin + Send> PcmSource for TestSource<R> {
        async fn finish(&mut self) -> Result<(), DecodeError> {
            Ok(())
        }
    }

    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "decoder died")))
        }
    }

    /// The sink must be stopped before the next request can take the session.
    fn assert_abandoned_before_silence(log: &[Recorded]) {
        let abandoned = log.iter().position(|r| *r == Recorded::Abandoned).unwrap();
        let silent = log
            .iter()
            .position(|r| *r == Recorded::Speaking(false))
            .unwrap();
        assert!(abandoned < silent);
    }

    #[tokio::test]
    async fn test_relay_two_seconds_of_audio() {
        let session = PlaybackSession::new(GuildId::new(1));
        let transport = Arc::new(RecordingTransport::new());
        let relay = AudioRelay::new(Arc::clone(&transport));

        let pcm = vec![7u8; 2 * 48_000 * 2 * 2];
        let mut source = TestSource(&pcm[..]);
        let written = relay.run(&mut source, session.begin().await).await.unwrap();

        assert_eq!(written, 384_000);
        assert_eq!(transport.written(), pcm);
        assert_eq!(transport.speaking(), vec![true, false]);

        let log = transport.log();
        assert_eq!(log.first(), Some(&Recorded::Speaking(true)));
        assert_eq!(
            &log[log.len() - 3..],
            &[
                Recorded::Flush,
                Recorded::Drained,
                Recorded::Speaking(false)
            ]
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_write_failure_still_releases_session() {
        let session = PlaybackSession::new(GuildId::new(1));
        let transport = Arc::new(RecordingTransport::failing_after(2));
        let relay = AudioRelay::new(Arc::clone(&transport));

        let pcm = vec![0u8; 10 * 3840];
        let err = relay
            .run(&mut TestSource(&pcm[..]), session.begin().await)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::TransportWrite(TransportError::Closed)));
        assert_eq!(transport.written().len(), 2 * 3840);
        assert_eq!(transport.speaking(), vec![true, false]);
        assert!(!transport.log().contains(&Recorded::Flush));
        assert_abandoned_before_silence(&transport.log());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_read_failure_is_a_decode_error() {
        let session = PlaybackSession::new(GuildId::new(1));
        let transport = Arc::new(RecordingTransport::new());
        let relay = AudioRelay::new(Arc::clone(&transport));

        let err = relay
            .run(&mut TestSource(BrokenReader), session.begin().await)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::DecodeRead(DecodeError::Read(_))));
        assert_eq!(transport.speaking(), vec![true, false]);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_partial_frame_is_truncated_output() {
        let session = PlaybackSession::new(GuildId::new(1));
        let transport = Arc::new(RecordingTransport::new());
        let relay = AudioRelay::new(Arc::clone(&transport));

        let err = relay
            .run(&mut TestSource(&[1u8; 7][..]), session.begin().await)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::DecodeRead(DecodeError::Truncated(7))));
        assert_eq!(transport.speaking(), vec![true, false]);
        assert!(!transport.log().contains(&Recorded::Flush));
        assert_abandoned_before_silence(&transport.log());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_overlapping_requests_do_not_interleave() {
        let session = Arc::new(PlaybackSession::new(GuildId::new(1)));
        let transport = RecordingTransport::new();

        let (mut writer, reader) = tokio::io::duplex(64);
        let first = {
            let guard = session.begin().await;
            let relay = AudioRelay::new(Arc::new(transport.clone()));
            tokio::spawn(async move { relay.run(&mut TestSource(reader), guard).await })
        };
        let second = {
            let session = Arc::clone(&session);
            let relay = AudioRelay::new(Arc::new(transport.clone()));
            tokio::spawn(async move {
                let guard = session.begin().await;
                relay.run(&mut TestSource(&[2u8; 64][..]), guard).await
            })
        };

        for _ in 0..4 {
            writer.write_all(&[1u8; 16]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(writer);

        assert_eq!(first.await.unwrap().unwrap(), 64);
        assert_eq!(second.await.unwrap().unwrap(), 64);

        let written = transport.written();
        assert_eq!(written.len(), 128);
        assert!(written[..64].iter().all(|b| *b == 1));
        assert!(written[64..].iter().all(|b| *b == 2));

        let speaking = transport.speaking();
        assert_eq!(speaking, vec![true, false, true, false]);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_relay_clears_speaking_and_session() {
        let session = PlaybackSession::new(GuildId::new(1));
        let transport = Arc::new(RecordingTransport::new());
        let relay = AudioRelay::new(Arc::clone(&transport));

        // The writer half is kept open, so the relay never sees end-of-stream.
        let (_writer, reader) = tokio::io::duplex(64);
        let mut source = TestSource(reader);
        let guard = session.begin().await;
        let res =
            tokio::time::timeout(Duration::from_millis(50), relay.run(&mut source, guard)).await;
        assert!(res.is_err());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(transport.log().contains(&Recorded::Abandoned));

        // The speaking reset is spawned from `Drop`.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.speaking(), vec![true, false]);
    }
}
