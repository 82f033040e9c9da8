use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    process::{ExitStatus, Stdio},
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf},
    process::{Child, ChildStdout, Command},
};
use tracing::{debug, warn, Instrument};

use crate::relay::PcmSource;

pub const DEFAULT_DECODER: &str = "ffmpeg";
pub const SAMPLE_RATE_HZ: u32 = 48_000;
pub const CHANNEL_COUNT: u32 = 2;
pub const BYTES_PER_SAMPLE: u32 = 2;

/// Size of one interleaved stereo s16le frame.
pub const FRAME_BYTES: usize = (CHANNEL_COUNT * BYTES_PER_SAMPLE) as usize;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read decoder output: {0}")]
    Read(#[from] io::Error),

    #[error("decoder exited with {0}")]
    Exited(ExitStatus),

    #[error("decoder output ended mid-frame after {0} bytes")]
    Truncated(u64),
}

/// One invocation of the `play` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeRequest {
    source_path: PathBuf,
}

impl DecodeRequest {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// File name shown to users; falls back to the full path.
    pub fn display_name(&self) -> String {
        self.source_path
            .file_name()
            .map_or_else(
                || self.source_path.to_string_lossy(),
                |name| name.to_string_lossy(),
            )
            .into_owned()
    }

    /// Whether the source is an existing file that can be opened for reading.
    pub async fn is_readable(&self) -> bool {
        match tokio::fs::File::open(&self.source_path).await {
            Ok(file) => file.metadata().await.map_or(false, |m| m.is_file()),
            Err(_) => false,
        }
    }
}

/// Launches the external decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoder {
    program: PathBuf,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_DECODER)
    }
}

impl Decoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, request: &DecodeRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-i")
            .arg(request.source_path())
            .args(["-ac", "2", "-f", "s16le", "-ar", "48000", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    #[tracing::instrument(skip(self), fields(program = %self.program.display()))]
    pub fn spawn(&self, request: &DecodeRequest) -> Result<DecoderProcess, DecodeError> {
        let launch_error = |source| DecodeError::Launch {
            program: self.program.to_string_lossy().into_owned(),
            source,
        };

        let mut child = self.command(request).spawn().map_err(launch_error)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            launch_error(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "decoder stdout was not captured",
            ))
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(
                async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!("{line}");
                    }
                }
                .instrument(tracing::debug_span!("decoder_stderr")),
            );
        }

        debug!(pid = child.id(), "decoder started");
        Ok(DecoderProcess { child, stdout })
    }
}

/// A running decoder whose stdout carries the PCM stream.
///
/// Dropping it kills the process.
#[derive(Debug)]
pub struct DecoderProcess {
    child: Child,
    stdout: ChildStdout,
}

impl DecoderProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kills the process and reaps it.
    pub async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            // Usually means the process had already exited.
            debug!("Could not kill the decoder: {e:?}");
        }
    }
}

impl AsyncRead for DecoderProcess {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

#[async_trait]
impl PcmSource for DecoderProcess {
    async fn finish(&mut self) -> Result<(), DecodeError> {
        let status = self.child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            warn!(%status, "decoder did not exit cleanly");
            Err(DecodeError::Exited(status))
        }
    }
}

#[cfg(test)]
mod test {
    use std::ffi::OsStr;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn test_command_requests_stereo_s16le_at_48khz() {
        let decoder = Decoder::default();
        let command = decoder.command(&DecodeRequest::new("/music/a b.mp3"));
        let command = command.as_std();
        assert_eq!(command.get_program(), OsStr::new("ffmpeg"));
        assert_eq!(
            command.get_args().collect::<Vec<_>>(),
            [
                "-i",
                "/music/a b.mp3",
                "-ac",
                "2",
                "-f",
                "s16le",
                "-ar",
                "48000",
                "pipe:1"
            ]
            .map(OsStr::new)
        );
    }

    #[test]
    fn test_display_name() {
        assert_eq!(
            DecodeRequest::new("/music/song.mp3").display_name(),
            "song.mp3"
        );
        assert_eq!(DecodeRequest::new("song.mp3").display_name(), "song.mp3");
        assert_eq!(DecodeRequest::new("/").display_name(), "/");
    }

    #[tokio::test]
    async fn test_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.wav");
        std::fs::write(&file, b"RIFF").unwrap();
        assert!(DecodeRequest::new(&file).is_readable().await);
        assert!(!DecodeRequest::new(dir.path().join("missing.wav")).is_readable().await);
        assert!(!DecodeRequest::new(dir.path()).is_readable().await);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_launch() {
        let decoder = Decoder::new("/nonexistent/ffmpeg");
        let err = decoder
            .spawn(&DecodeRequest::new("missing.wav"))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Launch { .. }), "{err:?}");
    }

    /// `sh -i <script> ...` runs the script, so `sh` can stand in for the decoder.
    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> DecodeRequest {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        DecodeRequest::new(path)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let request = script(dir.path(), "ok.sh", "head -c 3840 /dev/zero\n");
        let mut process = Decoder::new("sh").spawn(&request).unwrap();
        assert!(process.id().is_some());

        let mut out = Vec::new();
        process.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 3840);
        process.finish().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let request = script(dir.path(), "fail.sh", "head -c 6 /dev/zero\nexit 1\n");
        let mut process = Decoder::new("sh").spawn(&request).unwrap();

        let mut out = Vec::new();
        process.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 6);
        let err = process.finish().await.unwrap_err();
        assert!(matches!(err, DecodeError::Exited(status) if !status.success()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_long_running_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let request = script(dir.path(), "slow.sh", "sleep 30\n");
        let mut process = Decoder::new("sh").spawn(&request).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), process.terminate())
            .await
            .unwrap();
        assert!(process.finish().await.is_err());
    }
}
