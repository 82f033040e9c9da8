pub mod command;
pub mod config;
pub mod decoder;
pub mod play;
pub mod relay;
pub mod session;
pub mod transport;

pub use config::{ConfigFile, Settings};
pub use decoder::{DecodeError, DecodeRequest, Decoder};
pub use play::{PlaybackError, Player};
pub use relay::{AudioRelay, PcmSource, RelayError};
pub use session::{PlaybackSession, PlaybackSessions, SessionState};
pub use transport::{SongbirdTransport, TransportError, VoiceTransport};
