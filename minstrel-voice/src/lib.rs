//! Minstrel Voice Library
//!
//! The real-time voice transmission path of the Minstrel bot: an audio
//! pipeline that decodes a media source through an external ffmpeg process,
//! Opus-encodes one 20ms frame at a time, and drives a UDP voice transport
//! that encrypts and paces RTP packets to the voice server.
//!
//! The session controller wires the two halves together: it calls
//! [`VoiceTransport::connect`] and [`VoiceTransport::set_secret_key`] as
//! session negotiation progresses, then hands the transport to an
//! [`AudioPipeline`] and issues play/pause/stop commands on user request.

pub mod error;
pub mod pipeline;
pub mod transport;

pub use error::{PipelineError, TransportError};
pub use pipeline::{AudioPipeline, PlaybackConfig, PlaybackState, VoiceEvent};
pub use transport::VoiceTransport;
