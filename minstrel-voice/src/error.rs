//! Error types for the voice transport and audio pipeline
//!
//! Transport send errors are non-fatal to a session (one dropped packet is
//! inaudible); handshake errors are fatal to session setup; a spawn error
//! is fatal to a single `play()` call and leaves the pipeline idle.

use std::fmt;
use std::io;

/// Errors from the UDP voice transport
#[derive(Debug)]
pub enum TransportError {
    /// Socket creation or connect failed
    Socket(io::Error),
    /// Sending a datagram failed
    Send(io::Error),
    /// No discovery response arrived within the timeout
    DiscoveryTimeout,
    /// The peer sent a malformed handshake packet
    Protocol(&'static str),
    /// Packet encryption failed
    Crypto,
    /// The transport is not connected or has no secret key yet
    NotReady,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Socket(e) => write!(f, "socket error: {}", e),
            TransportError::Send(e) => write!(f, "send error: {}", e),
            TransportError::DiscoveryTimeout => write!(f, "endpoint discovery timed out"),
            TransportError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            TransportError::Crypto => write!(f, "packet encryption failed"),
            TransportError::NotReady => write!(f, "transport not ready"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Socket(e) | TransportError::Send(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from starting playback
#[derive(Debug)]
pub enum PipelineError {
    /// The decoder subprocess could not be spawned
    Spawn(io::Error),
    /// The Opus encoder could not be created or configured
    Encoder(opus::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Spawn(e) => write!(f, "failed to spawn decoder: {}", e),
            PipelineError::Encoder(e) => write!(f, "encoder error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Spawn(e) => Some(e),
            PipelineError::Encoder(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::DiscoveryTimeout.to_string(),
            "endpoint discovery timed out"
        );
        assert_eq!(TransportError::NotReady.to_string(), "transport not ready");
        assert_eq!(
            TransportError::Protocol("bad reply").to_string(),
            "protocol error: bad reply"
        );
    }

    #[test]
    fn test_transport_error_source() {
        use std::error::Error;

        let err = TransportError::Socket(io::Error::other("boom"));
        assert!(err.source().is_some());
        assert!(TransportError::Crypto.source().is_none());
    }

    #[test]
    fn test_pipeline_error_display() {
        let err = PipelineError::Spawn(io::Error::new(io::ErrorKind::NotFound, "no ffmpeg"));
        assert!(err.to_string().contains("failed to spawn decoder"));
    }
}
