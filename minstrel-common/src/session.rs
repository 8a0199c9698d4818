//! Session parameters handed to the voice transport
//!
//! The gateway/session-negotiation layer obtains these values out of band
//! and passes them in by value. The voice subsystem never reaches into the
//! session layer's own state; this DTO is the entire contract.

use serde::{Deserialize, Serialize};

use crate::voice::CRYPTO_KEY_SIZE;

/// Version of the [`VoiceServerInfo`] contract
///
/// Bumped if fields are added or reinterpreted, so a session layer built
/// against an older contract can detect the mismatch.
pub const VOICE_SERVER_INFO_VERSION: u32 = 1;

/// The 32-byte session secret key, supplied after the session handshake
pub type SecretKey = [u8; CRYPTO_KEY_SIZE];

/// Connection parameters for one voice server assignment
///
/// Produced by the session controller once a voice server is assigned and
/// consumed by `VoiceTransport::connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerInfo {
    /// Voice server IP address or hostname
    pub ip: String,
    /// Voice server UDP port
    pub port: u16,
    /// Synchronization source identifier assigned to this session
    pub ssrc: u32,
}

impl VoiceServerInfo {
    /// Create connection parameters for a voice server assignment
    pub fn new(ip: impl Into<String>, port: u16, ssrc: u32) -> Self {
        Self {
            ip: ip.into(),
            port,
            ssrc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_server_info_new() {
        let info = VoiceServerInfo::new("203.0.113.7", 4000, 0xCAFE);
        assert_eq!(info.ip, "203.0.113.7");
        assert_eq!(info.port, 4000);
        assert_eq!(info.ssrc, 0xCAFE);
    }

    #[test]
    fn test_voice_server_info_serde_roundtrip() {
        let info = VoiceServerInfo::new("voice.example.net", 50000, 42);

        let json = serde_json::to_string(&info).expect("should serialize");
        let decoded: VoiceServerInfo = serde_json::from_str(&json).expect("should deserialize");

        assert_eq!(decoded, info);
    }

    #[test]
    fn test_secret_key_size() {
        let key: SecretKey = [0u8; 32];
        assert_eq!(key.len(), CRYPTO_KEY_SIZE);
    }
}
