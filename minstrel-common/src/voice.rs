//! Voice wire formats for UDP audio transmission
//!
//! This module defines the binary formats the voice transport puts on the
//! wire: the 12-byte RTP header prefixing every audio datagram and the
//! 74-byte endpoint-discovery handshake packets. Audio frames are sent at
//! 50 packets/second with Opus-encoded audio.

use serde::{Deserialize, Serialize};

// =============================================================================
// Audio Constants
// =============================================================================

/// Sample rate for voice audio (48kHz, required by Opus)
pub const VOICE_SAMPLE_RATE: u32 = 48000;

/// Frame duration in milliseconds (20ms is standard for voice)
pub const VOICE_FRAME_DURATION_MS: u32 = 20;

/// Number of samples per frame per channel at 48kHz with 20ms frames
pub const VOICE_SAMPLES_PER_FRAME: u32 = VOICE_SAMPLE_RATE * VOICE_FRAME_DURATION_MS / 1000;

/// Number of audio channels (stereo)
pub const VOICE_CHANNELS: u16 = 2;

/// Interleaved i16 samples in one PCM frame (960 samples x 2 channels)
pub const PCM_FRAME_SAMPLES: usize =
    VOICE_SAMPLES_PER_FRAME as usize * VOICE_CHANNELS as usize;

/// Size of one raw PCM frame in bytes (16-bit little-endian samples)
pub const PCM_FRAME_SIZE: usize = PCM_FRAME_SAMPLES * 2;

/// RTP timestamp increment per frame (one frame's sample count)
pub const TIMESTAMP_STEP: u32 = VOICE_SAMPLES_PER_FRAME;

// =============================================================================
// RTP Header
// =============================================================================

/// RTP header size in bytes
pub const RTP_HEADER_SIZE: usize = 12;

/// First RTP header byte: version 2, no padding, no extension, no CSRC
pub const RTP_VERSION_BYTE: u8 = 0x80;

/// Second RTP header byte: fixed payload type tag for Opus audio
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;

// =============================================================================
// Encryption Constants
// =============================================================================

/// Session secret key size in bytes (supplied by the session controller)
pub const CRYPTO_KEY_SIZE: usize = 32;

/// AEAD nonce size in bytes (RTP header plus zero fill)
pub const CRYPTO_NONCE_SIZE: usize = 24;

/// AEAD authentication tag size in bytes, appended to every ciphertext
pub const CRYPTO_TAG_SIZE: usize = 16;

// =============================================================================
// Silence
// =============================================================================

/// The Opus silence frame, sent to flush the decoder at end of speech
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Number of silence frames sent when a track ends
pub const SILENCE_FRAME_COUNT: usize = 5;

// =============================================================================
// Endpoint Discovery
// =============================================================================

/// Total size of a discovery request or response packet
pub const DISCOVERY_PACKET_SIZE: usize = 74;

/// Packet type for a discovery request (big-endian, bytes 0-1)
pub const DISCOVERY_REQUEST_TYPE: u16 = 0x0001;

/// Packet type for a discovery response (big-endian, bytes 0-1)
pub const DISCOVERY_RESPONSE_TYPE: u16 = 0x0002;

/// Value of the payload-length field (big-endian, bytes 2-3)
pub const DISCOVERY_PAYLOAD_LEN: u16 = 70;

/// Offset of the NUL-terminated IP string field in a discovery response
const DISCOVERY_IP_OFFSET: usize = 8;

/// Offset of the big-endian port in a discovery response
const DISCOVERY_PORT_OFFSET: usize = 72;

// =============================================================================
// Encoder Bitrate
// =============================================================================

/// Opus encoder bitrate presets (bits per second)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncoderBitrate {
    /// Voice quality: 64 kbps - spoken-word sources
    Voice = 64000,
    /// Music quality: 128 kbps - recommended default
    #[default]
    Music = 128000,
}

impl EncoderBitrate {
    /// Get the bitrate in bits per second
    pub fn bitrate(self) -> i32 {
        self as i32
    }
}

// =============================================================================
// RTP Header Format
// =============================================================================

/// The 12-byte RTP header prefixing every audio datagram
///
/// Wire format (binary, big-endian):
/// ```text
/// +----------------+----------------+----------------+----------------+
/// |      0x80      |      0x78      |       Sequence (2 bytes)        |
/// +----------------+----------------+----------------+----------------+
/// |                         Timestamp (4 bytes)                       |
/// +----------------+----------------+----------------+----------------+
/// |                           SSRC (4 bytes)                          |
/// +----------------+----------------+----------------+----------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Sequence number, incremented once per sent packet (wrapping)
    pub sequence: u16,
    /// Timestamp in samples at 48kHz, incremented by 960 per sent packet
    pub timestamp: u32,
    /// Synchronization source identifier for this sender's stream
    pub ssrc: u32,
}

impl RtpHeader {
    /// Serialize the header to its 12-byte wire form
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_SIZE] {
        let mut bytes = [0u8; RTP_HEADER_SIZE];
        bytes[0] = RTP_VERSION_BYTE;
        bytes[1] = RTP_PAYLOAD_TYPE;
        bytes[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        bytes
    }

    /// Deserialize a header from bytes
    ///
    /// Returns `None` if the slice is too short or the fixed version and
    /// payload-type bytes don't match.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RTP_HEADER_SIZE {
            return None;
        }

        if bytes[0] != RTP_VERSION_BYTE || bytes[1] != RTP_PAYLOAD_TYPE {
            return None;
        }

        let sequence = u16::from_be_bytes([bytes[2], bytes[3]]);
        let timestamp = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let ssrc = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        Some(Self {
            sequence,
            timestamp,
            ssrc,
        })
    }
}

// =============================================================================
// Endpoint Discovery Format
// =============================================================================

/// Build a 74-byte endpoint-discovery request
///
/// Wire format (binary, big-endian):
/// ```text
/// +----------------+----------------+----------------+----------------+
/// |       Type 0x0001 (2 bytes)     |      Length 70 (2 bytes)        |
/// +----------------+----------------+----------------+----------------+
/// |                           SSRC (4 bytes)                          |
/// +----------------+----------------+----------------+----------------+
/// |                      Zero padding (66 bytes)                      |
/// +----------------+----------------+----------------+----------------+
/// ```
pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut bytes = [0u8; DISCOVERY_PACKET_SIZE];
    bytes[0..2].copy_from_slice(&DISCOVERY_REQUEST_TYPE.to_be_bytes());
    bytes[2..4].copy_from_slice(&DISCOVERY_PAYLOAD_LEN.to_be_bytes());
    bytes[4..8].copy_from_slice(&ssrc.to_be_bytes());
    bytes
}

/// The sender's externally visible endpoint, as reported by the voice server
///
/// Response wire format mirrors the request, with the SSRC echoed back,
/// a NUL-terminated IP string at bytes 8-71, and a big-endian port at
/// bytes 72-73.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    /// Externally visible IP address string
    pub ip: String,
    /// Externally visible UDP port
    pub port: u16,
}

impl DiscoveredEndpoint {
    /// Serialize a discovery response carrying this endpoint
    ///
    /// Used by the server side of the handshake; the IP string is
    /// truncated to the 63 bytes the field can hold.
    pub fn to_bytes(&self, ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
        let mut bytes = [0u8; DISCOVERY_PACKET_SIZE];
        bytes[0..2].copy_from_slice(&DISCOVERY_RESPONSE_TYPE.to_be_bytes());
        bytes[2..4].copy_from_slice(&DISCOVERY_PAYLOAD_LEN.to_be_bytes());
        bytes[4..8].copy_from_slice(&ssrc.to_be_bytes());

        let ip_bytes = self.ip.as_bytes();
        let ip_len = ip_bytes.len().min(DISCOVERY_PORT_OFFSET - DISCOVERY_IP_OFFSET - 1);
        bytes[DISCOVERY_IP_OFFSET..DISCOVERY_IP_OFFSET + ip_len]
            .copy_from_slice(&ip_bytes[..ip_len]);

        bytes[DISCOVERY_PORT_OFFSET..].copy_from_slice(&self.port.to_be_bytes());
        bytes
    }

    /// Deserialize a discovery response
    ///
    /// Returns `None` if the packet is not exactly 74 bytes, does not carry
    /// the response type, or the IP field is unterminated or not UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != DISCOVERY_PACKET_SIZE {
            return None;
        }

        let packet_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        if packet_type != DISCOVERY_RESPONSE_TYPE {
            return None;
        }

        let ip_field = &bytes[DISCOVERY_IP_OFFSET..DISCOVERY_PORT_OFFSET];
        let nul = ip_field.iter().position(|&b| b == 0)?;
        let ip = std::str::from_utf8(&ip_field[..nul]).ok()?.to_string();

        let port = u16::from_be_bytes([bytes[DISCOVERY_PORT_OFFSET], bytes[DISCOVERY_PORT_OFFSET + 1]]);

        Some(Self { ip, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        // Verify frame calculations
        assert_eq!(VOICE_SAMPLES_PER_FRAME, 960); // 48000 * 20 / 1000
        assert_eq!(PCM_FRAME_SAMPLES, 1920);
        assert_eq!(PCM_FRAME_SIZE, 3840);
        assert_eq!(TIMESTAMP_STEP, 960);
    }

    #[test]
    fn test_encoder_bitrate_values() {
        assert_eq!(EncoderBitrate::Voice.bitrate(), 64000);
        assert_eq!(EncoderBitrate::Music.bitrate(), 128000);
    }

    #[test]
    fn test_encoder_bitrate_default() {
        assert_eq!(EncoderBitrate::default(), EncoderBitrate::Music);
    }

    #[test]
    fn test_rtp_header_roundtrip() {
        let header = RtpHeader {
            sequence: 42,
            timestamp: 40320,
            ssrc: 0xDEADBEEF,
        };

        let bytes = header.to_bytes();
        let decoded = RtpHeader::from_bytes(&bytes).expect("should decode");

        assert_eq!(decoded, header);
    }

    #[test]
    fn test_rtp_header_byte_layout() {
        let header = RtpHeader {
            sequence: 0x0102,
            timestamp: 0x03040506,
            ssrc: 0x0708090A,
        };

        let bytes = header.to_bytes();

        // Fixed leading bytes
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x78);
        // Sequence at offset 2-3, big-endian
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x02);
        // Timestamp at offset 4-7
        assert_eq!(bytes[4], 0x03);
        assert_eq!(bytes[7], 0x06);
        // SSRC at offset 8-11
        assert_eq!(bytes[8], 0x07);
        assert_eq!(bytes[11], 0x0A);
    }

    #[test]
    fn test_rtp_header_too_short() {
        let bytes = [0x80u8, 0x78, 0, 0, 0, 0, 0, 0];
        assert!(RtpHeader::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_rtp_header_wrong_fixed_bytes() {
        let mut bytes = RtpHeader {
            sequence: 1,
            timestamp: 960,
            ssrc: 7,
        }
        .to_bytes();

        bytes[0] = 0x81;
        assert!(RtpHeader::from_bytes(&bytes).is_none());

        bytes[0] = 0x80;
        bytes[1] = 0x79;
        assert!(RtpHeader::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_discovery_request_layout() {
        let request = discovery_request(0x01020304);

        assert_eq!(request.len(), DISCOVERY_PACKET_SIZE);
        // Type 0x0001 big-endian
        assert_eq!(request[0], 0x00);
        assert_eq!(request[1], 0x01);
        // Length field 70 big-endian
        assert_eq!(request[2], 0x00);
        assert_eq!(request[3], 70);
        // SSRC big-endian
        assert_eq!(&request[4..8], &[0x01, 0x02, 0x03, 0x04]);
        // Zero padding to the end
        assert!(request[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_discovery_response_roundtrip() {
        let endpoint = DiscoveredEndpoint {
            ip: "203.0.113.7".to_string(),
            port: 50042,
        };

        let bytes = endpoint.to_bytes(0xCAFE);
        let decoded = DiscoveredEndpoint::from_bytes(&bytes).expect("should decode");

        assert_eq!(decoded, endpoint);
    }

    #[test]
    fn test_discovery_response_port_big_endian() {
        let endpoint = DiscoveredEndpoint {
            ip: "10.0.0.1".to_string(),
            port: 0x1234,
        };

        let bytes = endpoint.to_bytes(1);
        assert_eq!(bytes[72], 0x12);
        assert_eq!(bytes[73], 0x34);
    }

    #[test]
    fn test_discovery_response_wrong_type() {
        // A request echoed back must not parse as a response
        let request = discovery_request(0xCAFE);
        assert!(DiscoveredEndpoint::from_bytes(&request).is_none());
    }

    #[test]
    fn test_discovery_response_wrong_size() {
        let endpoint = DiscoveredEndpoint {
            ip: "10.0.0.1".to_string(),
            port: 4000,
        };
        let bytes = endpoint.to_bytes(1);

        assert!(DiscoveredEndpoint::from_bytes(&bytes[..73]).is_none());

        let mut long = bytes.to_vec();
        long.push(0);
        assert!(DiscoveredEndpoint::from_bytes(&long).is_none());
    }

    #[test]
    fn test_discovery_response_unterminated_ip() {
        let endpoint = DiscoveredEndpoint {
            ip: "10.0.0.1".to_string(),
            port: 4000,
        };
        let mut bytes = endpoint.to_bytes(1);

        // Fill the whole IP field so no NUL terminator remains
        for byte in bytes[8..72].iter_mut() {
            *byte = b'x';
        }
        assert!(DiscoveredEndpoint::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_discovery_response_long_ip_truncated() {
        let endpoint = DiscoveredEndpoint {
            ip: "x".repeat(100),
            port: 4000,
        };

        let bytes = endpoint.to_bytes(1);
        let decoded = DiscoveredEndpoint::from_bytes(&bytes).expect("should decode");

        // Field holds 63 bytes plus the NUL terminator
        assert_eq!(decoded.ip.len(), 63);
    }

    #[test]
    fn test_silence_frame_bytes() {
        assert_eq!(SILENCE_FRAME, [0xF8, 0xFF, 0xFE]);
        assert_eq!(SILENCE_FRAME_COUNT, 5);
    }
}
