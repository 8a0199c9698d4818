//! UDP voice transport
//!
//! Owns the UDP socket for one voice session: performs endpoint discovery,
//! tracks RTP sequence/timestamp state, and encrypts and sends audio frames.
//!
//! ## Packet Flow
//!
//! 1. Session controller calls `connect` with the server assignment
//! 2. `discover_endpoint` learns our externally visible IP/port (NAT)
//! 3. Controller supplies the session key via `set_secret_key`
//! 4. The audio pipeline calls `send_audio_frame` once per 20ms frame
//!
//! Every datagram is `header ‖ ciphertext ‖ tag`: a 12-byte RTP header in
//! the clear, followed by the XChaCha20-Poly1305 ciphertext of the Opus
//! frame with the header as associated data. The 24-byte nonce is the
//! header itself, zero-filled to length, so the receiver can reconstruct
//! it without extra bytes on the wire.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};

use minstrel_common::session::{SecretKey, VoiceServerInfo};
use minstrel_common::voice::{
    CRYPTO_NONCE_SIZE, DISCOVERY_PACKET_SIZE, DiscoveredEndpoint, RTP_HEADER_SIZE, RtpHeader,
    SILENCE_FRAME, SILENCE_FRAME_COUNT, TIMESTAMP_STEP, discovery_request,
};

use crate::error::TransportError;

/// How long to wait for an endpoint-discovery response
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// UDP voice transport for one session
///
/// Not thread-safe by itself; the session controller and audio pipeline
/// share it behind a mutex, with the pipeline's send loop as the only
/// caller of `send_audio_frame`.
pub struct VoiceTransport {
    /// Connected UDP socket, present once `connect` succeeds
    socket: Option<UdpSocket>,
    /// Externally visible endpoint, present once discovery succeeds
    external_endpoint: Option<DiscoveredEndpoint>,
    /// Per-packet cipher, present once the secret key is supplied
    cipher: Option<XChaCha20Poly1305>,
    /// Synchronization source identifier assigned at connect time
    ssrc: u32,
    /// RTP sequence number for the next packet
    sequence: u16,
    /// RTP timestamp for the next packet (48kHz samples)
    timestamp: u32,
}

impl VoiceTransport {
    /// Create a disconnected transport
    pub fn new() -> Self {
        Self {
            socket: None,
            external_endpoint: None,
            cipher: None,
            ssrc: 0,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Open a UDP socket and connect it to the assigned voice server
    ///
    /// Connecting the socket makes the OS drop datagrams from other
    /// sources. Resets the sequence and timestamp counters; does not
    /// touch the secret key.
    pub fn connect(&mut self, info: &VoiceServerInfo) -> Result<(), TransportError> {
        let server_addr = resolve(&info.ip, info.port)?;

        let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(TransportError::Socket)?;
        socket.connect(server_addr).map_err(TransportError::Socket)?;

        self.socket = Some(socket);
        self.external_endpoint = None;
        self.ssrc = info.ssrc;
        self.sequence = 0;
        self.timestamp = 0;
        Ok(())
    }

    /// Discover our externally visible IP/port through the voice server
    ///
    /// Sends the 74-byte discovery request and blocks up to 5 seconds for
    /// the response. Must be called after `connect`.
    pub fn discover_endpoint(&mut self) -> Result<DiscoveredEndpoint, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotReady)?;

        let request = discovery_request(self.ssrc);
        socket.send(&request).map_err(TransportError::Send)?;

        socket
            .set_read_timeout(Some(DISCOVERY_TIMEOUT))
            .map_err(TransportError::Socket)?;

        // One extra byte so an oversized reply is seen as oversized
        // rather than silently truncated to 74 bytes.
        let mut reply = [0u8; DISCOVERY_PACKET_SIZE + 1];
        let result = socket.recv(&mut reply);
        let _ = socket.set_read_timeout(None);

        let len = match result {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(TransportError::DiscoveryTimeout);
            }
            Err(e) => return Err(TransportError::Socket(e)),
        };

        let endpoint = DiscoveredEndpoint::from_bytes(&reply[..len])
            .ok_or(TransportError::Protocol("malformed discovery response"))?;

        self.external_endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    /// Store the session secret key
    ///
    /// Any 32 bytes are accepted; the key comes from a handshake outside
    /// this component's control.
    pub fn set_secret_key(&mut self, key: SecretKey) {
        self.cipher = Some(XChaCha20Poly1305::new(Key::from_slice(&key)));
    }

    /// Whether the socket is connected to a voice server
    pub fn connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Whether audio frames can be sent (connected and key supplied)
    pub fn ready(&self) -> bool {
        self.socket.is_some() && self.cipher.is_some()
    }

    /// The externally visible endpoint learned by discovery, if any
    pub fn external_endpoint(&self) -> Option<&DiscoveredEndpoint> {
        self.external_endpoint.as_ref()
    }

    /// SSRC assigned at connect time
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp the next packet will carry
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Build the RTP header for the next packet from the current counters
    ///
    /// Pure; the counters only advance after a successful send.
    pub fn build_rtp_header(&self) -> RtpHeader {
        RtpHeader {
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        }
    }

    /// Encrypt a payload under the session key with `header` as AAD
    ///
    /// The nonce is the 12-byte header zero-filled to 24 bytes. Returns
    /// ciphertext with the 16-byte authentication tag appended.
    pub fn encrypt(
        &self,
        header: &[u8; RTP_HEADER_SIZE],
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let cipher = self.cipher.as_ref().ok_or(TransportError::NotReady)?;

        let mut nonce = [0u8; CRYPTO_NONCE_SIZE];
        nonce[..RTP_HEADER_SIZE].copy_from_slice(header);

        cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: payload,
                    aad: header,
                },
            )
            .map_err(|_| TransportError::Crypto)
    }

    /// Encrypt and send one audio frame as a single datagram
    ///
    /// Advances the sequence (by 1) and timestamp (by 960) counters only
    /// on a successful send, so the receiver never sees a gap for a frame
    /// that was never transmitted.
    pub fn send_audio_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.ready() {
            return Err(TransportError::NotReady);
        }

        let header = self.build_rtp_header().to_bytes();
        let ciphertext = self.encrypt(&header, payload)?;

        let mut datagram = Vec::with_capacity(RTP_HEADER_SIZE + ciphertext.len());
        datagram.extend_from_slice(&header);
        datagram.extend_from_slice(&ciphertext);

        let socket = self.socket.as_ref().ok_or(TransportError::NotReady)?;
        socket.send(&datagram).map_err(TransportError::Send)?;

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(TIMESTAMP_STEP);
        Ok(())
    }

    /// Send the 5-frame silence burst that marks end of speech
    ///
    /// Stops at the first failed send and returns that error.
    pub fn send_silence(&mut self) -> Result<(), TransportError> {
        for _ in 0..SILENCE_FRAME_COUNT {
            self.send_audio_frame(&SILENCE_FRAME)?;
        }
        Ok(())
    }

    /// Release the socket and forget the session key
    ///
    /// Idempotent; a later `connect` starts a fresh session.
    pub fn close(&mut self) {
        self.socket = None;
        self.cipher = None;
        self.external_endpoint = None;
    }
}

impl Default for VoiceTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a server host/port pair to a socket address
fn resolve(ip: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (ip, port)
        .to_socket_addrs()
        .map_err(TransportError::Socket)?
        .next()
        .ok_or(TransportError::Socket(io::Error::new(
            io::ErrorKind::InvalidInput,
            "server address did not resolve",
        )))
}

// Test-only counter seeding, for exercising wraparound without sending
// tens of thousands of frames
#[cfg(test)]
impl VoiceTransport {
    fn seed_counters(&mut self, sequence: u16, timestamp: u32) {
        self.sequence = sequence;
        self.timestamp = timestamp;
    }
}
