//! RLPx frame codec: authenticated encryption of frames.
//!
//! Every frame on the wire is:
//!
//! ```text
//! header-ciphertext (16) || header-mac (16) || body-ciphertext (padded to 16) || body-mac (16)
//! ```
//!
//! The plaintext header is a 24-bit big-endian body size followed by the RLP
//! list `[protocol-id, (sequence-id), (total-packet-size)]`, zero padded.
//! Both directions run one AES-256-CTR keystream for the whole session, and
//! the MAC states chain across every frame, so frames must be written and
//! read strictly in order.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use rlp::{Rlp, RlpStream};
use thiserror::Error;

use crate::crypto::{MacState, SessionSecrets};
use crate::wire::MAX_FRAME_SIZE;

type Aes256Ctr = ctr::Ctr64BE<Aes256>;

pub const HEADER_LEN: usize = 16;
pub const MAC_LEN: usize = 16;

/// Header plus header MAC: what must be read before the body length is known.
pub const HEADER_FRAME_LEN: usize = HEADER_LEN + MAC_LEN;

/// Wire bytes of a frame with an empty body.
pub const EMPTY_FRAME_LEN: usize = HEADER_FRAME_LEN + MAC_LEN;

// ── Header ────────────────────────────────────────────────────────────────────

/// Decrypted frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length before padding.
    pub size: usize,
    pub protocol_id: u16,
    /// Present on every frame of a multi-frame packet.
    pub sequence_id: Option<u16>,
    /// Present only on the first frame of a multi-frame packet.
    pub total_packet_size: Option<u32>,
}

impl FrameHeader {
    /// A frame carrying one or more whole packets.
    pub fn single(protocol_id: u16, size: usize) -> Self {
        Self {
            size,
            protocol_id,
            sequence_id: None,
            total_packet_size: None,
        }
    }

    /// First frame of a packet split across frames.
    pub fn first(protocol_id: u16, size: usize, total_packet_size: u32) -> Self {
        Self {
            size,
            protocol_id,
            sequence_id: Some(0),
            total_packet_size: Some(total_packet_size),
        }
    }

    /// Follow-on frame `sequence_id` of a split packet.
    pub fn continuation(protocol_id: u16, sequence_id: u16, size: usize) -> Self {
        Self {
            size,
            protocol_id,
            sequence_id: Some(sequence_id),
            total_packet_size: None,
        }
    }

    /// Body length on the wire, padding included, MAC excluded.
    pub fn padded_size(&self) -> usize {
        padded_len(self.size)
    }

    /// Bytes that follow the 32-byte header frame: padded body plus body MAC.
    pub fn body_frame_len(&self) -> usize {
        self.padded_size() + MAC_LEN
    }

    fn encode(&self) -> Result<[u8; HEADER_LEN], FrameError> {
        if self.size > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(self.size));
        }
        let items = match (self.sequence_id, self.total_packet_size) {
            (None, _) => 1,
            (Some(_), None) => 2,
            (Some(_), Some(_)) => 3,
        };
        let mut s = RlpStream::new_list(items);
        s.append(&self.protocol_id);
        if let Some(seq) = self.sequence_id {
            s.append(&seq);
        }
        if let (Some(_), Some(total)) = (self.sequence_id, self.total_packet_size) {
            s.append(&total);
        }
        let context = s.out();

        let mut header = [0u8; HEADER_LEN];
        let size = (self.size as u32).to_be_bytes();
        header[..3].copy_from_slice(&size[1..]);
        header[3..3 + context.len()].copy_from_slice(&context);
        Ok(header)
    }

    fn decode(plain: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let size = u32::from_be_bytes([0, plain[0], plain[1], plain[2]]) as usize;

        // The context list is followed by zero padding, which must not be
        // read as further list items.
        let area = &plain[3..];
        let info = Rlp::new(area).payload_info()?;
        let end = info.header_len + info.value_len;
        if end > area.len() {
            return Err(FrameError::MalformedHeader(rlp::DecoderError::RlpIsTooShort));
        }
        let context = Rlp::new(&area[..end]);
        if !context.is_list() {
            return Err(FrameError::MalformedHeader(rlp::DecoderError::RlpExpectedToBeList));
        }
        let items = context.item_count()?;
        let protocol_id: u16 = context.val_at(0)?;
        let sequence_id: Option<u16> = if items >= 2 { Some(context.val_at(1)?) } else { None };
        let total_packet_size: Option<u32> = if items >= 3 { Some(context.val_at(2)?) } else { None };

        Ok(Self {
            size,
            protocol_id,
            sequence_id,
            total_packet_size,
        })
    }
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(16) * 16
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Both directions of a session's frame crypto.
///
/// Sessions split this into an egress half owned by the writer task and an
/// ingress half owned by the reader task.
#[derive(Debug)]
pub struct FrameCodec {
    egress: FrameEgress,
    ingress: FrameIngress,
}

impl FrameCodec {
    pub fn new(secrets: SessionSecrets) -> Self {
        let key = GenericArray::clone_from_slice(secrets.aes_secret.as_bytes());
        let iv = GenericArray::default();
        Self {
            egress: FrameEgress {
                aes: <Aes256Ctr as KeyIvInit>::new(&key, &iv),
                mac: secrets.egress_mac,
            },
            ingress: FrameIngress {
                aes: <Aes256Ctr as KeyIvInit>::new(&key, &iv),
                mac: secrets.ingress_mac,
            },
        }
    }

    pub fn into_split(self) -> (FrameEgress, FrameIngress) {
        (self.egress, self.ingress)
    }

    pub fn egress(&mut self) -> &mut FrameEgress {
        &mut self.egress
    }

    pub fn ingress(&mut self) -> &mut FrameIngress {
        &mut self.ingress
    }
}

/// Outbound half: encrypts and authenticates frames.
pub struct FrameEgress {
    aes: Aes256Ctr,
    mac: MacState,
}

impl FrameEgress {
    /// Encrypt one frame. `header.size` must equal `body.len()`.
    pub fn write_frame(&mut self, header: &FrameHeader, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        if header.size != body.len() {
            return Err(FrameError::SizeMismatch {
                declared: header.size,
                actual: body.len(),
            });
        }
        let mut plain_header = header.encode()?;
        let padded = padded_len(body.len());

        let mut frame = Vec::with_capacity(HEADER_FRAME_LEN + padded + MAC_LEN);

        self.aes.apply_keystream(&mut plain_header);
        let header_mac = self.mac.update_header(&plain_header);
        frame.extend_from_slice(&plain_header);
        frame.extend_from_slice(header_mac.as_bytes());

        frame.extend_from_slice(body);
        frame.resize(HEADER_FRAME_LEN + padded, 0);
        let body_cipher = &mut frame[HEADER_FRAME_LEN..];
        self.aes.apply_keystream(body_cipher);
        let body_mac = self.mac.update_body(body_cipher);
        frame.extend_from_slice(body_mac.as_bytes());

        Ok(frame)
    }
}

impl std::fmt::Debug for FrameEgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameEgress").field("mac", &self.mac).finish_non_exhaustive()
    }
}

/// Inbound half: authenticates and decrypts frames.
pub struct FrameIngress {
    aes: Aes256Ctr,
    mac: MacState,
}

impl FrameIngress {
    /// Authenticate and decrypt the 32-byte header frame.
    pub fn read_header(&mut self, buf: &[u8; HEADER_FRAME_LEN]) -> Result<FrameHeader, FrameError> {
        let (cipher, tag) = buf.split_at(HEADER_LEN);
        let expected = self.mac.update_header(cipher);
        if expected.as_bytes() != tag {
            return Err(FrameError::HeaderMacMismatch);
        }
        let mut plain = [0u8; HEADER_LEN];
        plain.copy_from_slice(cipher);
        self.aes.apply_keystream(&mut plain);
        FrameHeader::decode(&plain)
    }

    /// Authenticate and decrypt a body of `header.body_frame_len()` bytes.
    /// Returns the body with padding stripped.
    pub fn read_body(&mut self, header: &FrameHeader, buf: &mut [u8]) -> Result<Vec<u8>, FrameError> {
        if buf.len() != header.body_frame_len() {
            return Err(FrameError::BufferLength {
                expected: header.body_frame_len(),
                actual: buf.len(),
            });
        }
        let (cipher, tag) = buf.split_at_mut(header.padded_size());
        let expected = self.mac.update_body(cipher);
        if expected.as_bytes() != &tag[..] {
            return Err(FrameError::BodyMacMismatch);
        }
        self.aes.apply_keystream(cipher);
        Ok(cipher[..header.size].to_vec())
    }

    /// Decode one complete frame from the front of `wire`.
    /// Returns the header, the body, and how many bytes were consumed.
    pub fn read_frame(&mut self, wire: &[u8]) -> Result<(FrameHeader, Vec<u8>, usize), FrameError> {
        if wire.len() < HEADER_FRAME_LEN {
            return Err(FrameError::BufferLength {
                expected: HEADER_FRAME_LEN,
                actual: wire.len(),
            });
        }
        let mut head = [0u8; HEADER_FRAME_LEN];
        head.copy_from_slice(&wire[..HEADER_FRAME_LEN]);
        let header = self.read_header(&head)?;

        let end = HEADER_FRAME_LEN + header.body_frame_len();
        if wire.len() < end {
            return Err(FrameError::BufferLength {
                expected: end,
                actual: wire.len(),
            });
        }
        let mut body = wire[HEADER_FRAME_LEN..end].to_vec();
        let body = self.read_body(&header, &mut body)?;
        Ok((header, body, end))
    }
}

impl std::fmt::Debug for FrameIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameIngress").field("mac", &self.mac).finish_non_exhaustive()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame header MAC mismatch")]
    HeaderMacMismatch,
    #[error("frame body MAC mismatch")]
    BodyMacMismatch,
    #[error("frame body of {0} bytes exceeds the 24-bit size field")]
    TooLarge(usize),
    #[error("header declares {declared} body bytes, got {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("expected {expected} bytes of frame, got {actual}")]
    BufferLength { expected: usize, actual: usize },
    #[error("malformed frame header: {0}")]
    MalformedHeader(#[from] rlp::DecoderError),
}

/// Two codecs from a fresh handshake: what `a` writes, `b` reads.
#[cfg(test)]
pub(crate) fn codec_pair() -> (FrameCodec, FrameCodec) {
    use crate::crypto::{Keypair, RlpxInitiator, RlpxResponder};

    let a = Keypair::generate();
    let b = Keypair::generate();
    let (initiator, auth) = RlpxInitiator::new(&a, &b.node_id()).unwrap();
    let (responder_secrets, ack) = RlpxResponder::new().respond(&b, &auth).unwrap();
    let initiator_secrets = initiator.finish(&a, &ack).unwrap();
    (FrameCodec::new(initiator_secrets), FrameCodec::new(responder_secrets))
}
