//! Packet multiplexing over frames.
//!
//! A packet is `rlp(packet-type) || payload`, where the payload is a single
//! RLP item. Each negotiated protocol id gets a [`FrameWriter`] that packs its
//! queued packets into frames, and a [`FrameReader`] that reassembles them.
//!
//! Small packets are coalesced into one frame. A packet larger than the room
//! left in a frame budget is split: the first frame carries
//! `[protocol-id, 0, total-size]` and every following frame
//! `[protocol-id, sequence-id]`.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use rlp::Rlp;
use thiserror::Error;

use crate::frame::{FrameEgress, FrameError, FrameHeader, EMPTY_FRAME_LEN};
use crate::wire::MAX_PACKET_SIZE;

// ── Packet ────────────────────────────────────────────────────────────────────

/// A fully reassembled packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub protocol_id: u16,
    pub packet_type: u8,
    /// One RLP item, usually a list of the packet's fields.
    pub payload: Bytes,
}

impl Packet {
    pub fn new(protocol_id: u16, packet_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            protocol_id,
            packet_type,
            payload: payload.into(),
        }
    }

    /// The payload as an RLP view.
    pub fn rlp(&self) -> Rlp<'_> {
        Rlp::new(&self.payload)
    }
}

fn encode_packet(packet_type: u8, payload: &[u8]) -> Vec<u8> {
    let type_item = rlp::encode(&packet_type);
    let mut out = Vec::with_capacity(type_item.len() + payload.len());
    out.extend_from_slice(&type_item);
    out.extend_from_slice(payload);
    out
}

/// Split a frame body into the packets it carries, at RLP item boundaries.
fn split_packets(protocol_id: u16, body: &[u8]) -> Result<Vec<Packet>, MuxError> {
    let mut packets = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let type_item = Rlp::new(&body[offset..]);
        let type_len = type_item.payload_info()?.total();
        let packet_type: u8 = type_item.as_val()?;
        offset += type_len;
        if offset >= body.len() {
            return Err(MuxError::Malformed(rlp::DecoderError::RlpIsTooShort));
        }

        let payload_len = Rlp::new(&body[offset..]).payload_info()?.total();
        if offset + payload_len > body.len() {
            return Err(MuxError::Malformed(rlp::DecoderError::RlpIsTooShort));
        }
        packets.push(Packet {
            protocol_id,
            packet_type,
            payload: Bytes::copy_from_slice(&body[offset..offset + payload_len]),
        });
        offset += payload_len;
    }
    Ok(packets)
}

// ── Writer ────────────────────────────────────────────────────────────────────

struct Outgoing {
    data: Vec<u8>,
    offset: usize,
    next_sequence: u16,
}

/// Per-protocol send queue.
pub struct FrameWriter {
    protocol_id: u16,
    queue: VecDeque<Vec<u8>>,
    in_progress: Option<Outgoing>,
}

impl FrameWriter {
    pub fn new(protocol_id: u16) -> Self {
        Self {
            protocol_id,
            queue: VecDeque::new(),
            in_progress: None,
        }
    }

    pub fn protocol_id(&self) -> u16 {
        self.protocol_id
    }

    /// Queue a packet. `payload` must be one RLP item.
    pub fn enque(&mut self, packet_type: u8, payload: &[u8]) -> Result<(), MuxError> {
        let data = encode_packet(packet_type, payload);
        if data.len() > MAX_PACKET_SIZE {
            return Err(MuxError::TooLarge(data.len()));
        }
        self.queue.push_back(data);
        Ok(())
    }

    /// Packets not yet completely flushed, the one being split included.
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.in_progress.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Emit frames totalling at most `budget` wire bytes into `out`.
    /// Returns how many packets were completely flushed by this call.
    pub fn mux(
        &mut self,
        codec: &mut FrameEgress,
        budget: usize,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<usize, MuxError> {
        let mut flushed = 0;
        let mut left = budget;

        loop {
            let room = left.saturating_sub(EMPTY_FRAME_LEN) / 16 * 16;
            if room == 0 {
                break;
            }

            let frame = if let Some(mut current) = self.in_progress.take() {
                let remaining = current.data.len() - current.offset;
                let take = remaining.min(room);
                let chunk = &current.data[current.offset..current.offset + take];
                let header = if current.next_sequence == 0 {
                    FrameHeader::first(self.protocol_id, take, current.data.len() as u32)
                } else {
                    FrameHeader::continuation(self.protocol_id, current.next_sequence, take)
                };
                let frame = codec.write_frame(&header, chunk)?;
                current.offset += take;
                current.next_sequence = current.next_sequence.wrapping_add(1);
                if current.offset == current.data.len() {
                    flushed += 1;
                } else {
                    self.in_progress = Some(current);
                }
                frame
            } else {
                let fits = match self.queue.front() {
                    Some(front) => front.len() <= room,
                    None => break,
                };
                if !fits {
                    if let Some(data) = self.queue.pop_front() {
                        self.in_progress = Some(Outgoing {
                            data,
                            offset: 0,
                            next_sequence: 0,
                        });
                    }
                    continue;
                }

                let mut body = Vec::new();
                while let Some(front) = self.queue.front() {
                    if body.len() + front.len() > room {
                        break;
                    }
                    if let Some(data) = self.queue.pop_front() {
                        body.extend_from_slice(&data);
                        flushed += 1;
                    }
                }
                codec.write_frame(&FrameHeader::single(self.protocol_id, body.len()), &body)?
            };

            left -= frame.len();
            out.push(frame);
        }

        Ok(flushed)
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

struct Incoming {
    data: Vec<u8>,
    total: usize,
    next_sequence: u16,
}

/// Per-protocol reassembly.
pub struct FrameReader {
    protocol_id: u16,
    in_progress: Option<Incoming>,
}

impl FrameReader {
    pub fn new(protocol_id: u16) -> Self {
        Self {
            protocol_id,
            in_progress: None,
        }
    }

    /// Feed one decrypted frame. Returns every packet it completes.
    pub fn demux(&mut self, header: &FrameHeader, body: &[u8]) -> Result<Vec<Packet>, MuxError> {
        let pid = self.protocol_id;
        match (header.sequence_id, header.total_packet_size) {
            (Some(0), Some(total)) => {
                if self.in_progress.is_some() {
                    return Err(MuxError::Interleaved(pid));
                }
                let total = total as usize;
                if total > MAX_PACKET_SIZE {
                    return Err(MuxError::TooLarge(total));
                }
                if body.len() > total {
                    return Err(MuxError::Overflow(total));
                }
                self.in_progress = Some(Incoming {
                    data: body.to_vec(),
                    total,
                    next_sequence: 1,
                });
                self.complete()
            }
            (Some(seq), Some(_)) => Err(MuxError::UnexpectedTotal {
                protocol_id: pid,
                sequence_id: seq,
            }),
            // [pid, 0] with nothing in flight is how some clients mark a single frame.
            (None, _) | (Some(0), None) if self.in_progress.is_none() => split_packets(pid, body),
            (None, _) => Err(MuxError::Interleaved(pid)),
            (Some(seq), None) => {
                let current = self
                    .in_progress
                    .as_mut()
                    .ok_or(MuxError::UnexpectedContinuation(pid))?;
                if seq != current.next_sequence {
                    return Err(MuxError::SequenceGap {
                        protocol_id: pid,
                        expected: current.next_sequence,
                        got: seq,
                    });
                }
                if current.data.len() + body.len() > current.total {
                    return Err(MuxError::Overflow(current.total));
                }
                current.data.extend_from_slice(body);
                current.next_sequence = current.next_sequence.wrapping_add(1);
                self.complete()
            }
        }
    }

    fn complete(&mut self) -> Result<Vec<Packet>, MuxError> {
        match &self.in_progress {
            Some(current) if current.data.len() == current.total => {}
            _ => return Ok(Vec::new()),
        }
        match self.in_progress.take() {
            Some(done) => split_packets(self.protocol_id, &done.data),
            None => Ok(Vec::new()),
        }
    }
}

// ── Session mux ───────────────────────────────────────────────────────────────

/// Outbound side of a session: one writer per protocol id, drained
/// round-robin so one busy protocol cannot starve the others.
pub struct EgressMux {
    writers: Vec<FrameWriter>,
    next: usize,
    budget: usize,
}

/// Inbound side of a session: one reader per protocol id.
pub struct IngressMux {
    readers: HashMap<u16, FrameReader>,
}

/// Build matching egress/ingress muxes for a set of protocol ids.
/// `budget` is the wire-byte allowance for each writer turn.
pub fn mux_pair(protocol_ids: impl IntoIterator<Item = u16>, budget: usize) -> (EgressMux, IngressMux) {
    let mut ids: Vec<u16> = protocol_ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    let egress = EgressMux {
        writers: ids.iter().map(|&id| FrameWriter::new(id)).collect(),
        next: 0,
        budget,
    };
    let ingress = IngressMux {
        readers: ids.iter().map(|&id| (id, FrameReader::new(id))).collect(),
    };
    (egress, ingress)
}

impl EgressMux {
    pub fn enque(&mut self, protocol_id: u16, packet_type: u8, payload: &[u8]) -> Result<(), MuxError> {
        self.writers
            .iter_mut()
            .find(|w| w.protocol_id() == protocol_id)
            .ok_or(MuxError::UnknownProtocol(protocol_id))?
            .enque(packet_type, payload)
    }

    pub fn has_pending(&self) -> bool {
        self.writers.iter().any(|w| !w.is_empty())
    }

    /// Encode every queued packet. Returns the wire bytes in write order.
    pub fn drain(&mut self, codec: &mut FrameEgress) -> Result<Vec<u8>, MuxError> {
        let mut frames = Vec::new();
        while self.has_pending() {
            let before = frames.len();
            let count = self.writers.len();
            for i in 0..count {
                let idx = (self.next + i) % count;
                if !self.writers[idx].is_empty() {
                    self.writers[idx].mux(codec, self.budget, &mut frames)?;
                }
            }
            self.next = (self.next + 1) % count.max(1);
            if frames.len() == before {
                return Err(MuxError::BudgetTooSmall(self.budget));
            }
        }
        Ok(frames.concat())
    }
}

impl IngressMux {
    pub fn demux(&mut self, header: &FrameHeader, body: &[u8]) -> Result<Vec<Packet>, MuxError> {
        self.readers
            .get_mut(&header.protocol_id)
            .ok_or(MuxError::UnknownProtocol(header.protocol_id))?
            .demux(header, body)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MuxError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed packet: {0}")]
    Malformed(#[from] rlp::DecoderError),
    #[error("protocol {protocol_id}: expected sequence {expected}, got {got}")]
    SequenceGap {
        protocol_id: u16,
        expected: u16,
        got: u16,
    },
    #[error("protocol {protocol_id}: frame {sequence_id} carries a total size")]
    UnexpectedTotal { protocol_id: u16, sequence_id: u16 },
    #[error("protocol {0}: new packet while a multi-frame packet is in progress")]
    Interleaved(u16),
    #[error("protocol {0}: continuation frame without a first frame")]
    UnexpectedContinuation(u16),
    #[error("packet overflows its declared size of {0} bytes")]
    Overflow(usize),
    #[error("packet of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    #[error("no capability negotiated for protocol id {0}")]
    UnknownProtocol(u16),
    #[error("frame budget of {0} bytes cannot carry any body")]
    BudgetTooSmall(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{codec_pair, FrameIngress};

    fn payload_of(len: usize) -> Vec<u8> {
        rlp::encode(&vec![0xabu8; len]).to_vec()
    }

    fn read_all(ingress: &mut FrameIngress, wire: &[u8]) -> Vec<(FrameHeader, Vec<u8>)> {
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < wire.len() {
            let (header, body, used) = ingress.read_frame(&wire[offset..]).unwrap();
            frames.push((header, body));
            offset += used;
        }
        frames
    }

    #[test]
    fn empty_queue_produces_no_frames() {
        let (mut a, _) = codec_pair();
        let mut writer = FrameWriter::new(1);
        let mut out = Vec::new();
        assert_eq!(writer.mux(a.egress(), 1024, &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn packet_spanning_four_frames_reassembles() {
        let (mut a, mut b) = codec_pair();
        let mut writer = FrameWriter::new(2);
        // 1 type byte + 63 payload bytes = 64 bytes of packet, 16 per frame
        let payload = payload_of(61);
        assert_eq!(payload.len(), 63);
        writer.enque(0x05, &payload).unwrap();

        let mut out = Vec::new();
        let mut flushed = Vec::new();
        for _ in 0..4 {
            flushed.push(writer.mux(a.egress(), 64, &mut out).unwrap());
        }
        assert_eq!(flushed, vec![0, 0, 0, 1]);
        assert_eq!(out.len(), 4);
        assert!(writer.is_empty());

        let frames = read_all(b.ingress(), &out.concat());
        let sequence: Vec<_> = frames.iter().map(|(h, _)| h.sequence_id).collect();
        assert_eq!(sequence, vec![Some(0), Some(1), Some(2), Some(3)]);
        assert_eq!(frames[0].0.total_packet_size, Some(64));
        assert!(frames[1..].iter().all(|(h, _)| h.total_packet_size.is_none()));

        let mut reader = FrameReader::new(2);
        let mut packets = Vec::new();
        for (header, body) in &frames {
            packets.extend(reader.demux(header, body).unwrap());
        }
        assert_eq!(packets, vec![Packet::new(2, 0x05, payload)]);
    }

    #[test]
    fn small_packets_are_coalesced_into_one_frame() {
        let (mut a, mut b) = codec_pair();
        let mut writer = FrameWriter::new(1);
        for t in 0..3u8 {
            writer.enque(t, &payload_of(10)).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(writer.mux(a.egress(), 1024, &mut out).unwrap(), 3);
        assert_eq!(out.len(), 1);

        let frames = read_all(b.ingress(), &out.concat());
        let mut reader = FrameReader::new(1);
        let packets = reader.demux(&frames[0].0, &frames[0].1).unwrap();
        let types: Vec<_> = packets.iter().map(|p| p.packet_type).collect();
        assert_eq!(types, vec![0, 1, 2]);
    }

    #[test]
    fn packets_roundtrip_through_full_pipeline() {
        let (mut a, mut b) = codec_pair();
        let (mut egress, mut ingress) = mux_pair([0, 1], 1024);
        let sizes = [0usize, 1, 15, 16, 17, 1000, 100_000];
        for (i, size) in sizes.iter().enumerate() {
            egress.enque(1, i as u8, &payload_of(*size)).unwrap();
        }
        let wire = egress.drain(a.egress()).unwrap();

        let mut packets = Vec::new();
        for (header, body) in read_all(b.ingress(), &wire) {
            packets.extend(ingress.demux(&header, &body).unwrap());
        }
        assert_eq!(packets.len(), sizes.len());
        for (i, (packet, size)) in packets.iter().zip(sizes).enumerate() {
            assert_eq!(packet.packet_type, i as u8);
            assert_eq!(packet.payload.as_ref(), payload_of(size).as_slice());
            let decoded: Vec<u8> = packet.rlp().as_val().unwrap();
            assert_eq!(decoded.len(), size);
        }
    }

    #[test]
    fn budget_without_body_room_fails_instead_of_spinning() {
        let (mut a, _) = codec_pair();
        let (mut egress, _) = mux_pair([0], 63);
        egress.enque(0, 0x02, &payload_of(0)).unwrap();
        assert!(matches!(egress.drain(a.egress()), Err(MuxError::BudgetTooSmall(63))));

        let (mut egress, _) = mux_pair([0], crate::wire::MIN_FRAME_BUDGET);
        egress.enque(0, 0x02, &payload_of(40)).unwrap();
        assert!(!egress.drain(a.egress()).unwrap().is_empty());
        assert!(!egress.has_pending());
    }

    #[test]
    fn interleaved_protocols_reassemble_independently() {
        let (mut a, mut b) = codec_pair();
        let mut w1 = FrameWriter::new(1);
        let mut w2 = FrameWriter::new(2);
        for i in 0..3u8 {
            w1.enque(i, &payload_of(200 + i as usize)).unwrap();
            w2.enque(0x10 + i, &payload_of(300 + i as usize)).unwrap();
        }

        // alternate small turns so multi-frame packets of both protocols interleave
        let mut out = Vec::new();
        while !w1.is_empty() || !w2.is_empty() {
            w2.mux(a.egress(), 96, &mut out).unwrap();
            w1.mux(a.egress(), 80, &mut out).unwrap();
        }
        let frames = read_all(b.ingress(), &out.concat());
        let protocols: Vec<_> = frames.iter().map(|(h, _)| h.protocol_id).collect();
        assert!(protocols.windows(2).any(|w| w[0] != w[1]));

        let (_, mut ingress) = mux_pair([1, 2], 96);
        let mut by_protocol: HashMap<u16, Vec<Packet>> = HashMap::new();
        for (header, body) in frames {
            for packet in ingress.demux(&header, &body).unwrap() {
                by_protocol.entry(packet.protocol_id).or_default().push(packet);
            }
        }
        let t1: Vec<_> = by_protocol[&1].iter().map(|p| p.packet_type).collect();
        let t2: Vec<_> = by_protocol[&2].iter().map(|p| p.packet_type).collect();
        assert_eq!(t1, vec![0, 1, 2]);
        assert_eq!(t2, vec![0x10, 0x11, 0x12]);
        assert_eq!(by_protocol[&2][1].payload.as_ref(), payload_of(301).as_slice());
    }

    #[test]
    fn sequence_gap_is_fatal() {
        let mut reader = FrameReader::new(1);
        assert!(reader.demux(&FrameHeader::first(1, 16, 48), &[0u8; 16]).unwrap().is_empty());
        assert!(matches!(
            reader.demux(&FrameHeader::continuation(1, 2, 16), &[0u8; 16]),
            Err(MuxError::SequenceGap { expected: 1, got: 2, .. })
        ));
    }

    #[test]
    fn continuation_without_first_frame_is_fatal() {
        let mut reader = FrameReader::new(1);
        assert!(matches!(
            reader.demux(&FrameHeader::continuation(1, 1, 16), &[0u8; 16]),
            Err(MuxError::UnexpectedContinuation(1))
        ));
    }

    #[test]
    fn single_frame_during_multi_frame_packet_is_fatal() {
        let mut reader = FrameReader::new(1);
        reader.demux(&FrameHeader::first(1, 16, 48), &[0u8; 16]).unwrap();
        assert!(matches!(
            reader.demux(&FrameHeader::single(1, 2), &[0x80, 0xc0]),
            Err(MuxError::Interleaved(1))
        ));
    }

    #[test]
    fn overflowing_declared_total_is_fatal() {
        let mut reader = FrameReader::new(1);
        reader.demux(&FrameHeader::first(1, 16, 20), &[0u8; 16]).unwrap();
        assert!(matches!(
            reader.demux(&FrameHeader::continuation(1, 1, 16), &[0u8; 16]),
            Err(MuxError::Overflow(20))
        ));
    }

    #[test]
    fn truncated_packet_is_malformed() {
        let mut reader = FrameReader::new(1);
        // type byte followed by a list header promising 5 bytes
        assert!(reader.demux(&FrameHeader::single(1, 3), &[0x01, 0xc5, 0x80]).is_err());
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let (mut egress, mut ingress) = mux_pair([0, 1], 1024);
        assert!(matches!(egress.enque(7, 0, &[0xc0]), Err(MuxError::UnknownProtocol(7))));
        assert!(matches!(
            ingress.demux(&FrameHeader::single(9, 0), &[]),
            Err(MuxError::UnknownProtocol(9))
        ));
    }
}
