//! RTP packet header pack/unpack (RFC 3550) and the H.264 FU-A payloader
//! (RFC 6184) that turns one NAL unit into one or more RTP packets (C1).
//!
//! Hand-rolled rather than wrapped around a generic RTP crate: the spec's
//! testable properties (§8) pin exact byte layouts (FU indicator/header
//! values, marker-bit placement across a whole access unit) that are easier
//! to keep correct when this crate owns every byte, the same way the
//! reference client in this corpus walks RTP payloads by hand instead of
//! going through a black-box parser.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, RtspError};

/// Fixed 12-byte RTP header, no CSRCs or extensions (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

impl RtpHeader {
    pub fn pack(&self, out: &mut BytesMut) {
        let byte0 = (RTP_VERSION << 6) | 0u8; // padding=0, extension=0, CC=0
        let byte1 = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        out.extend_from_slice(&[byte0, byte1]);
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
    }

    pub fn unpack(data: &[u8]) -> Result<(Self, &[u8])> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtspError::Transport("RTP packet shorter than header".into()));
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtspError::Transport(format!("unsupported RTP version {}", version)));
        }
        let cc = (data[0] & 0x0f) as usize;
        let marker = (data[1] & 0x80) != 0;
        let payload_type = data[1] & 0x7f;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let header_len = RTP_HEADER_LEN + cc * 4;
        if data.len() < header_len {
            return Err(RtspError::Transport("RTP packet truncated before CSRC list".into()));
        }
        Ok((
            Self {
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
            },
            &data[header_len..],
        ))
    }
}

/// A packed RTP packet ready for the wire.
pub fn pack_packet(header: &RtpHeader, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
    header.pack(&mut out);
    out.extend_from_slice(payload);
    out.freeze()
}

const FU_A_NAL_TYPE: u8 = 28;

/// Split one Annex-B-stripped NAL unit (header byte included) into one or
/// more RTP payload buffers per §4.1's FU-A rule.
///
/// `mtu_payload` is the maximum payload size per packet (default 1400).
/// A NAL that fits whole is returned as a single-element vector; otherwise
/// it is fragmented with FU indicator/header bytes, `S` set only on the
/// first fragment and `E` only on the last.
pub fn fragment_nal(nal: &[u8], mtu_payload: usize) -> Vec<Bytes> {
    if nal.is_empty() {
        return Vec::new();
    }

    if nal.len() <= mtu_payload {
        return vec![Bytes::copy_from_slice(nal)];
    }

    let header = nal[0];
    let nal_type = header & 0x1f;
    let fu_indicator = (header & 0xe0) | FU_A_NAL_TYPE;
    let body = &nal[1..];
    let chunk_size = mtu_payload.saturating_sub(2).max(1);

    let mut fragments = Vec::with_capacity(body.len().div_ceil(chunk_size));
    let mut offset = 0usize;
    while offset < body.len() {
        let end = (offset + chunk_size).min(body.len());
        let is_first = offset == 0;
        let is_last = end == body.len();

        let mut fu_header = nal_type;
        if is_first {
            fu_header |= 0x80;
        }
        if is_last {
            fu_header |= 0x40;
        }

        let mut packet = BytesMut::with_capacity(2 + (end - offset));
        packet.extend_from_slice(&[fu_indicator, fu_header]);
        packet.extend_from_slice(&body[offset..end]);
        fragments.push(packet.freeze());

        offset = end;
    }

    fragments
}

/// Reassemble a NAL unit from an ordered sequence of FU-A fragment payloads
/// (used by tests to verify round-trip fidelity, §8 property 3).
pub fn reassemble_fu_a(fragments: &[Bytes]) -> Option<Bytes> {
    let first = fragments.first()?;
    if first.len() < 2 {
        return None;
    }
    let fu_indicator = first[0];
    let fu_header = first[1];
    if fu_indicator & 0x1f != FU_A_NAL_TYPE {
        return None;
    }
    if fu_header & 0x80 == 0 {
        return None; // first fragment must carry S=1
    }
    let nal_header = (fu_indicator & 0xe0) | (fu_header & 0x1f);

    let mut out = BytesMut::new();
    out.extend_from_slice(&[nal_header]);
    for (idx, frag) in fragments.iter().enumerate() {
        if frag.len() < 2 {
            return None;
        }
        let is_last_claimed = frag[1] & 0x40 != 0;
        let is_last_position = idx == fragments.len() - 1;
        if is_last_claimed != is_last_position {
            return None;
        }
        out.extend_from_slice(&frag[2..]);
    }
    Some(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_pack_unpack() {
        let header = RtpHeader {
            marker: true,
            payload_type: 96,
            sequence_number: 0xBEEF,
            timestamp: 0xDEADBEEF,
            ssrc: 0x1234_5678,
        };
        let packed = pack_packet(&header, b"payload");
        let (unpacked, payload) = RtpHeader::unpack(&packed).unwrap();
        assert_eq!(unpacked, header);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn sequence_and_timestamp_wrap_around() {
        let header = RtpHeader {
            marker: false,
            payload_type: 96,
            sequence_number: u16::MAX,
            timestamp: u32::MAX,
            ssrc: 1,
        };
        let next_seq = header.sequence_number.wrapping_add(1);
        let next_ts = header.timestamp.wrapping_add(3000);
        assert_eq!(next_seq, 0);
        assert_eq!(next_ts, 2999);
    }

    #[test]
    fn small_nal_is_a_single_packet() {
        let nal = vec![0x67, 0x42, 0x00, 0x1f];
        let fragments = fragment_nal(&nal, 1400);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].as_ref(), nal.as_slice());
    }

    #[test]
    fn fu_a_fragmentation_matches_e6_scenario() {
        // 5000-byte IDR NAL, header 0x65, MTU payload 1400.
        let mut nal = vec![0x65u8];
        nal.extend(std::iter::repeat(0xABu8).take(4999));
        assert_eq!(nal.len(), 5000);

        let fragments = fragment_nal(&nal, 1400);
        assert_eq!(fragments.len(), 4);

        let fu_indicators: Vec<u8> = fragments.iter().map(|f| f[0]).collect();
        assert!(fu_indicators.iter().all(|&b| b == 0x7C));

        let fu_headers: Vec<u8> = fragments.iter().map(|f| f[1]).collect();
        assert_eq!(fu_headers, vec![0x85, 0x05, 0x05, 0x45]);

        let s_count = fu_headers.iter().filter(|&&h| h & 0x80 != 0).count();
        let e_count = fu_headers.iter().filter(|&&h| h & 0x40 != 0).count();
        assert_eq!(s_count, 1);
        assert_eq!(e_count, 1);
        assert!(fu_headers[0] & 0x80 != 0);
        assert!(fu_headers[fu_headers.len() - 1] & 0x40 != 0);

        let reassembled = reassemble_fu_a(&fragments).unwrap();
        assert_eq!(reassembled.as_ref(), nal.as_slice());
    }

    #[test]
    fn fu_a_fragment_count_matches_ceiling_formula() {
        let nal_len = 5000usize;
        let mtu_payload = 1400usize;
        let expected = (nal_len - 1).div_ceil(mtu_payload - 2);
        let mut nal = vec![0x65u8];
        nal.extend(std::iter::repeat(0u8).take(nal_len - 1));
        assert_eq!(fragment_nal(&nal, mtu_payload).len(), expected);
    }
}
