//! RTCP Sender Report packets (RFC 3550 §6.4.1), emitted once per track
//! every five seconds while a session is playing (C1/§4.4).

use bytes::{BufMut, Bytes, BytesMut};

const RTCP_VERSION: u8 = 2;
const PT_SENDER_REPORT: u8 = 200;

/// NTP epoch (1900-01-01) to Unix epoch (1970-01-01) offset, in seconds.
const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

/// A minimal Sender Report: no reception report blocks, no SDES chunk
/// (this server is a source, not a mixer, and never receives RTCP from
/// most clients worth reporting on).
#[derive(Debug, Clone, Copy)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_seconds: u32,
    pub ntp_fraction: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    /// Build a report for "now" plus the running per-track counters.
    pub fn new(
        ssrc: u32,
        unix_seconds: u64,
        unix_nanos: u32,
        rtp_timestamp: u32,
        packet_count: u32,
        octet_count: u32,
    ) -> Self {
        let ntp_seconds = (unix_seconds + NTP_UNIX_EPOCH_OFFSET) as u32;
        let ntp_fraction = (((unix_nanos as u64) << 32) / 1_000_000_000) as u32;
        Self {
            ssrc,
            ntp_seconds,
            ntp_fraction,
            rtp_timestamp,
            packet_count,
            octet_count,
        }
    }

    pub fn pack(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(28);
        let word_count: u16 = (28 / 4) - 1; // length field excludes the first word
        let byte0 = (RTCP_VERSION << 6) | 0u8; // padding=0, RC=0 (no report blocks)
        out.put_u8(byte0);
        out.put_u8(PT_SENDER_REPORT);
        out.put_u16(word_count);
        out.put_u32(self.ssrc);
        out.put_u32(self.ntp_seconds);
        out.put_u32(self.ntp_fraction);
        out.put_u32(self.rtp_timestamp);
        out.put_u32(self.packet_count);
        out.put_u32(self.octet_count);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_report_packs_to_28_bytes_with_expected_header() {
        let sr = SenderReport::new(0xAABBCCDD, 1_700_000_000, 0, 90_000, 42, 12_000);
        let packed = sr.pack();
        assert_eq!(packed.len(), 28);
        assert_eq!(packed[0], 0x80);
        assert_eq!(packed[1], PT_SENDER_REPORT);
        assert_eq!(u16::from_be_bytes([packed[2], packed[3]]), 6);
        assert_eq!(u32::from_be_bytes([packed[4], packed[5], packed[6], packed[7]]), 0xAABBCCDD);
    }

    #[test]
    fn ntp_seconds_offset_matches_epoch_difference() {
        let sr = SenderReport::new(1, 0, 0, 0, 0, 0);
        assert_eq!(sr.ntp_seconds, NTP_UNIX_EPOCH_OFFSET as u32);
    }
}
