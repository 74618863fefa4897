//! Annex-B NAL splitting, access-unit assembly and parameter-set caching (C2).
//!
//! Grounded on the Annex-B scanner already used for parameter-set discovery
//! in this codebase's RTSP service, generalized from "scan a whole encoded
//! frame for SPS/PPS" into a streaming NAL splitter plus an access-unit
//! assembler that groups NALs the way RFC 6184 §5.1 expects them grouped
//! for RTP delivery (single timestamp, single marker at the end of the AU).

use bytes::Bytes;

pub const NAL_TYPE_NON_IDR: u8 = 1;
pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SEI: u8 = 6;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;
pub const NAL_TYPE_AUD: u8 = 9;

/// One H.264 access unit: an ordered NAL list sharing one RTP timestamp.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub nals: Vec<Bytes>,
    pub is_idr: bool,
    pub pts_90khz: u32,
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

pub fn is_vcl(nal_type: u8) -> bool {
    (NAL_TYPE_NON_IDR..=NAL_TYPE_IDR).contains(&nal_type)
}

/// Split an Annex-B byte stream into NAL units (start codes stripped).
///
/// Trailing zero bytes before the next start code (or end of buffer) are
/// trimmed, matching the `cabac_zero_word` padding some encoders emit.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut cursor = 0usize;

    while let Some((start, code_len)) = find_start_code(data, cursor) {
        let nal_start = start + code_len;
        if nal_start >= data.len() {
            break;
        }

        let next_start = find_start_code(data, nal_start)
            .map(|(idx, _)| idx)
            .unwrap_or(data.len());

        let mut nal_end = next_start;
        while nal_end > nal_start && data[nal_end - 1] == 0 {
            nal_end -= 1;
        }

        if nal_end > nal_start {
            units.push(&data[nal_start..nal_end]);
        }

        cursor = next_start;
    }

    units
}

fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if from >= data.len() {
        return None;
    }

    let mut i = from;
    while i + 3 <= data.len() {
        if i + 4 <= data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 0 && data[i + 3] == 1 {
            return Some((i, 4));
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Caches the latest SPS/PPS observed from a stream (§3 StreamConfig.sps/pps).
#[derive(Default, Clone)]
pub struct ParameterSetCache {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    dirty: bool,
}

impl ParameterSetCache {
    pub fn observe(&mut self, nal: &Bytes) {
        match nal_type(nal) {
            Some(NAL_TYPE_SPS) => {
                if self.sps.as_ref() != Some(nal) {
                    self.sps = Some(nal.clone());
                    self.dirty = true;
                }
            }
            Some(NAL_TYPE_PPS) => {
                if self.pps.as_ref() != Some(nal) {
                    self.pps = Some(nal.clone());
                    self.dirty = true;
                }
            }
            _ => {}
        }
    }

    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// Returns `true` once, the first time it's called after SPS/PPS changed.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// `profile-level-id` for the SDP fmtp line: the first three SPS bytes
    /// after the one-byte NAL header, hex-encoded.
    pub fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_ref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }
}

/// Prepend cached SPS/PPS to an IDR access unit unless already present
/// (§4.2 IDR preamble injection).
pub fn inject_idr_preamble(au: &mut AccessUnit, cache: &ParameterSetCache) {
    if !au.is_idr {
        return;
    }
    let (Some(sps), Some(pps)) = (cache.sps(), cache.pps()) else {
        return;
    };

    let already_present = au.nals.len() >= 2
        && nal_type(&au.nals[0]) == Some(NAL_TYPE_SPS)
        && nal_type(&au.nals[1]) == Some(NAL_TYPE_PPS);

    if !already_present {
        au.nals.insert(0, pps.clone());
        au.nals.insert(0, sps.clone());
    }
}

/// Buffers incoming NALs and emits completed access units per §4.2's
/// assembly rule: an AUD starts a new AU; a VCL NAL followed by another
/// VCL NAL, or by a non-VCL NAL that begins the next AU (AUD/SPS/PPS/SEI),
/// closes the current one.
#[derive(Default)]
pub struct AccessUnitAssembler {
    pending: Vec<Bytes>,
    pending_has_vcl: bool,
    pending_pts: u32,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one NAL (start code already stripped) with the PTS (90kHz) it
    /// arrived at. Returns a completed access unit if this NAL closed one.
    pub fn push(&mut self, nal: Bytes, pts_90khz: u32) -> Option<AccessUnit> {
        let Some(ty) = nal_type(&nal) else {
            return None;
        };

        let mut completed = None;

        if is_vcl(ty) {
            if self.pending_has_vcl {
                completed = self.flush();
            }
            // This is always the AU's one VCL NAL (a second VCL NAL would
            // have flushed above), so its PTS is the AU's PTS regardless of
            // whatever non-VCL NALs (AUD/SPS/PPS) already lead `pending`.
            self.pending_pts = pts_90khz;
            self.pending.push(nal);
            self.pending_has_vcl = true;
        } else {
            if self.pending_has_vcl {
                completed = self.flush();
            }
            self.pending.push(nal);
        }

        completed
    }

    /// Flush whatever is buffered as a final (possibly incomplete) AU, e.g.
    /// on source shutdown/restart.
    pub fn flush(&mut self) -> Option<AccessUnit> {
        if self.pending.is_empty() {
            return None;
        }
        let nals = std::mem::take(&mut self.pending);
        let is_idr = nals.iter().any(|n| nal_type(n) == Some(NAL_TYPE_IDR));
        let pts = self.pending_pts;
        self.pending_has_vcl = false;
        Some(AccessUnit {
            nals,
            is_idr,
            pts_90khz: pts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(ty: u8, rest: &[u8]) -> Bytes {
        let mut v = vec![ty & 0x1f];
        v.extend_from_slice(rest);
        Bytes::from(v)
    }

    #[test]
    fn split_annexb_handles_both_start_code_lengths() {
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(&[0x67, 0x01, 0x02]);
        data.extend_from_slice(&[0, 0, 1]);
        data.extend_from_slice(&[0x68, 0x03]);

        let units = split_annexb(&data);
        assert_eq!(units, vec![&[0x67, 0x01, 0x02][..], &[0x68, 0x03][..]]);
    }

    #[test]
    fn assembler_groups_sps_pps_idr_into_one_au() {
        let mut asm = AccessUnitAssembler::new();
        assert!(asm.push(nal(NAL_TYPE_SPS, &[1, 2]), 0).is_none());
        assert!(asm.push(nal(NAL_TYPE_PPS, &[3, 4]), 0).is_none());
        assert!(asm.push(nal(NAL_TYPE_IDR, &[5, 6]), 100).is_none());
        // next AUD starts a new AU and flushes the previous one
        let au = asm.push(nal(NAL_TYPE_AUD, &[0]), 200).unwrap();
        assert_eq!(au.nals.len(), 3);
        assert!(au.is_idr);
        assert_eq!(au.pts_90khz, 100);
    }

    #[test]
    fn assembler_splits_back_to_back_vcl_nals_into_separate_aus() {
        let mut asm = AccessUnitAssembler::new();
        assert!(asm.push(nal(NAL_TYPE_IDR, &[1]), 0).is_none());
        let au = asm.push(nal(NAL_TYPE_NON_IDR, &[2]), 90).unwrap();
        assert_eq!(au.nals.len(), 1);
        assert!(au.is_idr);
        assert_eq!(au.pts_90khz, 0);

        let au2 = asm.flush().unwrap();
        assert_eq!(au2.nals.len(), 1);
        assert!(!au2.is_idr);
        assert_eq!(au2.pts_90khz, 90);
    }

    #[test]
    fn idr_preamble_injection_is_idempotent() {
        let mut cache = ParameterSetCache::default();
        cache.observe(&nal(NAL_TYPE_SPS, &[0x42, 0xe0, 0x1f]));
        cache.observe(&nal(NAL_TYPE_PPS, &[0xce]));

        let mut au = AccessUnit {
            nals: vec![nal(NAL_TYPE_IDR, &[1])],
            is_idr: true,
            pts_90khz: 0,
        };
        inject_idr_preamble(&mut au, &cache);
        assert_eq!(au.nals.len(), 3);
        assert_eq!(nal_type(&au.nals[0]), Some(NAL_TYPE_SPS));
        assert_eq!(nal_type(&au.nals[1]), Some(NAL_TYPE_PPS));

        // already-prefixed AU is left untouched
        inject_idr_preamble(&mut au, &cache);
        assert_eq!(au.nals.len(), 3);
    }

    #[test]
    fn profile_level_id_is_first_three_sps_bytes_hex() {
        let mut cache = ParameterSetCache::default();
        cache.observe(&nal(NAL_TYPE_SPS, &[0x42, 0xe0, 0x1f]));
        assert_eq!(cache.profile_level_id().as_deref(), Some("42e01f"));
    }
}
