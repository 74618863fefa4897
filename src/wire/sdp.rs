//! SDP (RFC 4566) session description generation for a stream's DESCRIBE
//! response (§4.1, §4.6).
//!
//! Grounded on the `sdp-types` struct-literal builder this codebase already
//! used for its RTSP `DESCRIBE` response, generalized to emit
//! `sprop-parameter-sets` from a live `ParameterSetCache` and an optional
//! second audio media section.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sdp_types as sdp;

use crate::h264::ParameterSetCache;

pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Static RTP payload types (RFC 3551): both audio codecs this server emits
/// have a fixed, well-known payload type, unlike the dynamic video type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Pcmu,
    Pcma,
}

impl AudioCodec {
    pub fn payload_type(&self) -> u8 {
        match self {
            Self::Pcmu => 0,
            Self::Pcma => 8,
        }
    }

    fn rtpmap_name(&self) -> &'static str {
        match self {
            Self::Pcmu => "PCMU",
            Self::Pcma => "PCMA",
        }
    }

    pub fn clock_rate(&self) -> u32 {
        8_000
    }
}

pub struct SdpParams<'a> {
    pub stream_id: &'a str,
    pub bind_address: &'a str,
    pub parameter_sets: &'a ParameterSetCache,
    pub audio: Option<AudioCodec>,
}

fn h264_fmtp(params: &ParameterSetCache) -> String {
    let profile_level_id = params.profile_level_id().unwrap_or_else(|| "42e01f".to_string());
    let sprop = match (params.sps(), params.pps()) {
        (Some(sps), Some(pps)) => {
            format!("{},{}", BASE64.encode(sps), BASE64.encode(pps))
        }
        _ => String::new(),
    };

    let mut fmtp = format!(
        "{} packetization-mode=1;profile-level-id={}",
        VIDEO_PAYLOAD_TYPE, profile_level_id
    );
    if !sprop.is_empty() {
        fmtp.push_str(&format!(";sprop-parameter-sets={}", sprop));
    }
    fmtp
}

/// Build the session description for a stream. Returns `None` if the SDP
/// could not be serialized (malformed inputs only; never expected in
/// practice, but the caller maps it to a 500 rather than panicking).
pub fn build_sdp(params: &SdpParams) -> Option<String> {
    let mut medias = vec![sdp::Media {
        media: "video".to_string(),
        port: 0,
        num_ports: None,
        proto: "RTP/AVP".to_string(),
        fmt: VIDEO_PAYLOAD_TYPE.to_string(),
        media_title: None,
        connections: Vec::new(),
        bandwidths: Vec::new(),
        key: None,
        attributes: vec![
            sdp::Attribute {
                attribute: "rtpmap".to_string(),
                value: Some(format!("{} H264/{}", VIDEO_PAYLOAD_TYPE, VIDEO_CLOCK_RATE)),
            },
            sdp::Attribute {
                attribute: "fmtp".to_string(),
                value: Some(h264_fmtp(params.parameter_sets)),
            },
            sdp::Attribute {
                attribute: "control".to_string(),
                value: Some("trackID=0".to_string()),
            },
        ],
    }];

    if let Some(audio_codec) = params.audio {
        let payload_type = audio_codec.payload_type();
        medias.push(sdp::Media {
            media: "audio".to_string(),
            port: 0,
            num_ports: None,
            proto: "RTP/AVP".to_string(),
            fmt: payload_type.to_string(),
            media_title: None,
            connections: Vec::new(),
            bandwidths: Vec::new(),
            key: None,
            attributes: vec![
                sdp::Attribute {
                    attribute: "rtpmap".to_string(),
                    value: Some(format!(
                        "{} {}/{}",
                        payload_type,
                        audio_codec.rtpmap_name(),
                        audio_codec.clock_rate()
                    )),
                },
                sdp::Attribute {
                    attribute: "control".to_string(),
                    value: Some("trackID=1".to_string()),
                },
            ],
        });
    }

    let session = sdp::Session {
        origin: sdp::Origin {
            username: Some("-".to_string()),
            sess_id: params.stream_id.to_string(),
            sess_version: 0,
            nettype: "IN".to_string(),
            addrtype: "IP4".to_string(),
            unicast_address: params.bind_address.to_string(),
        },
        session_name: params.stream_id.to_string(),
        session_description: None,
        uri: None,
        emails: Vec::new(),
        phones: Vec::new(),
        connection: Some(sdp::Connection {
            nettype: "IN".to_string(),
            addrtype: "IP4".to_string(),
            connection_address: "0.0.0.0".to_string(),
        }),
        bandwidths: Vec::new(),
        times: vec![sdp::Time {
            start_time: 0,
            stop_time: 0,
            repeats: Vec::new(),
        }],
        time_zones: Vec::new(),
        key: None,
        attributes: vec![sdp::Attribute {
            attribute: "control".to_string(),
            value: Some("*".to_string()),
        }],
        medias,
    };

    let mut output = Vec::new();
    session.write(&mut output).ok()?;
    String::from_utf8(output).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ready_cache() -> ParameterSetCache {
        let mut cache = ParameterSetCache::default();
        cache.observe(&Bytes::from_static(&[0x67, 0x42, 0xe0, 0x1f, 0x96, 0x54]));
        cache.observe(&Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]));
        cache
    }

    #[test]
    fn video_only_sdp_contains_expected_attributes() {
        let cache = ready_cache();
        let sdp_text = build_sdp(&SdpParams {
            stream_id: "cam2",
            bind_address: "192.0.2.1",
            parameter_sets: &cache,
            audio: None,
        })
        .unwrap();

        assert!(sdp_text.starts_with("v=0\r\n"));
        assert!(sdp_text.contains("o=- cam2 0 IN IP4 192.0.2.1"));
        assert!(sdp_text.contains("s=cam2"));
        assert!(sdp_text.contains("m=video 0 RTP/AVP 96"));
        assert!(sdp_text.contains("a=rtpmap:96 H264/90000"));
        assert!(sdp_text.contains("profile-level-id=42e01f"));
        assert!(sdp_text.contains("sprop-parameter-sets="));
        assert!(!sdp_text.contains("m=audio"));
    }

    #[test]
    fn audio_track_is_included_when_requested() {
        let cache = ready_cache();
        let sdp_text = build_sdp(&SdpParams {
            stream_id: "cam2",
            bind_address: "192.0.2.1",
            parameter_sets: &cache,
            audio: Some(AudioCodec::Pcmu),
        })
        .unwrap();

        assert!(sdp_text.contains("m=audio 0 RTP/AVP 0"));
        assert!(sdp_text.contains("a=rtpmap:0 PCMU/8000"));
    }

    #[test]
    fn missing_parameter_sets_falls_back_to_default_profile_level_id() {
        let cache = ParameterSetCache::default();
        let sdp_text = build_sdp(&SdpParams {
            stream_id: "cam2",
            bind_address: "192.0.2.1",
            parameter_sets: &cache,
            audio: None,
        })
        .unwrap();
        assert!(sdp_text.contains("profile-level-id=42e01f"));
        assert!(!sdp_text.contains("sprop-parameter-sets="));
    }
}
