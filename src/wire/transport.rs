//! RTSP `Transport` header parsing and serialization (RFC 2326 §12.39).
//!
//! Only the parameters this server actually negotiates are modeled: UDP
//! unicast with `client_port`/`server_port`, and TCP interleaving with
//! `interleaved`. Multicast and RTP/AVP/TCP without `interleaved` are
//! rejected with `RtspError::UnsupportedTransport`.

use crate::error::{Result, RtspError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSpec {
    pub lower: LowerTransport,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub interleaved: Option<(u8, u8)>,
    pub ssrc: Option<u32>,
}

fn parse_port_pair(value: &str) -> Option<(u16, u16)> {
    let (a, b) = value.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn parse_channel_pair(value: &str) -> Option<(u8, u8)> {
    let (a, b) = value.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

impl TransportSpec {
    /// Parse a SETUP request's `Transport` header. Only the first
    /// semicolon-delimited spec is honored, matching the one transport this
    /// server offers in its SDP.
    pub fn parse(header: &str) -> Result<Self> {
        let spec = header.split(',').next().unwrap_or(header);
        let mut parts = spec.split(';');
        let protocol = parts
            .next()
            .ok_or_else(|| RtspError::UnsupportedTransport("empty Transport header".into()))?
            .trim();

        let lower = match protocol {
            "RTP/AVP" | "RTP/AVP/UDP" => LowerTransport::Udp,
            "RTP/AVP/TCP" => LowerTransport::Tcp,
            other => {
                return Err(RtspError::UnsupportedTransport(format!("unknown protocol {other}")))
            }
        };

        let mut client_port = None;
        let mut server_port = None;
        let mut interleaved = None;
        let mut ssrc = None;

        for param in parts {
            let param = param.trim();
            if let Some(value) = param.strip_prefix("client_port=") {
                client_port = parse_port_pair(value);
            } else if let Some(value) = param.strip_prefix("server_port=") {
                server_port = parse_port_pair(value);
            } else if let Some(value) = param.strip_prefix("interleaved=") {
                interleaved = parse_channel_pair(value);
            } else if let Some(value) = param.strip_prefix("ssrc=") {
                ssrc = u32::from_str_radix(value, 16).ok();
            }
        }

        match lower {
            LowerTransport::Udp if client_port.is_none() => Err(RtspError::UnsupportedTransport(
                "RTP/AVP over UDP requires client_port".into(),
            )),
            LowerTransport::Tcp if interleaved.is_none() => Err(RtspError::UnsupportedTransport(
                "RTP/AVP/TCP requires interleaved".into(),
            )),
            _ => Ok(Self {
                lower,
                client_port,
                server_port,
                interleaved,
                ssrc,
            }),
        }
    }

    /// Render the `Transport` header echoed back in the SETUP response,
    /// filled in with the server-chosen ports/ssrc.
    pub fn to_header_value(&self) -> String {
        let mut out = match self.lower {
            LowerTransport::Udp => "RTP/AVP;unicast".to_string(),
            LowerTransport::Tcp => "RTP/AVP/TCP;unicast".to_string(),
        };
        if let Some((a, b)) = self.client_port {
            out.push_str(&format!(";client_port={a}-{b}"));
        }
        if let Some((a, b)) = self.server_port {
            out.push_str(&format!(";server_port={a}-{b}"));
        }
        if let Some((a, b)) = self.interleaved {
            out.push_str(&format!(";interleaved={a}-{b}"));
        }
        if let Some(ssrc) = self.ssrc {
            out.push_str(&format!(";ssrc={ssrc:08x}"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_unicast_client_port() {
        let spec = TransportSpec::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(spec.lower, LowerTransport::Udp);
        assert_eq!(spec.client_port, Some((5000, 5001)));
    }

    #[test]
    fn parses_tcp_interleaved() {
        let spec = TransportSpec::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        assert_eq!(spec.lower, LowerTransport::Tcp);
        assert_eq!(spec.interleaved, Some((0, 1)));
    }

    #[test]
    fn udp_without_client_port_is_rejected() {
        assert!(TransportSpec::parse("RTP/AVP;unicast").is_err());
    }

    #[test]
    fn tcp_without_interleaved_is_rejected() {
        assert!(TransportSpec::parse("RTP/AVP/TCP;unicast").is_err());
    }

    #[test]
    fn multicast_is_rejected_as_unsupported() {
        assert!(TransportSpec::parse("RTP/AVP/TCP/UDP;multicast").is_err());
    }

    #[test]
    fn header_value_round_trips_fields() {
        let spec = TransportSpec {
            lower: LowerTransport::Udp,
            client_port: Some((5000, 5001)),
            server_port: Some((6000, 6001)),
            interleaved: None,
            ssrc: Some(0xdead_beef),
        };
        let rendered = spec.to_header_value();
        assert!(rendered.contains("client_port=5000-5001"));
        assert!(rendered.contains("server_port=6000-6001"));
        assert!(rendered.contains("ssrc=deadbeef"));
    }
}
