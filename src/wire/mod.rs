//! Wire-format codecs: RTSP request/response framing, the Transport header,
//! SDP generation, and RTP/RTCP packet packing (C1).

pub mod request;
pub mod rtcp;
pub mod rtp;
pub mod sdp;
pub mod transport;

pub use request::{status_reason, take_request_from_buffer, Method, Request, Response};
pub use rtcp::SenderReport;
pub use rtp::{fragment_nal, pack_packet, RtpHeader};
pub use sdp::{build_sdp, AudioCodec, SdpParams};
pub use transport::{LowerTransport, TransportSpec};
