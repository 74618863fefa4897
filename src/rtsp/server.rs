//! TCP listener and per-connection RTSP request loop (§4.6).
//!
//! Grounded on this codebase's RTSP service: a `tokio::select!` accept loop
//! racing a broadcast shutdown signal against `listener.accept()`, one
//! spawned task per connection tracked so it can be aborted on stop, and a
//! buffered incremental request parse per connection. Generalized from a
//! single always-on client stream to full method dispatch against a
//! multi-camera stream registry and session manager.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

use crate::config::RtspConfig;
use crate::error::{Result, RtspError};
use crate::registry::StreamRegistry;
use crate::session::{RtpChannel, Session, Transport, DEFAULT_TIMEOUT_S};
use crate::session_manager::SessionManager;
use crate::wire::sdp::{VIDEO_CLOCK_RATE, VIDEO_PAYLOAD_TYPE};
use crate::wire::{
    build_sdp, status_reason, take_request_from_buffer, LowerTransport, Method, Request,
    Response, SdpParams, TransportSpec,
};

/// Map a crate-wide error to the RTSP status code it's served as. Lives
/// here, next to the method dispatch, rather than on the error type itself.
pub fn status_for_error(err: &RtspError) -> u16 {
    match err {
        RtspError::Protocol(_) => 400,
        RtspError::UnsupportedMethod(_) => 501,
        RtspError::UnsupportedTransport(_) => 461,
        RtspError::NotFound(_) => 404,
        RtspError::TooManyClients(_) => 453,
        RtspError::UnknownSession(_) => 454,
        RtspError::State(_) => 455,
        RtspError::Unauthorized => 401,
        RtspError::Transport(_) => 500,
        RtspError::Source(_) => 500,
        RtspError::ParametersUnavailable(_) => 503,
        RtspError::Io(_) => 500,
        RtspError::Fatal(_) => 500,
    }
}

pub struct RtspServer {
    config: ArcSwap<RtspConfig>,
    streams: Arc<StreamRegistry>,
    sessions: Arc<SessionManager>,
    shutdown_tx: broadcast::Sender<()>,
    /// The one peer currently allowed to stream when `allow_one_client` is
    /// set. Gated per-connection in `handle_connection`, not per-session,
    /// since the rejection happens before any SETUP/PLAY ever occurs.
    active_client: parking_lot::Mutex<Option<SocketAddr>>,
}

impl RtspServer {
    pub fn new(config: RtspConfig, streams: Arc<StreamRegistry>, sessions: Arc<SessionManager>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            streams,
            sessions,
            shutdown_tx,
            active_client: parking_lot::Mutex::new(None),
        })
    }

    pub fn update_config(&self, config: RtspConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the listener and run the accept loop until `shutdown()` is
    /// called. Returns only on shutdown or a fatal bind failure.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let bind_addr: SocketAddr = {
            let cfg = self.config.load();
            format!("{}:{}", cfg.bind, cfg.port)
                .parse()
                .map_err(|e| RtspError::Fatal(format!("invalid RTSP bind address: {e}")))?
        };

        let std_listener = crate::utils::bind_tcp_listener(bind_addr)?;
        let listener = TcpListener::from_std(std_listener)?;
        tracing::info!(%bind_addr, "RTSP server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut client_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("RTSP server shutdown signal received");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let server = self.clone();
                            let task = tokio::spawn(async move {
                                server.handle_connection(stream, addr).await;
                            });
                            client_tasks.retain(|t| !t.is_finished());
                            client_tasks.push(task);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "RTSP accept failed");
                        }
                    }
                }
            }
        }

        for task in client_tasks {
            task.abort();
        }
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);

        if self.config.load().allow_one_client && !self.claim_client_slot(addr) {
            tracing::debug!(client = %addr, "rejecting connection, another client is active");
            let (mut reader, writer_half) = stream.into_split();
            let writer = Arc::new(tokio::sync::Mutex::new(writer_half));
            if let Ok(Some((request, _))) = wait_for_one_request(&mut reader).await {
                let response = response_for_error(&request, &RtspError::TooManyClients(addr.to_string()));
                let _ = write_response(&writer, &response).await;
            }
            return;
        }

        let (mut reader, writer_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer_half));
        let mut buf = BytesMut::with_capacity(4096);
        let mut read_buf = [0u8; 4096];
        let mut connection_sessions: Vec<String> = Vec::new();

        'connection: loop {
            let request = loop {
                match take_request_from_buffer(&buf) {
                    Ok(Some((request, consumed))) => {
                        let _ = buf.split_to(consumed);
                        break Some(request);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(client = %addr, error = %err, "malformed RTSP request");
                        let response = Response::new(400, status_reason(400)).with_header("CSeq", "0");
                        let _ = write_response(&writer, &response).await;
                        break 'connection;
                    }
                }

                match reader.read(&mut read_buf).await {
                    Ok(0) => break 'connection,
                    Ok(n) => buf.extend_from_slice(&read_buf[..n]),
                    Err(err) if is_connection_reset(&err) => {
                        tracing::debug!(client = %addr, "RTSP client connection reset");
                        break 'connection;
                    }
                    Err(err) => {
                        tracing::warn!(client = %addr, error = %err, "RTSP read error");
                        break 'connection;
                    }
                }
            };

            let Some(request) = request else { break 'connection };

            tracing::debug!(client = %addr, method = request.method.as_str(), uri = %request.uri, "RTSP request");

            let response = self.dispatch(&request, addr, &writer, &mut connection_sessions).await;

            if write_response(&writer, &response).await.is_err() {
                tracing::debug!(client = %addr, "RTSP write failed, tearing down connection");
                break 'connection;
            }
        }

        for session_id in connection_sessions {
            self.teardown_session(&session_id).await;
        }

        if self.config.load().allow_one_client {
            self.release_client_slot(addr);
        }
    }

    /// Claim the single-client slot for `addr`, or confirm it already holds
    /// it (a client's later requests land on the same connection, so this
    /// only matters at connect time). Returns `false` if another peer holds
    /// the slot.
    fn claim_client_slot(&self, addr: SocketAddr) -> bool {
        let mut active = self.active_client.lock();
        match *active {
            Some(current) if current != addr => false,
            Some(_) => true,
            None => {
                *active = Some(addr);
                true
            }
        }
    }

    fn release_client_slot(&self, addr: SocketAddr) {
        let mut active = self.active_client.lock();
        if *active == Some(addr) {
            *active = None;
        }
    }

    async fn dispatch(
        &self,
        req: &Request,
        addr: SocketAddr,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
        connection_sessions: &mut Vec<String>,
    ) -> Response {
        if req.method != Method::Options {
            if let Err(err) = self.check_auth(req) {
                return response_for_error(req, &err);
            }
        }

        let result = match req.method {
            Method::Options => Ok(handle_options(req)),
            Method::Describe => self.handle_describe(req).await,
            Method::Setup => self
                .handle_setup(req, addr, writer)
                .await
                .map(|(response, session)| {
                    if !connection_sessions.contains(&session.session_id) {
                        connection_sessions.push(session.session_id.clone());
                    }
                    response
                }),
            Method::Play => self.handle_play(req).await,
            Method::Pause => self.handle_pause(req).await,
            Method::Teardown => self.handle_teardown(req).await,
            Method::GetParameter => self.handle_get_parameter(req).await,
            Method::SetParameter => Err(RtspError::UnsupportedMethod("SET_PARAMETER".to_string())),
        };

        match result {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(error = %err, "RTSP request failed");
                response_for_error(req, &err)
            }
        }
    }

    fn check_auth(&self, req: &Request) -> Result<()> {
        let cfg = self.config.load();
        if !cfg.auth_enabled() {
            return Ok(());
        }

        let header = req.header("authorization").ok_or(RtspError::Unauthorized)?;
        let encoded = header.strip_prefix("Basic ").ok_or(RtspError::Unauthorized)?;
        let decoded = BASE64.decode(encoded).map_err(|_| RtspError::Unauthorized)?;
        let decoded = String::from_utf8(decoded).map_err(|_| RtspError::Unauthorized)?;
        let (user, pass) = decoded.split_once(':').ok_or(RtspError::Unauthorized)?;

        let expected_user = cfg.username.as_deref().unwrap_or("");
        let expected_pass = cfg.password.as_deref().unwrap_or("");
        if user == expected_user && pass == expected_pass {
            Ok(())
        } else {
            Err(RtspError::Unauthorized)
        }
    }

    async fn handle_describe(&self, req: &Request) -> Result<Response> {
        let path = extract_path(&req.uri);
        let stream = self.streams.resolve(path).ok_or_else(|| RtspError::NotFound(path.to_string()))?;

        let parameter_sets = stream.parameter_sets.read().clone();
        if !parameter_sets.is_ready() {
            return Err(RtspError::ParametersUnavailable(stream.stream_id.clone()));
        }

        let bind_address = self.config.load().bind.clone();
        let sdp_text = build_sdp(&SdpParams {
            stream_id: &stream.stream_id,
            bind_address: &bind_address,
            parameter_sets: &parameter_sets,
            audio: stream.audio_codec.to_sdp_codec(),
        })
        .ok_or_else(|| RtspError::Fatal("failed to serialize SDP".to_string()))?;

        Ok(Response::new(200, status_reason(200))
            .with_header("CSeq", req.cseq().unwrap_or("0"))
            .with_body("application/sdp", sdp_text.into_bytes()))
    }

    async fn handle_setup(
        &self,
        req: &Request,
        client_addr: SocketAddr,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    ) -> Result<(Response, Arc<Session>)> {
        let path = extract_path(&req.uri);
        let stream = self.streams.resolve(path).ok_or_else(|| RtspError::NotFound(path.to_string()))?;

        let transport_header = req
            .header("transport")
            .ok_or_else(|| RtspError::UnsupportedTransport("missing Transport header".to_string()))?;
        let transport_spec = TransportSpec::parse(transport_header)?;

        let session = match req.header("session") {
            Some(id) => self.sessions.lookup(id)?,
            None => self.sessions.create(&stream.stream_id),
        };

        let track = track_for_path(path);
        let (payload_type, clock_rate) = match track {
            "audio" => {
                let codec = stream
                    .audio_codec
                    .to_sdp_codec()
                    .ok_or_else(|| RtspError::UnsupportedTransport("stream has no audio track".to_string()))?;
                (codec.payload_type(), codec.clock_rate())
            }
            _ => (VIDEO_PAYLOAD_TYPE, VIDEO_CLOCK_RATE),
        };

        let mut response_spec = transport_spec.clone();
        let transport = match transport_spec.lower {
            LowerTransport::Udp => {
                let client_port = transport_spec
                    .client_port
                    .ok_or_else(|| RtspError::UnsupportedTransport("RTP/AVP requires client_port".to_string()))?;
                let bind_ip: IpAddr = self
                    .config
                    .load()
                    .bind
                    .parse()
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                let (rtp_socket, rtcp_socket, server_port) = bind_udp_pair(bind_ip)?;
                response_spec.server_port = Some(server_port);
                Transport::Udp {
                    rtp_socket,
                    rtcp_socket,
                    client_rtp_addr: SocketAddr::new(client_addr.ip(), client_port.0),
                    client_rtcp_addr: SocketAddr::new(client_addr.ip(), client_port.1),
                }
            }
            LowerTransport::Tcp => {
                let (rtp_channel, rtcp_channel) = transport_spec
                    .interleaved
                    .ok_or_else(|| RtspError::UnsupportedTransport("RTP/AVP/TCP requires interleaved".to_string()))?;
                Transport::Interleaved {
                    rtp_channel,
                    rtcp_channel,
                    writer: writer.clone(),
                }
            }
        };

        let channel = RtpChannel::new(transport, payload_type, clock_rate);
        let ssrc = channel.ssrc;
        session.add_track(track, channel).await?;
        response_spec.ssrc = Some(ssrc);

        let response = Response::new(200, status_reason(200))
            .with_header("CSeq", req.cseq().unwrap_or("0"))
            .with_header("Session", format!("{};timeout={}", session.session_id, DEFAULT_TIMEOUT_S))
            .with_header("Transport", response_spec.to_header_value());

        Ok((response, session))
    }

    async fn handle_play(&self, req: &Request) -> Result<Response> {
        let session_id = req
            .header("session")
            .ok_or_else(|| RtspError::UnknownSession("missing Session header".to_string()))?;
        let session = self.sessions.lookup(session_id)?;
        session.play()?;
        session.touch();

        let stream = self
            .streams
            .by_stream_id(&session.stream_id)
            .ok_or_else(|| RtspError::NotFound(session.stream_id.clone()))?;
        stream.subscribe(session.clone());

        let base_url = format!("rtsp://{}/{}", self.config.load().bind, stream.stream_id);
        let rtp_info = session.rtp_info(&base_url).await;

        Ok(Response::new(200, status_reason(200))
            .with_header("CSeq", req.cseq().unwrap_or("0"))
            .with_header("Session", session.session_id.clone())
            .with_header("Range", "npt=0.000-")
            .with_header("RTP-Info", rtp_info))
    }

    async fn handle_pause(&self, req: &Request) -> Result<Response> {
        let session_id = req
            .header("session")
            .ok_or_else(|| RtspError::UnknownSession("missing Session header".to_string()))?;
        let session = self.sessions.lookup(session_id)?;
        session.pause()?;
        session.touch();

        Ok(Response::new(200, status_reason(200))
            .with_header("CSeq", req.cseq().unwrap_or("0"))
            .with_header("Session", session.session_id.clone()))
    }

    async fn handle_teardown(&self, req: &Request) -> Result<Response> {
        let session_id = req
            .header("session")
            .ok_or_else(|| RtspError::UnknownSession("missing Session header".to_string()))?;
        self.teardown_session(session_id).await;

        Ok(Response::new(200, status_reason(200)).with_header("CSeq", req.cseq().unwrap_or("0")))
    }

    async fn handle_get_parameter(&self, req: &Request) -> Result<Response> {
        if let Some(session_id) = req.header("session") {
            if let Ok(session) = self.sessions.lookup(session_id) {
                session.touch();
            }
        }
        Ok(Response::new(200, status_reason(200)).with_header("CSeq", req.cseq().unwrap_or("0")))
    }

    async fn teardown_session(&self, session_id: &str) {
        if let Some(session) = self.sessions.remove(session_id) {
            if let Some(stream) = self.streams.by_stream_id(&session.stream_id) {
                stream.unsubscribe(&session.session_id);
            }
        }
    }
}

fn handle_options(req: &Request) -> Response {
    Response::new(200, status_reason(200))
        .with_header("CSeq", req.cseq().unwrap_or("0"))
        .with_header("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER")
}

fn response_for_error(req: &Request, err: &RtspError) -> Response {
    let status = status_for_error(err);
    let mut response = Response::new(status, status_reason(status)).with_header("CSeq", req.cseq().unwrap_or("0"));
    if matches!(err, RtspError::Unauthorized) {
        response = response.with_header("WWW-Authenticate", "Basic realm=\"camrtsp\"");
    }
    response
}

/// Strip `rtsp://host[:port]` and a leading slash, leaving the mount path
/// (and any `/trackID=n` suffix) as the registry expects it.
fn extract_path(uri: &str) -> &str {
    let without_scheme = match uri.strip_prefix("rtsp://") {
        Some(rest) => rest.find('/').map_or("", |idx| &rest[idx + 1..]),
        None => uri,
    };
    without_scheme.trim_start_matches('/')
}

fn track_for_path(path: &str) -> &'static str {
    if path.ends_with("trackID=1") {
        "audio"
    } else {
        "video"
    }
}

/// Read just enough off a freshly-accepted connection to parse one request,
/// so a rejected client still gets a properly CSeq-echoed error response
/// instead of a silently closed socket.
async fn wait_for_one_request(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
) -> Result<Option<(Request, usize)>> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some((request, consumed)) = take_request_from_buffer(&buf)? {
            return Ok(Some((request, consumed)));
        }
        match reader.read(&mut chunk).await {
            Ok(0) => return Ok(None),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return Ok(None),
        }
    }
}

async fn write_response(writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>, response: &Response) -> std::io::Result<()> {
    let bytes = response.serialize();
    let mut guard = writer.lock().await;
    guard.write_all(&bytes).await
}

fn is_connection_reset(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof
    )
}

/// Allocate an even/odd UDP port pair for one RTP/RTCP track, retrying on
/// ephemeral ports that happen to land on an odd RTP port.
fn bind_udp_pair(bind_ip: IpAddr) -> Result<(Arc<UdpSocket>, Arc<UdpSocket>, (u16, u16))> {
    for _ in 0..16 {
        let rtp_std = crate::utils::bind_udp_socket(SocketAddr::new(bind_ip, 0))?;
        let rtp_port = rtp_std.local_addr()?.port();
        if rtp_port % 2 != 0 {
            continue;
        }
        let Ok(rtcp_std) = crate::utils::bind_udp_socket(SocketAddr::new(bind_ip, rtp_port + 1)) else {
            continue;
        };
        let rtp = UdpSocket::from_std(rtp_std)?;
        let rtcp = UdpSocket::from_std(rtcp_std)?;
        return Ok((Arc::new(rtp), Arc::new(rtcp), (rtp_port, rtp_port + 1)));
    }
    Err(RtspError::Transport("failed to allocate an even/odd UDP port pair".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_path_strips_scheme_and_host() {
        assert_eq!(extract_path("rtsp://host:8554/cam2"), "cam2");
        assert_eq!(extract_path("rtsp://host/cam2/trackID=0"), "cam2/trackID=0");
    }

    #[test]
    fn extract_path_handles_bare_paths() {
        assert_eq!(extract_path("/cam2"), "cam2");
        assert_eq!(extract_path("*"), "*");
    }

    #[test]
    fn track_for_path_recognizes_audio_suffix() {
        assert_eq!(track_for_path("cam2/trackID=1"), "audio");
        assert_eq!(track_for_path("cam2/trackID=0"), "video");
        assert_eq!(track_for_path("cam2"), "video");
    }

    #[test]
    fn status_for_error_maps_common_variants() {
        assert_eq!(status_for_error(&RtspError::NotFound("x".to_string())), 404);
        assert_eq!(status_for_error(&RtspError::Unauthorized), 401);
        assert_eq!(status_for_error(&RtspError::ParametersUnavailable("x".to_string())), 503);
        assert_eq!(status_for_error(&RtspError::State("x".to_string())), 455);
        assert_eq!(status_for_error(&RtspError::TooManyClients("x".to_string())), 453);
    }

    #[test]
    fn client_slot_admits_one_peer_and_rejects_a_second() {
        let config = RtspConfig {
            allow_one_client: true,
            ..RtspConfig::default()
        };
        let streams = StreamRegistry::new();
        let sessions = SessionManager::new();
        let server = RtspServer::new(config, streams, sessions);

        let a: SocketAddr = "127.0.0.1:10001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:10002".parse().unwrap();
        assert!(server.claim_client_slot(a));
        assert!(server.claim_client_slot(a));
        assert!(!server.claim_client_slot(b));

        server.release_client_slot(a);
        assert!(server.claim_client_slot(b));
    }
}
