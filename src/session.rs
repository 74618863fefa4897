//! Per-client session state machine and packetization (C4).
//!
//! A `Session` owns one client's SETUP/PLAY/TEARDOWN lifecycle and turns
//! each `AccessUnit` it's handed into wire-ready RTP (and periodic RTCP)
//! for every track the client has set up. Delivery is best-effort: a send
//! failure on one session's channel must never affect another session, the
//! same isolation this codebase's per-connection broadcast fanout already
//! assumes for its single-client model, generalized here to a bounded
//! mailbox per session instead of a single shared broadcast channel.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use crate::error::{Result, RtspError};
use crate::h264::{inject_idr_preamble, AccessUnit, ParameterSetCache};
use crate::registry::StreamConfig;
use crate::wire::rtp::{fragment_nal, pack_packet, RtpHeader};
use crate::wire::rtcp::SenderReport;

pub const DEFAULT_TIMEOUT_S: u64 = 60;
pub const MTU_PAYLOAD: usize = 1400;
pub const MAILBOX_CAPACITY: usize = 128;

const TCP_INTERLEAVE_MARKER: u8 = 0x24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Ready,
    Playing,
}

/// The two ways an RTP/RTCP track can reach a client.
pub enum Transport {
    Udp {
        rtp_socket: Arc<UdpSocket>,
        rtcp_socket: Arc<UdpSocket>,
        client_rtp_addr: SocketAddr,
        client_rtcp_addr: SocketAddr,
    },
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
        writer: Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    },
}

pub struct RtpChannel {
    pub transport: Transport,
    pub ssrc: u32,
    pub payload_type: u8,
    pub clock_rate: u32,
    seq: u16,
    rtp_ts_base: u32,
    first_pts: Option<u32>,
    last_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
}

impl RtpChannel {
    pub fn new(transport: Transport, payload_type: u8, clock_rate: u32) -> Self {
        let mut rng = rand::thread_rng();
        let rtp_ts_base = rng.gen();
        Self {
            transport,
            ssrc: rng.gen(),
            payload_type,
            clock_rate,
            seq: rng.gen(),
            rtp_ts_base,
            first_pts: None,
            last_timestamp: rtp_ts_base,
            packet_count: 0,
            octet_count: 0,
        }
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }

    pub fn rtp_ts_base(&self) -> u32 {
        self.rtp_ts_base
    }

    /// Map a source PTS (already in this track's clock rate) onto this
    /// channel's RTP timestamp space, anchored at the channel's random
    /// starting `rtp_ts_base` so the first AU lands exactly on it.
    fn rtp_timestamp_for(&mut self, pts: u32) -> u32 {
        let first = *self.first_pts.get_or_insert(pts);
        let delta = pts.wrapping_sub(first);
        self.rtp_ts_base.wrapping_add(delta)
    }

    async fn send_packet(&mut self, payload: &[u8], marker: bool, timestamp: u32) -> Result<()> {
        let header = RtpHeader {
            marker,
            payload_type: self.payload_type,
            sequence_number: self.seq,
            timestamp,
            ssrc: self.ssrc,
        };
        let packet = pack_packet(&header, payload);
        self.seq = self.seq.wrapping_add(1);
        self.last_timestamp = timestamp;
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload.len() as u32);

        match &self.transport {
            Transport::Udp {
                rtp_socket,
                client_rtp_addr,
                ..
            } => {
                rtp_socket
                    .send_to(&packet, *client_rtp_addr)
                    .await
                    .map_err(|e| RtspError::Transport(e.to_string()))?;
            }
            Transport::Interleaved { rtp_channel, writer, .. } => {
                write_interleaved(writer, *rtp_channel, &packet).await?;
            }
        }
        Ok(())
    }

    /// Send an RTCP Sender Report for this channel's current counters.
    ///
    /// Carries the RTP timestamp of the most recently sent packet (§4.1: the
    /// SR pairs the current RTP timestamp with the NTP wallclock), not the
    /// channel's initial `rtp_ts_base`.
    pub async fn send_sender_report(&self) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let report = SenderReport::new(
            self.ssrc,
            now.as_secs(),
            now.subsec_nanos(),
            self.last_timestamp,
            self.packet_count,
            self.octet_count,
        );
        let packet = report.pack();

        match &self.transport {
            Transport::Udp {
                rtcp_socket,
                client_rtcp_addr,
                ..
            } => {
                rtcp_socket
                    .send_to(&packet, *client_rtcp_addr)
                    .await
                    .map_err(|e| RtspError::Transport(e.to_string()))?;
            }
            Transport::Interleaved { rtcp_channel, writer, .. } => {
                write_interleaved(writer, *rtcp_channel, &packet).await?;
            }
        }
        Ok(())
    }

    /// Packetize and send one access unit's NALs in order, fragmenting as
    /// needed, with the marker bit set only on the last fragment of the
    /// last NAL.
    async fn deliver_access_unit(&mut self, au: &AccessUnit) -> Result<()> {
        let timestamp = self.rtp_timestamp_for(au.pts_90khz);
        let nal_count = au.nals.len();

        for (nal_idx, nal) in au.nals.iter().enumerate() {
            let fragments = fragment_nal(nal, MTU_PAYLOAD);
            let frag_count = fragments.len();
            for (frag_idx, fragment) in fragments.iter().enumerate() {
                let is_last_nal = nal_idx + 1 == nal_count;
                let is_last_fragment = frag_idx + 1 == frag_count;
                let marker = is_last_nal && is_last_fragment;
                self.send_packet(fragment, marker, timestamp).await?;
            }
        }
        Ok(())
    }

    /// Send cached SPS/PPS as two back-to-back single-NAL packets at
    /// `timestamp − 1`, marker=0 (§4.2 late-join preamble).
    async fn deliver_late_join_preamble(&mut self, cache: &ParameterSetCache, next_pts: u32) -> Result<()> {
        let (Some(sps), Some(pps)) = (cache.sps(), cache.pps()) else {
            return Ok(());
        };
        let timestamp = self.rtp_timestamp_for(next_pts).wrapping_sub(1);
        self.send_packet(sps, false, timestamp).await?;
        self.send_packet(pps, false, timestamp).await?;
        Ok(())
    }
}

async fn write_interleaved(
    writer: &Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    channel: u8,
    packet: &Bytes,
) -> Result<()> {
    let mut framed = BytesMut::with_capacity(4 + packet.len());
    framed.put_u8(TCP_INTERLEAVE_MARKER);
    framed.put_u8(channel);
    framed.put_u16(packet.len() as u16);
    framed.extend_from_slice(packet);

    let mut guard = writer.lock().await;
    guard
        .write_all(&framed)
        .await
        .map_err(|e| RtspError::Transport(e.to_string()))
}

/// A session's bounded inbox of pending access units (§4.4 fanout
/// contract). One per session, drained by a dedicated delivery task so a
/// slow or blocked session can never stall the producer's fanout loop.
/// Overflow drops the oldest queued AU rather than the incoming one,
/// favoring freshness for a live stream over strict arrival order
/// (§9 "Fanout model").
struct Mailbox {
    queue: Mutex<VecDeque<AccessUnit>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

pub struct Session {
    pub session_id: String,
    pub stream_id: String,
    state: Mutex<SessionState>,
    pub tracks: tokio::sync::Mutex<HashMap<&'static str, RtpChannel>>,
    pub client_addr: Option<SocketAddr>,
    pub created_at: std::time::Instant,
    last_activity: Mutex<std::time::Instant>,
    pub timeout_s: u64,
    preamble_sent: Mutex<bool>,
    mailbox: Mailbox,
}

impl Session {
    pub fn new(session_id: String, stream_id: String, client_addr: Option<SocketAddr>) -> Self {
        let now = std::time::Instant::now();
        Self {
            session_id,
            stream_id,
            state: Mutex::new(SessionState::Init),
            tracks: tokio::sync::Mutex::new(HashMap::new()),
            client_addr,
            created_at: now,
            last_activity: Mutex::new(now),
            timeout_s: DEFAULT_TIMEOUT_S,
            preamble_sent: Mutex::new(false),
            mailbox: Mailbox::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = std::time::Instant::now();
    }

    pub fn is_idle(&self) -> bool {
        self.last_activity.lock().elapsed() > Duration::from_secs(self.timeout_s)
    }

    /// SETUP on INIT promotes to READY; SETUP on READY adds another track.
    pub async fn add_track(&self, name: &'static str, channel: RtpChannel) -> Result<()> {
        {
            let state = self.state.lock();
            if *state == SessionState::Playing {
                return Err(RtspError::State("cannot SETUP a track while PLAYING".to_string()));
            }
        }
        self.tracks.lock().await.insert(name, channel);
        *self.state.lock() = SessionState::Ready;
        Ok(())
    }

    pub fn play(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Ready => {
                *state = SessionState::Playing;
                Ok(())
            }
            SessionState::Init => Err(RtspError::State(
                "PLAY requires at least one SETUP track".to_string(),
            )),
            SessionState::Playing => Ok(()),
        }
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Playing => {
                *state = SessionState::Ready;
                Ok(())
            }
            _ => Err(RtspError::State("PAUSE requires PLAYING state".to_string())),
        }
    }

    pub fn dropped_au_count(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue an access unit for this session's delivery task (non-blocking,
    /// never awaits a socket write). When the mailbox is already at capacity
    /// the oldest queued AU is dropped to make room, bumping a counter
    /// logged at debug.
    pub fn enqueue(&self, au: AccessUnit) {
        let mut queue = self.mailbox.queue.lock();
        if queue.len() >= MAILBOX_CAPACITY {
            queue.pop_front();
            self.mailbox.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session_id = %self.session_id, "dropped access unit, mailbox full");
        }
        queue.push_back(au);
        drop(queue);
        self.mailbox.notify.notify_one();
    }

    /// Stop this session's delivery task. Idempotent.
    pub fn close_mailbox(&self) {
        self.mailbox.closed.store(true, Ordering::Relaxed);
        self.mailbox.notify.notify_one();
    }

    /// Drain the mailbox and packetize/send each access unit in order,
    /// until the session is torn down. Spawned once per session by the
    /// stream registry on subscribe (§4.4's fanout contract): this task
    /// owns the session's only blocking sends, so a stalled client here
    /// never holds up the registry's fanout loop or any other session.
    pub async fn run_delivery(self: Arc<Self>, stream: Arc<StreamConfig>) {
        loop {
            if self.mailbox.closed.load(Ordering::Relaxed) {
                return;
            }
            let next = self.mailbox.queue.lock().pop_front();
            let Some(au) = next else {
                self.mailbox.notify.notified().await;
                continue;
            };
            if self.state() != SessionState::Playing {
                continue;
            }
            let parameter_sets = stream.parameter_sets.read().clone();
            self.deliver_one(au, &parameter_sets).await;
        }
    }

    /// Packetize and send one access unit to every PLAYING track, injecting
    /// the IDR preamble first if needed. Per-track failures are logged and
    /// do not stop delivery to the remaining tracks.
    async fn deliver_one(&self, mut au: AccessUnit, parameter_sets: &ParameterSetCache) {
        inject_idr_preamble(&mut au, parameter_sets);

        let mut should_send_preamble = false;
        {
            let mut sent = self.preamble_sent.lock();
            if !*sent && parameter_sets.is_ready() {
                should_send_preamble = true;
                *sent = true;
            }
        }

        let mut tracks = self.tracks.lock().await;
        if let Some(video) = tracks.get_mut("video") {
            if should_send_preamble {
                if let Err(err) = video.deliver_late_join_preamble(parameter_sets, au.pts_90khz).await {
                    tracing::debug!(session_id = %self.session_id, error = %err, "late-join preamble send failed");
                }
            }
            if let Err(err) = video.deliver_access_unit(&au).await {
                tracing::debug!(session_id = %self.session_id, error = %err, "access unit send failed");
            }
        }
    }

    /// Packetize and send one raw audio frame to the "audio" track, if the
    /// session has set one up and is PLAYING. Audio fanout bypasses the
    /// mailbox: frames are small, arrive at a steady low rate, and §9's
    /// design notes scope the harder backpressure guarantee to the video
    /// AU pipeline.
    pub async fn deliver_audio(&self, payload: &[u8], rtp_timestamp: u32) {
        if self.state() != SessionState::Playing {
            return;
        }
        let mut tracks = self.tracks.lock().await;
        if let Some(audio) = tracks.get_mut("audio") {
            if let Err(err) = audio.send_packet(payload, false, rtp_timestamp).await {
                tracing::debug!(session_id = %self.session_id, error = %err, "audio packet send failed");
            }
        }
    }

    /// Build the `RTP-Info` header value for every SETUP track:
    /// `url=<base_url>/trackID=<n>;seq=<S>;rtptime=<T>`, comma-separated.
    pub async fn rtp_info(&self, base_url: &str) -> String {
        let tracks = self.tracks.lock().await;
        tracks
            .iter()
            .map(|(name, channel)| {
                let track_id = if *name == "audio" { 1 } else { 0 };
                format!(
                    "url={base_url}/trackID={track_id};seq={};rtptime={}",
                    channel.seq(),
                    channel.rtp_ts_base()
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub async fn send_sender_reports(&self) {
        let tracks = self.tracks.lock().await;
        for channel in tracks.values() {
            if let Err(err) = channel.send_sender_report().await {
                tracing::debug!(session_id = %self.session_id, error = %err, "sender report send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn udp_channel() -> RtpChannel {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000);
        RtpChannel {
            transport: Transport::Udp {
                rtp_socket: Arc::new(tokio::net::UdpSocket::from_std(
                    std::net::UdpSocket::bind("127.0.0.1:0").unwrap(),
                ).unwrap()),
                rtcp_socket: Arc::new(tokio::net::UdpSocket::from_std(
                    std::net::UdpSocket::bind("127.0.0.1:0").unwrap(),
                ).unwrap()),
                client_rtp_addr: addr,
                client_rtcp_addr: addr,
            },
            ssrc: 1,
            payload_type: 96,
            clock_rate: 90_000,
            seq: 0,
            rtp_ts_base: 1000,
            first_pts: None,
            last_timestamp: 1000,
            packet_count: 0,
            octet_count: 0,
        }
    }

    #[test]
    fn state_machine_rejects_play_without_setup() {
        let session = Session::new("abc".into(), "cam1".into(), None);
        assert!(session.play().is_err());
    }

    #[tokio::test]
    async fn state_machine_allows_setup_then_play_then_pause() {
        let session = Session::new("abc".into(), "cam1".into(), None);
        session.add_track("video", udp_channel()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        session.play().unwrap();
        assert_eq!(session.state(), SessionState::Playing);
        session.pause().unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn setup_is_rejected_while_playing() {
        let session = Session::new("abc".into(), "cam1".into(), None);
        session.add_track("video", udp_channel()).await.unwrap();
        session.play().unwrap();
        assert!(session.add_track("audio", udp_channel()).await.is_err());
    }

    #[tokio::test]
    async fn rtp_timestamp_anchors_first_au_at_base_and_tracks_deltas() {
        let mut channel = udp_channel();
        assert_eq!(channel.rtp_timestamp_for(1000), 1000);
        assert_eq!(channel.rtp_timestamp_for(1000), 1000);
        assert_eq!(channel.rtp_timestamp_for(1500), 1500);
    }

    #[test]
    fn idle_detection_respects_timeout() {
        let session = Session::new("abc".into(), "cam1".into(), None);
        assert!(!session.is_idle());
    }
}
