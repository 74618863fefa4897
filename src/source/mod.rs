//! Per-camera ffmpeg transcode subprocess plus optional ALSA audio capture
//! (C3).
//!
//! Grounded on this codebase's extension-process manager: spawn via
//! `tokio::process::Command` with piped stdout/stderr, a dedicated task per
//! stream, `kill_on_drop`, and a restart loop driven by a stall watchdog —
//! generalized from "restart a crashed helper binary" to "restart a
//! continuously-streaming transcoder and keep publishing access units to
//! whoever is listening." The hardware-encoder preference order mirrors the
//! priority-ordered, hardware-before-software candidate list this codebase's
//! encoder registry already builds, adapted to probing `ffmpeg -encoders`
//! and falling back to the next candidate on spawn/early-exit rather than
//! querying an in-process SDK.

mod audio;
mod encoder;

pub use audio::{enumerate_capture_devices, select_audio_device};
pub use encoder::{select_video_encoder, VideoEncoder};

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::h264::{AccessUnit, AccessUnitAssembler};
use crate::utils::LogThrottler;

const STALL_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(30);
const MIN_FRAMERATE: u32 = 10;
const READ_CHUNK: usize = 64 * 1024;
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// PCMU clock rate, fixed by the codec (RFC 3551).
const PCMU_CLOCK_RATE: u32 = 8_000;
/// 20ms of 8kHz 8-bit mu-law samples: a conventional RTP audio packetization
/// interval that keeps per-packet overhead low without adding latency.
const PCMU_FRAME_BYTES: usize = 160;

/// One packetization-ready chunk of raw PCMU audio, paired with the RTP
/// timestamp delta (in the 8kHz clock) it advances by.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub payload: Bytes,
    pub rtp_timestamp: u32,
}

/// What the source needs to know to build its ffmpeg command line.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub stream_id: String,
    pub input_url: String,
    pub gop: u32,
    pub framerate: u32,
    pub bitrate: u32,
    pub preset: String,
    pub audio_device: Option<String>,
}

impl SourceSpec {
    fn clamped_framerate(&self) -> u32 {
        self.framerate.max(MIN_FRAMERATE)
    }
}

/// Handle to a running source. Dropping it stops the subprocess(es).
pub struct Source {
    shutdown: Arc<Notify>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Source {
    /// Spawn the transcoder (and, if configured, audio capture) and start
    /// publishing `AccessUnit`s to `tx` and, if `spec.audio_device` is set,
    /// `AudioFrame`s to `audio_tx`. Runs until `stop()` is called.
    pub fn spawn(spec: SourceSpec, tx: mpsc::Sender<AccessUnit>, audio_tx: Option<mpsc::Sender<AudioFrame>>) -> Self {
        let shutdown = Arc::new(Notify::new());
        let shutdown_for_task = shutdown.clone();

        if let (Some(device), Some(audio_tx)) = (spec.audio_device.clone(), audio_tx) {
            let stream_id = spec.stream_id.clone();
            let audio_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_audio_capture_with_restart(stream_id, device, audio_tx, audio_shutdown).await;
            });
        }

        let task = tokio::spawn(async move {
            run_with_restart(spec, tx, shutdown_for_task).await;
        });

        Self {
            shutdown,
            task: Some(task),
        }
    }

    /// Request shutdown and wait for the run loop to exit.
    pub async fn stop(mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

async fn run_with_restart(spec: SourceSpec, tx: mpsc::Sender<AccessUnit>, shutdown: Arc<Notify>) {
    let mut backoff = BACKOFF_INITIAL;
    let encoder = select_video_encoder();
    tracing::info!(stream_id = %spec.stream_id, encoder = %encoder.codec_name(), "selected video encoder");

    loop {
        let run = run_once(&spec, &encoder, &tx, &shutdown);
        let stopped = tokio::select! {
            result = run => result,
            _ = shutdown.notified() => true,
        };

        if stopped {
            tracing::info!(stream_id = %spec.stream_id, "source stopped");
            return;
        }

        tracing::warn!(
            stream_id = %spec.stream_id,
            backoff_secs = backoff.as_secs(),
            "source exited unexpectedly, restarting"
        );

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.notified() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_CEILING);
    }
}

/// Runs the transcoder once. Returns `true` if shutdown was requested
/// (caller should stop restarting), `false` if it exited/stalled and should
/// be restarted.
async fn run_once(
    spec: &SourceSpec,
    encoder: &VideoEncoder,
    tx: &mpsc::Sender<AccessUnit>,
    shutdown: &Arc<Notify>,
) -> bool {
    let mut child = match spawn_ffmpeg(spec, encoder) {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(stream_id = %spec.stream_id, error = %err, "failed to spawn ffmpeg");
            return false;
        }
    };

    let mut stdout = match child.stdout.take() {
        Some(s) => s,
        None => return false,
    };
    let stderr = child.stderr.take();

    let stderr_task = stderr.map(|stderr| {
        let stream_id = spec.stream_id.clone();
        tokio::spawn(async move { log_stderr(stream_id, stderr).await })
    });

    let mut assembler = AccessUnitAssembler::new();
    let mut pending_tail = BytesMut::new();
    let mut last_bytes_at = Instant::now();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pts: u32 = 0;
    let ts_step = 90_000u32 / spec.clamped_framerate().max(1);

    let outcome = loop {
        let read = tokio::select! {
            read = stdout.read(&mut buf) => read,
            _ = tokio::time::sleep(STALL_TIMEOUT.saturating_sub(last_bytes_at.elapsed())) => {
                tracing::warn!(stream_id = %spec.stream_id, "ffmpeg stdout stalled, restarting");
                break false;
            }
            _ = shutdown.notified() => break true,
        };

        match read {
            Ok(0) => break false, // EOF
            Ok(n) => {
                last_bytes_at = Instant::now();
                pending_tail.extend_from_slice(&buf[..n]);

                // Only NALs terminated by a *later* start code are complete;
                // the bytes from the last observed start code onward might
                // still be growing and are kept for the next read.
                let nals = drain_complete_nals(&mut pending_tail);

                for nal in nals {
                    pts = pts.wrapping_add(ts_step);
                    if let Some(au) = assembler.push(nal, pts) {
                        if tx.try_send(au).is_err() {
                            tracing::debug!(stream_id = %spec.stream_id, "access unit dropped, no capacity");
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(stream_id = %spec.stream_id, error = %err, "ffmpeg stdout read error");
                break false;
            }
        }
    };

    if let Some(au) = assembler.flush() {
        let _ = tx.try_send(au);
    }

    terminate_child(&mut child).await;
    if let Some(handle) = stderr_task {
        handle.abort();
    }

    outcome
}

/// Ask the child to exit with SIGTERM, give it `TERMINATE_GRACE` to flush
/// and quit, then escalate to SIGKILL if it's still alive. ffmpeg traps
/// SIGTERM and finalizes the muxer on receipt; killing it outright risks
/// a corrupt trailing NAL on every restart.
async fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await;
}

/// Scan `buf` for Annex-B start codes and drain every NAL unit that is
/// followed by another start code, leaving the bytes from the last start
/// code onward in `buf` (that final NAL may still be arriving).
fn drain_complete_nals(buf: &mut BytesMut) -> Vec<Bytes> {
    let positions = start_code_positions(buf);
    if positions.len() < 2 {
        return Vec::new();
    }

    let last_start = positions[positions.len() - 1].0;
    let complete_region = buf.split_to(last_start).freeze();
    crate::h264::split_annexb(&complete_region)
        .into_iter()
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Returns `(start_of_code, code_len)` for every start code in `data`.
fn start_code_positions(data: &[u8]) -> Vec<(usize, usize)> {
    let mut positions = Vec::new();
    let mut i = 0usize;
    while i + 3 <= data.len() {
        if i + 4 <= data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 0 && data[i + 3] == 1 {
            positions.push((i, 4));
            i += 4;
            continue;
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            positions.push((i, 3));
            i += 3;
            continue;
        }
        i += 1;
    }
    positions
}

fn spawn_ffmpeg(spec: &SourceSpec, encoder: &VideoEncoder) -> std::io::Result<Child> {
    let gop = spec.gop.max(1).to_string();
    let bitrate = format!("{}", spec.bitrate);

    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-fflags",
        "+genpts",
        "-probesize",
        "32768",
        "-analyzeduration",
        "500000",
        "-i",
        &spec.input_url,
        "-an",
        "-c:v",
        encoder.codec_name(),
        "-preset",
        &spec.preset,
        "-tune",
        "zerolatency",
        "-b:v",
        &bitrate,
        "-g",
        &gop,
        "-x264-params",
        "aud=1:repeat-headers=1",
        "-f",
        "h264",
        "-bsf:v",
        "h264_mp4toannexb",
        "pipe:1",
    ]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.spawn()
}

async fn log_stderr(stream_id: String, stderr: tokio::process::ChildStderr) {
    let throttle = LogThrottler::default();
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.to_ascii_lowercase().contains("error") {
                    if throttle.should_log(&stream_id) {
                        tracing::warn!(stream_id = %stream_id, "{}", line);
                    }
                } else {
                    tracing::info!(stream_id = %stream_id, "{}", line);
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

async fn run_audio_capture_with_restart(
    stream_id: String,
    device: String,
    tx: mpsc::Sender<AudioFrame>,
    shutdown: Arc<Notify>,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        let run = run_audio_capture_once(&stream_id, &device, &tx, &shutdown);
        let stopped = tokio::select! {
            result = run => result,
            _ = shutdown.notified() => true,
        };

        if stopped {
            return;
        }

        tracing::warn!(stream_id = %stream_id, device = %device, backoff_secs = backoff.as_secs(), "audio capture exited, restarting");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.notified() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_CEILING);
    }
}

async fn run_audio_capture_once(
    stream_id: &str,
    device: &str,
    tx: &mpsc::Sender<AudioFrame>,
    shutdown: &Arc<Notify>,
) -> bool {
    let mut child = match spawn_arecord(device) {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(stream_id = %stream_id, device = %device, error = %err, "failed to spawn arecord");
            return false;
        }
    };

    let mut stdout = match child.stdout.take() {
        Some(s) => s,
        None => return false,
    };

    let mut pending = BytesMut::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut rtp_timestamp: u32 = 0;

    let outcome = loop {
        let read = tokio::select! {
            read = stdout.read(&mut buf) => read,
            _ = shutdown.notified() => break true,
        };

        match read {
            Ok(0) => break false,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while pending.len() >= PCMU_FRAME_BYTES {
                    let frame = pending.split_to(PCMU_FRAME_BYTES).freeze();
                    let timestamp = rtp_timestamp;
                    rtp_timestamp = rtp_timestamp.wrapping_add(PCMU_FRAME_BYTES as u32);
                    if tx
                        .try_send(AudioFrame {
                            payload: frame,
                            rtp_timestamp: timestamp,
                        })
                        .is_err()
                    {
                        tracing::debug!(stream_id = %stream_id, "audio frame dropped, no capacity");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(stream_id = %stream_id, error = %err, "arecord stdout read error");
                break false;
            }
        }
    };

    terminate_child(&mut child).await;
    outcome
}

fn spawn_arecord(device: &str) -> std::io::Result<Child> {
    let mut cmd = Command::new("arecord");
    cmd.args([
        "-D",
        device,
        "-f",
        "MU_LAW",
        "-r",
        &PCMU_CLOCK_RATE.to_string(),
        "-c",
        "1",
        "-t",
        "raw",
        "pipe:1",
    ]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());
    cmd.kill_on_drop(true);
    cmd.spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamped_framerate_enforces_minimum_of_ten() {
        let spec = SourceSpec {
            stream_id: "cam1".into(),
            input_url: "http://example/snapshot".into(),
            gop: 30,
            framerate: 2,
            bitrate: 1_000_000,
            preset: "ultrafast".into(),
            audio_device: None,
        };
        assert_eq!(spec.clamped_framerate(), MIN_FRAMERATE);
    }

    #[test]
    fn clamped_framerate_passes_through_when_above_minimum() {
        let spec = SourceSpec {
            stream_id: "cam1".into(),
            input_url: "http://example/snapshot".into(),
            gop: 30,
            framerate: 25,
            bitrate: 1_000_000,
            preset: "ultrafast".into(),
            audio_device: None,
        };
        assert_eq!(spec.clamped_framerate(), 25);
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let mut backoff = BACKOFF_INITIAL;
        for _ in 0..10 {
            backoff = (backoff * 2).min(BACKOFF_CEILING);
        }
        assert_eq!(backoff, BACKOFF_CEILING);
    }

    #[test]
    fn drain_complete_nals_withholds_the_final_unterminated_nal() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x01]);
        buf.extend_from_slice(&[0, 0, 1, 0x68, 0x02]);
        buf.extend_from_slice(&[0, 0, 1, 0x65]); // final NAL still arriving

        let nals = drain_complete_nals(&mut buf);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0].as_ref(), &[0x67, 0x01]);
        assert_eq!(nals[1].as_ref(), &[0x68, 0x02]);
        // the unterminated NAL (plus its start code) is left pending
        assert_eq!(buf.as_ref(), &[0, 0, 1, 0x65]);
    }

    #[test]
    fn drain_complete_nals_waits_for_a_second_start_code() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x01]);
        assert!(drain_complete_nals(&mut buf).is_empty());
        assert_eq!(buf.len(), 6);
    }
}
