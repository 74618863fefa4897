//! Wires configured cameras into the stream registry and owns their Source
//! transcoders end to end (C8).
//!
//! The registry, session manager, and RTSP server are process-wide
//! singletons for the lifetime of one `Integration`; nothing outside this
//! module should hold a `StreamConfig`/`Session` reference across a
//! start/stop boundary.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CameraConfig;
use crate::h264::AccessUnit;
use crate::registry::{AudioCodecKind, StreamConfig, StreamRegistry};
use crate::source::{enumerate_capture_devices, select_audio_device, AudioFrame, Source, SourceSpec};

const AU_CHANNEL_CAPACITY: usize = 64;
const AUDIO_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_FRAMERATE: u32 = 25;
const DEFAULT_GOP: u32 = 50;

struct RunningCamera {
    stream_id: String,
    source: Source,
    forward_task: JoinHandle<()>,
    audio_forward_task: Option<JoinHandle<()>>,
}

/// Owns every running camera's Source and its forwarding task into the
/// stream registry's fanout.
pub struct Integration {
    streams: Arc<StreamRegistry>,
    cameras: Vec<RunningCamera>,
}

impl Integration {
    pub fn new(streams: Arc<StreamRegistry>) -> Self {
        Self {
            streams,
            cameras: Vec::new(),
        }
    }

    /// Register and start every configured camera.
    pub fn start(&mut self, cameras: Vec<CameraConfig>, video_bitrate: u32, video_preset: &str, default_audio_enabled: bool) {
        for camera in cameras {
            self.start_camera(camera, video_bitrate, video_preset, default_audio_enabled);
        }
    }

    fn start_camera(&mut self, camera: CameraConfig, video_bitrate: u32, video_preset: &str, default_audio_enabled: bool) {
        let audio_enabled = camera.audio_enabled.unwrap_or(default_audio_enabled);

        let mut stream_config = StreamConfig::new(camera.stream_id.clone(), camera.mount_paths.clone());
        if audio_enabled {
            stream_config.audio_codec = AudioCodecKind::Pcmu;
        }
        let stream = self.streams.register(stream_config);

        let audio_device = if audio_enabled {
            let enumerated = enumerate_capture_devices();
            Some(select_audio_device(camera.audio_device.as_deref(), &enumerated))
        } else {
            None
        };

        let (au_tx, au_rx) = mpsc::channel::<AccessUnit>(AU_CHANNEL_CAPACITY);
        let (audio_tx, audio_rx) = if audio_device.is_some() {
            let (tx, rx) = mpsc::channel::<AudioFrame>(AUDIO_CHANNEL_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let spec = SourceSpec {
            stream_id: camera.stream_id.clone(),
            input_url: camera.input_url.clone(),
            gop: DEFAULT_GOP,
            framerate: DEFAULT_FRAMERATE,
            bitrate: video_bitrate,
            preset: video_preset.to_string(),
            audio_device,
        };

        let source = Source::spawn(spec, au_tx, audio_tx);
        let forward_task = spawn_forwarding(stream.clone(), au_rx);
        let audio_forward_task = audio_rx.map(|rx| spawn_audio_forwarding(stream.clone(), rx));

        tracing::info!(stream_id = %camera.stream_id, audio = audio_enabled, "camera source started");

        self.cameras.push(RunningCamera {
            stream_id: camera.stream_id,
            source,
            forward_task,
            audio_forward_task,
        });
    }

    /// Stop every camera's Source (SIGTERM, wait, SIGKILL — see
    /// `source::terminate_child`) and unregister its stream. Sessions still
    /// subscribed simply stop receiving access units; UDP sessions idle out
    /// via the sweeper, and TCP sessions are torn down when their
    /// connection's next write fails or the client disconnects.
    pub async fn stop(&mut self) {
        for camera in self.cameras.drain(..) {
            let stream_id = camera.stream_id.clone();
            camera.source.stop().await;
            let _ = camera.forward_task.await;
            if let Some(task) = camera.audio_forward_task {
                let _ = task.await;
            }
            self.streams.unregister(&stream_id);
            tracing::info!(stream_id = %stream_id, "camera source stopped");
        }
    }
}

fn spawn_forwarding(stream: Arc<StreamConfig>, mut au_rx: mpsc::Receiver<AccessUnit>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(au) = au_rx.recv().await {
            stream.deliver(au);
        }
    })
}

fn spawn_audio_forwarding(stream: Arc<StreamConfig>, mut audio_rx: mpsc::Receiver<AudioFrame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = audio_rx.recv().await {
            stream.deliver_audio(&frame.payload, frame.rtp_timestamp).await;
        }
    })
}
