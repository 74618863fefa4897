//! Configuration types consumed from the embedding application.
//!
//! This crate never reads or writes these from disk/database itself — the
//! surrounding app owns persistence and hands us a constructed `RtspConfig`
//! plus a list of `CameraConfig` entries at startup.

use serde::{Deserialize, Serialize};

/// Global RTSP service configuration (§6 of the spec).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    /// Start/stop the server.
    pub enabled: bool,
    /// Listen port.
    pub port: u16,
    /// Bind address.
    pub bind: String,
    /// Basic auth username; auth is enabled when both username and password are non-empty.
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
    /// Include an audio track when the camera has audio capture enabled.
    pub audio_enabled: bool,
    /// ALSA device string; empty means auto-detect. Never persisted back empty.
    pub audio_device: Option<String>,
    /// Encoder target bitrate in bits/s.
    pub video_bitrate: u32,
    /// Encoder preset (e.g. "ultrafast").
    pub video_preset: String,
    /// Only allow one concurrently active client across all streams.
    pub allow_one_client: bool,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8554,
            bind: "0.0.0.0".to_string(),
            username: None,
            password: None,
            audio_enabled: false,
            audio_device: None,
            video_bitrate: 2_000_000,
            video_preset: "ultrafast".to_string(),
            allow_one_client: false,
        }
    }
}

impl RtspConfig {
    pub fn auth_enabled(&self) -> bool {
        self.username.as_ref().is_some_and(|u| !u.is_empty())
            && self.password.as_ref().is_some_and(|p| !p.is_empty())
    }
}

/// One camera entry enumerated by the embedder at startup (§4.7/C7, C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Stable stream identifier, distinct from any URL the client may use.
    pub stream_id: String,
    /// URL path aliases that resolve to this stream (includes `stream_id` itself).
    pub mount_paths: Vec<String>,
    /// ffmpeg input: a passthrough camera URL, or a local MJPEG snapshot endpoint.
    pub input_url: String,
    /// Per-camera override of the global audio device selection.
    #[serde(default)]
    pub audio_device: Option<String>,
    /// Per-camera audio capture enable, defaults to the global setting when `None`.
    #[serde(default)]
    pub audio_enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rtsp_config_matches_spec_defaults() {
        let cfg = RtspConfig::default();
        assert_eq!(cfg.port, 8554);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert!(!cfg.auth_enabled());
    }

    #[test]
    fn auth_enabled_requires_both_username_and_password() {
        let mut cfg = RtspConfig::default();
        cfg.username = Some("admin".to_string());
        assert!(!cfg.auth_enabled());
        cfg.password = Some("secret".to_string());
        assert!(cfg.auth_enabled());
    }

    #[test]
    fn rtsp_config_roundtrips_through_json() {
        let cfg = RtspConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RtspConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, cfg.port);
    }
}
