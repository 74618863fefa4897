//! Hardware H.264 encoder selection (§4.3).
//!
//! Mirrors this codebase's encoder registry: a priority-ordered candidate
//! list, hardware backends ahead of software, with software always
//! available as a guaranteed fallback. Detection here means checking
//! `ffmpeg -hide_banner -encoders` for the candidate's name rather than
//! querying an in-process SDK, since the actual encode happens in a
//! subprocess.

use std::process::Command;

/// Candidates in priority order; the first one ffmpeg actually reports
/// supporting wins. `Software` is never absent from a stock ffmpeg build.
const HARDWARE_CANDIDATES: &[&str] = &["h264_v4l2m2m", "h264_nvenc", "h264_qsv", "h264_nvmpi"];
const SOFTWARE_FALLBACK: &str = "libx264";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEncoder {
    codec_name: String,
    is_hardware: bool,
}

impl VideoEncoder {
    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn is_hardware(&self) -> bool {
        self.is_hardware
    }
}

/// Probe `ffmpeg -hide_banner -encoders` once and pick the first available
/// hardware candidate, falling back to libx264. If the probe itself fails
/// (ffmpeg missing, unexpected output), assume no hardware encoder is
/// available rather than failing startup — libx264 ships with any
/// reasonably complete ffmpeg build.
pub fn select_video_encoder() -> VideoEncoder {
    let available = probe_available_encoders().unwrap_or_default();
    select_from(&available)
}

fn select_from(available: &[String]) -> VideoEncoder {
    for candidate in HARDWARE_CANDIDATES {
        if available.iter().any(|e| e == candidate) {
            return VideoEncoder {
                codec_name: candidate.to_string(),
                is_hardware: true,
            };
        }
    }
    VideoEncoder {
        codec_name: SOFTWARE_FALLBACK.to_string(),
        is_hardware: false,
    }
}

fn probe_available_encoders() -> Option<Vec<String>> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Some(parse_encoder_names(&text))
}

/// Parses `ffmpeg -encoders` output. Each encoder line looks like:
/// ` V..... h264_v4l2m2m         V4L2 mem2mem H.264 encoder wrapper`
/// preceded by a header ending in a line of dashes. We only need the
/// second whitespace-delimited column.
fn parse_encoder_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut past_header = false;
    for line in text.lines() {
        if !past_header {
            if line.trim_start().starts_with("------") {
                past_header = true;
            }
            continue;
        }
        let mut fields = line.split_whitespace();
        let _flags = fields.next();
        if let Some(name) = fields.next() {
            names.push(name.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_available_hardware_candidate_in_priority_order() {
        let available = vec!["h264_qsv".to_string(), "h264_nvenc".to_string()];
        let chosen = select_from(&available);
        assert_eq!(chosen.codec_name(), "h264_nvenc");
        assert!(chosen.is_hardware());
    }

    #[test]
    fn falls_back_to_libx264_when_nothing_hardware_is_available() {
        let available = vec!["libx264".to_string(), "mpeg4".to_string()];
        let chosen = select_from(&available);
        assert_eq!(chosen.codec_name(), "libx264");
        assert!(!chosen.is_hardware());
    }

    #[test]
    fn parses_encoder_names_past_the_dashed_header() {
        let text = "Encoders:\n V..... = Video\n ------\n V..... h264_v4l2m2m    V4L2 mem2mem\n A..... aac            AAC (native)\n";
        let names = parse_encoder_names(text);
        assert_eq!(names, vec!["h264_v4l2m2m".to_string(), "aac".to_string()]);
    }
}
