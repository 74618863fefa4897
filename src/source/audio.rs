//! ALSA capture device selection (§4.3).
//!
//! Grounded on this codebase's audio device enumerator: walk the ALSA card
//! list, probe each card/device index for a capture-capable PCM, and prefer
//! the first one found. Generalized to the spec's exact fallback order
//! (explicit config name, then first hardware capture device, then a
//! hardcoded `plughw:0,0`) rather than scoring by sample-rate/channel
//! support, since this component just hands the device string to
//! `arecord`/ffmpeg and never opens the PCM itself.

const FINAL_FALLBACK_DEVICE: &str = "plughw:0,0";

/// One ALSA capture-capable device, as reported by `arecord -l` parsing or
/// the `alsa` crate's card iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlsaCaptureDevice {
    pub card_index: i32,
    pub device_index: i32,
    pub name: String,
}

impl AlsaCaptureDevice {
    pub fn alsa_name(&self) -> String {
        format!("hw:{},{}", self.card_index, self.device_index)
    }
}

/// Select the ALSA device string to pass to the capture subprocess:
/// (a) the configured name if present and non-empty, matched against the
/// enumerated device list; (b) the first hardware capture device found;
/// (c) `plughw:0,0`.
///
/// A configured name that doesn't match anything enumerated is still
/// honored verbatim — the embedder may know about a device this process's
/// enumeration pass missed (a device added after boot, for instance).
pub fn select_audio_device(configured: Option<&str>, enumerated: &[AlsaCaptureDevice]) -> String {
    if let Some(name) = configured {
        if !name.is_empty() {
            return name.to_string();
        }
    }

    if let Some(first) = enumerated.first() {
        return first.alsa_name();
    }

    FINAL_FALLBACK_DEVICE.to_string()
}

/// Enumerate capture-capable ALSA devices. Lives behind the `alsa` crate's
/// card iterator; returns an empty list (never an error) if no sound cards
/// are present, since "no audio hardware" is an expected, recoverable
/// configuration on many embedded boards.
pub fn enumerate_capture_devices() -> Vec<AlsaCaptureDevice> {
    let mut devices = Vec::new();

    for card in alsa::card::Iter::new().flatten() {
        let card_index = card.get_index();
        let name = card.get_name().unwrap_or_else(|_| format!("card{card_index}"));
        for device_index in 0..8 {
            let device_name = format!("hw:{},{}", card_index, device_index);
            if alsa::pcm::PCM::new(&device_name, alsa::Direction::Capture, false).is_ok() {
                devices.push(AlsaCaptureDevice {
                    card_index,
                    device_index,
                    name: name.clone(),
                });
            }
        }
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(card: i32, dev: i32) -> AlsaCaptureDevice {
        AlsaCaptureDevice {
            card_index: card,
            device_index: dev,
            name: format!("card{card}"),
        }
    }

    #[test]
    fn explicit_configured_name_wins_even_if_unenumerated() {
        let enumerated = vec![device(0, 0)];
        assert_eq!(select_audio_device(Some("hw:2,0"), &enumerated), "hw:2,0");
    }

    #[test]
    fn empty_configured_name_falls_through_to_enumeration() {
        let enumerated = vec![device(1, 0)];
        assert_eq!(select_audio_device(Some(""), &enumerated), "hw:1,0");
    }

    #[test]
    fn no_configured_name_uses_first_enumerated_device() {
        let enumerated = vec![device(0, 0), device(1, 0)];
        assert_eq!(select_audio_device(None, &enumerated), "hw:0,0");
    }

    #[test]
    fn falls_back_to_plughw_when_nothing_else_available() {
        assert_eq!(select_audio_device(None, &[]), FINAL_FALLBACK_DEVICE);
    }
}
