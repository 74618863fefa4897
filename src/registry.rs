//! Stream registry (C7): maps mount-path aliases to a stable `stream_id`
//! and fans out access units to every PLAYING session of that stream.
//!
//! Mount-path resolution is load-bearing (§4.6): a Session always stores
//! the resolved `stream_id`, never the client's literal URL text, so the
//! fanout match in `deliver()` can never silently miss a subscriber because
//! of a URL spelling difference.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::h264::{AccessUnit, ParameterSetCache};
use crate::session::Session;
use crate::wire::sdp::AudioCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodecKind {
    Pcmu,
    Pcma,
    Aac,
    None,
}

impl AudioCodecKind {
    pub fn clock_rate(&self) -> Option<u32> {
        match self {
            Self::Pcmu | Self::Pcma => Some(8_000),
            Self::Aac => Some(44_100),
            Self::None => None,
        }
    }

    pub fn to_sdp_codec(self) -> Option<AudioCodec> {
        match self {
            Self::Pcmu => Some(AudioCodec::Pcmu),
            Self::Pcma => Some(AudioCodec::Pcma),
            // AAC packetization (RFC 3640) is out of scope; see DESIGN.md.
            Self::Aac | Self::None => None,
        }
    }
}

pub struct StreamConfig {
    pub stream_id: String,
    pub mount_paths: HashSet<String>,
    pub video_clock_rate: u32,
    pub audio_codec: AudioCodecKind,
    pub parameter_sets: RwLock<ParameterSetCache>,
    subscribers: RwLock<HashSet<String>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl StreamConfig {
    pub fn new(stream_id: String, mount_paths: Vec<String>) -> Self {
        let mut paths: HashSet<String> = mount_paths.into_iter().collect();
        paths.insert(stream_id.clone());
        Self {
            stream_id,
            mount_paths: paths,
            video_clock_rate: 90_000,
            audio_codec: AudioCodecKind::None,
            parameter_sets: RwLock::new(ParameterSetCache::default()),
            subscribers: RwLock::new(HashSet::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.mount_paths.contains(path)
    }

    /// Subscribe a session to this stream's fanout and spawn its dedicated
    /// delivery task. The task, not this call, does the actual packet
    /// sending, so `deliver()` below never blocks on a client socket.
    ///
    /// Idempotent: a session already subscribed (e.g. PLAY called again, or
    /// PLAY after PAUSE without an intervening TEARDOWN) is left alone
    /// rather than getting a second `run_delivery` task racing the first
    /// one over the same mailbox.
    pub fn subscribe(self: &Arc<Self>, session: Arc<Session>) {
        let already_subscribed = !self.subscribers.write().insert(session.session_id.clone());
        if already_subscribed {
            return;
        }
        self.sessions.write().insert(session.session_id.clone(), session.clone());
        let stream = self.clone();
        tokio::spawn(async move { session.run_delivery(stream).await });
    }

    pub fn unsubscribe(&self, session_id: &str) {
        self.subscribers.write().remove(session_id);
        if let Some(session) = self.sessions.write().remove(session_id) {
            session.close_mailbox();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn observe_nal(&self, nal: &bytes::Bytes) {
        let mut cache = self.parameter_sets.write();
        cache.observe(nal);
    }

    /// Fan out one access unit to every subscriber's mailbox. Enqueuing
    /// never awaits a client socket, so a stalled session can never block
    /// or skip delivery to another.
    pub fn deliver(&self, au: AccessUnit) {
        for nal in &au.nals {
            self.observe_nal(nal);
        }

        let sessions: Vec<Arc<Session>> = {
            let subscribers = self.subscribers.read();
            let sessions = self.sessions.read();
            subscribers
                .iter()
                .filter_map(|id| sessions.get(id).cloned())
                .collect()
        };

        for session in sessions {
            session.enqueue(au.clone());
        }
    }

    /// Fan out one raw audio frame directly (no mailbox — see
    /// `Session::deliver_audio`).
    pub async fn deliver_audio(&self, payload: &[u8], rtp_timestamp: u32) {
        let sessions: Vec<Arc<Session>> = {
            let subscribers = self.subscribers.read();
            let sessions = self.sessions.read();
            subscribers
                .iter()
                .filter_map(|id| sessions.get(id).cloned())
                .collect()
        };
        for session in sessions {
            session.deliver_audio(payload, rtp_timestamp).await;
        }
    }
}

/// Process-wide `mount_path → stream_id` + `stream_id → StreamConfig` map.
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<StreamConfig>>>,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
        })
    }

    pub fn register(&self, config: StreamConfig) -> Arc<StreamConfig> {
        let config = Arc::new(config);
        self.streams.write().insert(config.stream_id.clone(), config.clone());
        config
    }

    pub fn unregister(&self, stream_id: &str) -> Option<Arc<StreamConfig>> {
        self.streams.write().remove(stream_id)
    }

    /// Resolve a client-supplied URL path to its `StreamConfig`, accepting
    /// either the stream root (`cam2`) or a track suffix
    /// (`cam2/trackID=0`) by stripping the suffix before lookup.
    pub fn resolve(&self, path: &str) -> Option<Arc<StreamConfig>> {
        let root = path.split("/trackID=").next().unwrap_or(path);
        let trimmed = root.trim_start_matches('/');
        self.streams
            .read()
            .values()
            .find(|cfg| cfg.matches_path(trimmed))
            .cloned()
    }

    pub fn by_stream_id(&self, stream_id: &str) -> Option<Arc<StreamConfig>> {
        self.streams.read().get(stream_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_matches_any_configured_mount_path() {
        let registry = StreamRegistry::new();
        registry.register(StreamConfig::new("cam2".to_string(), vec!["stream".to_string()]));

        assert!(registry.resolve("cam2").is_some());
        assert!(registry.resolve("stream").is_some());
        assert!(registry.resolve("unknown").is_none());
    }

    #[test]
    fn resolve_strips_track_suffix_before_matching() {
        let registry = StreamRegistry::new();
        registry.register(StreamConfig::new("cam2".to_string(), vec![]));

        let resolved = registry.resolve("cam2/trackID=0").unwrap();
        assert_eq!(resolved.stream_id, "cam2");
    }

    #[test]
    fn resolved_stream_id_is_stable_regardless_of_which_alias_matched() {
        let registry = StreamRegistry::new();
        registry.register(StreamConfig::new("cam2".to_string(), vec!["front-door".to_string()]));

        let via_alias = registry.resolve("front-door").unwrap();
        let via_canonical = registry.resolve("cam2").unwrap();
        assert_eq!(via_alias.stream_id, via_canonical.stream_id);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_removes_from_fanout() {
        let stream = Arc::new(StreamConfig::new("cam1".to_string(), vec![]));
        let session = Arc::new(Session::new("abc".into(), "cam1".into(), None));
        stream.subscribe(session.clone());
        assert_eq!(stream.subscriber_count(), 1);
        stream.unsubscribe(&session.session_id);
        assert_eq!(stream.subscriber_count(), 0);
    }
}
