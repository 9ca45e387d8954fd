use std::env;
use std::time::Duration;

use clap::ValueEnum;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{DirectoryError, SignalingError};
use crate::media::MediaConstraints;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// How chat text reaches the other participant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ChatMode {
    /// Reliable ordered WebRTC data channel opened by the initiator.
    #[default]
    #[value(name = "data-channel")]
    DataChannel,
    /// `chat_message` frames relayed by the signaling server.
    #[value(name = "relay")]
    SignalingRelay,
}

impl ChatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatMode::DataChannel => "data-channel",
            ChatMode::SignalingRelay => "relay",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "data-channel" | "datachannel" | "data_channel" => Some(ChatMode::DataChannel),
            "relay" | "signaling" | "signaling-relay" => Some(ChatMode::SignalingRelay),
            _ => None,
        }
    }
}

/// Bounded, linearly backing-off reconnect budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Everything a call session needs besides its collaborators.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// Base URL of the call service; REST and signaling endpoints derive from it.
    pub api_base: Url,
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Label of the chat data channel
    pub chat_label: String,
    pub signaling_connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub chat_mode: ChatMode,
    pub media: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            api_base: Url::parse(DEFAULT_API_URL).expect("default api url is valid"),
            ice_servers: default_ice_servers(),
            chat_label: "chat".to_string(),
            signaling_connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(25),
            reconnect: ReconnectPolicy::default(),
            chat_mode: ChatMode::default(),
            media: MediaConstraints::audio_video(),
        }
    }
}

impl CallConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("UNILINK_API_URL") {
            match parse_api_base(&raw) {
                Ok(url) => config.api_base = url,
                Err(err) => tracing::warn!(value = %raw, error = %err, "ignoring UNILINK_API_URL"),
            }
        }

        if lookup("UNILINK_LOCALHOST_ONLY").is_some_and(|v| truthy(&v)) {
            config.ice_servers.clear();
        } else if let Some(raw) = lookup("UNILINK_ICE_SERVERS") {
            let urls: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            config.ice_servers = urls
                .into_iter()
                .map(|url| RTCIceServer {
                    urls: vec![url],
                    ..Default::default()
                })
                .collect();
        }

        if let Some(mode) = lookup("UNILINK_CHAT_MODE").and_then(|v| ChatMode::parse(&v)) {
            config.chat_mode = mode;
        }
        if let Some(ms) = lookup("UNILINK_SIGNALING_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.signaling_connect_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = lookup("UNILINK_HEARTBEAT_SECS").and_then(|v| v.parse().ok()) {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = lookup("UNILINK_RECONNECT_BASE_MS").and_then(|v| v.parse().ok()) {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }
        config
    }

    /// `ws(s)://<base>/ws/webrtc/<call_id>?token=Bearer <token>`
    pub fn signaling_url(&self, call_id: &str, token: &str) -> Result<Url, SignalingError> {
        let mut url = self.api_base.clone();
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(SignalingError::InvalidEndpoint(format!(
                    "unsupported scheme {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::InvalidEndpoint("invalid websocket scheme".into()))?;
        url.path_segments_mut()
            .map_err(|_| SignalingError::InvalidEndpoint("base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["ws", "webrtc", call_id]);
        url.set_query(None);
        url.set_fragment(None);
        url.query_pairs_mut()
            .append_pair("token", &bearer_token(token));
        Ok(url)
    }

    /// REST endpoint under the api base, one path segment per element.
    pub fn api_url(&self, segments: &[&str]) -> Result<Url, DirectoryError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidEndpoint(self.api_base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        url.set_query(None);
        Ok(url)
    }
}

pub fn default_ice_servers() -> Vec<RTCIceServer> {
    DEFAULT_STUN_SERVERS
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.to_string()],
            ..Default::default()
        })
        .collect()
}

pub fn parse_api_base(raw: &str) -> Result<Url, url::ParseError> {
    Url::parse(raw.trim().trim_end_matches('/'))
}

/// The relay expects `Bearer <token>`; callers may hand over either form.
pub fn bearer_token(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

fn truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
