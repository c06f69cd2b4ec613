use std::time::Duration;

use serde::Deserialize;

/// Bytes read from the upstream per relay iteration.
pub const RELAY_CHUNK_BYTES: usize = 4096;

/// Longest control line accepted from the engine (64 KB).
pub const MAX_ENGINE_LINE_BYTES: usize = 64 * 1024;

/// Line terminator used by the engine control protocol.
pub const ENGINE_LINE_TERMINATOR: &str = "\r\n";

/// Number of positional parameters that may follow the content key.
pub const MAX_POSITIONAL_PARAMS: usize = 5;

/// Value substituted for missing positional parameters.
pub const DEFAULT_PARAM: &str = "0";

/// Upper bound on the best-effort SHUTDOWN write during teardown.
pub const SHUTDOWN_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Depth of the per-client body channel, in relay chunks.
pub const BODY_CHANNEL_DEPTH: usize = 16;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the HTTP surface binds to.
    pub http_host: String,
    pub http_port: u16,
    pub engine: EngineConfig,
    pub relay: RelayConfig,
    pub broadcast: BroadcastConfig,
    /// Playlist plugin settings; the plugin is disabled when absent.
    pub playlist: Option<PlaylistConfig>,
    /// Channel directory to announce streams to; disabled when absent.
    pub cybertv: Option<CyberTvConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 8000,
            engine: EngineConfig::default(),
            relay: RelayConfig::default(),
            broadcast: BroadcastConfig::default(),
            playlist: None,
            cybertv: None,
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}

/// How to reach and authenticate against the streaming engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// Timeout for the handshake and for START/LOADASYNC acknowledgements.
    pub result_timeout_secs: u64,
    pub product_key: String,
    pub gender: Gender,
    pub age: AgeGroup,
    /// Delay applied after a RESUME before playback is released again.
    pub resume_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 62062,
            connect_timeout_secs: 5,
            result_timeout_secs: 10,
            product_key: String::new(),
            gender: Gender::Male,
            age: AgeGroup::From25To34,
            resume_delay_ms: 0,
        }
    }
}

impl EngineConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    pub fn resume_delay(&self) -> Duration {
        Duration::from_millis(self.resume_delay_ms)
    }
}

/// Per-request relay behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub url_timeout_secs: u64,
    /// Pause between URL resolution and the start of relaying/broadcasting.
    pub start_delay_secs: u64,
    /// Grace period before the last client's session is destroyed.
    pub destroy_delay_secs: u64,
    /// Honour engine PAUSE/RESUME while relaying.
    pub obey_pacing: bool,
    pub chunk_size: usize,
    /// Maximum concurrent stream clients; 0 disables the limit.
    pub max_connections: usize,
    pub idle_backoff_ms: u64,
    /// Consecutive empty reads tolerated before the relay ends.
    pub max_idle_polls: u32,
    pub upstream_timeout_secs: u64,
    /// User agents answered with an empty 200 without touching the engine.
    pub fake_user_agents: Vec<String>,
    /// User agents that get canned headers before the engine is started.
    pub fake_header_user_agents: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url_timeout_secs: 40,
            start_delay_secs: 2,
            destroy_delay_secs: 3,
            obey_pacing: true,
            chunk_size: RELAY_CHUNK_BYTES,
            max_connections: 0,
            idle_backoff_ms: 500,
            max_idle_polls: 20,
            upstream_timeout_secs: 10,
            fake_user_agents: Vec::new(),
            fake_header_user_agents: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn url_timeout(&self) -> Duration {
        Duration::from_secs(self.url_timeout_secs)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_secs(self.start_delay_secs)
    }

    pub fn destroy_delay(&self) -> Duration {
        Duration::from_secs(self.destroy_delay_secs)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

/// Settings used when a downstream media relay fans sessions out.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub mux: String,
    /// Prefix sources with `http/ffmpeg://` to force ffmpeg demuxing.
    pub force_ffmpeg: bool,
    /// Wait after starting a broadcast so the relay can open its port.
    pub settle_ms: u64,
    pub pause_poll_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            mux: "ts".to_string(),
            force_ffmpeg: false,
            settle_ms: 500,
            pause_poll_ms: 500,
        }
    }
}

impl BroadcastConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistConfig {
    pub url: String,
    /// `host:port` written into rewritten entries; the request Host header
    /// is used when empty.
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_playlist_refresh")]
    pub refresh_secs: u64,
}

/// CyberTV channel directory endpoints.
///
/// Requests are built as `<add_channel_url><password_hash>&ch_name=...` and
/// `<add_server_url><password_hash>&serv_addr=...`.
#[derive(Debug, Clone, Deserialize)]
pub struct CyberTvConfig {
    pub add_channel_url: String,
    pub add_server_url: String,
    #[serde(default)]
    pub password_hash: String,
    /// Publicly reachable address announced for this gateway and its channels.
    pub global_ip: String,
    /// Port viewers use for announced channels (the media relay's output port).
    #[serde(default = "default_cybertv_output_port")]
    pub output_port: u16,
    #[serde(default = "default_cybertv_timeout")]
    pub timeout_secs: u64,
}

impl CyberTvConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_cybertv_output_port() -> u16 {
    8081
}

fn default_cybertv_timeout() -> u64 {
    10
}

fn default_playlist_refresh() -> u64 {
    60 * 60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn code(self) -> u8 {
        match self {
            Gender::Male => 1,
            Gender::Female => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeGroup {
    Under13,
    From13To17,
    From18To24,
    From25To34,
    From35To44,
    From45To54,
    From55To64,
    Over64,
}

impl AgeGroup {
    pub fn code(self) -> u8 {
        match self {
            AgeGroup::Under13 => 1,
            AgeGroup::From13To17 => 2,
            AgeGroup::From18To24 => 3,
            AgeGroup::From25To34 => 4,
            AgeGroup::From35To44 => 5,
            AgeGroup::From45To54 => 6,
            AgeGroup::From55To64 => 7,
            AgeGroup::Over64 => 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{"http_port": 8080, "engine": {"port": 62063, "age": "from18_to24"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.engine.port, 62063);
        assert_eq!(cfg.engine.host, "127.0.0.1");
        assert_eq!(cfg.engine.age.code(), 3);
        assert_eq!(cfg.relay.chunk_size, RELAY_CHUNK_BYTES);
        assert!(cfg.playlist.is_none());
        assert!(cfg.cybertv.is_none());
    }

    #[test]
    fn test_cybertv_section_defaults() {
        let cfg: GatewayConfig = serde_json::from_str(
            r#"{"cybertv": {"add_channel_url": "http://dir/add_ch.php?pass=",
                            "add_server_url": "http://dir/add_serv.php?pass=",
                            "global_ip": "203.0.113.7"}}"#,
        )
        .unwrap();
        let cybertv = cfg.cybertv.unwrap();
        assert_eq!(cybertv.output_port, 8081);
        assert_eq!(cybertv.timeout(), Duration::from_secs(10));
        assert!(cybertv.password_hash.is_empty());
    }
}
