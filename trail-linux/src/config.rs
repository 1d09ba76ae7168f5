//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use trail_core::Coordinate;
use uuid::Uuid;

/// Default service id; both peers must share it.
pub const DEFAULT_SERVICE_ID: Uuid = Uuid::from_u128(0x7b3e_52c4_1d8a_4f60_9c2e_5a7d_1b04_e913);

/// Daemon configuration. File: ~/.config/trail-talk/config.toml or /etc/trail-talk/config.toml.
/// Env overrides: TRAIL_DEVICE_NAME, TRAIL_DEVICE_ADDRESS, TRAIL_SERVICE_ID,
/// TRAIL_DISCOVERY_PORT, TRAIL_TRANSPORT_PORT, TRAIL_REDISCOVER_SECS,
/// TRAIL_BUFFER_SIZE, TRAIL_PEER, TRAIL_AUTO_LISTEN, TRAIL_POSITION ("lat,lon").
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name advertised to peers.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// `AA:BB:CC:DD:EE:FF`; random when unset.
    #[serde(default)]
    pub device_address: Option<String>,
    #[serde(default = "default_service_id")]
    pub service_id: Uuid,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_discovery_window_secs")]
    pub discovery_window_secs: u64,
    /// Start another discovery pass this often while no link is up.
    #[serde(default = "default_rediscover_secs")]
    pub rediscover_secs: u64,
    /// Audio chunk size in bytes. Must match the peer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_silence_threshold_ms")]
    pub silence_threshold_ms: u64,
    #[serde(default = "default_talk_poll_ms")]
    pub talk_poll_ms: u64,
    #[serde(default = "default_location_interval_ms")]
    pub location_interval_ms: u64,
    /// Go back to listening after the link drops.
    #[serde(default = "default_auto_listen")]
    pub auto_listen: bool,
    /// Address to connect to at start-up instead of discovering.
    #[serde(default)]
    pub peer: Option<String>,
    /// Fixed local position; location updates are only sent when set.
    #[serde(default)]
    pub position: Option<Coordinate>,
}

fn default_device_name() -> String {
    "trail-talk".to_string()
}
fn default_service_id() -> Uuid {
    DEFAULT_SERVICE_ID
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_discovery_window_secs() -> u64 {
    12
}
fn default_rediscover_secs() -> u64 {
    30
}
// 40 ms of 8 kHz 16-bit mono.
fn default_buffer_size() -> usize {
    640
}
fn default_silence_threshold_ms() -> u64 {
    1000
}
fn default_talk_poll_ms() -> u64 {
    1000
}
fn default_location_interval_ms() -> u64 {
    5000
}
fn default_auto_listen() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            device_address: None,
            service_id: default_service_id(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            discovery_window_secs: default_discovery_window_secs(),
            rediscover_secs: default_rediscover_secs(),
            buffer_size: default_buffer_size(),
            silence_threshold_ms: default_silence_threshold_ms(),
            talk_poll_ms: default_talk_poll_ms(),
            location_interval_ms: default_location_interval_ms(),
            auto_listen: default_auto_listen(),
            peer: None,
            position: None,
        }
    }
}

impl Config {
    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.discovery_window_secs)
    }

    pub fn rediscover_interval(&self) -> Duration {
        Duration::from_secs(self.rediscover_secs.max(1))
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    /// Never zero; a zero period would make `tokio::time::interval` panic.
    pub fn talk_poll(&self) -> Duration {
        Duration::from_millis(self.talk_poll_ms.max(1))
    }

    pub fn location_interval(&self) -> Duration {
        Duration::from_millis(self.location_interval_ms.max(1))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Overrides from `lookup`; values that do not parse are ignored.
pub fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(s) = lookup("TRAIL_DEVICE_NAME") {
        if !s.trim().is_empty() {
            c.device_name = s.trim().to_string();
        }
    }
    if let Some(s) = lookup("TRAIL_DEVICE_ADDRESS") {
        c.device_address = Some(s);
    }
    if let Some(s) = lookup("TRAIL_SERVICE_ID") {
        if let Ok(id) = s.trim().parse::<Uuid>() {
            c.service_id = id;
        }
    }
    if let Some(s) = lookup("TRAIL_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Some(s) = lookup("TRAIL_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    if let Some(s) = lookup("TRAIL_REDISCOVER_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.rediscover_secs = n;
        }
    }
    if let Some(s) = lookup("TRAIL_BUFFER_SIZE") {
        if let Ok(n) = s.parse::<usize>() {
            c.buffer_size = n;
        }
    }
    if let Some(s) = lookup("TRAIL_PEER") {
        c.peer = Some(s).filter(|p| !p.trim().is_empty());
    }
    if let Some(s) = lookup("TRAIL_AUTO_LISTEN") {
        if let Ok(b) = s.parse::<bool>() {
            c.auto_listen = b;
        }
    }
    if let Some(s) = lookup("TRAIL_POSITION") {
        if let Some(pos) = parse_position(&s) {
            c.position = Some(pos);
        }
    }
}

fn parse_position(s: &str) -> Option<Coordinate> {
    let (lat, lon) = s.split_once(',')?;
    let pos = Coordinate::new(lat.trim().parse().ok()?, lon.trim().parse().ok()?);
    pos.validate().ok()?;
    Some(pos)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/trail-talk/config.toml"));
    }
    out.push(PathBuf::from("/etc/trail-talk/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), "ignoring config file: {}", e),
                },
                Err(e) => tracing::warn!(path = %p.display(), "cannot read config file: {}", e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.buffer_size, 640);
        assert_eq!(c.discovery_window(), Duration::from_secs(12));
        assert_eq!(c.rediscover_interval(), Duration::from_secs(30));
        assert_eq!(c.silence_threshold(), Duration::from_millis(1000));
        assert_eq!(c.location_interval(), Duration::from_millis(5000));
        assert_eq!(c.service_id, DEFAULT_SERVICE_ID);
        assert!(c.auto_listen);
        assert!(c.position.is_none());
    }

    #[test]
    fn file_values() {
        let c: Config = toml::from_str(
            r#"
            device_name = "ridge"
            device_address = "02:11:22:33:44:55"
            buffer_size = 320
            auto_listen = false
            peer = "02:AA:BB:CC:DD:EE"

            [position]
            latitude = 46.5
            longitude = 7.9
            "#,
        )
        .unwrap();
        assert_eq!(c.device_name, "ridge");
        assert_eq!(c.device_address.as_deref(), Some("02:11:22:33:44:55"));
        assert_eq!(c.buffer_size, 320);
        assert!(!c.auto_listen);
        assert_eq!(c.peer.as_deref(), Some("02:AA:BB:CC:DD:EE"));
        assert_eq!(c.position, Some(Coordinate::new(46.5, 7.9)));
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("TRAIL_TRANSPORT_PORT", "50000"),
                ("TRAIL_BUFFER_SIZE", "256"),
                ("TRAIL_REDISCOVER_SECS", "45"),
                ("TRAIL_AUTO_LISTEN", "false"),
                ("TRAIL_POSITION", "55.75, 37.61"),
                ("TRAIL_PEER", "02:00:00:00:00:09"),
            ]),
        );
        assert_eq!(c.transport_port, 50000);
        assert_eq!(c.buffer_size, 256);
        assert_eq!(c.rediscover_interval(), Duration::from_secs(45));
        assert!(!c.auto_listen);
        assert_eq!(c.position, Some(Coordinate::new(55.75, 37.61)));
        assert_eq!(c.peer.as_deref(), Some("02:00:00:00:00:09"));
    }

    #[test]
    fn bad_env_values_ignored() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("TRAIL_DISCOVERY_PORT", "seventy"),
                ("TRAIL_SERVICE_ID", "not-a-uuid"),
                ("TRAIL_POSITION", "95,0"),
                ("TRAIL_PEER", "  "),
            ]),
        );
        assert_eq!(c.discovery_port, 45680);
        assert_eq!(c.service_id, DEFAULT_SERVICE_ID);
        assert!(c.position.is_none());
        assert!(c.peer.is_none());
    }

    #[test]
    fn zero_intervals_clamped() {
        let c = Config {
            talk_poll_ms: 0,
            location_interval_ms: 0,
            rediscover_secs: 0,
            ..Config::default()
        };
        assert_eq!(c.talk_poll(), Duration::from_millis(1));
        assert_eq!(c.location_interval(), Duration::from_millis(1));
        assert_eq!(c.rediscover_interval(), Duration::from_secs(1));
    }
}
