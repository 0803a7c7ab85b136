//! Configuration parameters recognized by the core (`spec.md` §6). Fields
//! outside this set (network credentials, firmware-update endpoints, mDNS,
//! dashboard) belong to external collaborators and are not modeled here.

use std::time::Duration;

use serde::Deserialize;

fn default_tcp_port() -> u16 {
    8000
}
fn default_max_clients() -> usize {
    5
}
fn default_client_idle_timeout_secs() -> u64 {
    300
}
fn default_dongle_serial() -> String {
    "0000000000".to_string()
}
fn default_response_timeout_ms() -> u64 {
    1000
}
fn default_inter_frame_gap_ms() -> u64 {
    50
}
fn default_probe_backoff_base_secs() -> u64 {
    5
}
fn default_probe_backoff_max_secs() -> u64 {
    300
}
fn default_cache_max_entries() -> usize {
    10
}
fn default_cache_ttl_secs() -> u64 {
    600
}
fn default_request_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tcp_port: u16,
    pub max_clients: usize,
    pub client_idle_timeout_secs: u64,
    pub dongle_serial: String,
    pub response_timeout_ms: u64,
    pub inter_frame_gap_ms: u64,
    pub probe_backoff_base_secs: u64,
    pub probe_backoff_max_secs: u64,
    pub cache_max_entries: usize,
    pub cache_ttl_secs: u64,
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            max_clients: default_max_clients(),
            client_idle_timeout_secs: default_client_idle_timeout_secs(),
            dongle_serial: default_dongle_serial(),
            response_timeout_ms: default_response_timeout_ms(),
            inter_frame_gap_ms: default_inter_frame_gap_ms(),
            probe_backoff_base_secs: default_probe_backoff_base_secs(),
            probe_backoff_max_secs: default_probe_backoff_max_secs(),
            cache_max_entries: default_cache_max_entries(),
            cache_ttl_secs: default_cache_ttl_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Config {
    /// Parses a TOML configuration file. Missing fields fall back to the
    /// defaults named in `spec.md` §6.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.client_idle_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn inter_frame_gap(&self) -> Duration {
        Duration::from_millis(self.inter_frame_gap_ms)
    }

    pub fn probe_backoff_base(&self) -> Duration {
        Duration::from_secs(self.probe_backoff_base_secs)
    }

    pub fn probe_backoff_max(&self) -> Duration {
        Duration::from_secs(self.probe_backoff_max_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.tcp_port, 8000);
        assert_eq!(cfg.max_clients, 5);
        assert_eq!(cfg.response_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.inter_frame_gap(), Duration::from_millis(50));
        assert_eq!(cfg.probe_backoff_base(), Duration::from_secs(5));
        assert_eq!(cfg.probe_backoff_max(), Duration::from_secs(300));
        assert_eq!(cfg.cache_max_entries, 10);
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(600));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn partial_toml_layers_over_defaults() {
        let cfg = Config::from_toml_str("tcp_port = 9000\ndongle_serial = \"ABCDEFGHIJ\"\n").unwrap();
        assert_eq!(cfg.tcp_port, 9000);
        assert_eq!(cfg.dongle_serial, "ABCDEFGHIJ");
        assert_eq!(cfg.max_clients, 5);
    }
}
