//! Flat string-keyed configuration (spec §6 "CLI/environment").
//!
//! Mirrors `original_source/tpn/config.hpp`'s `Config::Load`/`Config::Get`:
//! a `key = value` text file overlaid on documented defaults. Every key is
//! optional; unknown keys are logged and ignored rather than rejected, so
//! older config files keep working against newer builds.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub interface_port: u16,
    pub tracker: Option<String>,
    pub min_connections: usize,
    pub max_connections: usize,
    pub store_max_age: Duration,
    pub cache_max_size: u64,
    pub cache_max_file_size: u64,
    pub keepalive_timeout: Duration,
    pub retransmit_timeout: Duration,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
    pub force_http_tunnel: bool,
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8480,
            interface_port: 8080,
            tracker: None,
            min_connections: 8,
            max_connections: 256,
            store_max_age: Duration::from_secs(6 * 3600),
            cache_max_size: 10 * 1024 * 1024 * 1024,
            cache_max_file_size: 2 * 1024 * 1024 * 1024,
            keepalive_timeout: Duration::from_secs(10),
            retransmit_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(10),
            force_http_tunnel: false,
            data_dir: ".teapotnet".to_string(),
        }
    }
}

impl Config {
    /// Load a config file, overlaying recognized keys onto [`Config::default`].
    /// Missing file is not an error — callers get the defaults.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Config> {
        let mut cfg = Config::default();
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cfg),
            Err(e) => return Err(e),
        };
        let params = parse_params(&text);
        cfg.apply(&params);
        Ok(cfg)
    }

    fn apply(&mut self, params: &HashMap<String, String>) {
        for (key, value) in params {
            match key.as_str() {
                "port" => self.try_set_u16(value, |c, v| c.port = v),
                "interface_port" => self.try_set_u16(value, |c, v| c.interface_port = v),
                "tracker" => self.tracker = Some(value.clone()),
                "min_connections" => self.try_set_usize(value, |c, v| c.min_connections = v),
                "max_connections" => self.try_set_usize(value, |c, v| c.max_connections = v),
                "store_max_age" => self.try_set_secs(value, |c, v| c.store_max_age = v),
                "cache_max_size" => self.try_set_u64(value, |c, v| c.cache_max_size = v),
                "cache_max_file_size" => self.try_set_u64(value, |c, v| c.cache_max_file_size = v),
                "keepalive_timeout" => self.try_set_secs(value, |c, v| c.keepalive_timeout = v),
                "retransmit_timeout" => self.try_set_millis(value, |c, v| c.retransmit_timeout = v),
                "idle_timeout" => self.try_set_secs(value, |c, v| c.idle_timeout = v),
                "request_timeout" => self.try_set_secs(value, |c, v| c.request_timeout = v),
                "force_http_tunnel" => self.force_http_tunnel = value == "true" || value == "1",
                "data_dir" => self.data_dir = value.clone(),
                other => log::warn!("config: unknown key '{other}', ignoring"),
            }
        }
    }

    fn try_set_u16(&mut self, raw: &str, set: impl FnOnce(&mut Self, u16)) {
        match raw.parse() {
            Ok(v) => set(self, v),
            Err(_) => log::warn!("config: invalid integer '{raw}'"),
        }
    }
    fn try_set_usize(&mut self, raw: &str, set: impl FnOnce(&mut Self, usize)) {
        match raw.parse() {
            Ok(v) => set(self, v),
            Err(_) => log::warn!("config: invalid integer '{raw}'"),
        }
    }
    fn try_set_u64(&mut self, raw: &str, set: impl FnOnce(&mut Self, u64)) {
        match raw.parse() {
            Ok(v) => set(self, v),
            Err(_) => log::warn!("config: invalid integer '{raw}'"),
        }
    }
    fn try_set_secs(&mut self, raw: &str, set: impl FnOnce(&mut Self, Duration)) {
        match raw.parse::<u64>() {
            Ok(v) => set(self, Duration::from_secs(v)),
            Err(_) => log::warn!("config: invalid duration (seconds) '{raw}'"),
        }
    }
    fn try_set_millis(&mut self, raw: &str, set: impl FnOnce(&mut Self, Duration)) {
        match raw.parse::<u64>() {
            Ok(v) => set(self, Duration::from_millis(v)),
            Err(_) => log::warn!("config: invalid duration (ms) '{raw}'"),
        }
    }
}

fn parse_params(text: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            params.insert(key.trim().to_string(), value.trim().to_string());
        } else {
            log::warn!("config: malformed line '{line}', ignoring");
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.store_max_age, Duration::from_secs(6 * 3600));
        assert_eq!(cfg.keepalive_timeout, Duration::from_secs(10));
        assert_eq!(cfg.retransmit_timeout, Duration::from_millis(500));
    }

    #[test]
    fn parse_overlays_defaults() {
        let text = "port = 9000\n# comment\nmin_connections=3\nbogus_key=1\n";
        let params = parse_params(text);
        let mut cfg = Config::default();
        cfg.apply(&params);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.min_connections, 3);
        assert_eq!(cfg.max_connections, Config::default().max_connections);
    }
}
