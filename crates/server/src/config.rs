use std::{collections::HashMap, fs, time::Duration};

use serde::Deserialize;
use sync_api::{MediatorSettings, RouterSettings};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub heartbeat_interval_secs: u64,
    pub max_missed_heartbeats: u32,
    pub command_ttl_secs: u64,
    pub command_max_attempts: u32,
    pub command_retry_initial_secs: u64,
    pub command_retention_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            heartbeat_interval_secs: 30,
            max_missed_heartbeats: 3,
            command_ttl_secs: 30,
            command_max_attempts: 3,
            command_retry_initial_secs: 2,
            command_retention_secs: 60 * 60,
        }
    }
}

impl Settings {
    /// Applies one `server.toml` style key. Unknown keys are reported and
    /// unparsable values leave the current setting alone.
    fn set(&mut self, key: &str, raw: &str) {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str, slot: &mut T) {
            match raw.trim().parse::<T>() {
                Ok(value) => *slot = value,
                Err(_) => warn!(key, value = raw, "config: ignoring unparsable value"),
            }
        }

        match key {
            "bind_addr" => self.server_bind = raw.to_string(),
            "database_url" => self.database_url = raw.to_string(),
            "heartbeat_interval_secs" => parse(key, raw, &mut self.heartbeat_interval_secs),
            "max_missed_heartbeats" => parse(key, raw, &mut self.max_missed_heartbeats),
            "command_ttl_secs" => parse(key, raw, &mut self.command_ttl_secs),
            "command_max_attempts" => parse(key, raw, &mut self.command_max_attempts),
            "command_retry_initial_secs" => parse(key, raw, &mut self.command_retry_initial_secs),
            "command_retention_secs" => parse(key, raw, &mut self.command_retention_secs),
            other => warn!(key = other, "config: ignoring unknown setting"),
        }
    }

    fn apply_file(&mut self, raw: &str) {
        let file_cfg = match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => file_cfg,
            Err(err) => {
                warn!(error = %err, "config: server.toml is not valid, using defaults");
                return;
            }
        };
        for (key, value) in file_cfg {
            let raw = match value {
                toml::Value::String(text) => text,
                other => other.to_string(),
            };
            self.set(&key, &raw);
        }
    }

    /// Environment overrides. `SERVER_BIND` and `DATABASE_URL` are accepted
    /// alongside their `APP__` forms, which win when both are set.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SERVER_BIND") {
            self.server_bind = v;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = v;
        }
        for key in [
            "bind_addr",
            "database_url",
            "heartbeat_interval_secs",
            "max_missed_heartbeats",
            "command_ttl_secs",
            "command_max_attempts",
            "command_retry_initial_secs",
            "command_retention_secs",
        ] {
            if let Some(v) = lookup(&format!("APP__{}", key.to_ascii_uppercase())) {
                self.set(key, &v);
            }
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn mediator_settings(&self) -> MediatorSettings {
        MediatorSettings {
            heartbeat_interval: self.heartbeat_interval(),
            max_missed_heartbeats: self.max_missed_heartbeats.max(1),
        }
    }

    /// Redelivery backoff doubles from the initial delay and never waits
    /// longer than one heartbeat interval.
    pub fn router_settings(&self) -> RouterSettings {
        let retry_max = self.heartbeat_interval();
        RouterSettings {
            command_ttl: Duration::from_secs(self.command_ttl_secs),
            max_attempts: self.command_max_attempts.max(1),
            retry_initial: Duration::from_secs(self.command_retry_initial_secs).min(retry_max),
            retry_max,
            retention: Duration::from_secs(self.command_retention_secs),
        }
    }

    /// How often the heartbeat and command sweeps run.
    pub fn sweep_interval(&self) -> Duration {
        self.heartbeat_interval().min(Duration::from_secs(1))
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string("server.toml") {
        settings.apply_file(&raw);
    }
    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();
    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");
    if has_drive_prefix(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
