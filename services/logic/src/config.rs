use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Logic tier configuration sourced from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicConfig {
    // HTTP API bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Lifetime of session mappings and online snapshots without a refresh.
    pub mapping_expiry_secs: u64,
    // Heartbeat interval clients are expected to keep.
    pub node_heartbeat_secs: u64,
    // Heartbeats a client may miss before the connect tier drops it.
    pub node_heartbeat_max: u64,
    // Snapshots older than this are evicted from the cluster totals.
    pub online_deadline_secs: u64,
    // Period of the cluster totals refresh.
    pub online_tick_ms: u64,
}

pub const DEFAULT_BIND: &str = "0.0.0.0:3111";
pub const DEFAULT_METRICS_BIND: &str = "0.0.0.0:3118";
const DEFAULT_MAPPING_EXPIRY_SECS: u64 = 30 * 60;
const DEFAULT_NODE_HEARTBEAT_SECS: u64 = 4 * 60;
const DEFAULT_NODE_HEARTBEAT_MAX: u64 = 2;
const DEFAULT_ONLINE_DEADLINE_SECS: u64 = 5 * 60;
const DEFAULT_ONLINE_TICK_MS: u64 = 10_000;

impl Default for LogicConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3111)),
            metrics_bind: SocketAddr::from(([0, 0, 0, 0], 3118)),
            mapping_expiry_secs: DEFAULT_MAPPING_EXPIRY_SECS,
            node_heartbeat_secs: DEFAULT_NODE_HEARTBEAT_SECS,
            node_heartbeat_max: DEFAULT_NODE_HEARTBEAT_MAX,
            online_deadline_secs: DEFAULT_ONLINE_DEADLINE_SECS,
            online_tick_ms: DEFAULT_ONLINE_TICK_MS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogicConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    mapping_expiry_secs: Option<u64>,
    node_heartbeat_secs: Option<u64>,
    node_heartbeat_max: Option<u64>,
    online_deadline_secs: Option<u64>,
    online_tick_ms: Option<u64>,
}

impl LogicConfig {
    pub fn from_env() -> Result<Self> {
        let bind = std::env::var("COURIER_LOGIC_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_LOGIC_BIND")?;
        let metrics_bind = std::env::var("COURIER_LOGIC_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_LOGIC_METRICS_BIND")?;
        Ok(Self {
            bind,
            metrics_bind,
            mapping_expiry_secs: env_u64(
                "COURIER_MAPPING_EXPIRY_SECS",
                DEFAULT_MAPPING_EXPIRY_SECS,
            ),
            node_heartbeat_secs: env_u64(
                "COURIER_NODE_HEARTBEAT_SECS",
                DEFAULT_NODE_HEARTBEAT_SECS,
            ),
            node_heartbeat_max: env_u64("COURIER_NODE_HEARTBEAT_MAX", DEFAULT_NODE_HEARTBEAT_MAX),
            online_deadline_secs: env_u64(
                "COURIER_ONLINE_DEADLINE_SECS",
                DEFAULT_ONLINE_DEADLINE_SECS,
            ),
            online_tick_ms: env_u64("COURIER_ONLINE_TICK_MS", DEFAULT_ONLINE_TICK_MS),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("COURIER_LOGIC_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read COURIER_LOGIC_CONFIG: {path}"))?;
            let override_cfg: LogicConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse logic config yaml")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, o: LogicConfigOverride) -> Result<()> {
        if let Some(value) = o.bind {
            self.bind = value.parse().with_context(|| "parse bind")?;
        }
        if let Some(value) = o.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        for (slot, value) in [
            (&mut self.mapping_expiry_secs, o.mapping_expiry_secs),
            (&mut self.node_heartbeat_secs, o.node_heartbeat_secs),
            (&mut self.node_heartbeat_max, o.node_heartbeat_max),
            (&mut self.online_deadline_secs, o.online_deadline_secs),
            (&mut self.online_tick_ms, o.online_tick_ms),
        ] {
            if let Some(value) = value.filter(|value| *value > 0) {
                *slot = value;
            }
        }
        Ok(())
    }

    pub fn mapping_expiry(&self) -> Duration {
        Duration::from_secs(self.mapping_expiry_secs)
    }

    pub fn online_tick(&self) -> Duration {
        Duration::from_millis(self.online_tick_ms)
    }

    /// Read deadline handed to connect nodes, in seconds.
    pub fn client_heartbeat_secs(&self) -> i64 {
        (self.node_heartbeat_secs * self.node_heartbeat_max.max(1)) as i64
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[test]
    #[serial]
    fn from_env_uses_defaults() {
        let _g1 = EnvGuard::unset("COURIER_LOGIC_BIND");
        let _g2 = EnvGuard::unset("COURIER_NODE_HEARTBEAT_SECS");
        let _g3 = EnvGuard::unset("COURIER_NODE_HEARTBEAT_MAX");
        let _g4 = EnvGuard::unset("COURIER_ONLINE_DEADLINE_SECS");

        let config = LogicConfig::from_env().expect("config");
        assert_eq!(config.bind, DEFAULT_BIND.parse::<SocketAddr>().expect("addr"));
        assert_eq!(config.client_heartbeat_secs(), 480);
        assert_eq!(config.online_deadline_secs, 300);
        assert_eq!(config.online_tick(), Duration::from_secs(10));
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides_and_rejects_bad_bind() {
        let _g1 = EnvGuard::set("COURIER_NODE_HEARTBEAT_SECS", "30");
        let _g2 = EnvGuard::set("COURIER_NODE_HEARTBEAT_MAX", "0");
        let _g3 = EnvGuard::set("COURIER_LOGIC_BIND", "127.0.0.1:4111");
        let config = LogicConfig::from_env().expect("config");
        assert_eq!(config.node_heartbeat_secs, 30);
        assert_eq!(config.node_heartbeat_max, DEFAULT_NODE_HEARTBEAT_MAX);
        assert_eq!(config.bind.port(), 4111);

        let _g4 = EnvGuard::set("COURIER_LOGIC_BIND", "not-an-addr");
        assert!(LogicConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let _g1 = EnvGuard::unset("COURIER_LOGIC_BIND");
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "bind: \"127.0.0.1:5111\"\nonline_deadline_secs: 60\nonline_tick_ms: 0"
        )
        .expect("write");
        let _g2 = EnvGuard::set(
            "COURIER_LOGIC_CONFIG",
            file.path().to_str().expect("path"),
        );

        let config = LogicConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.bind.port(), 5111);
        assert_eq!(config.online_deadline_secs, 60);
        assert_eq!(config.online_tick_ms, DEFAULT_ONLINE_TICK_MS);
    }
}
