use anyhow::{Context, Result};
use courier_hub::BucketConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Connect tier configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    // Identity reported to the logic tier; generated when unset.
    pub server_id: String,
    // Client TCP listener bind addresses.
    pub tcp_binds: Vec<SocketAddr>,
    // Client WebSocket listener bind addresses.
    pub ws_binds: Vec<SocketAddr>,
    // Push API HTTP bind address.
    pub push_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Logic tier base URL.
    pub logic_url: String,
    // Per-request timeout for logic tier calls.
    pub rpc_timeout_ms: u64,
    // Accept tasks per listener; 0 means one per available core.
    pub accept_tasks: usize,
    // Socket send buffer size applied to accepted TCP sockets.
    pub tcp_sndbuf: usize,
    // Socket receive buffer size applied to accepted TCP sockets.
    pub tcp_rcvbuf: usize,
    // Enable TCP keepalive on accepted sockets.
    pub tcp_keepalive: bool,
    // Outbound frames buffered per connection before pushes are rejected.
    pub channel_capacity: usize,
    // Max frame body accepted from clients.
    pub max_body_size: usize,
    // Time allowed between accept and a successful auth frame.
    pub handshake_timeout_ms: u64,
    // Heartbeat interval used when the logic tier does not supply one.
    pub heartbeat_interval_ms: u64,
    // Missed heartbeats tolerated before the connection is closed.
    pub max_missed_heartbeats: u32,
    // Non-auth frames tolerated on the WebSocket handshake.
    pub auth_attempts: usize,
    // Period between successful online renewals.
    pub online_interval_ms: u64,
    // Delay before retrying a failed online renewal.
    pub online_retry_ms: u64,
    // Bucket array sizing.
    pub bucket: BucketConfig,
}

pub const DEFAULT_TCP_BIND: &str = "0.0.0.0:3101";
pub const DEFAULT_WS_BIND: &str = "0.0.0.0:3102";
pub const DEFAULT_PUSH_BIND: &str = "0.0.0.0:3109";
pub const DEFAULT_METRICS_BIND: &str = "0.0.0.0:3108";
pub const DEFAULT_LOGIC_URL: &str = "http://127.0.0.1:3111";
const DEFAULT_RPC_TIMEOUT_MS: u64 = 1000;
const DEFAULT_TCP_BUF: usize = 4096;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 8000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 2;
const DEFAULT_AUTH_ATTEMPTS: usize = 3;
const DEFAULT_ONLINE_INTERVAL_MS: u64 = 10_000;
const DEFAULT_ONLINE_RETRY_MS: u64 = 3000;

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            tcp_binds: vec![SocketAddr::from(([0, 0, 0, 0], 3101))],
            ws_binds: vec![SocketAddr::from(([0, 0, 0, 0], 3102))],
            push_bind: SocketAddr::from(([0, 0, 0, 0], 3109)),
            metrics_bind: SocketAddr::from(([0, 0, 0, 0], 3108)),
            logic_url: DEFAULT_LOGIC_URL.to_string(),
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            accept_tasks: 0,
            tcp_sndbuf: DEFAULT_TCP_BUF,
            tcp_rcvbuf: DEFAULT_TCP_BUF,
            tcp_keepalive: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_body_size: courier_wire::MAX_BODY_SIZE,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            auth_attempts: DEFAULT_AUTH_ATTEMPTS,
            online_interval_ms: DEFAULT_ONLINE_INTERVAL_MS,
            online_retry_ms: DEFAULT_ONLINE_RETRY_MS,
            bucket: BucketConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConnectConfigOverride {
    server_id: Option<String>,
    tcp_binds: Option<Vec<String>>,
    ws_binds: Option<Vec<String>>,
    push_bind: Option<String>,
    metrics_bind: Option<String>,
    logic_url: Option<String>,
    rpc_timeout_ms: Option<u64>,
    accept_tasks: Option<usize>,
    tcp_sndbuf: Option<usize>,
    tcp_rcvbuf: Option<usize>,
    tcp_keepalive: Option<bool>,
    channel_capacity: Option<usize>,
    max_body_size: Option<usize>,
    handshake_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    max_missed_heartbeats: Option<u32>,
    auth_attempts: Option<usize>,
    online_interval_ms: Option<u64>,
    online_retry_ms: Option<u64>,
    bucket: Option<BucketOverride>,
}

#[derive(Debug, Default, Deserialize)]
struct BucketOverride {
    size: Option<usize>,
    channel: Option<usize>,
    room: Option<usize>,
    routine_amount: Option<usize>,
    routine_size: Option<usize>,
    max_conns_per_ip: Option<usize>,
}

impl ConnectConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let server_id = std::env::var("COURIER_SERVER_ID")
            .ok()
            .filter(|value| !value.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let tcp_binds = parse_binds(
            &std::env::var("COURIER_TCP_BIND").unwrap_or_else(|_| DEFAULT_TCP_BIND.to_string()),
        )
        .with_context(|| "parse COURIER_TCP_BIND")?;
        let ws_binds = parse_binds(
            &std::env::var("COURIER_WS_BIND").unwrap_or_else(|_| DEFAULT_WS_BIND.to_string()),
        )
        .with_context(|| "parse COURIER_WS_BIND")?;
        let push_bind = std::env::var("COURIER_PUSH_BIND")
            .unwrap_or_else(|_| DEFAULT_PUSH_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_PUSH_BIND")?;
        let metrics_bind = std::env::var("COURIER_CONNECT_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_CONNECT_METRICS_BIND")?;
        let logic_url =
            std::env::var("COURIER_LOGIC_URL").unwrap_or_else(|_| DEFAULT_LOGIC_URL.to_string());
        let defaults = BucketConfig::default();
        let bucket = BucketConfig {
            size: env_positive("COURIER_BUCKET_SIZE").unwrap_or(defaults.size),
            channel: env_positive("COURIER_BUCKET_CHANNEL").unwrap_or(defaults.channel),
            room: env_positive("COURIER_BUCKET_ROOM").unwrap_or(defaults.room),
            routine_amount: env_positive("COURIER_ROUTINE_AMOUNT")
                .unwrap_or(defaults.routine_amount),
            routine_size: env_positive("COURIER_ROUTINE_SIZE").unwrap_or(defaults.routine_size),
            max_conns_per_ip: std::env::var("COURIER_MAX_CONNS_PER_IP")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(defaults.max_conns_per_ip),
        };
        Ok(Self {
            server_id,
            tcp_binds,
            ws_binds,
            push_bind,
            metrics_bind,
            logic_url,
            rpc_timeout_ms: env_positive("COURIER_RPC_TIMEOUT_MS")
                .unwrap_or(DEFAULT_RPC_TIMEOUT_MS),
            accept_tasks: std::env::var("COURIER_ACCEPT_TASKS")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(0),
            tcp_sndbuf: env_positive("COURIER_TCP_SNDBUF").unwrap_or(DEFAULT_TCP_BUF),
            tcp_rcvbuf: env_positive("COURIER_TCP_RCVBUF").unwrap_or(DEFAULT_TCP_BUF),
            tcp_keepalive: std::env::var("COURIER_TCP_KEEPALIVE")
                .ok()
                .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            channel_capacity: env_positive("COURIER_CHANNEL_CAPACITY")
                .unwrap_or(DEFAULT_CHANNEL_CAPACITY),
            max_body_size: env_positive("COURIER_MAX_BODY_SIZE")
                .unwrap_or(courier_wire::MAX_BODY_SIZE),
            handshake_timeout_ms: env_positive("COURIER_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            heartbeat_interval_ms: env_positive("COURIER_HEARTBEAT_INTERVAL_MS")
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
            max_missed_heartbeats: env_positive("COURIER_MAX_MISSED_HEARTBEATS")
                .unwrap_or(DEFAULT_MAX_MISSED_HEARTBEATS),
            auth_attempts: env_positive("COURIER_AUTH_ATTEMPTS").unwrap_or(DEFAULT_AUTH_ATTEMPTS),
            online_interval_ms: env_positive("COURIER_ONLINE_INTERVAL_MS")
                .unwrap_or(DEFAULT_ONLINE_INTERVAL_MS),
            online_retry_ms: env_positive("COURIER_ONLINE_RETRY_MS")
                .unwrap_or(DEFAULT_ONLINE_RETRY_MS),
            bucket,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("COURIER_CONNECT_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read COURIER_CONNECT_CONFIG: {path}"))?;
            let override_cfg: ConnectConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse connect config yaml")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, o: ConnectConfigOverride) -> Result<()> {
        if let Some(value) = o.server_id
            && !value.is_empty()
        {
            self.server_id = value;
        }
        if let Some(values) = o.tcp_binds {
            self.tcp_binds = parse_bind_list(&values).with_context(|| "parse tcp_binds")?;
        }
        if let Some(values) = o.ws_binds {
            self.ws_binds = parse_bind_list(&values).with_context(|| "parse ws_binds")?;
        }
        if let Some(value) = o.push_bind {
            self.push_bind = value.parse().with_context(|| "parse push_bind")?;
        }
        if let Some(value) = o.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = o.logic_url {
            self.logic_url = value;
        }
        set_positive(&mut self.rpc_timeout_ms, o.rpc_timeout_ms);
        if let Some(value) = o.accept_tasks {
            self.accept_tasks = value;
        }
        set_positive(&mut self.tcp_sndbuf, o.tcp_sndbuf);
        set_positive(&mut self.tcp_rcvbuf, o.tcp_rcvbuf);
        if let Some(value) = o.tcp_keepalive {
            self.tcp_keepalive = value;
        }
        set_positive(&mut self.channel_capacity, o.channel_capacity);
        set_positive(&mut self.max_body_size, o.max_body_size);
        set_positive(&mut self.handshake_timeout_ms, o.handshake_timeout_ms);
        set_positive(&mut self.heartbeat_interval_ms, o.heartbeat_interval_ms);
        set_positive(&mut self.max_missed_heartbeats, o.max_missed_heartbeats);
        set_positive(&mut self.auth_attempts, o.auth_attempts);
        set_positive(&mut self.online_interval_ms, o.online_interval_ms);
        set_positive(&mut self.online_retry_ms, o.online_retry_ms);
        if let Some(bucket) = o.bucket {
            set_positive(&mut self.bucket.size, bucket.size);
            set_positive(&mut self.bucket.channel, bucket.channel);
            set_positive(&mut self.bucket.room, bucket.room);
            set_positive(&mut self.bucket.routine_amount, bucket.routine_amount);
            set_positive(&mut self.bucket.routine_size, bucket.routine_size);
            if let Some(value) = bucket.max_conns_per_ip {
                self.bucket.max_conns_per_ip = value;
            }
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Read deadline for an authenticated connection.
    ///
    /// `negotiated_secs` is the deadline returned by the logic tier, which
    /// already accounts for missed heartbeats; zero keeps the configured
    /// `heartbeat_interval × max_missed_heartbeats`.
    pub fn read_timeout(&self, negotiated_secs: i64) -> Duration {
        if negotiated_secs > 0 {
            return Duration::from_secs(negotiated_secs as u64);
        }
        Duration::from_millis(self.heartbeat_interval_ms) * self.max_missed_heartbeats.max(1)
    }

    pub fn online_interval(&self) -> Duration {
        Duration::from_millis(self.online_interval_ms)
    }

    pub fn online_retry(&self) -> Duration {
        Duration::from_millis(self.online_retry_ms)
    }

    /// Acceptor count per listener.
    pub fn acceptors(&self) -> usize {
        if self.accept_tasks > 0 {
            return self.accept_tasks;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

fn env_positive<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

fn set_positive<T>(slot: &mut T, value: Option<T>)
where
    T: PartialOrd + Default,
{
    if let Some(value) = value
        && value > T::default()
    {
        *slot = value;
    }
}

fn parse_binds(raw: &str) -> Result<Vec<SocketAddr>> {
    let parts: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();
    parse_bind_list(&parts)
}

fn parse_bind_list(values: &[String]) -> Result<Vec<SocketAddr>> {
    values
        .iter()
        .map(|value| {
            value
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid bind address: {value}"))
        })
        .collect()
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
        let _g1 = EnvGuard::unset("COURIER_TCP_BIND");
        let _g2 = EnvGuard::unset("COURIER_WS_BIND");
        let _g3 = EnvGuard::unset("COURIER_CHANNEL_CAPACITY");
        let _g4 = EnvGuard::unset("COURIER_BUCKET_SIZE");
        let _g5 = EnvGuard::set("COURIER_SERVER_ID", "comet-1");
        let _g6 = EnvGuard::unset("COURIER_MAX_CONNS_PER_IP");

        let config = ConnectConfig::from_env().expect("config");
        assert_eq!(config.server_id, "comet-1");
        assert_eq!(config.tcp_binds, vec![DEFAULT_TCP_BIND.parse::<SocketAddr>().unwrap()]);
        assert_eq!(config.ws_binds, vec![DEFAULT_WS_BIND.parse::<SocketAddr>().unwrap()]);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.max_body_size, courier_wire::MAX_BODY_SIZE);
        assert_eq!(config.auth_attempts, 3);
        assert_eq!(config.online_interval(), Duration::from_secs(10));
        assert_eq!(config.online_retry(), Duration::from_secs(3));
        assert_eq!(config.bucket, BucketConfig::default());
    }

    #[test]
    #[serial]
    fn from_env_reads_lists_and_ignores_zero() {
        let _g1 = EnvGuard::set("COURIER_TCP_BIND", "127.0.0.1:4000, 127.0.0.1:4001");
        let _g2 = EnvGuard::set("COURIER_CHANNEL_CAPACITY", "0");
        let _g3 = EnvGuard::set("COURIER_BUCKET_SIZE", "8");
        let _g4 = EnvGuard::set("COURIER_MAX_CONNS_PER_IP", "5");

        let config = ConnectConfig::from_env().expect("config");
        assert_eq!(config.tcp_binds.len(), 2);
        assert_eq!(config.tcp_binds[1].port(), 4001);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.bucket.size, 8);
        assert_eq!(config.bucket.max_conns_per_ip, 5);
    }

    #[test]
    #[serial]
    fn from_env_rejects_bad_bind() {
        let _g1 = EnvGuard::set("COURIER_PUSH_BIND", "not-an-addr");
        let err = ConnectConfig::from_env().expect_err("bad bind");
        assert!(err.to_string().contains("COURIER_PUSH_BIND"));
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let _g1 = EnvGuard::set("COURIER_LOGIC_URL", "http://env:1");
        let _g2 = EnvGuard::unset("COURIER_PUSH_BIND");
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "logic_url: http://yaml:2\n\
             ws_binds: [\"127.0.0.1:9000\"]\n\
             channel_capacity: 5\n\
             max_missed_heartbeats: 0\n\
             bucket:\n  size: 4\n  max_conns_per_ip: 10\n"
        )
        .expect("write yaml");
        let path = file.path().to_string_lossy().to_string();
        let _g3 = EnvGuard::set("COURIER_CONNECT_CONFIG", &path);

        let config = ConnectConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.logic_url, "http://yaml:2");
        assert_eq!(config.ws_binds, vec!["127.0.0.1:9000".parse::<SocketAddr>().unwrap()]);
        assert_eq!(config.channel_capacity, 5);
        assert_eq!(config.max_missed_heartbeats, DEFAULT_MAX_MISSED_HEARTBEATS);
        assert_eq!(config.bucket.size, 4);
        assert_eq!(config.bucket.max_conns_per_ip, 10);
    }

    #[test]
    #[serial]
    fn yaml_missing_file_is_an_error() {
        let _g1 = EnvGuard::set("COURIER_CONNECT_CONFIG", "/nonexistent/courier.yaml");
        let err = ConnectConfig::from_env_or_yaml().expect_err("missing file");
        assert!(err.to_string().contains("COURIER_CONNECT_CONFIG"));
    }

    #[test]
    fn read_timeout_prefers_negotiated_deadline() {
        let mut config = ConnectConfig {
            heartbeat_interval_ms: 1000,
            max_missed_heartbeats: 3,
            ..ConnectConfig::default()
        };
        assert_eq!(config.read_timeout(0), Duration::from_secs(3));
        assert_eq!(config.read_timeout(10), Duration::from_secs(10));
        config.max_missed_heartbeats = 0;
        assert_eq!(config.read_timeout(0), Duration::from_secs(1));
    }
}
