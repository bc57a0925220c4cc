use std::net::Ipv4Addr;
use std::time::Duration;

/// Environment variable names
pub const ENV_SERVER_IPV4: &str = "server_ipv4";
pub const ENV_SIP_UDP_PORT: &str = "sip_udp_port";
pub const ENV_HTTP_PORT: &str = "http_port";
pub const ENV_MEDIA_DIR: &str = "media_dir";
pub const ENV_REPO_NAME: &str = "repo_name";
pub const ENV_RATE_LIMIT: &str = "rate_limit";
pub const ENV_T1_MS: &str = "t1_ms";
pub const ENV_RETX_COUNT: &str = "retx_count";
pub const ENV_PROBING_SEC: &str = "probing_sec";
pub const ENV_MAX_CALL_DURATION_SEC: &str = "max_call_duration_sec";
pub const ENV_ANSWER_DELAY_MS: &str = "answer_delay_ms";
pub const ENV_MEDIA_START_PORT: &str = "media_start_port";
pub const ENV_MEDIA_END_PORT: &str = "media_end_port";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("no media directory provided")]
    MissingMediaDir,
    #[error("no usable IPv4 interface found")]
    NoUsableInterface,
}

/// Runtime configuration, resolved once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub server_ipv4: Ipv4Addr,
    pub sip_udp_port: u16,
    pub http_port: u16,
    pub media_dir: String,
    pub repo_name: String,

    /// Inbound calls per second, -1 disables the limit
    pub rate_limit: i64,

    /// Retransmission base interval T1
    pub t1: Duration,

    /// Number of retransmissions before a transaction times out
    pub retx_count: u32,

    /// In-dialog OPTIONS probing interval, 0 disables
    pub probing_sec: u64,

    /// Maximum call duration, 0 disables
    pub max_call_duration_sec: u64,

    /// Pause between 180 and 200 on inbound INVITEs
    pub answer_delay: Duration,

    pub media_start_port: u16,
    pub media_end_port: u16,

    /// Worker pool size
    pub workers: usize,

    /// Capacity of the packet queue between the reader and the workers
    pub queue_capacity: usize,

    /// Frames buffered before in-band DTMF decoding runs (20 ms each)
    pub dtmf_packets_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ipv4: Ipv4Addr::LOCALHOST,
            sip_udp_port: 5060,
            http_port: 8080,
            media_dir: String::new(),
            repo_name: "mrf".into(),
            rate_limit: -1,
            t1: Duration::from_millis(500),
            retx_count: 7,
            probing_sec: 0,
            max_call_duration_sec: 0,
            answer_delay: Duration::from_millis(200),
            media_start_port: 10000,
            media_end_port: 10500,
            workers: num_cpus::get(),
            queue_capacity: 1000,
            dtmf_packets_count: 10,
        }
    }
}

/// Parse an integer with a default and strictly exclusive bounds.
///
/// Mirrors the historical validator contract: an empty value yields the
/// default and is fine, anything parsed must satisfy `min < v < max` or
/// the default is returned with `ok = false`.
pub fn str_to_int_default_min_max(s: &str, default: i64, min: i64, max: i64) -> (i64, bool) {
    let s = s.trim();
    if s.is_empty() {
        return (default, true);
    }

    match s.parse::<i64>() {
        Ok(v) if v > min && v < max => (v, true),
        _ => (default, false),
    }
}

impl Config {
    /// Resolve the configuration from the environment.
    ///
    /// Fails on an invalid SIP/HTTP port, a missing media directory or,
    /// when no bind address is given, the absence of a usable private
    /// IPv4 interface.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        config.server_ipv4 = match std::env::var(ENV_SERVER_IPV4) {
            Ok(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    var: ENV_SERVER_IPV4,
                    value,
                })?,
            Err(_) => first_private_ipv4().ok_or(ConfigError::NoUsableInterface)?,
        };

        config.sip_udp_port = int_env(ENV_SIP_UDP_PORT, 5060, 4999, 6000)? as u16;
        config.http_port = int_env(ENV_HTTP_PORT, 8080, 79, 9999)? as u16;

        config.media_dir =
            std::env::var(ENV_MEDIA_DIR).map_err(|_| ConfigError::MissingMediaDir)?;

        if let Ok(name) = std::env::var(ENV_REPO_NAME) {
            config.repo_name = name;
        }

        config.rate_limit = int_env_lenient(ENV_RATE_LIMIT, config.rate_limit, -2, i64::MAX);
        config.t1 = Duration::from_millis(int_env_lenient(ENV_T1_MS, 500, 0, 10_000) as u64);
        config.retx_count = int_env_lenient(ENV_RETX_COUNT, 7, 0, 32) as u32;
        config.probing_sec = int_env_lenient(ENV_PROBING_SEC, 0, -1, 3600) as u64;
        config.max_call_duration_sec =
            int_env_lenient(ENV_MAX_CALL_DURATION_SEC, 0, -1, 86_400) as u64;
        config.answer_delay = Duration::from_millis(int_env_lenient(
            ENV_ANSWER_DELAY_MS,
            200,
            -1,
            10_000,
        ) as u64);

        config.media_start_port =
            int_env_lenient(ENV_MEDIA_START_PORT, 10000, 1024, 65_535) as u16;
        config.media_end_port = int_env_lenient(ENV_MEDIA_END_PORT, 10500, 1024, 65_535) as u16;

        if config.media_end_port < config.media_start_port {
            return Err(ConfigError::InvalidValue {
                var: ENV_MEDIA_END_PORT,
                value: config.media_end_port.to_string(),
            });
        }

        Ok(config)
    }
}

/// Strict variant: an out-of-range value aborts startup
fn int_env(var: &'static str, default: i64, min: i64, max: i64) -> Result<i64, ConfigError> {
    let value = std::env::var(var).unwrap_or_default();
    let (parsed, ok) = str_to_int_default_min_max(&value, default, min, max);

    if ok {
        Ok(parsed)
    } else {
        Err(ConfigError::InvalidValue { var, value })
    }
}

/// Lenient variant: an out-of-range value falls back to the default
fn int_env_lenient(var: &'static str, default: i64, min: i64, max: i64) -> i64 {
    let value = std::env::var(var).unwrap_or_default();
    let (parsed, ok) = str_to_int_default_min_max(&value, default, min, max);

    if !ok {
        tracing::warn!(var, %value, "invalid value, using default {default}");
    }

    parsed
}

/// An alternative bind address after the configured one failed: the
/// first private interface address that differs from the failed one
pub fn fallback_ipv4(failed: Ipv4Addr) -> Option<Ipv4Addr> {
    first_private_ipv4().filter(|ip| *ip != failed)
}

/// First non-loopback private IPv4 address of an interface that is up
fn first_private_ipv4() -> Option<Ipv4Addr> {
    let interfaces = get_if_addrs::get_if_addrs().ok()?;

    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.ip() {
            std::net::IpAddr::V4(ip) if ip.is_private() => Some(ip),
            _ => None,
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_value_is_default() {
        assert_eq!(str_to_int_default_min_max("", 5060, 4999, 6000), (5060, true));
        assert_eq!(str_to_int_default_min_max("  ", 8080, 79, 9999), (8080, true));
    }

    #[test]
    fn bounds_are_strictly_exclusive() {
        // the boundary values themselves are invalid
        assert_eq!(str_to_int_default_min_max("4999", 5060, 4999, 6000), (5060, false));
        assert_eq!(str_to_int_default_min_max("6000", 5060, 4999, 6000), (5060, false));

        assert_eq!(str_to_int_default_min_max("5000", 5060, 4999, 6000), (5000, true));
        assert_eq!(str_to_int_default_min_max("5999", 5060, 4999, 6000), (5999, true));
    }

    #[test]
    fn garbage_falls_back() {
        assert_eq!(str_to_int_default_min_max("abc", 42, 0, 100), (42, false));
        assert_eq!(str_to_int_default_min_max("12x", 42, 0, 100), (42, false));
    }
}
