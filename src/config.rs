use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::DecisionCacheConfig;
use crate::engine::FailMode;
use crate::source::BreakerConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Policy bundle the service loads at startup and the file refresher
    /// watches afterwards.
    pub policy_file: PathBuf,
    /// Optional subject attribute directory.
    pub subject_file: Option<PathBuf>,
    pub cache: DecisionCacheConfig,
    /// How often the refresher re-fetches the policy source. `None`
    /// disables the background refresh entirely.
    pub refresh_interval: Option<Duration>,
    pub breaker: BreakerConfig,
    pub fail_mode: FailMode,
}

impl AppConfig {
    /// Assemble the configuration from the environment. Every knob has a
    /// default; an unparseable value logs a warning and falls back.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let port: u16 = env_parsed("PORT").unwrap_or(8082);
        let host: IpAddr = env_parsed("HOST").unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let policy_file = std::env::var("POLICY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/policies.json"))
            });
        let subject_file = std::env::var("SUBJECT_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/subjects.json"))
            });
        let subject_file = subject_file.exists().then_some(subject_file);

        let cache = DecisionCacheConfig {
            permit_ttl: Duration::from_secs(env_parsed("DECISION_CACHE_TTL_SECS").unwrap_or(300)),
            deny_ttl: Duration::from_secs(
                env_parsed("DECISION_CACHE_DENY_TTL_SECS").unwrap_or(60),
            ),
            max_entries: env_parsed("DECISION_CACHE_MAX_ENTRIES").unwrap_or(10_000),
            enabled: env_parsed("DECISION_CACHE_ENABLED").unwrap_or(true),
        };

        let refresh_interval = match env_parsed::<u64>("POLICY_REFRESH_INTERVAL_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(60)),
        };

        let breaker = BreakerConfig {
            failure_threshold: env_parsed("POLICY_BREAKER_THRESHOLD").unwrap_or(5),
            cooldown: Duration::from_secs(env_parsed("POLICY_BREAKER_COOLDOWN_SECS").unwrap_or(60)),
        };

        // Fail-open is an explicit non-production override; anything but an
        // exact opt-in means fail-closed.
        let fail_mode = if env_parsed("POLICY_FAIL_OPEN").unwrap_or(false) {
            tracing::warn!("POLICY_FAIL_OPEN is set: unloaded engine will PERMIT (non-production)");
            FailMode::FailOpen
        } else {
            FailMode::FailClosed
        };

        let config = Self {
            bind_addr: SocketAddr::new(host, port),
            policy_file,
            subject_file,
            cache,
            refresh_interval,
            breaker,
            fail_mode,
        };
        tracing::info!(
            bind_addr = %config.bind_addr,
            policy_file = %config.policy_file.display(),
            "Configuration loaded"
        );
        config
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| {
        raw.parse()
            .map_err(|_| {
                tracing::warn!("Invalid {} value '{}', using default", key, raw);
            })
            .ok()
    })
}
