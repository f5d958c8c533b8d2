use anyhow::{Context, Result, anyhow};
use std::{
    collections::BTreeMap,
    env,
    net::SocketAddr,
    time::Duration,
};

use crate::ratelimit::tiered::{
    Tier,
    TierLimits,
    TierTable,
    WindowAlgorithm,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub store: StoreConfig,
    pub key_prefix: String,
    pub backend_timeout: Duration,
    pub tiers: TierTable,
    pub window_algorithm: WindowAlgorithm,
    pub quota: QuotaConfig,
    pub analytics_retention: Duration,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    InMemory,
    Redis { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaConfig {
    pub totals: BTreeMap<String, u64>,
    pub period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            store: StoreConfig::InMemory,
            key_prefix: "admission".to_string(),
            backend_timeout: Duration::from_millis(250),
            tiers: TierTable::default(),
            window_algorithm: WindowAlgorithm::Fixed,
            quota: QuotaConfig {
                totals: BTreeMap::from([
                    ("api_calls".to_string(), 10_000),
                    ("compute_hours".to_string(), 50),
                    ("storage_gb".to_string(), 100),
                ]),
                period: Duration::from_secs(30 * 86_400),
            },
            analytics_retention: Duration::from_secs(168 * 3_600),
            log_format: LogFormat::Compact,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let store = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => StoreConfig::InMemory,
            "redis" => StoreConfig::Redis {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            other => return Err(anyhow!("unsupported STORE_BACKEND: {other}")),
        };

        let key_prefix = env::var("STORE_KEY_PREFIX").unwrap_or_else(|_| "admission".to_string());
        let backend_timeout = Duration::from_millis(parse_env("BACKEND_TIMEOUT_MS", 250u64).max(1));

        let tiers = match env::var("TIER_LIMITS") {
            Ok(raw) => parse_tier_limits(&raw).context("invalid TIER_LIMITS")?,
            Err(_) => TierTable::default(),
        };

        let window_algorithm = env::var("WINDOW_ALGORITHM")
            .unwrap_or_else(|_| "fixed".to_string())
            .parse::<WindowAlgorithm>()
            .map_err(|err| anyhow!(err))
            .context("invalid WINDOW_ALGORITHM")?;

        let quota = QuotaConfig {
            totals: parse_quotas(&parse_csv(
                "RESOURCE_QUOTAS",
                "api_calls=10000,storage_gb=100,compute_hours=50",
            ))
            .context("invalid RESOURCE_QUOTAS")?,
            period: Duration::from_secs(parse_env("QUOTA_PERIOD_DAYS", 30u64).max(1) * 86_400),
        };

        let analytics_retention =
            Duration::from_secs(parse_env("ANALYTICS_RETENTION_HOURS", 168u64).max(1) * 3_600);

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "compact".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "compact" | "text" => LogFormat::Compact,
            "json" => LogFormat::Json,
            other => return Err(anyhow!("unsupported LOG_FORMAT: {other}")),
        };

        Ok(Self {
            bind_addr,
            store,
            key_prefix,
            backend_timeout,
            tiers,
            window_algorithm,
            quota,
            analytics_retention,
            log_format,
        })
    }
}

/// Parses `tier=hour/minute/burst` rows on top of the built-in table.
/// `unlimited` is accepted for the hourly and per-minute rates.
fn parse_tier_limits(raw: &str) -> Result<TierTable> {
    let mut table = TierTable::default();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (name, rates) = chunk
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid tier entry: {chunk}"))?;
        let tier = name.parse::<Tier>().map_err(|err| anyhow!(err))?;

        let rates = rates.split('/').map(str::trim).collect::<Vec<_>>();
        let [hour, minute, burst] = rates.as_slice() else {
            return Err(anyhow!("tier {tier} needs hour/minute/burst: {chunk}"));
        };

        let limits = TierLimits {
            requests_per_hour: parse_rate(hour).with_context(|| format!("tier {tier} hourly rate"))?,
            requests_per_minute: parse_rate(minute)
                .with_context(|| format!("tier {tier} per-minute rate"))?,
            burst_capacity: burst
                .parse::<u64>()
                .with_context(|| format!("tier {tier} burst capacity"))?,
        };
        limits
            .validate()
            .map_err(|err| anyhow!("tier {tier}: {err}"))?;
        table.set(tier, limits);
    }
    Ok(table)
}

fn parse_rate(raw: &str) -> Result<Option<u64>> {
    if raw.eq_ignore_ascii_case("unlimited") {
        return Ok(None);
    }
    Ok(Some(raw.parse::<u64>().context("expected an integer or `unlimited`")?))
}

fn parse_quotas(entries: &[String]) -> Result<BTreeMap<String, u64>> {
    let mut out = BTreeMap::new();
    for entry in entries {
        let (name, total) = entry
            .split_once('=')
            .map(|(n, t)| (n.trim(), t.trim()))
            .filter(|(n, _)| !n.is_empty())
            .ok_or_else(|| anyhow!("invalid quota entry: {entry}"))?;
        let total = total
            .parse::<u64>()
            .with_context(|| format!("invalid quota total for {name}"))?;
        if total == 0 {
            return Err(anyhow!("quota for {name} must be greater than 0"));
        }
        out.insert(name.to_string(), total);
    }

    if out.is_empty() {
        return Err(anyhow!("no resource quotas configured"));
    }
    Ok(out)
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_rows_override_defaults() {
        let table = parse_tier_limits("free=50/5/3, enterprise=unlimited/600/200").unwrap();

        assert_eq!(
            table.get(Tier::Free),
            TierLimits {
                requests_per_hour: Some(50),
                requests_per_minute: Some(5),
                burst_capacity: 3,
            }
        );
        assert_eq!(
            table.get(Tier::Enterprise),
            TierLimits {
                requests_per_hour: None,
                requests_per_minute: Some(600),
                burst_capacity: 200,
            }
        );
        assert_eq!(table.get(Tier::Developer), TierTable::default().get(Tier::Developer));
    }

    #[test]
    fn invalid_tier_rows_are_errors() {
        assert!(parse_tier_limits("free=100/20/0").is_err());
        assert!(parse_tier_limits("free=0/20/10").is_err());
        assert!(parse_tier_limits("free=100/20").is_err());
        assert!(parse_tier_limits("gold=1/1/1").is_err());
        assert!(parse_tier_limits("free=lots/20/10").is_err());
    }

    #[test]
    fn quotas_parse_into_a_table() {
        let quotas = parse_quotas(&["api_calls=10000".to_string(), " storage_gb = 100".to_string()])
            .unwrap();
        assert_eq!(quotas.get("api_calls"), Some(&10_000));
        assert_eq!(quotas.get("storage_gb"), Some(&100));

        assert!(parse_quotas(&["api_calls=0".to_string()]).is_err());
        assert!(parse_quotas(&["=5".to_string()]).is_err());
        assert!(parse_quotas(&[]).is_err());
    }
}
