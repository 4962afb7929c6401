//! YAML configuration: loading, environment expansion, validation.
//!
//! Every string value supports `${VAR}` / `$VAR` expansion from the
//! process environment (applied to the raw file text before parsing, so
//! secrets like the store token never need to live in the file). Unknown
//! variables expand to the empty string.
//!
//! Validation is strict and startup-fatal: a daemon that would sweep the
//! wrong range or write to a malformed store URL should never come up.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::NaiveTime;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use tracing::warn;

use netpulse_core::probe::is_probe_safe;

/// Community strings that ship as vendor defaults; accepting them would
/// give a false sense of configuration.
const WEAK_COMMUNITIES: &[&str] = &[
    "private", "admin", "default", "root", "secret", "write", "test", "cisco",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub networks: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub icmp_discovery_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_ping_timeout")]
    pub ping_timeout: Duration,
    #[serde(default = "default_ping_rate_limit")]
    pub ping_rate_limit: f64,
    #[serde(default = "default_ping_burst_limit")]
    pub ping_burst_limit: u32,
    #[serde(default = "default_ping_max_fails")]
    pub ping_max_consecutive_fails: u32,
    #[serde(with = "humantime_serde", default = "default_ping_backoff")]
    pub ping_backoff_duration: Duration,
    #[serde(default = "default_icmp_workers")]
    pub icmp_workers: usize,
    pub snmp: SnmpSection,
    #[serde(default = "default_snmp_workers")]
    pub snmp_workers: usize,
    /// "HH:MM" local time; empty disables the daily SNMP pass.
    #[serde(default)]
    pub snmp_daily_schedule: String,
    #[serde(with = "humantime_serde", default = "default_snmp_interval")]
    pub snmp_interval: Duration,
    #[serde(default = "default_fleet_cap")]
    pub max_concurrent_pingers: usize,
    #[serde(default = "default_fleet_cap")]
    pub max_devices: usize,
    #[serde(with = "humantime_serde", default = "default_min_scan_interval")]
    pub min_scan_interval: Duration,
    pub influxdb: InfluxSection,
    #[serde(default = "default_health_port")]
    pub health_check_port: u16,
    #[serde(with = "humantime_serde", default = "default_health_report_interval")]
    pub health_report_interval: Duration,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// Devices registered before the first sweep runs.
    #[serde(default)]
    pub static_devices: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnmpSection {
    pub community: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxSection {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    #[serde(default = "default_health_bucket")]
    pub health_bucket: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,
}

// Default value functions
fn default_ping_timeout() -> Duration { Duration::from_secs(3) }
fn default_ping_rate_limit() -> f64 { 64.0 }
fn default_ping_burst_limit() -> u32 { 256 }
fn default_ping_max_fails() -> u32 { 10 }
fn default_ping_backoff() -> Duration { Duration::from_secs(300) }
fn default_icmp_workers() -> usize { 64 }
fn default_snmp_workers() -> usize { 32 }
fn default_snmp_interval() -> Duration { Duration::from_secs(300) }
fn default_fleet_cap() -> usize { 20_000 }
fn default_min_scan_interval() -> Duration { Duration::from_secs(60) }
fn default_health_port() -> u16 { netpulse_core::DEFAULT_HEALTH_PORT }
fn default_health_report_interval() -> Duration { Duration::from_secs(10) }
fn default_memory_limit_mb() -> u64 { 16_384 }
fn default_health_bucket() -> String { "health".to_string() }
fn default_batch_size() -> usize { 5000 }
fn default_flush_interval() -> Duration { Duration::from_secs(5) }

impl Config {
    /// Read, expand, parse, and validate a configuration file.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Config::parse(&raw)
    }

    /// Parse and validate config text (after env expansion).
    pub fn parse(raw: &str) -> anyhow::Result<Config> {
        let expanded = expand_env(raw);
        let config: Config =
            serde_yaml::from_str(&expanded).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn networks(&self) -> anyhow::Result<Vec<Ipv4Network>> {
        let mut nets = Vec::with_capacity(self.networks.len());
        for raw in &self.networks {
            let net: Ipv4Network = raw
                .parse()
                .with_context(|| format!("invalid CIDR {raw:?}"))?;
            nets.push(net);
        }
        Ok(nets)
    }

    /// Parsed daily schedule, `None` when disabled.
    pub fn daily_schedule(&self) -> anyhow::Result<Option<NaiveTime>> {
        if self.snmp_daily_schedule.is_empty() {
            return Ok(None);
        }
        let time = NaiveTime::parse_from_str(&self.snmp_daily_schedule, "%H:%M")
            .with_context(|| {
                format!(
                    "invalid snmp_daily_schedule {:?}, expected HH:MM",
                    self.snmp_daily_schedule
                )
            })?;
        Ok(Some(time))
    }

    pub fn static_device_ips(&self) -> anyhow::Result<Vec<Ipv4Addr>> {
        let mut ips = Vec::with_capacity(self.static_devices.len());
        for raw in &self.static_devices {
            let ip: Ipv4Addr = raw
                .parse()
                .with_context(|| format!("invalid static device address {raw:?}"))?;
            if !is_probe_safe(ip) {
                bail!("static device address {ip} is not a probeable unicast address");
            }
            ips.push(ip);
        }
        Ok(ips)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.networks.is_empty() {
            bail!("networks must list at least one CIDR range");
        }
        for net in self.networks()? {
            if net.prefix() < 8 {
                bail!("network {net} is wider than /8");
            }
            if net.prefix() < 16 {
                warn!(network = %net, "network wider than /16, sweeps will be slow");
            }
            let ip = net.ip();
            if ip.is_loopback() || ip.is_multicast() || ip.is_link_local() {
                bail!("network {net} is not a sweepable unicast range");
            }
        }

        if self.min_scan_interval < Duration::from_secs(30) {
            bail!("min_scan_interval must be at least 30s");
        }
        if self.icmp_discovery_interval < Duration::from_secs(60) {
            bail!("icmp_discovery_interval must be at least 1m");
        }
        if self.icmp_discovery_interval < self.min_scan_interval {
            bail!("icmp_discovery_interval must not be below min_scan_interval");
        }
        if self.ping_interval < Duration::from_secs(1) {
            bail!("ping_interval must be at least 1s");
        }
        if self.ping_max_consecutive_fails < 1 {
            bail!("ping_max_consecutive_fails must be at least 1");
        }
        if self.ping_backoff_duration < Duration::from_secs(60) {
            bail!("ping_backoff_duration must be at least 1m");
        }
        if self.ping_rate_limit <= 0.0 {
            bail!("ping_rate_limit must be positive");
        }
        if !(1..=2000).contains(&self.icmp_workers) {
            bail!("icmp_workers must be in 1..=2000");
        }
        if !(1..=1000).contains(&self.snmp_workers) {
            bail!("snmp_workers must be in 1..=1000");
        }
        if !(1..=100_000).contains(&self.max_concurrent_pingers) {
            bail!("max_concurrent_pingers must be in 1..=100000");
        }
        if !(1..=100_000).contains(&self.max_devices) {
            bail!("max_devices must be in 1..=100000");
        }
        if self.snmp_interval < Duration::from_secs(10) {
            bail!("snmp_interval must be at least 10s");
        }
        if !(64..=16_384).contains(&self.memory_limit_mb) {
            bail!("memory_limit_mb must be in 64..=16384");
        }

        validate_community(&self.snmp.community)?;
        self.daily_schedule()?;
        self.static_device_ips()?;

        let url = reqwest::Url::parse(&self.influxdb.url)
            .with_context(|| format!("invalid influxdb.url {:?}", self.influxdb.url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            bail!("influxdb.url must use http or https");
        }
        for (key, value) in [
            ("influxdb.token", &self.influxdb.token),
            ("influxdb.org", &self.influxdb.org),
            ("influxdb.bucket", &self.influxdb.bucket),
        ] {
            if value.is_empty() {
                bail!("{key} must not be empty");
            }
        }
        if self.influxdb.batch_size < 1 {
            bail!("influxdb.batch_size must be at least 1");
        }

        Ok(())
    }
}

fn validate_community(community: &str) -> anyhow::Result<()> {
    if community.is_empty() || community.len() > 32 {
        bail!("snmp.community must be 1..=32 characters");
    }
    if !community
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        bail!("snmp.community may only contain [A-Za-z0-9._-]");
    }
    if WEAK_COMMUNITIES.contains(&community.to_ascii_lowercase().as_str()) {
        bail!("snmp.community {community:?} is a known-weak default");
    }
    if community.eq_ignore_ascii_case("public") {
        warn!("snmp.community is \"public\"; consider a dedicated read-only community");
    }
    Ok(())
}

// ── Environment expansion ───────────────────────────────────────────────

/// Expand `${VAR}` and `$VAR` against the process environment. Unknown
/// variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    expand_env_with(input, |name| std::env::var(name).ok())
}

fn expand_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let rest = &input[i + 2..];
                match rest.find('}') {
                    Some(end) => {
                        let name = &rest[..end];
                        out.push_str(&lookup(name).unwrap_or_default());
                        // Consume through the closing brace by byte index.
                        let stop = i + 2 + end;
                        while let Some((j, _)) = chars.peek() {
                            if *j <= stop {
                                chars.next();
                            } else {
                                break;
                            }
                        }
                    }
                    // Unterminated brace: keep the text literally.
                    None => out.push_str("${"),
                }
            }
            Some((_, c2)) if c2.is_ascii_alphabetic() || *c2 == '_' => {
                let mut name = String::new();
                while let Some((_, c2)) = chars.peek() {
                    if c2.is_ascii_alphanumeric() || *c2 == '_' {
                        name.push(*c2);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> String {
        r#"
networks: ["192.0.2.0/24"]
icmp_discovery_interval: 5m
ping_interval: 10s
snmp:
  community: netpulse-ro
  port: 161
  timeout: 2s
  retries: 1
influxdb:
  url: http://influx.example:8086
  token: secret-token
  org: netops
  bucket: netmon
"#
        .to_string()
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = Config::parse(&minimal_yaml()).unwrap();
        assert_eq!(config.ping_timeout, Duration::from_secs(3));
        assert_eq!(config.ping_rate_limit, 64.0);
        assert_eq!(config.ping_burst_limit, 256);
        assert_eq!(config.ping_max_consecutive_fails, 10);
        assert_eq!(config.ping_backoff_duration, Duration::from_secs(300));
        assert_eq!(config.icmp_workers, 64);
        assert_eq!(config.snmp_workers, 32);
        assert_eq!(config.max_devices, 20_000);
        assert_eq!(config.influxdb.batch_size, 5000);
        assert_eq!(config.influxdb.flush_interval, Duration::from_secs(5));
        assert_eq!(config.influxdb.health_bucket, "health");
        assert_eq!(config.health_check_port, 8080);
        assert!(config.snmp_daily_schedule.is_empty());
        assert!(config.daily_schedule().unwrap().is_none());
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let yaml = minimal_yaml().replace("ping_interval: 10s\n", "");
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn invalid_cidr_is_rejected() {
        let yaml = minimal_yaml().replace("192.0.2.0/24", "192.0.2.0/33");
        assert!(Config::parse(&yaml).is_err());
        let yaml = minimal_yaml().replace("192.0.2.0/24", "not-a-cidr");
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn network_wider_than_slash8_is_rejected() {
        let yaml = minimal_yaml().replace("192.0.2.0/24", "0.0.0.0/4");
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn loopback_and_multicast_ranges_are_rejected() {
        for bad in ["127.0.0.0/24", "224.0.0.0/24", "169.254.0.0/24"] {
            let yaml = minimal_yaml().replace("192.0.2.0/24", bad);
            assert!(Config::parse(&yaml).is_err(), "range {bad} should be rejected");
        }
    }

    #[test]
    fn interval_floors_are_enforced() {
        let yaml = minimal_yaml().replace("ping_interval: 10s", "ping_interval: 500ms");
        assert!(Config::parse(&yaml).is_err());

        let yaml = minimal_yaml()
            .replace("icmp_discovery_interval: 5m", "icmp_discovery_interval: 30s");
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn weak_community_is_rejected_case_insensitively() {
        for weak in ["private", "Private", "ADMIN"] {
            let yaml = minimal_yaml().replace("netpulse-ro", weak);
            assert!(Config::parse(&yaml).is_err(), "community {weak:?}");
        }
        // "public" is weak but only warned about.
        let yaml = minimal_yaml().replace("netpulse-ro", "public");
        assert!(Config::parse(&yaml).is_ok());
    }

    #[test]
    fn community_charset_is_enforced() {
        let yaml = minimal_yaml().replace("netpulse-ro", "has space");
        assert!(Config::parse(&yaml).is_err());
        let yaml = minimal_yaml().replace("netpulse-ro", &"x".repeat(33));
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn store_url_must_be_http() {
        let yaml = minimal_yaml().replace("http://influx.example:8086", "ftp://influx");
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn schedule_must_be_hh_mm() {
        let yaml = minimal_yaml() + "snmp_daily_schedule: \"02:30\"\n";
        let config = Config::parse(&yaml).unwrap();
        let time = config.daily_schedule().unwrap().unwrap();
        assert_eq!(time, NaiveTime::from_hms_opt(2, 30, 0).unwrap());

        let yaml = minimal_yaml() + "snmp_daily_schedule: \"25:00\"\n";
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn static_devices_are_parsed_and_guarded() {
        let yaml = minimal_yaml() + "static_devices: [\"192.0.2.10\", \"192.0.2.11\"]\n";
        let config = Config::parse(&yaml).unwrap();
        assert_eq!(config.static_device_ips().unwrap().len(), 2);

        let yaml = minimal_yaml() + "static_devices: [\"127.0.0.1\"]\n";
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn env_expansion_handles_both_forms() {
        let lookup = |name: &str| match name {
            "TOKEN" => Some("s3cret".to_string()),
            "ORG" => Some("netops".to_string()),
            _ => None,
        };
        assert_eq!(expand_env_with("token: ${TOKEN}", lookup), "token: s3cret");
        assert_eq!(expand_env_with("org: $ORG!", lookup), "org: netops!");
        assert_eq!(expand_env_with("missing: ${NOPE}", lookup), "missing: ");
        assert_eq!(expand_env_with("price: $5", lookup), "price: $5");
        assert_eq!(expand_env_with("dangling: ${OPEN", lookup), "dangling: ${OPEN");
    }

    #[test]
    fn env_expansion_feeds_the_parser() {
        std::env::set_var("NETPULSE_TEST_TOKEN", "from-env");
        let yaml = minimal_yaml().replace("secret-token", "${NETPULSE_TEST_TOKEN}");
        let config = Config::parse(&yaml).unwrap();
        assert_eq!(config.influxdb.token, "from-env");
    }
}
