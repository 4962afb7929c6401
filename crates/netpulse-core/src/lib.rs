pub mod health;
pub mod limiter;
pub mod probe;
pub mod registry;
pub mod sink;
pub mod snmp;
pub mod sweep;
pub mod tasktable;

/// Default HTTP health server port.
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Timeout for a single sweep echo (RFC-sized networks at fleet rate need a
/// short bound; monitors use the configurable `ping_timeout` instead).
pub const SWEEP_PING_TIMEOUT_MS: u64 = 1000;

/// Timeout for the synchronous store health probe.
pub const STORE_HEALTH_TIMEOUT_SECS: u64 = 5;

/// Devices unseen for this long are pruned from the registry.
pub const STALE_DEVICE_MAX_AGE_SECS: u64 = 24 * 60 * 60;
