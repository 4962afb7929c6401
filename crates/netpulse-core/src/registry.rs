//! Authoritative in-memory device registry.
//!
//! Single source of truth for every known device: SNMP enrichment, liveness
//! timestamps, and the per-device ICMP/SNMP circuit breakers. Bounded by
//! capacity; when full, insertion evicts the device with the oldest
//! `last_seen`. A cached atomic counter tracks how many devices are
//! suspended per probe kind so the hot paths never scan the map; the cache
//! can drift upward when suspensions expire by wall clock, and
//! `repair_suspended_counts` walks the map to correct it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

/// Which of the two probe circuits an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Icmp,
    Snmp,
}

/// Consecutive-failure circuit breaker for one probe kind.
#[derive(Debug, Clone, Default)]
pub struct Breaker {
    pub fails: u32,
    pub suspended_until: Option<Instant>,
}

impl Breaker {
    /// Actively suspended: a deadline is stored and has not yet passed.
    fn is_suspended(&self, now: Instant) -> bool {
        self.suspended_until.is_some_and(|t| t > now)
    }

    /// Clear any stored deadline, reporting whether one was stored.
    /// The caller owns the matching counter decrement.
    fn clear(&mut self) -> bool {
        self.fails = 0;
        self.suspended_until.take().is_some()
    }
}

/// One monitored device. Owned exclusively by the registry; accessors hand
/// out clones.
#[derive(Debug, Clone)]
pub struct Device {
    pub ip: Ipv4Addr,
    /// SNMP sysName, or the dotted IP until enrichment succeeds.
    pub hostname: String,
    /// SNMP sysDescr; may be empty.
    pub descr: String,
    /// Most recent successful ICMP response (creation time until then).
    pub last_seen: Instant,
    pub icmp: Breaker,
    pub snmp: Breaker,
}

impl Device {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            hostname: ip.to_string(),
            descr: String::new(),
            last_seen: Instant::now(),
            icmp: Breaker::default(),
            snmp: Breaker::default(),
        }
    }

    fn breaker(&self, kind: ProbeKind) -> &Breaker {
        match kind {
            ProbeKind::Icmp => &self.icmp,
            ProbeKind::Snmp => &self.snmp,
        }
    }

    fn breaker_mut(&mut self, kind: ProbeKind) -> &mut Breaker {
        match kind {
            ProbeKind::Icmp => &mut self.icmp,
            ProbeKind::Snmp => &mut self.snmp,
        }
    }
}

/// Thread-safe device registry with bounded capacity.
///
/// All mutations take the write lock; the suspended caches are atomics so
/// `suspended_count` never touches the lock. Counter mutations only happen
/// while the write lock is held, which is what makes the exactly-once
/// decrement rule enforceable.
pub struct Registry {
    devices: RwLock<HashMap<Ipv4Addr, Device>>,
    max_devices: usize,
    icmp_suspended: AtomicU64,
    snmp_suspended: AtomicU64,
}

impl Registry {
    pub fn new(max_devices: usize) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            max_devices: max_devices.max(1),
            icmp_suspended: AtomicU64::new(0),
            snmp_suspended: AtomicU64::new(0),
        }
    }

    fn counter(&self, kind: ProbeKind) -> &AtomicU64 {
        match kind {
            ProbeKind::Icmp => &self.icmp_suspended,
            ProbeKind::Snmp => &self.snmp_suspended,
        }
    }

    /// Decrement a suspended cache. Saturating: repair may already have
    /// lowered the cache below the number of stored deadlines.
    fn dec_suspended(&self, kind: ProbeKind) {
        let c = self.counter(kind);
        let mut cur = c.load(Ordering::Relaxed);
        while cur > 0 {
            match c.compare_exchange_weak(cur, cur - 1, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Account for every suspension stored on a device leaving the map.
    fn forget_device(&self, dev: &Device) {
        if dev.icmp.suspended_until.is_some() {
            self.dec_suspended(ProbeKind::Icmp);
        }
        if dev.snmp.suspended_until.is_some() {
            self.dec_suspended(ProbeKind::Snmp);
        }
    }

    /// Evict the device with the smallest `last_seen`. Caller holds the
    /// write lock and has already established the map is at capacity.
    fn evict_oldest(&self, map: &mut HashMap<Ipv4Addr, Device>) {
        let oldest = map
            .values()
            .min_by_key(|d| d.last_seen)
            .map(|d| d.ip);
        if let Some(ip) = oldest {
            if let Some(dev) = map.remove(&ip) {
                debug!(ip = %ip, "registry full, evicting oldest device");
                self.forget_device(&dev);
            }
        }
    }

    /// Register or re-register a device. An existing entry keeps its key but
    /// takes the new hostname/descr/last_seen and has both breakers cleared
    /// (with the matching counter decrements). A new entry may evict the
    /// oldest device first.
    pub fn add(&self, device: Device) {
        let mut map = self.devices.write().unwrap();
        if let Some(existing) = map.get_mut(&device.ip) {
            existing.hostname = device.hostname;
            existing.descr = device.descr;
            existing.last_seen = device.last_seen;
            if existing.icmp.clear() {
                self.dec_suspended(ProbeKind::Icmp);
            }
            if existing.snmp.clear() {
                self.dec_suspended(ProbeKind::Snmp);
            }
            return;
        }
        if map.len() >= self.max_devices {
            self.evict_oldest(&mut map);
        }
        map.insert(device.ip, device);
    }

    /// Register an address discovered by a sweep. Returns true if the device
    /// is new. An existing device only has its `last_seen` refreshed —
    /// re-discovery says nothing about enrichment or breaker state.
    pub fn add_ip(&self, ip: Ipv4Addr) -> bool {
        let mut map = self.devices.write().unwrap();
        if let Some(existing) = map.get_mut(&ip) {
            existing.last_seen = Instant::now();
            return false;
        }
        if map.len() >= self.max_devices {
            self.evict_oldest(&mut map);
        }
        map.insert(ip, Device::new(ip));
        true
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<Device> {
        self.devices.read().unwrap().get(&ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().unwrap().is_empty()
    }

    pub fn all_ips(&self) -> Vec<Ipv4Addr> {
        self.devices.read().unwrap().keys().copied().collect()
    }

    pub fn all_devices(&self) -> Vec<Device> {
        self.devices.read().unwrap().values().cloned().collect()
    }

    /// Touch the liveness timestamp. Unknown IP is a no-op.
    pub fn update_last_seen(&self, ip: Ipv4Addr) {
        if let Some(dev) = self.devices.write().unwrap().get_mut(&ip) {
            dev.last_seen = Instant::now();
        }
    }

    /// Merge SNMP enrichment and touch the liveness timestamp.
    pub fn update_snmp(&self, ip: Ipv4Addr, hostname: &str, descr: &str) {
        if let Some(dev) = self.devices.write().unwrap().get_mut(&ip) {
            dev.hostname = hostname.to_string();
            dev.descr = descr.to_string();
            dev.last_seen = Instant::now();
        }
    }

    /// A probe succeeded: reset the failure count and lift any stored
    /// suspension, decrementing the cache exactly once if one was stored.
    pub fn report_success(&self, ip: Ipv4Addr, kind: ProbeKind) {
        let mut map = self.devices.write().unwrap();
        if let Some(dev) = map.get_mut(&ip) {
            if dev.breaker_mut(kind).clear() {
                self.dec_suspended(kind);
            }
        }
    }

    /// A probe failed. On the `threshold`-th consecutive failure the breaker
    /// trips: the failure count resets, the device is suspended for
    /// `backoff`, the cache increments, and `true` is returned.
    pub fn report_fail(
        &self,
        ip: Ipv4Addr,
        kind: ProbeKind,
        threshold: u32,
        backoff: Duration,
    ) -> bool {
        let mut map = self.devices.write().unwrap();
        let Some(dev) = map.get_mut(&ip) else {
            return false;
        };
        let breaker = dev.breaker_mut(kind);
        breaker.fails += 1;
        if breaker.fails < threshold.max(1) {
            return false;
        }
        breaker.fails = 0;
        let already_stored = breaker.suspended_until.is_some();
        breaker.suspended_until = Some(Instant::now() + backoff);
        if !already_stored {
            self.counter(kind).fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    pub fn is_suspended(&self, ip: Ipv4Addr, kind: ProbeKind) -> bool {
        let now = Instant::now();
        self.devices
            .read()
            .unwrap()
            .get(&ip)
            .map(|d| d.breaker(kind).is_suspended(now))
            .unwrap_or(false)
    }

    /// Remove every device unseen for longer than `max_age`, returning the
    /// removed entries so the orchestrator can stop their tasks.
    pub fn prune_stale(&self, max_age: Duration) -> Vec<Device> {
        let now = Instant::now();
        let mut map = self.devices.write().unwrap();
        let stale: Vec<Ipv4Addr> = map
            .values()
            .filter(|d| now.duration_since(d.last_seen) > max_age)
            .map(|d| d.ip)
            .collect();
        let mut removed = Vec::with_capacity(stale.len());
        for ip in stale {
            if let Some(dev) = map.remove(&ip) {
                self.forget_device(&dev);
                removed.push(dev);
            }
        }
        removed
    }

    /// Cached fast-path suspended count. May over-report between a
    /// wall-clock expiry and the next clearing operation or repair pass.
    pub fn suspended_count(&self, kind: ProbeKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    /// Slow-path scan: drop expired deadlines, recompute the true counts,
    /// and overwrite both caches. Returns `(icmp, snmp)` truth. Invoked by
    /// the self-health driver, never by hot loops.
    pub fn repair_suspended_counts(&self) -> (u64, u64) {
        let now = Instant::now();
        let mut map = self.devices.write().unwrap();
        let mut icmp = 0u64;
        let mut snmp = 0u64;
        for dev in map.values_mut() {
            for kind in [ProbeKind::Icmp, ProbeKind::Snmp] {
                let breaker = dev.breaker_mut(kind);
                match breaker.suspended_until {
                    Some(t) if t > now => match kind {
                        ProbeKind::Icmp => icmp += 1,
                        ProbeKind::Snmp => snmp += 1,
                    },
                    Some(_) => {
                        breaker.suspended_until = None;
                    }
                    None => {}
                }
            }
        }
        self.icmp_suspended.store(icmp, Ordering::Relaxed);
        self.snmp_suspended.store(snmp, Ordering::Relaxed);
        (icmp, snmp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 0, 2, last)
    }

    #[test]
    fn add_then_get_returns_equal_device() {
        let reg = Registry::new(16);
        let mut dev = Device::new(ip(1));
        dev.hostname = "switch01".into();
        dev.descr = "core switch".into();
        reg.add(dev);

        let got = reg.get(ip(1)).expect("device should exist");
        assert_eq!(got.ip, ip(1));
        assert_eq!(got.hostname, "switch01");
        assert_eq!(got.descr, "core switch");
    }

    #[test]
    fn add_same_ip_takes_latest_mutable_fields() {
        let reg = Registry::new(16);
        let mut first = Device::new(ip(1));
        first.hostname = "old".into();
        reg.add(first);

        let mut second = Device::new(ip(1));
        second.hostname = "new".into();
        second.descr = "replaced".into();
        reg.add(second);

        assert_eq!(reg.len(), 1);
        let got = reg.get(ip(1)).unwrap();
        assert_eq!(got.hostname, "new");
        assert_eq!(got.descr, "replaced");
    }

    #[test]
    fn add_ip_reports_newness_and_preserves_enrichment() {
        let reg = Registry::new(16);
        assert!(reg.add_ip(ip(1)));
        reg.update_snmp(ip(1), "switch01", "core");
        assert!(!reg.add_ip(ip(1)));
        assert_eq!(reg.get(ip(1)).unwrap().hostname, "switch01");
    }

    #[test]
    fn updates_on_unknown_ip_are_noops() {
        let reg = Registry::new(16);
        reg.update_last_seen(ip(9));
        reg.update_snmp(ip(9), "x", "y");
        reg.report_success(ip(9), ProbeKind::Icmp);
        assert!(!reg.report_fail(ip(9), ProbeKind::Icmp, 1, Duration::from_secs(60)));
        assert!(reg.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest_by_last_seen() {
        let reg = Registry::new(2);
        reg.add_ip(ip(1));
        std::thread::sleep(Duration::from_millis(5));
        reg.add_ip(ip(2));
        std::thread::sleep(Duration::from_millis(5));
        reg.add_ip(ip(3));

        assert_eq!(reg.len(), 2);
        assert!(reg.get(ip(1)).is_none(), "oldest should have been evicted");
        assert!(reg.get(ip(2)).is_some());
        assert!(reg.get(ip(3)).is_some());
    }

    #[test]
    fn registry_size_never_exceeds_capacity() {
        let reg = Registry::new(8);
        for last in 1..=50u8 {
            reg.add_ip(ip(last));
            assert!(reg.len() <= 8);
        }
    }

    #[test]
    fn breaker_trips_at_threshold_and_success_unsuspends() {
        let reg = Registry::new(16);
        reg.add_ip(ip(1));
        let backoff = Duration::from_secs(300);

        assert!(!reg.report_fail(ip(1), ProbeKind::Icmp, 3, backoff));
        assert!(!reg.report_fail(ip(1), ProbeKind::Icmp, 3, backoff));
        assert!(!reg.is_suspended(ip(1), ProbeKind::Icmp));

        assert!(
            reg.report_fail(ip(1), ProbeKind::Icmp, 3, backoff),
            "third consecutive failure should trip the breaker"
        );
        assert!(reg.is_suspended(ip(1), ProbeKind::Icmp));
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 1);
        assert_eq!(reg.get(ip(1)).unwrap().icmp.fails, 0, "fails reset on trip");

        reg.report_success(ip(1), ProbeKind::Icmp);
        assert!(!reg.is_suspended(ip(1), ProbeKind::Icmp));
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 0);
        assert_eq!(reg.get(ip(1)).unwrap().icmp.fails, 0);
    }

    #[test]
    fn suspend_unsuspend_decrements_exactly_once() {
        let reg = Registry::new(16);
        reg.add_ip(ip(1));
        let backoff = Duration::from_secs(300);

        reg.report_fail(ip(1), ProbeKind::Icmp, 1, backoff);
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 1);

        // Repeated successes must not decrement twice.
        reg.report_success(ip(1), ProbeKind::Icmp);
        reg.report_success(ip(1), ProbeKind::Icmp);
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 0);

        // A re-trip while already suspended must not double-increment.
        reg.report_fail(ip(1), ProbeKind::Icmp, 1, backoff);
        reg.report_fail(ip(1), ProbeKind::Icmp, 1, backoff);
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 1);
    }

    #[test]
    fn icmp_and_snmp_breakers_are_independent() {
        let reg = Registry::new(16);
        reg.add_ip(ip(1));
        let backoff = Duration::from_secs(60);

        reg.report_fail(ip(1), ProbeKind::Snmp, 1, backoff);
        assert!(reg.is_suspended(ip(1), ProbeKind::Snmp));
        assert!(!reg.is_suspended(ip(1), ProbeKind::Icmp));
        assert_eq!(reg.suspended_count(ProbeKind::Snmp), 1);
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 0);
    }

    #[test]
    fn prune_removes_stale_and_fixes_counter() {
        let reg = Registry::new(16);
        reg.add_ip(ip(1));
        reg.add_ip(ip(2));
        reg.report_fail(ip(1), ProbeKind::Icmp, 1, Duration::from_secs(600));
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 1);

        std::thread::sleep(Duration::from_millis(10));
        let removed = reg.prune_stale(Duration::from_millis(1));
        assert_eq!(removed.len(), 2);
        assert!(reg.is_empty());
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 0);
    }

    #[test]
    fn prune_keeps_fresh_devices() {
        let reg = Registry::new(16);
        reg.add_ip(ip(1));
        let removed = reg.prune_stale(Duration::from_secs(3600));
        assert!(removed.is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn eviction_of_suspended_device_decrements() {
        let reg = Registry::new(1);
        reg.add_ip(ip(1));
        reg.report_fail(ip(1), ProbeKind::Icmp, 1, Duration::from_secs(600));
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 1);

        // Inserting a second device evicts the suspended one.
        reg.add_ip(ip(2));
        assert_eq!(reg.len(), 1);
        assert!(reg.get(ip(1)).is_none());
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 0);
    }

    #[test]
    fn add_overwrite_clears_suspension_with_decrement() {
        let reg = Registry::new(16);
        reg.add_ip(ip(1));
        reg.report_fail(ip(1), ProbeKind::Icmp, 1, Duration::from_secs(600));
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 1);

        reg.add(Device::new(ip(1)));
        assert!(!reg.is_suspended(ip(1), ProbeKind::Icmp));
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 0);
    }

    #[test]
    fn repair_clears_expired_deadlines_and_restores_truth() {
        let reg = Registry::new(16);
        reg.add_ip(ip(1));
        reg.add_ip(ip(2));
        // ip1 suspension expires almost immediately, ip2's does not.
        reg.report_fail(ip(1), ProbeKind::Icmp, 1, Duration::from_millis(1));
        reg.report_fail(ip(2), ProbeKind::Icmp, 1, Duration::from_secs(600));
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 2);

        std::thread::sleep(Duration::from_millis(10));
        // Cache has drifted: ip1 expired with no event.
        let (icmp, snmp) = reg.repair_suspended_counts();
        assert_eq!(icmp, 1);
        assert_eq!(snmp, 0);
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 1);
        assert!(
            reg.get(ip(1)).unwrap().icmp.suspended_until.is_none(),
            "expired deadline should be cleared by repair"
        );
    }

    #[test]
    fn success_after_expiry_does_not_underflow_counter() {
        let reg = Registry::new(16);
        reg.add_ip(ip(1));
        reg.report_fail(ip(1), ProbeKind::Icmp, 1, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));

        // Repair clears the deadline first; the later success must not
        // drive the cache below zero.
        reg.repair_suspended_counts();
        reg.report_success(ip(1), ProbeKind::Icmp);
        assert_eq!(reg.suspended_count(ProbeKind::Icmp), 0);
    }
}
