//! SNMP metadata queries.
//!
//! Fetches `sysName.0` and `sysDescr.0` over SNMPv2c. Devices that expose a
//! scalar at a non-`.0` index get a GetNext fallback: the trailing `.0` is
//! stripped and the response is accepted only when the returned OID is a
//! descendant of the requested base. "No answer" is normal for most of a
//! fleet, so failures are logged at debug and the device is skipped.
//!
//! `snmp2` sessions are blocking UDP, so the fan-out runs each worker's
//! chunk under `spawn_blocking`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use snmp2::{Oid, SyncSession, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Maximum accepted length for an SNMP string value, in characters.
const MAX_STRING_LEN: usize = 1024;

/// sysDescr.0 (1.3.6.1.2.1.1.1.0)
const SYS_DESCR: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 1, 0];
/// sysName.0 (1.3.6.1.2.1.1.5.0)
const SYS_NAME: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 5, 0];

#[derive(Debug, Clone)]
pub struct SnmpParams {
    pub community: String,
    pub port: u16,
    pub timeout: Duration,
    pub retries: u32,
}

/// Enrichment result for one device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub descr: String,
}

// ── String sanitization ─────────────────────────────────────────────────

/// Normalize an SNMP string value: truncate to 1024 chars, fold
/// CR/LF/TAB into spaces, drop other control characters, trim. Idempotent.
pub fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_STRING_LEN));
    for c in s.chars().take(MAX_STRING_LEN) {
        match c {
            '\r' | '\n' | '\t' => out.push(' '),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out.trim().to_string()
}

/// Decode and sanitize a raw octet-string value. A NUL byte anywhere
/// rejects the value outright.
pub fn sanitize_bytes(bytes: &[u8]) -> Option<String> {
    if bytes.contains(&0) {
        return None;
    }
    Some(sanitize(&String::from_utf8_lossy(bytes)))
}

// ── OID helpers ─────────────────────────────────────────────────────────

fn oid_string(parts: &[u64]) -> String {
    parts
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// GetNext acceptance: the returned OID must be a strict descendant of the
/// requested base, otherwise the walk has left the subtree.
pub fn accept_getnext(base: &str, returned: &str) -> bool {
    returned
        .strip_prefix(base)
        .is_some_and(|rest| rest.starts_with('.'))
}

// ── Wire protocol ───────────────────────────────────────────────────────

enum GetOutcome {
    Text(String),
    NeedFallback,
    Rejected,
    IoError,
}

fn get_once(sess: &mut SyncSession, scalar: &[u64]) -> GetOutcome {
    let Ok(oid) = Oid::from(scalar) else {
        return GetOutcome::Rejected;
    };
    match sess.get(&oid) {
        Ok(mut pdu) => match pdu.varbinds.next() {
            Some((_oid, Value::OctetString(bytes))) => match sanitize_bytes(bytes) {
                Some(text) => GetOutcome::Text(text),
                None => GetOutcome::Rejected,
            },
            Some((_oid, Value::NoSuchInstance)) | Some((_oid, Value::NoSuchObject)) => {
                GetOutcome::NeedFallback
            }
            _ => GetOutcome::Rejected,
        },
        Err(_) => GetOutcome::IoError,
    }
}

/// GetNext on the scalar's base (trailing `.0` stripped). Accepts only a
/// descendant OID carrying an octet string.
fn getnext_fallback(sess: &mut SyncSession, scalar: &[u64]) -> Option<String> {
    let base = &scalar[..scalar.len() - 1];
    let base_str = oid_string(base);
    let oid = Oid::from(base).ok()?;
    match sess.getnext(&oid) {
        Ok(mut pdu) => match pdu.varbinds.next() {
            Some((returned, Value::OctetString(bytes))) => {
                if accept_getnext(&base_str, &returned.to_string()) {
                    sanitize_bytes(bytes)
                } else {
                    None
                }
            }
            _ => None,
        },
        Err(_) => None,
    }
}

/// Fetch one scalar string, retrying I/O errors up to `retries` times and
/// falling back to GetNext when the `.0` instance is absent.
fn fetch_scalar(sess: &mut SyncSession, scalar: &[u64], retries: u32) -> Option<String> {
    for _ in 0..=retries {
        match get_once(sess, scalar) {
            GetOutcome::Text(text) => return Some(text),
            GetOutcome::NeedFallback => return getnext_fallback(sess, scalar),
            GetOutcome::Rejected => return None,
            GetOutcome::IoError => continue,
        }
    }
    None
}

/// Query one device for sysName and sysDescr. Any failure skips the device.
pub fn query_device(ip: Ipv4Addr, params: &SnmpParams) -> Option<DeviceInfo> {
    let addr = SocketAddr::from((ip, params.port));
    let mut sess = match SyncSession::new_v2c(
        addr,
        params.community.as_bytes(),
        Some(params.timeout),
        0,
    ) {
        Ok(sess) => sess,
        Err(e) => {
            debug!(ip = %ip, error = %e, "snmp session open failed");
            return None;
        }
    };
    let hostname = match fetch_scalar(&mut sess, SYS_NAME, params.retries) {
        Some(name) => name,
        None => {
            debug!(ip = %ip, "no snmp sysName answer");
            return None;
        }
    };
    let descr = match fetch_scalar(&mut sess, SYS_DESCR, params.retries) {
        Some(descr) => descr,
        None => {
            debug!(ip = %ip, "no snmp sysDescr answer");
            return None;
        }
    };
    Some(DeviceInfo { ip, hostname, descr })
}

/// Query a set of devices with a blocking worker pool. Each worker takes a
/// contiguous chunk; unresponsive devices simply do not appear in the
/// result.
pub async fn query_many(
    ips: Vec<Ipv4Addr>,
    params: SnmpParams,
    workers: usize,
    cancel: CancellationToken,
) -> Vec<DeviceInfo> {
    if ips.is_empty() {
        return Vec::new();
    }
    let workers = workers.clamp(1, ips.len());
    let chunk_len = ips.len().div_ceil(workers);
    let params = Arc::new(params);

    let mut handles = Vec::with_capacity(workers);
    for chunk in ips.chunks(chunk_len) {
        let chunk = chunk.to_vec();
        let params = Arc::clone(&params);
        let cancel = cancel.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            for ip in chunk {
                if cancel.is_cancelled() {
                    break;
                }
                if let Some(info) = query_device(ip, &params) {
                    found.push(info);
                }
            }
            found
        }));
    }

    let mut out = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(mut infos) => out.append(&mut infos),
            Err(e) => error!(error = %e, "snmp query worker panicked"),
        }
    }
    out
}
