use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    net::IpAddr,
    str::FromStr,
    time::{Duration, Instant},
};

use ipnetwork::IpNetwork;
use thiserror::Error;

use crate::signature::{hmac_hex, verify_hex, within_tolerance};

pub const TOKEN_MIN_LEN: usize = 32;
pub const TOKEN_MAX_LEN: usize = 64;

/// Cheap structural check run before any token lookup.
pub fn is_well_formed_token(token: &str) -> bool {
    (TOKEN_MIN_LEN..=TOKEN_MAX_LEN).contains(&token.len())
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid allow-list entry '{0}'")]
pub struct InvalidIpRule(pub String);

/// Allow-list entry: an exact address or a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRule {
    Exact(IpAddr),
    Network(IpNetwork),
}

impl IpRule {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match self {
            Self::Exact(addr) => *addr == normalize(ip),
            Self::Network(network) => network.contains(normalize(ip)),
        }
    }
}

impl FromStr for IpRule {
    type Err = InvalidIpRule;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.contains('/') {
            trimmed
                .parse::<IpNetwork>()
                .map(Self::Network)
                .map_err(|_| InvalidIpRule(value.to_string()))
        } else {
            trimmed
                .parse::<IpAddr>()
                .map(|addr| Self::Exact(normalize(addr)))
                .map_err(|_| InvalidIpRule(value.to_string()))
        }
    }
}

/// IPv4-mapped IPv6 addresses compare as their IPv4 form.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        other => other,
    }
}

/// Parses every entry, failing on the first invalid one.
pub fn parse_allow_list<S: AsRef<str>>(entries: &[S]) -> Result<Vec<IpRule>, InvalidIpRule> {
    entries.iter().map(|entry| entry.as_ref().parse()).collect()
}

/// Returns `true` if `ip` matches any well-formed entry. Malformed stored entries never match.
pub fn ip_allowed<S: AsRef<str>>(entries: &[S], ip: IpAddr) -> bool {
    entries
        .iter()
        .filter_map(|entry| entry.as_ref().parse::<IpRule>().ok())
        .any(|rule| rule.contains(ip))
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    count: u32,
}

/// Fixed-window request counter keyed by `K`.
///
/// Rejected requests do not consume budget.
#[derive(Debug)]
pub struct FixedWindowLimiter<K> {
    limit: u32,
    window: Duration,
    windows: HashMap<K, Window>,
}

impl<K: Eq + Hash> FixedWindowLimiter<K> {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: HashMap::new(),
        }
    }

    /// Counts one request for `key`; returns `false` when the budget is exhausted.
    pub fn check(&mut self, key: K, now: Instant) -> bool {
        let window = self.window;
        let entry = self.windows.entry(key).or_insert(Window {
            start: now,
            count: 0,
        });
        if now.saturating_duration_since(entry.start) >= window {
            entry.start = now;
            entry.count = 0;
        }
        if entry.count >= self.limit {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drops windows that ended before `now`.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.windows
            .retain(|_, entry| now.saturating_duration_since(entry.start) < window);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Bounded set of recently used nonces with their timestamps.
#[derive(Debug)]
pub struct NonceCache {
    capacity: usize,
    order: VecDeque<(String, i64)>,
}

impl NonceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
        }
    }

    /// Records `nonce` seen at `timestamp` after dropping entries that left the window.
    ///
    /// Live nonces are never evicted: once `capacity` of them are held, new nonces are
    /// refused until older ones age out.
    pub fn insert(
        &mut self,
        nonce: &str,
        timestamp: i64,
        now: i64,
        tolerance_secs: i64,
    ) -> Result<(), NonceRejection> {
        self.order
            .retain(|(_, seen_at)| within_tolerance(now, *seen_at, tolerance_secs));
        if self.order.iter().any(|(seen, _)| seen == nonce) {
            return Err(NonceRejection::Seen);
        }
        if self.order.len() >= self.capacity {
            return Err(NonceRejection::Full);
        }
        self.order.push_back((nonce.to_string(), timestamp));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceRejection {
    Seen,
    Full,
}

/// Control-plane request signature failures, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestSignatureError {
    #[error("request timestamp is outside the allowed window")]
    StaleTimestamp,
    #[error("request signature does not match")]
    SignatureMismatch,
    #[error("nonce has already been used")]
    ReplayDetected,
    #[error("too many signed requests inside the window")]
    NonceCacheFull,
}

/// Signature over `"{timestamp}:{nonce}"`.
pub fn sign_request(secret: &str, timestamp: i64, nonce: &str) -> String {
    hmac_hex(secret.as_bytes(), &[format!("{timestamp}:{nonce}").as_bytes()])
}

/// Checks freshness and MAC, then records the nonce.
pub fn verify_request_signature(
    secret: &str,
    timestamp: i64,
    nonce: &str,
    signature: &str,
    now: i64,
    tolerance_secs: i64,
    nonces: &mut NonceCache,
) -> Result<(), RequestSignatureError> {
    if !within_tolerance(now, timestamp, tolerance_secs) {
        return Err(RequestSignatureError::StaleTimestamp);
    }
    let message = format!("{timestamp}:{nonce}");
    if secret.is_empty() || !verify_hex(secret.as_bytes(), &[message.as_bytes()], signature) {
        return Err(RequestSignatureError::SignatureMismatch);
    }
    nonces
        .insert(nonce, timestamp, now, tolerance_secs)
        .map_err(|rejection| match rejection {
            NonceRejection::Seen => RequestSignatureError::ReplayDetected,
            NonceRejection::Full => RequestSignatureError::NonceCacheFull,
        })
}
