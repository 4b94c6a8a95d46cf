//! Single-use token cache for pending streaming requests.
//!
//! `GetExec`/`GetAttach`/`GetPortForward` park their request here and hand
//! the client a URL containing the token. The HTTP handler consumes the
//! token exactly once. Entries expire after a fixed TTL and the number of
//! live entries is bounded.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::time::Instant;

use berth_core::error::{BerthError, Result};

/// Default lifetime of an issued token.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default bound on live tokens.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1000;

/// Length of an issued token in characters.
pub const TOKEN_LEN: usize = 8;

/// Random bytes drawn per token: 6 bytes encode to exactly 8 base64 chars.
const TOKEN_BYTES: usize = TOKEN_LEN * 6 / 8;

const MAX_TOKEN_ATTEMPTS: usize = 10;

/// Stale order slots tolerated before the age list is compacted.
const COMPACT_SLACK: usize = 64;

struct Entry<T> {
    seq: u64,
    request: T,
    expires_at: Instant,
}

struct Inner<T, R> {
    rng: R,
    entries: HashMap<String, Entry<T>>,
    /// Insertion order, oldest first. Consumed entries leave stale slots
    /// behind that are skipped by sequence number.
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl<T, R: RngCore> Inner<T, R> {
    /// Drop expired entries from the old end of the age list.
    fn gc(&mut self, now: Instant) {
        while let Some((seq, token)) = self.order.front() {
            if let Some(entry) = self.entries.get(token) {
                if entry.seq == *seq {
                    if entry.expires_at > now {
                        break;
                    }
                    self.entries.remove(token);
                }
            }
            self.order.pop_front();
        }
    }

    fn compact(&mut self) {
        if self.order.len() <= 2 * self.entries.len() + COMPACT_SLACK {
            return;
        }
        let entries = &self.entries;
        self.order
            .retain(|(seq, token)| entries.get(token).map_or(false, |e| e.seq == *seq));
    }

    fn unique_token(&mut self) -> Result<String> {
        let mut raw = [0u8; TOKEN_BYTES];
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            self.rng
                .try_fill_bytes(&mut raw)
                .map_err(|e| BerthError::TokenGeneration(e.to_string()))?;
            let mut token = URL_SAFE_NO_PAD.encode(raw);
            token.truncate(TOKEN_LEN);
            if !self.entries.contains_key(&token) {
                return Ok(token);
            }
        }
        Err(BerthError::TokenGeneration(format!(
            "no unique token after {} attempts",
            MAX_TOKEN_ATTEMPTS
        )))
    }
}

/// Bounded, time-limited registry of pending requests keyed by token.
pub struct RequestCache<T, R = OsRng> {
    ttl: Duration,
    max_in_flight: usize,
    inner: Mutex<Inner<T, R>>,
}

impl<T> RequestCache<T> {
    /// Create a cache drawing tokens from the OS random source.
    pub fn new(ttl: Duration, max_in_flight: usize) -> Self {
        Self::with_rng(ttl, max_in_flight, OsRng)
    }
}

impl<T, R: RngCore> RequestCache<T, R> {
    /// Create a cache with a caller-supplied random source.
    pub fn with_rng(ttl: Duration, max_in_flight: usize, rng: R) -> Self {
        Self {
            ttl,
            max_in_flight,
            inner: Mutex::new(Inner {
                rng,
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    /// Token lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a request and return the token that redeems it.
    ///
    /// Expired entries are collected first so they never count against the
    /// in-flight bound.
    pub fn insert(&self, request: T) -> Result<String> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.gc(now);
        if inner.entries.len() >= self.max_in_flight {
            return Err(BerthError::TooManyInFlight);
        }

        let token = inner.unique_token()?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.push_back((seq, token.clone()));
        inner.entries.insert(
            token.clone(),
            Entry {
                seq,
                request,
                expires_at: now + self.ttl,
            },
        );
        Ok(token)
    }

    /// Remove and return the request behind `token`.
    ///
    /// Returns `None` for unknown, already consumed or expired tokens.
    pub fn consume(&self, token: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(token)?;
        inner.compact();
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.request)
    }

    /// Number of stored entries, including expired ones not yet collected.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
