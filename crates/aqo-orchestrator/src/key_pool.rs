//! Per-operation credential pools with lock-free health tracking.
//!
//! Each operation owns 1..N interchangeable keys plus an optional designated
//! fallback key. Health lives in per-key atomics so the hot path (one
//! acquire and one report per provider call) never takes a lock:
//!
//! - `healthy -> rate_limited` on a provider rate-limit response, reverting
//!   lazily once the cooldown has elapsed;
//! - `healthy -> error` after `error_threshold` consecutive hard errors, or
//!   immediately on a credential rejection, until [`KeyPool::reset`].
//!
//! When every pooled key is unhealthy, [`KeyPool::acquire`] hands out the
//! fallback key instead of blocking.
//!
//! Keys are identified in logs and snapshots by a short SHA-256 fingerprint;
//! the secret never leaves a [`KeyLease`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use aqo_core::{ApiKeyState, AppConfig, CredentialConfig, KeyHealth, KeyStrategy};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::error::KeyPoolError;

const HEALTHY: u8 = 0;
const RATE_LIMITED: u8 = 1;
const ERROR: u8 = 2;

const FINGERPRINT_BYTES: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct KeyPoolConfig {
    pub strategy: KeyStrategy,
    pub cooldown: Duration,
    pub error_threshold: u32,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            strategy: KeyStrategy::RoundRobin,
            cooldown: Duration::from_secs(300),
            error_threshold: 5,
        }
    }
}

impl KeyPoolConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            strategy: config.key_strategy,
            cooldown: config.key_cooldown(),
            error_threshold: config.key_error_threshold.max(1),
        }
    }
}

/// Short, stable, non-reversible identifier for a secret.
#[must_use]
pub fn fingerprint(secret: &str) -> String {
    Sha256::digest(secret.as_bytes())
        .iter()
        .take(FINGERPRINT_BYTES)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn health_from_u8(raw: u8) -> KeyHealth {
    match raw {
        RATE_LIMITED => KeyHealth::RateLimited,
        ERROR => KeyHealth::Error,
        _ => KeyHealth::Healthy,
    }
}

struct KeySlot {
    secret: String,
    fingerprint: String,
    status: AtomicU8,
    /// Milliseconds since the pool epoch; meaningful only while rate limited.
    cooldown_until_ms: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    consecutive_errors: AtomicU32,
    last_used_ms: AtomicU64,
}

impl KeySlot {
    fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_owned(),
            fingerprint: fingerprint(secret),
            status: AtomicU8::new(HEALTHY),
            cooldown_until_ms: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            last_used_ms: AtomicU64::new(0),
        }
    }

    /// Whether the key may be handed out at `now_ms`, reviving an expired
    /// rate limit on the way.
    fn is_available(&self, now_ms: u64) -> bool {
        match self.status.load(Ordering::Acquire) {
            HEALTHY => true,
            RATE_LIMITED => {
                if now_ms < self.cooldown_until_ms.load(Ordering::Acquire) {
                    return false;
                }
                // Losing this race means another caller already revived it
                // or a fresh report moved it again; re-read either way.
                let _ = self.status.compare_exchange(
                    RATE_LIMITED,
                    HEALTHY,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.status.load(Ordering::Acquire) == HEALTHY
            }
            _ => false,
        }
    }

    fn state(&self, operation: &str, is_fallback: bool, now_ms: u64) -> ApiKeyState {
        let status = health_from_u8(self.status.load(Ordering::Acquire));
        let cooldown_remaining_ms = (status == KeyHealth::RateLimited).then(|| {
            self.cooldown_until_ms
                .load(Ordering::Acquire)
                .saturating_sub(now_ms)
        });
        ApiKeyState {
            operation: operation.to_owned(),
            fingerprint: self.fingerprint.clone(),
            is_fallback,
            status,
            cooldown_remaining_ms,
            success_count: self.success_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.status.store(HEALTHY, Ordering::Release);
        self.cooldown_until_ms.store(0, Ordering::Release);
        self.consecutive_errors.store(0, Ordering::Release);
    }
}

struct OperationPool {
    keys: Vec<KeySlot>,
    fallback: Option<KeySlot>,
    cursor: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotRef {
    Pooled(usize),
    Fallback,
}

/// A key handed out for one provider call. Report the call's outcome back
/// through the pool with this lease.
#[derive(Clone)]
pub struct KeyLease {
    operation: String,
    slot: SlotRef,
    secret: String,
    fingerprint: String,
}

impl KeyLease {
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.slot == SlotRef::Fallback
    }
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease")
            .field("operation", &self.operation)
            .field("fingerprint", &self.fingerprint)
            .field("is_fallback", &self.is_fallback())
            .finish_non_exhaustive()
    }
}

/// Owned pool of credentials for every configured operation.
pub struct KeyPool {
    operations: BTreeMap<String, OperationPool>,
    config: KeyPoolConfig,
    epoch: Instant,
}

impl KeyPool {
    #[must_use]
    pub fn from_credentials(credentials: &CredentialConfig, config: KeyPoolConfig) -> Self {
        let operations = credentials
            .operations
            .iter()
            .map(|(operation, keys)| {
                let pool = OperationPool {
                    keys: keys.keys.iter().map(|k| KeySlot::new(k)).collect(),
                    fallback: keys.fallback.as_deref().map(KeySlot::new),
                    cursor: AtomicUsize::new(0),
                };
                (operation.clone(), pool)
            })
            .collect();

        Self {
            operations,
            config,
            epoch: Instant::now(),
        }
    }

    #[must_use]
    pub fn has_operation(&self, operation: &str) -> bool {
        self.operations.contains_key(operation)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn pool(&self, operation: &str) -> Result<&OperationPool, KeyPoolError> {
        self.operations
            .get(operation)
            .ok_or_else(|| KeyPoolError::UnknownOperation(operation.to_owned()))
    }

    fn slot<'a>(&'a self, lease: &KeyLease) -> Option<&'a KeySlot> {
        let pool = self.operations.get(&lease.operation)?;
        match lease.slot {
            SlotRef::Pooled(i) => pool.keys.get(i),
            SlotRef::Fallback => pool.fallback.as_ref(),
        }
    }

    fn lease(operation: &str, slot: SlotRef, key: &KeySlot, now_ms: u64) -> KeyLease {
        key.last_used_ms.store(now_ms, Ordering::Release);
        KeyLease {
            operation: operation.to_owned(),
            slot,
            secret: key.secret.clone(),
            fingerprint: key.fingerprint.clone(),
        }
    }

    /// Picks a key for `operation` using the configured strategy.
    ///
    /// Unhealthy keys are skipped. If none is healthy the fallback key is
    /// returned; without a fallback, the rate-limited key whose cooldown ends
    /// soonest is returned.
    ///
    /// # Errors
    ///
    /// Returns [`KeyPoolError::UnknownOperation`] if no credentials are
    /// configured for `operation`, or [`KeyPoolError::NoUsableKey`] if every
    /// key is in `error` and there is no fallback.
    pub fn acquire(&self, operation: &str) -> Result<KeyLease, KeyPoolError> {
        let pool = self.pool(operation)?;
        let now_ms = self.now_ms();

        if let Some(index) = self.select(pool, now_ms) {
            let lease = Self::lease(operation, SlotRef::Pooled(index), &pool.keys[index], now_ms);
            tracing::debug!(operation, key = %lease.fingerprint, "key acquired");
            return Ok(lease);
        }

        if let Some(fallback) = &pool.fallback {
            tracing::warn!(
                operation,
                key = %fallback.fingerprint,
                "all pooled keys unhealthy; using fallback key"
            );
            return Ok(Self::lease(operation, SlotRef::Fallback, fallback, now_ms));
        }

        let soonest = pool
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.status.load(Ordering::Acquire) == RATE_LIMITED)
            .min_by_key(|(_, k)| k.cooldown_until_ms.load(Ordering::Acquire));

        match soonest {
            Some((index, key)) => {
                tracing::warn!(
                    operation,
                    key = %key.fingerprint,
                    "all keys rate limited and no fallback configured; using soonest to recover"
                );
                Ok(Self::lease(operation, SlotRef::Pooled(index), key, now_ms))
            }
            None => Err(KeyPoolError::NoUsableKey(operation.to_owned())),
        }
    }

    fn select(&self, pool: &OperationPool, now_ms: u64) -> Option<usize> {
        let n = pool.keys.len();
        if n == 0 {
            return None;
        }

        match self.config.strategy {
            KeyStrategy::RoundRobin => {
                let start = pool.cursor.fetch_add(1, Ordering::Relaxed) % n;
                (0..n)
                    .map(|offset| (start + offset) % n)
                    .find(|&i| pool.keys[i].is_available(now_ms))
            }
            KeyStrategy::LeastRecentlyUsed => pool
                .keys
                .iter()
                .enumerate()
                .filter(|(_, k)| k.is_available(now_ms))
                .min_by_key(|(_, k)| k.last_used_ms.load(Ordering::Acquire))
                .map(|(i, _)| i),
            KeyStrategy::HealthWeighted => pool
                .keys
                .iter()
                .enumerate()
                .filter(|(_, k)| k.is_available(now_ms))
                .max_by(|(ia, a), (ib, b)| {
                    // Compare (s+1)/(s+e+2) without floating point; ties go to
                    // the idlest key, then the lowest index.
                    let (sa, ea) = (
                        u128::from(a.success_count.load(Ordering::Relaxed)),
                        u128::from(a.error_count.load(Ordering::Relaxed)),
                    );
                    let (sb, eb) = (
                        u128::from(b.success_count.load(Ordering::Relaxed)),
                        u128::from(b.error_count.load(Ordering::Relaxed)),
                    );
                    ((sa + 1) * (sb + eb + 2))
                        .cmp(&((sb + 1) * (sa + ea + 2)))
                        .then_with(|| {
                            b.last_used_ms
                                .load(Ordering::Acquire)
                                .cmp(&a.last_used_ms.load(Ordering::Acquire))
                        })
                        .then_with(|| ib.cmp(ia))
                })
                .map(|(i, _)| i),
        }
    }

    pub fn report_success(&self, lease: &KeyLease) {
        if let Some(key) = self.slot(lease) {
            key.success_count.fetch_add(1, Ordering::Relaxed);
            key.consecutive_errors.store(0, Ordering::Release);
        }
    }

    /// Puts the key into cooldown. `retry_after` extends the default cooldown
    /// when the provider asks for longer.
    pub fn report_rate_limited(&self, lease: &KeyLease, retry_after: Option<Duration>) {
        let Some(key) = self.slot(lease) else {
            return;
        };
        key.error_count.fetch_add(1, Ordering::Relaxed);

        let cooldown = retry_after.map_or(self.config.cooldown, |d| d.max(self.config.cooldown));
        let cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        let until = self.now_ms().saturating_add(cooldown_ms);
        key.cooldown_until_ms.store(until, Ordering::Release);

        // An `error` key stays in error; only healthy or rate-limited keys
        // move into cooldown.
        let moved = key
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s != ERROR).then_some(RATE_LIMITED)
            })
            .is_ok();

        if moved {
            tracing::warn!(
                operation = %lease.operation,
                key = %lease.fingerprint,
                cooldown_ms,
                "key rate limited"
            );
        }
    }

    /// Counts a hard error. The key moves to `error` once consecutive hard
    /// errors reach the threshold, or immediately for credential rejections.
    pub fn report_hard_error(&self, lease: &KeyLease, credential_rejected: bool) {
        let Some(key) = self.slot(lease) else {
            return;
        };
        key.error_count.fetch_add(1, Ordering::Relaxed);
        let consecutive = key.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;

        if credential_rejected || consecutive >= self.config.error_threshold {
            let previous = key.status.swap(ERROR, Ordering::AcqRel);
            if previous != ERROR {
                tracing::warn!(
                    operation = %lease.operation,
                    key = %lease.fingerprint,
                    consecutive,
                    credential_rejected,
                    "key marked error"
                );
            }
        }
    }

    /// Counts a failure that says nothing about the key itself (timeouts,
    /// upstream 5xx).
    pub fn report_transient_error(&self, lease: &KeyLease) {
        if let Some(key) = self.slot(lease) {
            key.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns a key to `healthy`. Returns `false` if no key matches.
    pub fn reset(&self, operation: &str, fingerprint: &str) -> bool {
        let Some(pool) = self.operations.get(operation) else {
            return false;
        };
        let key = pool
            .keys
            .iter()
            .chain(pool.fallback.iter())
            .find(|k| k.fingerprint == fingerprint);

        match key {
            Some(key) => {
                key.reset();
                tracing::info!(operation, key = fingerprint, "key reset to healthy");
                true
            }
            None => false,
        }
    }

    /// Point-in-time state of every key, grouped by operation.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ApiKeyState> {
        let now_ms = self.now_ms();
        self.operations
            .iter()
            .flat_map(|(operation, pool)| {
                pool.keys
                    .iter()
                    .map(move |k| k.state(operation, false, now_ms))
                    .chain(pool.fallback.iter().map(move |k| k.state(operation, true, now_ms)))
            })
            .collect()
    }
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "key_pool_test.rs"]
mod tests;
