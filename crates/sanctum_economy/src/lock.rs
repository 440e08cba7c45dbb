//! # Locking
//!
//! Two independent lock tiers guard every mutation:
//!
//! ```text
//! caller ──► advisory lock (per player, LockCoordinator)
//!              │  stops two commands for one player from even starting
//!              ▼
//!            row locks (per row, inside a StoreTransaction)
//!              │  last line of defence for the rows themselves
//!              ▼
//!            commit / rollback ──► release row locks ──► release advisory
//! ```
//!
//! Both tiers share [`LockTable`]: `FREE → HELD(owner, expires_at) → FREE`.
//! Release only succeeds for the current owner token, so a holder whose
//! hold expired (and was reclaimed) cannot free the new holder's lock.
//!
//! Multi-player operations lock in ascending [`PlayerId`] order, in both
//! tiers.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::account::PlayerId;
use crate::config::Tunables;
use crate::error::{EconomyError, EconomyResult};

/// Default advisory hold timeout.
pub const DEFAULT_HOLD: Duration = Duration::from_secs(10);

/// Default wait budget for any lock.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Unique per acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerToken(u64);

impl OwnerToken {
    fn next() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw token value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Lock timeouts for one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockSettings {
    /// How long an advisory lock may be held before it can be reclaimed.
    pub hold: Duration,
    /// How long to wait for any lock.
    pub wait: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            hold: DEFAULT_HOLD,
            wait: DEFAULT_WAIT,
        }
    }
}

impl LockSettings {
    /// Reads `lock.hold_ms` and `lock.wait_ms`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if a value is malformed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn load(tunables: &Tunables<'_>) -> EconomyResult<Self> {
        Ok(Self {
            hold: Duration::from_millis(
                tunables.unsigned_or("lock.hold_ms", DEFAULT_HOLD.as_millis() as u64)?,
            ),
            wait: Duration::from_millis(
                tunables.unsigned_or("lock.wait_ms", DEFAULT_WAIT.as_millis() as u64)?,
            ),
        })
    }
}

// =============================================================================
// LockTable
// =============================================================================

#[derive(Clone, Copy, Debug)]
struct Holder {
    owner: OwnerToken,
    expires_at: Option<Instant>,
}

impl Holder {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A successful acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acquired {
    /// Token needed to release.
    pub owner: OwnerToken,
    /// When the lock was taken.
    pub acquired_at: Instant,
    /// When the hold lapses, `None` for holds that only end on release.
    pub expires_at: Option<Instant>,
}

/// Owner-token lock table with bounded waits.
pub struct LockTable<K> {
    slots: Mutex<HashMap<K, Holder>>,
    released: Condvar,
}

impl<K> Default for LockTable<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }
}

impl<K: Eq + Hash + Clone + fmt::Display> LockTable<K> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `key`, waiting at most `wait` and never past `deadline`.
    ///
    /// An expired hold is reclaimed. With `hold = None` the lock is held
    /// until released.
    ///
    /// # Errors
    ///
    /// `LockTimeout` if the wait budget runs out, `DeadlineExceeded` if the
    /// deadline passes first.
    pub fn acquire(
        &self,
        key: &K,
        hold: Option<Duration>,
        wait: Duration,
        deadline: Option<Instant>,
    ) -> EconomyResult<Acquired> {
        let start = Instant::now();
        if deadline.is_some_and(|d| d <= start) {
            return Err(EconomyError::DeadlineExceeded);
        }
        let wait_until = start + wait;
        let limit = deadline.map_or(wait_until, |d| d.min(wait_until));

        let mut slots = self.slots.lock();
        loop {
            let now = Instant::now();
            let wake_at = match slots.get(key) {
                None => None,
                Some(holder) if holder.expired(now) => {
                    warn!(lock = %key, stale_owner = holder.owner.raw(), "reclaiming expired lock");
                    None
                }
                Some(holder) => Some(holder.expires_at.map_or(limit, |at| at.min(limit))),
            };

            let Some(wake_at) = wake_at else {
                let owner = OwnerToken::next();
                let expires_at = hold.map(|h| now + h);
                slots.insert(key.clone(), Holder { owner, expires_at });
                return Ok(Acquired {
                    owner,
                    acquired_at: now,
                    expires_at,
                });
            };

            if now >= limit {
                let waited_ms = u64::try_from(now.duration_since(start).as_millis()).unwrap_or(u64::MAX);
                debug!(lock = %key, waited_ms, "lock wait exhausted");
                if deadline.is_some_and(|d| d <= now) && deadline < Some(wait_until) {
                    return Err(EconomyError::DeadlineExceeded);
                }
                return Err(EconomyError::LockTimeout {
                    key: key.to_string(),
                    waited_ms,
                });
            }

            self.released.wait_until(&mut slots, wake_at);
        }
    }

    /// Releases `key` if `owner` still holds it.
    pub fn release(&self, key: &K, owner: OwnerToken) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(holder) if holder.owner == owner => {
                slots.remove(key);
                drop(slots);
                self.released.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Whether `key` is held by an unexpired owner.
    pub fn is_held(&self, key: &K) -> bool {
        let now = Instant::now();
        self.slots
            .lock()
            .get(key)
            .is_some_and(|holder| !holder.expired(now))
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// True if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

// =============================================================================
// Advisory tier
// =============================================================================

/// What a per-player advisory lock protects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Every balance or inventory mutation.
    Economy,
    /// A host-defined domain serialized separately from the economy.
    Named(&'static str),
}

/// Advisory lock key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockKey {
    /// Player the lock belongs to.
    pub player: PlayerId,
    /// Domain.
    pub kind: LockKind,
}

impl LockKey {
    /// The economy lock for a player.
    #[must_use]
    pub const fn economy(player: PlayerId) -> Self {
        Self {
            player,
            kind: LockKind::Economy,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LockKind::Economy => write!(f, "economy:{}", self.player.0),
            LockKind::Named(name) => write!(f, "{name}:{}", self.player.0),
        }
    }
}

/// An advisory lock held by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockHandle {
    /// Key held.
    pub key: LockKey,
    /// Owner token.
    pub owner: OwnerToken,
    /// Acquisition time.
    pub acquired_at: Instant,
    /// Hold expiry.
    pub expires_at: Instant,
}

/// Per-player advisory mutex.
///
/// A multi-process deployment backs this with a shared cache; the
/// semantics (owner-token release, timeout reclaim) must stay identical.
pub trait LockCoordinator: Send + Sync {
    /// Acquires `key` for `hold`, waiting at most `wait`.
    ///
    /// # Errors
    ///
    /// `LockTimeout` or `DeadlineExceeded`.
    fn acquire(
        &self,
        key: LockKey,
        hold: Duration,
        wait: Duration,
        deadline: Option<Instant>,
    ) -> EconomyResult<LockHandle>;

    /// Releases the lock if `handle` still owns it.
    fn release(&self, handle: &LockHandle) -> bool;

    /// Whether `key` is currently held.
    fn is_held(&self, key: &LockKey) -> bool;
}

/// Single-process coordinator.
#[derive(Default)]
pub struct InMemoryLockCoordinator {
    table: LockTable<LockKey>,
}

impl InMemoryLockCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockCoordinator for InMemoryLockCoordinator {
    fn acquire(
        &self,
        key: LockKey,
        hold: Duration,
        wait: Duration,
        deadline: Option<Instant>,
    ) -> EconomyResult<LockHandle> {
        let acquired = self.table.acquire(&key, Some(hold), wait, deadline)?;
        Ok(LockHandle {
            key,
            owner: acquired.owner,
            acquired_at: acquired.acquired_at,
            expires_at: acquired.expires_at.unwrap_or(acquired.acquired_at + hold),
        })
    }

    fn release(&self, handle: &LockHandle) -> bool {
        self.table.release(&handle.key, handle.owner)
    }

    fn is_held(&self, key: &LockKey) -> bool {
        self.table.is_held(key)
    }
}

/// Releases an advisory lock when dropped.
pub struct AdvisoryGuard<'a> {
    coordinator: &'a dyn LockCoordinator,
    handle: LockHandle,
}

impl<'a> AdvisoryGuard<'a> {
    /// Acquires one player's economy lock.
    ///
    /// # Errors
    ///
    /// `LockTimeout` or `DeadlineExceeded`.
    pub fn acquire(
        coordinator: &'a dyn LockCoordinator,
        player: PlayerId,
        settings: LockSettings,
        deadline: Option<Instant>,
    ) -> EconomyResult<Self> {
        let handle = coordinator.acquire(LockKey::economy(player), settings.hold, settings.wait, deadline)?;
        Ok(Self { coordinator, handle })
    }

    /// Acquires several players' economy locks in ascending id order.
    ///
    /// On failure the locks already taken are released.
    ///
    /// # Errors
    ///
    /// `LockTimeout` or `DeadlineExceeded`.
    pub fn acquire_ordered(
        coordinator: &'a dyn LockCoordinator,
        players: &[PlayerId],
        settings: LockSettings,
        deadline: Option<Instant>,
    ) -> EconomyResult<Vec<Self>> {
        let mut ordered = players.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for player in ordered {
            guards.push(Self::acquire(coordinator, player, settings, deadline)?);
        }
        Ok(guards)
    }

    /// The held lock.
    #[must_use]
    pub const fn handle(&self) -> &LockHandle {
        &self.handle
    }
}

impl Drop for AdvisoryGuard<'_> {
    fn drop(&mut self) {
        if !self.coordinator.release(&self.handle) {
            warn!(
                lock = %self.handle.key,
                owner = self.handle.owner.raw(),
                "advisory lock expired before release; another holder owns it now"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn settings(hold_ms: u64, wait_ms: u64) -> LockSettings {
        LockSettings {
            hold: Duration::from_millis(hold_ms),
            wait: Duration::from_millis(wait_ms),
        }
    }

    #[test]
    fn test_acquire_release() {
        let coordinator = InMemoryLockCoordinator::new();
        let key = LockKey::economy(PlayerId(1));
        let handle = coordinator
            .acquire(key, DEFAULT_HOLD, DEFAULT_WAIT, None)
            .unwrap();
        assert!(coordinator.is_held(&key));
        assert!(coordinator.release(&handle));
        assert!(!coordinator.is_held(&key));
        assert!(!coordinator.release(&handle));
    }

    #[test]
    fn test_contended_acquire_times_out() {
        let coordinator = InMemoryLockCoordinator::new();
        let _guard = AdvisoryGuard::acquire(&coordinator, PlayerId(1), settings(10_000, 50), None).unwrap();

        let start = Instant::now();
        let err = AdvisoryGuard::acquire(&coordinator, PlayerId(1), settings(10_000, 50), None)
            .err()
            .unwrap();
        assert!(matches!(err, EconomyError::LockTimeout { .. }));
        assert!(err.is_retryable());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_stale_holder_cannot_release_new_holder() {
        let coordinator = InMemoryLockCoordinator::new();
        let key = LockKey::economy(PlayerId(9));

        let stale = coordinator
            .acquire(key, Duration::from_millis(20), DEFAULT_WAIT, None)
            .unwrap();
        thread::sleep(Duration::from_millis(40));

        let fresh = coordinator
            .acquire(key, DEFAULT_HOLD, DEFAULT_WAIT, None)
            .unwrap();
        assert_ne!(stale.owner, fresh.owner);

        assert!(!coordinator.release(&stale), "stale release must be refused");
        assert!(coordinator.is_held(&key));
        assert!(coordinator.release(&fresh));
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let coordinator = Arc::new(InMemoryLockCoordinator::new());
        let guard_handle = coordinator
            .acquire(LockKey::economy(PlayerId(3)), DEFAULT_HOLD, DEFAULT_WAIT, None)
            .unwrap();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                coordinator
                    .acquire(LockKey::economy(PlayerId(3)), DEFAULT_HOLD, Duration::from_secs(2), None)
                    .map(|h| coordinator.release(&h))
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(coordinator.release(&guard_handle));
        assert_eq!(waiter.join().unwrap(), Ok(true));
    }

    #[test]
    fn test_deadline_aborts_wait() {
        let table: LockTable<LockKey> = LockTable::new();
        let key = LockKey::economy(PlayerId(5));
        table.acquire(&key, None, DEFAULT_WAIT, None).unwrap();

        let deadline = Instant::now() + Duration::from_millis(30);
        let err = table
            .acquire(&key, None, Duration::from_secs(5), Some(deadline))
            .unwrap_err();
        assert_eq!(err, EconomyError::DeadlineExceeded);
    }

    #[test]
    fn test_ordered_guards_release_on_drop() {
        let coordinator = InMemoryLockCoordinator::new();
        {
            let guards = AdvisoryGuard::acquire_ordered(
                &coordinator,
                &[PlayerId(8), PlayerId(2), PlayerId(8)],
                LockSettings::default(),
                None,
            )
            .unwrap();
            let order: Vec<_> = guards.iter().map(|g| g.handle().key.player).collect();
            assert_eq!(order, vec![PlayerId(2), PlayerId(8)]);
            assert!(coordinator.is_held(&LockKey::economy(PlayerId(8))));
        }
        assert!(!coordinator.is_held(&LockKey::economy(PlayerId(2))));
        assert!(!coordinator.is_held(&LockKey::economy(PlayerId(8))));
    }
}
