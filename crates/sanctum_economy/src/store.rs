//! # Store
//!
//! In-memory tables for player accounts and collectible stacks, with
//! pessimistic row locks and all-or-nothing transactions.
//!
//! ## Transaction lifecycle
//!
//! ```text
//! begin ─► lock_player / lock_players / lock_stack   (row locks, copy to workspace)
//!      ─► player_mut / stack_mut / add_to_stack / stage(journal draft)
//!      ─► commit:  version check ─► journal append ─► write back ─► unlock
//!          or drop: discard workspace ─► unlock
//! ```
//!
//! Reads outside a transaction see committed state only.
//!
//! ## Invariants
//!
//! - At most one stack row per `(player, base item, tier)`. New stacks are
//!   only created while the owner's row is locked, which serializes
//!   creators of the same triple.
//! - A stack can only be locked after its owner.
//! - Zero-quantity stacks stay as rows and are hidden from reads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::account::{CollectibleStack, Element, ItemId, PlayerAccount, PlayerId, StackId, Tier};
use crate::error::{EconomyError, EconomyResult};
use crate::journal::{JournalDraft, JournalEntry, TransactionJournal};
use crate::lock::{LockTable, OwnerToken};

/// Row lock key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum RowKey {
    Player(PlayerId),
    Stack(StackId),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Player(id) => write!(f, "row:{id}"),
            Self::Stack(id) => write!(f, "row:{id}"),
        }
    }
}

#[derive(Default)]
struct Tables {
    players: HashMap<PlayerId, PlayerAccount>,
    stacks: HashMap<StackId, CollectibleStack>,
    by_triple: HashMap<(PlayerId, ItemId, Tier), StackId>,
    by_owner: HashMap<PlayerId, BTreeSet<StackId>>,
}

impl Tables {
    fn insert_stack(&mut self, stack: CollectibleStack) {
        self.by_triple
            .insert((stack.owner, stack.base_id, stack.tier), stack.id);
        self.by_owner.entry(stack.owner).or_default().insert(stack.id);
        self.stacks.insert(stack.id, stack);
    }
}

/// Player and stack tables plus their row locks.
pub struct Store {
    tables: RwLock<Tables>,
    row_locks: LockTable<RowKey>,
    next_stack: AtomicU64,
    journal: Arc<TransactionJournal>,
}

impl Store {
    /// Creates an empty store that journals into `journal`.
    #[must_use]
    pub fn new(journal: Arc<TransactionJournal>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            row_locks: LockTable::new(),
            next_stack: AtomicU64::new(1),
            journal,
        }
    }

    /// The journal commits are appended to.
    #[must_use]
    pub fn journal(&self) -> &Arc<TransactionJournal> {
        &self.journal
    }

    /// Opens a transaction. Row locks wait at most `wait`, and nothing
    /// proceeds past `deadline`.
    #[must_use]
    pub fn begin(&self, wait: Duration, deadline: Option<Instant>) -> StoreTransaction<'_> {
        StoreTransaction {
            store: self,
            wait,
            deadline,
            locks: Vec::new(),
            players: BTreeMap::new(),
            stacks: BTreeMap::new(),
            drafts: Vec::new(),
            committed: false,
        }
    }

    /// Inserts a new account, journaling `draft` with it.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the id is taken; `Storage` if the journal fails.
    pub fn register(&self, account: PlayerAccount, draft: Option<JournalDraft>) -> EconomyResult<()> {
        let mut tables = self.tables.write();
        if tables.players.contains_key(&account.id) {
            return Err(EconomyError::invalid(format!("{} is already registered", account.id)));
        }
        if let Some(draft) = draft {
            self.journal.append(vec![draft])?;
        }
        debug!(player = account.id.0, "player registered");
        tables.players.insert(account.id, account);
        Ok(())
    }

    /// Committed account.
    ///
    /// # Errors
    ///
    /// `UnknownPlayer` if absent.
    pub fn account(&self, player: PlayerId) -> EconomyResult<PlayerAccount> {
        self.tables
            .read()
            .players
            .get(&player)
            .cloned()
            .ok_or(EconomyError::UnknownPlayer(player))
    }

    /// Committed stack, if present and non-empty.
    #[must_use]
    pub fn stack(&self, id: StackId) -> Option<CollectibleStack> {
        self.tables
            .read()
            .stacks
            .get(&id)
            .filter(|s| !s.is_empty())
            .cloned()
    }

    /// Non-empty committed stacks of a player, by id.
    #[must_use]
    pub fn stacks_of(&self, player: PlayerId) -> Vec<CollectibleStack> {
        let tables = self.tables.read();
        tables
            .by_owner
            .get(&player)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.stacks.get(id))
                    .filter(|s| !s.is_empty())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of registered players.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.tables.read().players.len()
    }

    /// Whether a row lock is held on a player (diagnostics and tests).
    #[must_use]
    pub fn is_player_row_locked(&self, player: PlayerId) -> bool {
        self.row_locks.is_held(&RowKey::Player(player))
    }
}

struct StagedPlayer {
    row: PlayerAccount,
    read_version: u64,
    dirty: bool,
}

struct StagedStack {
    row: CollectibleStack,
    created: bool,
    dirty: bool,
}

/// A unit of work over the store.
///
/// Dropping without [`StoreTransaction::commit`] rolls back.
pub struct StoreTransaction<'s> {
    store: &'s Store,
    wait: Duration,
    deadline: Option<Instant>,
    locks: Vec<(RowKey, OwnerToken)>,
    players: BTreeMap<PlayerId, StagedPlayer>,
    stacks: BTreeMap<StackId, StagedStack>,
    drafts: Vec<JournalDraft>,
    committed: bool,
}

impl StoreTransaction<'_> {
    fn check_deadline(&self) -> EconomyResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(EconomyError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    fn lock_row(&mut self, key: RowKey) -> EconomyResult<()> {
        let acquired = self.store.row_locks.acquire(&key, None, self.wait, self.deadline)?;
        self.locks.push((key, acquired.owner));
        Ok(())
    }

    fn not_locked(what: impl fmt::Display) -> EconomyError {
        EconomyError::invalid(format!("{what} is not locked in this transaction"))
    }

    /// Row-locks a player and copies the row into the workspace.
    ///
    /// # Errors
    ///
    /// `LockTimeout`/`DeadlineExceeded` on contention, `UnknownPlayer` if
    /// absent.
    pub fn lock_player(&mut self, player: PlayerId) -> EconomyResult<&PlayerAccount> {
        if !self.players.contains_key(&player) {
            self.check_deadline()?;
            if !self.store.tables.read().players.contains_key(&player) {
                return Err(EconomyError::UnknownPlayer(player));
            }
            self.lock_row(RowKey::Player(player))?;
            let row = self
                .store
                .tables
                .read()
                .players
                .get(&player)
                .cloned()
                .ok_or(EconomyError::UnknownPlayer(player))?;
            self.players.insert(
                player,
                StagedPlayer {
                    read_version: row.version,
                    row,
                    dirty: false,
                },
            );
        }
        self.player(player)
    }

    /// Locks a player and asserts the version the caller last saw.
    ///
    /// # Errors
    ///
    /// As [`Self::lock_player`], plus `ConcurrentModification` on mismatch.
    pub fn lock_player_at(&mut self, player: PlayerId, expected_version: u64) -> EconomyResult<&PlayerAccount> {
        let found = self.lock_player(player)?.version;
        if found != expected_version {
            return Err(EconomyError::ConcurrentModification {
                entity: player.to_string(),
                expected: expected_version,
                found,
            });
        }
        self.player(player)
    }

    /// Locks several players in ascending id order.
    ///
    /// # Errors
    ///
    /// As [`Self::lock_player`].
    pub fn lock_players(&mut self, players: &[PlayerId]) -> EconomyResult<()> {
        let mut ordered = players.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        for player in ordered {
            self.lock_player(player)?;
        }
        Ok(())
    }

    /// Row-locks a stack. Its owner must already be locked.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for unknown or empty stacks, or if the owner is not
    /// locked; `LockTimeout`/`DeadlineExceeded` on contention.
    pub fn lock_stack(&mut self, id: StackId) -> EconomyResult<&CollectibleStack> {
        if !self.stacks.contains_key(&id) {
            self.check_deadline()?;
            let owner = self
                .store
                .tables
                .read()
                .stacks
                .get(&id)
                .map(|s| s.owner)
                .ok_or_else(|| EconomyError::invalid(format!("unknown {id}")))?;
            if !self.players.contains_key(&owner) {
                return Err(Self::not_locked(owner));
            }
            self.lock_row(RowKey::Stack(id))?;
            let row = self
                .store
                .tables
                .read()
                .stacks
                .get(&id)
                .cloned()
                .ok_or_else(|| EconomyError::invalid(format!("unknown {id}")))?;
            self.stacks.insert(
                id,
                StagedStack {
                    row,
                    created: false,
                    dirty: false,
                },
            );
        }
        self.stack(id)
    }

    /// A locked player row.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if not locked.
    pub fn player(&self, player: PlayerId) -> EconomyResult<&PlayerAccount> {
        self.players
            .get(&player)
            .map(|s| &s.row)
            .ok_or_else(|| Self::not_locked(player))
    }

    /// A locked player row, for mutation.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if not locked.
    pub fn player_mut(&mut self, player: PlayerId) -> EconomyResult<&mut PlayerAccount> {
        let staged = self
            .players
            .get_mut(&player)
            .ok_or_else(|| Self::not_locked(player))?;
        staged.dirty = true;
        Ok(&mut staged.row)
    }

    /// A locked stack row.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if not locked.
    pub fn stack(&self, id: StackId) -> EconomyResult<&CollectibleStack> {
        self.stacks
            .get(&id)
            .map(|s| &s.row)
            .ok_or_else(|| Self::not_locked(id))
    }

    /// A locked stack row, for mutation.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if not locked.
    pub fn stack_mut(&mut self, id: StackId) -> EconomyResult<&mut CollectibleStack> {
        let staged = self.stacks.get_mut(&id).ok_or_else(|| Self::not_locked(id))?;
        staged.dirty = true;
        Ok(&mut staged.row)
    }

    /// Adds copies to the owner's `(base, tier)` stack, creating it if needed.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the owner is not locked, `ArithmeticOverflow`
    /// if the quantity would overflow, lock errors if the existing stack is
    /// contended.
    pub fn add_to_stack(
        &mut self,
        owner: PlayerId,
        base_id: ItemId,
        tier: Tier,
        element: Element,
        quantity: u32,
    ) -> EconomyResult<StackId> {
        if !self.players.contains_key(&owner) {
            return Err(Self::not_locked(owner));
        }

        let in_workspace = self
            .stacks
            .values()
            .find(|s| s.row.owner == owner && s.row.base_id == base_id && s.row.tier == tier)
            .map(|s| s.row.id);
        let existing = in_workspace.or_else(|| {
            self.store
                .tables
                .read()
                .by_triple
                .get(&(owner, base_id, tier))
                .copied()
        });

        let id = if let Some(id) = existing {
            self.lock_stack(id)?;
            let stack = self.stack_mut(id)?;
            stack.quantity = stack
                .quantity
                .checked_add(quantity)
                .ok_or(EconomyError::ArithmeticOverflow)?;
            id
        } else {
            let id = StackId(self.store.next_stack.fetch_add(1, Ordering::Relaxed));
            self.stacks.insert(
                id,
                StagedStack {
                    row: CollectibleStack {
                        id,
                        owner,
                        base_id,
                        tier,
                        quantity,
                        element,
                    },
                    created: true,
                    dirty: true,
                },
            );
            id
        };
        Ok(id)
    }

    /// Base items the owner holds a non-empty stack of, counting changes
    /// made earlier in this transaction.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the owner is not locked.
    pub fn owned_base_items(&self, owner: PlayerId) -> EconomyResult<BTreeSet<ItemId>> {
        if !self.players.contains_key(&owner) {
            return Err(Self::not_locked(owner));
        }
        let tables = self.store.tables.read();
        let committed = tables
            .by_owner
            .get(&owner)
            .into_iter()
            .flatten()
            .filter(|id| !self.stacks.contains_key(*id))
            .filter_map(|id| tables.stacks.get(id));
        let staged = self
            .stacks
            .values()
            .map(|s| &s.row)
            .filter(|s| s.owner == owner);

        Ok(committed
            .chain(staged)
            .filter(|s| !s.is_empty())
            .map(|s| s.base_id)
            .collect())
    }

    /// Queues a journal entry for commit.
    pub fn stage(&mut self, draft: JournalDraft) {
        self.drafts.push(draft);
    }

    /// Number of drafts queued.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.drafts.len()
    }

    /// Applies the workspace, appends staged entries and releases row locks.
    ///
    /// # Errors
    ///
    /// `DeadlineExceeded`, `ConcurrentModification` if a row changed outside
    /// its lock, or `Storage` if the journal fails. Nothing is applied on
    /// error.
    pub fn commit(mut self) -> EconomyResult<Vec<JournalEntry>> {
        self.check_deadline()?;
        let mut tables = self.store.tables.write();

        for (id, staged) in &self.players {
            let found = tables.players.get(id).map_or(0, |p| p.version);
            if found != staged.read_version {
                return Err(EconomyError::ConcurrentModification {
                    entity: id.to_string(),
                    expected: staged.read_version,
                    found,
                });
            }
        }

        let entries = self.store.journal.append(std::mem::take(&mut self.drafts))?;

        let now = SystemTime::now();
        for (id, staged) in std::mem::take(&mut self.players) {
            if staged.dirty {
                let mut row = staged.row;
                row.version = staged.read_version + 1;
                row.updated_at = now;
                tables.players.insert(id, row);
            }
        }
        for (_, staged) in std::mem::take(&mut self.stacks) {
            if staged.created {
                tables.insert_stack(staged.row);
            } else if staged.dirty {
                tables.stacks.insert(staged.row.id, staged.row);
            }
        }
        drop(tables);

        self.committed = true;
        Ok(entries)
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        for (key, owner) in self.locks.drain(..).rev() {
            if !self.store.row_locks.release(&key, owner) {
                warn!(row = %key, "row lock already released");
            }
        }
        if !self.committed && (!self.players.is_empty() || !self.drafts.is_empty()) {
            debug!(
                rows = self.players.len() + self.stacks.len(),
                drafts = self.drafts.len(),
                "transaction rolled back"
            );
        }
    }
}
