//! # Economy Engine
//!
//! The single entry point callers use. Nothing is granted, consumed,
//! fused or summoned without passing through here.
//!
//! ```text
//! caller ──> EconomyEngine ──> advisory lock ──> StoreTransaction
//!                 │                                   │
//!                 │               Ledger / OutcomeResolver / stacks
//!                 │                                   │
//!                 │                          commit + journal append
//!                 ▼                                   │
//!             EventBus  <─────── publish after commit ┘
//! ```
//!
//! Every method reads the config provider at call time; nothing is cached
//! across calls. Errors never leave partial state: validation happens
//! before locking, and everything after is inside one transaction that is
//! rolled back when dropped.

use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use serde_json::json;
use tracing::{debug, info};

use crate::account::{CollectibleStack, ItemId, PlayerAccount, PlayerClass, PlayerId, StackId, Tier};
use crate::catalog::ItemCatalog;
use crate::config::{ConfigProvider, Tunables};
use crate::currency::CurrencyKind;
use crate::error::{EconomyError, EconomyResult};
use crate::events::{EventBus, EventReceiver, OutcomePayload, DEFAULT_BACKLOG_LIMIT, DEFAULT_EVENT_CAPACITY};
use crate::fixed_point::FixedPoint;
use crate::fusion::{FusionOrchestrator, FusionResult};
use crate::journal::{JournalDraft, JournalKind, JournalSettings, TransactionJournal};
use crate::ledger::{BalanceChange, Ledger};
use crate::lock::{AdvisoryGuard, InMemoryLockCoordinator, LockCoordinator, LockSettings};
use crate::outcome::FusionSettings;
use crate::rng::{secure_factory, RngFactory};
use crate::store::{Store, StoreTransaction};
use crate::summon::{SummonOrchestrator, SummonResult};

// ============================================================================
// Requests
// ============================================================================

/// A grant or consume request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrencyRequest {
    /// Player.
    pub player: PlayerId,
    /// Currency.
    pub kind: CurrencyKind,
    /// Amount before modifiers.
    pub amount: u64,
    /// Caller modifiers (leader bonus, events). Grants only.
    pub factors: Vec<FixedPoint>,
    /// Version the caller last saw, checked under lock.
    pub expected_version: Option<u64>,
    /// Recorded in the journal context.
    pub reason: String,
    /// Abort lock waits and commit past this instant.
    pub deadline: Option<Instant>,
}

impl CurrencyRequest {
    /// A plain request.
    #[must_use]
    pub fn new(player: PlayerId, kind: CurrencyKind, amount: u64) -> Self {
        Self {
            player,
            kind,
            amount,
            factors: Vec::new(),
            expected_version: None,
            reason: String::new(),
            deadline: None,
        }
    }

    /// Adds a modifier factor.
    #[must_use]
    pub fn with_factor(mut self, factor: FixedPoint) -> Self {
        self.factors.push(factor);
        self
    }

    /// Requires the account to still be at `version`.
    #[must_use]
    pub const fn expecting_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Sets the journal reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Sets a deadline.
    #[must_use]
    pub const fn before(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Wires an [`EconomyEngine`].
pub struct EngineBuilder {
    config: Arc<dyn ConfigProvider>,
    locks: Option<Arc<dyn LockCoordinator>>,
    journal: Option<Arc<TransactionJournal>>,
    catalog: Option<Arc<ItemCatalog>>,
    rng: Option<RngFactory>,
}

impl EngineBuilder {
    /// Uses a shared lock coordinator instead of a private in-memory one.
    #[must_use]
    pub fn locks(mut self, locks: Arc<dyn LockCoordinator>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Uses an existing journal.
    #[must_use]
    pub fn journal(mut self, journal: Arc<TransactionJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Opens (and replays) a durable journal at `path`.
    ///
    /// # Errors
    ///
    /// `Storage` if the file cannot be opened.
    pub fn journal_file(self, path: impl AsRef<Path>) -> EconomyResult<Self> {
        let journal = TransactionJournal::open(path)?;
        Ok(self.journal(Arc::new(journal)))
    }

    /// Sets the item catalogue. Defaults to [`ItemCatalog::standard`].
    #[must_use]
    pub fn catalog(mut self, catalog: ItemCatalog) -> Self {
        self.catalog = Some(Arc::new(catalog));
        self
    }

    /// Sets the random source factory. Defaults to [`secure_factory`].
    #[must_use]
    pub fn rng(mut self, rng: RngFactory) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `events.capacity` or `events.max_backlog` is
    /// malformed.
    pub fn build(self) -> EconomyResult<EconomyEngine> {
        let tunables = Tunables::new(self.config.as_ref());
        let capacity = tunables.unsigned_or("events.capacity", DEFAULT_EVENT_CAPACITY as u64)?;
        let capacity = usize::try_from(capacity)
            .map_err(|_| EconomyError::InvalidConfig("events.capacity out of range".into()))?;
        let backlog_limit = tunables.unsigned_or("events.max_backlog", DEFAULT_BACKLOG_LIMIT as u64)?;
        let backlog_limit = usize::try_from(backlog_limit)
            .map_err(|_| EconomyError::InvalidConfig("events.max_backlog out of range".into()))?;
        let journal = self
            .journal
            .unwrap_or_else(|| Arc::new(TransactionJournal::in_memory()));

        Ok(EconomyEngine {
            config: self.config,
            locks: self
                .locks
                .unwrap_or_else(|| Arc::new(InMemoryLockCoordinator::new())),
            store: Store::new(journal),
            catalog: self.catalog.unwrap_or_else(|| Arc::new(ItemCatalog::standard())),
            events: EventBus::new(capacity).with_backlog_limit(backlog_limit),
            rng: self.rng.unwrap_or_else(secure_factory),
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Resource transaction and outcome engine.
pub struct EconomyEngine {
    config: Arc<dyn ConfigProvider>,
    locks: Arc<dyn LockCoordinator>,
    store: Store,
    catalog: Arc<ItemCatalog>,
    events: EventBus,
    rng: RngFactory,
}

impl EconomyEngine {
    /// Starts wiring an engine around a config provider.
    #[must_use]
    pub fn builder(config: Arc<dyn ConfigProvider>) -> EngineBuilder {
        EngineBuilder {
            config,
            locks: None,
            journal: None,
            catalog: None,
            rng: None,
        }
    }

    /// Engine with default collaborators.
    ///
    /// # Errors
    ///
    /// As [`EngineBuilder::build`].
    pub fn new(config: Arc<dyn ConfigProvider>) -> EconomyResult<Self> {
        Self::builder(config).build()
    }

    fn tunables(&self) -> Tunables<'_> {
        Tunables::new(self.config.as_ref())
    }

    // ------------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------------

    /// Creates an account with the configured starting balances.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the id is taken, config errors for malformed
    /// starting balances.
    pub fn register_player(&self, player: PlayerId, class: PlayerClass, level: u32) -> EconomyResult<PlayerAccount> {
        let tunables = self.tunables();
        let balances = tunables.starting_balances()?;
        let caps = tunables.currency_caps()?;

        let mut account = PlayerAccount::new(player, class, balances).with_level(level);
        let mut draft = JournalDraft::new(player, JournalKind::Grant).with_context(json!({
            "reason": "registration",
            "class": class.as_str(),
        }));
        for kind in CurrencyKind::ALL {
            let seeded = caps.clip(kind, account.balances[kind]);
            account.balances[kind] = seeded;
            draft = draft.with_delta(kind, i64::try_from(seeded).unwrap_or(i64::MAX));
        }

        self.store.register(account.clone(), Some(draft))?;
        info!(player = player.0, class = class.as_str(), level, "player registered");
        Ok(account)
    }

    /// Soft-archives an account. Archived accounts reject every mutation.
    ///
    /// # Errors
    ///
    /// `UnknownPlayer`, lock errors.
    pub fn archive_player(&self, player: PlayerId) -> EconomyResult<()> {
        let lock_settings = LockSettings::load(&self.tunables())?;
        let _guard = AdvisoryGuard::acquire(self.locks.as_ref(), player, lock_settings, None)?;
        let mut tx = self.store.begin(lock_settings.wait, None);
        tx.lock_player(player)?;
        tx.player_mut(player)?.archived = true;
        tx.commit()?;
        info!(player = player.0, "player archived");
        Ok(())
    }

    /// Committed account state.
    ///
    /// # Errors
    ///
    /// `UnknownPlayer`.
    pub fn account(&self, player: PlayerId) -> EconomyResult<PlayerAccount> {
        self.store.account(player)
    }

    /// Non-empty stacks owned by a player.
    #[must_use]
    pub fn stacks_of(&self, player: PlayerId) -> Vec<CollectibleStack> {
        self.store.stacks_of(player)
    }

    /// One non-empty stack.
    #[must_use]
    pub fn stack(&self, id: StackId) -> Option<CollectibleStack> {
        self.store.stack(id)
    }

    // ------------------------------------------------------------------------
    // Currency
    // ------------------------------------------------------------------------

    fn lock_for(tx: &mut StoreTransaction<'_>, request: &CurrencyRequest) -> EconomyResult<()> {
        match request.expected_version {
            Some(version) => tx.lock_player_at(request.player, version).map(|_| ()),
            None => tx.lock_player(request.player).map(|_| ()),
        }
    }

    fn reject_zero(amount: u64) -> EconomyResult<()> {
        if amount == 0 {
            return Err(EconomyError::invalid("amount must be positive"));
        }
        Ok(())
    }

    /// Grants currency: caller factors and the class modifier are
    /// multiplied, applied, floored, added, then clipped to the cap.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for zero amounts or archived players,
    /// `ConcurrentModification` on version mismatch, lock errors.
    pub fn grant_currency(&self, request: &CurrencyRequest) -> EconomyResult<BalanceChange> {
        Self::reject_zero(request.amount)?;
        let tunables = self.tunables();
        let ledger = Ledger::load(&tunables)?;
        let lock_settings = LockSettings::load(&tunables)?;

        let _guard = AdvisoryGuard::acquire(self.locks.as_ref(), request.player, lock_settings, request.deadline)?;
        let mut tx = self.store.begin(lock_settings.wait, request.deadline);
        Self::lock_for(&mut tx, request)?;

        let class = tx.player(request.player)?.class;
        let mut factors = request.factors.clone();
        factors.push(tunables.class_modifier(class, request.kind)?);

        let change = ledger.grant(&mut tx, request.player, request.kind, request.amount, &factors)?;
        tx.stage(
            JournalDraft::new(request.player, JournalKind::Grant)
                .with_delta(request.kind, change.delta())
                .with_context(json!({
                    "reason": request.reason,
                    "requested": request.amount,
                    "factors": factors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "clipped": change.clipped,
                })),
        );
        let entries = tx.commit()?;

        debug!(
            player = request.player.0,
            kind = request.kind.as_str(),
            amount = request.amount,
            new = change.new,
            "currency granted"
        );
        self.events.publish(
            request.player,
            entries.iter().map(|e| e.id).collect(),
            OutcomePayload::CurrencyGranted {
                kind: request.kind,
                delta: change.delta(),
            },
        );
        Ok(change)
    }

    /// Consumes exactly `amount`, or nothing.
    ///
    /// # Errors
    ///
    /// `InsufficientResources` if the balance is short; otherwise as
    /// [`Self::grant_currency`]. No journal entry is written on failure.
    pub fn consume_currency(&self, request: &CurrencyRequest) -> EconomyResult<BalanceChange> {
        Self::reject_zero(request.amount)?;
        let tunables = self.tunables();
        let ledger = Ledger::load(&tunables)?;
        let lock_settings = LockSettings::load(&tunables)?;

        let _guard = AdvisoryGuard::acquire(self.locks.as_ref(), request.player, lock_settings, request.deadline)?;
        let mut tx = self.store.begin(lock_settings.wait, request.deadline);
        Self::lock_for(&mut tx, request)?;

        let change = ledger.consume(&mut tx, request.player, request.kind, request.amount)?;
        tx.stage(
            JournalDraft::new(request.player, JournalKind::Consume)
                .with_delta(request.kind, change.delta())
                .with_context(json!({ "reason": request.reason })),
        );
        let entries = tx.commit()?;

        debug!(
            player = request.player.0,
            kind = request.kind.as_str(),
            amount = request.amount,
            new = change.new,
            "currency consumed"
        );
        self.events.publish(
            request.player,
            entries.iter().map(|e| e.id).collect(),
            OutcomePayload::CurrencyConsumed {
                kind: request.kind,
                amount: request.amount,
            },
        );
        Ok(change)
    }

    /// Moves currency between two players.
    ///
    /// # Errors
    ///
    /// As [`Self::transfer_currency_before`].
    pub fn transfer_currency(
        &self,
        from: PlayerId,
        to: PlayerId,
        kind: CurrencyKind,
        amount: u64,
    ) -> EconomyResult<(BalanceChange, BalanceChange)> {
        self.transfer_currency_before(from, to, kind, amount, None)
    }

    /// Moves currency between two players, giving up at `deadline`.
    ///
    /// Advisory and row locks are both taken in ascending id order, so
    /// opposite transfers cannot deadlock. The credit is clipped to the
    /// recipient's cap like any grant.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for self-transfers or zero amounts,
    /// `InsufficientResources`, lock and deadline errors.
    pub fn transfer_currency_before(
        &self,
        from: PlayerId,
        to: PlayerId,
        kind: CurrencyKind,
        amount: u64,
        deadline: Option<Instant>,
    ) -> EconomyResult<(BalanceChange, BalanceChange)> {
        Self::reject_zero(amount)?;
        if from == to {
            return Err(EconomyError::invalid("cannot transfer to the same player"));
        }
        let tunables = self.tunables();
        let ledger = Ledger::load(&tunables)?;
        let lock_settings = LockSettings::load(&tunables)?;

        let _guards = AdvisoryGuard::acquire_ordered(self.locks.as_ref(), &[from, to], lock_settings, deadline)?;
        let mut tx = self.store.begin(lock_settings.wait, deadline);
        tx.lock_players(&[from, to])?;

        let (debit, credit) = ledger.transfer(&mut tx, from, to, kind, amount)?;
        let context = json!({ "from": from.0, "to": to.0, "amount": amount, "clipped": credit.clipped });
        tx.stage(
            JournalDraft::new(from, JournalKind::Transfer)
                .with_delta(kind, debit.delta())
                .with_context(context.clone()),
        );
        tx.stage(
            JournalDraft::new(to, JournalKind::Transfer)
                .with_delta(kind, credit.delta())
                .with_context(context),
        );
        let entries = tx.commit()?;

        debug!(from = from.0, to = to.0, kind = kind.as_str(), amount, "currency transferred");
        let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
        for player in [from, to] {
            self.events.publish(
                player,
                ids.clone(),
                OutcomePayload::Transfer { from, to, kind, amount },
            );
        }
        Ok((debit, credit))
    }

    // ------------------------------------------------------------------------
    // Collectibles
    // ------------------------------------------------------------------------

    /// Adds copies of a catalogue item at `tier`. Journaled as a grant.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for unknown items, a tier outside
    /// `1..=fusion.max_tier` or zero quantity; lock errors.
    pub fn grant_collectible(
        &self,
        player: PlayerId,
        base_id: ItemId,
        tier: Tier,
        quantity: u32,
    ) -> EconomyResult<StackId> {
        Self::reject_zero(u64::from(quantity))?;
        let tunables = self.tunables();
        let max_tier = FusionSettings::load(&tunables)?.max_tier;
        if tier == 0 || tier > max_tier {
            return Err(EconomyError::invalid(format!(
                "tier {tier} is outside 1..={max_tier}"
            )));
        }
        let element = self
            .catalog
            .get(base_id)
            .map(|item| item.element)
            .ok_or_else(|| EconomyError::invalid(format!("unknown item {base_id}")))?;
        let lock_settings = LockSettings::load(&tunables)?;

        let _guard = AdvisoryGuard::acquire(self.locks.as_ref(), player, lock_settings, None)?;
        let mut tx = self.store.begin(lock_settings.wait, None);
        if tx.lock_player(player)?.archived {
            return Err(EconomyError::invalid(format!("{player} is archived")));
        }
        let stack = tx.add_to_stack(player, base_id, tier, element, quantity)?;
        tx.stage(
            JournalDraft::new(player, JournalKind::Grant).with_context(json!({
                "reason": "collectible",
                "base_id": base_id,
                "tier": tier,
                "quantity": quantity,
                "stack": stack.0,
            })),
        );
        let entries = tx.commit()?;

        self.events.publish(
            player,
            entries.iter().map(|e| e.id).collect(),
            OutcomePayload::CollectibleGranted {
                base_id,
                tier,
                quantity,
            },
        );
        Ok(stack)
    }

    // ------------------------------------------------------------------------
    // Fusion and summons
    // ------------------------------------------------------------------------

    /// Fuses copies from `source` into the next tier.
    ///
    /// # Errors
    ///
    /// See [`FusionOrchestrator::attempt`].
    pub fn attempt_fusion(&self, player: PlayerId, source: StackId) -> EconomyResult<FusionResult> {
        self.attempt_fusion_before(player, source, None)
    }

    /// [`Self::attempt_fusion`] with a deadline.
    ///
    /// # Errors
    ///
    /// See [`FusionOrchestrator::attempt`].
    pub fn attempt_fusion_before(
        &self,
        player: PlayerId,
        source: StackId,
        deadline: Option<Instant>,
    ) -> EconomyResult<FusionResult> {
        FusionOrchestrator::new(self.config.as_ref(), self.locks.as_ref(), &self.store, &self.rng)
            .attempt_then(player, source, deadline, |result| {
                self.events.publish(
                    player,
                    vec![result.entry_id],
                    OutcomePayload::Fusion {
                        source,
                        tier: result.tier,
                        success: result.success,
                        shards_awarded: result.shards_awarded,
                    },
                );
            })
    }

    /// Performs a summon batch.
    ///
    /// # Errors
    ///
    /// See [`SummonOrchestrator::perform`].
    pub fn perform_summon(&self, player: PlayerId, count: u32) -> EconomyResult<SummonResult> {
        self.perform_summon_before(player, count, None)
    }

    /// [`Self::perform_summon`] with a deadline.
    ///
    /// # Errors
    ///
    /// See [`SummonOrchestrator::perform`].
    pub fn perform_summon_before(
        &self,
        player: PlayerId,
        count: u32,
        deadline: Option<Instant>,
    ) -> EconomyResult<SummonResult> {
        SummonOrchestrator::new(
            self.config.as_ref(),
            self.locks.as_ref(),
            &self.store,
            &self.catalog,
            &self.rng,
        )
        .perform_then(player, count, deadline, |result| {
            self.events.publish(
                player,
                result.entry_ids.clone(),
                OutcomePayload::Summon {
                    items: result.items.iter().map(|item| item.base_id).collect(),
                    pity_triggered: result.pity_triggered,
                },
            );
        })
    }

    // ------------------------------------------------------------------------
    // Journal and events
    // ------------------------------------------------------------------------

    /// The transaction journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<TransactionJournal> {
        self.store.journal()
    }

    /// Drops journal entries older than the configured retention window.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a malformed window, `Storage` on file errors.
    pub fn purge_journal(&self, now: SystemTime) -> EconomyResult<usize> {
        let settings = JournalSettings::load(&self.tunables())?;
        let purged = self.journal().purge_expired(now, settings.retention)?;
        info!(purged, retention_secs = settings.retention.as_secs(), "journal purged");
        Ok(purged)
    }

    /// Subscribes to committed outcomes.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// The event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The item catalogue.
    #[must_use]
    pub fn catalog(&self) -> &ItemCatalog {
        &self.catalog
    }

    /// Registered players.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.store.player_count()
    }
}
