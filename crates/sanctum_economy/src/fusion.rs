//! # Fusion
//!
//! Consumes copies of one stack to try for a copy at the next tier.
//!
//! ```text
//! validate ─► advisory lock ─► begin ─► row locks (player, stack)
//!          ─► consume cost ─► roll ─► apply success | apply failure
//!          ─► journal ─► commit ─► release
//! ```
//!
//! Validation runs before any lock is taken. From the first lock on, any
//! error drops the transaction (rolling it back) and the guard (releasing
//! the advisory lock) before it reaches the caller.

use std::time::Instant;

use serde_json::json;
use tracing::{debug, info};

use crate::account::{PlayerId, StackId, Tier};
use crate::config::{ConfigProvider, Tunables};
use crate::currency::CurrencyKind;
use crate::error::{EconomyError, EconomyResult};
use crate::journal::{EntryId, JournalDraft, JournalKind};
use crate::ledger::Ledger;
use crate::lock::{AdvisoryGuard, LockCoordinator, LockSettings};
use crate::outcome::{FusionSettings, OutcomeResolver};
use crate::rng::RngFactory;
use crate::store::Store;

/// Currency fusion is paid in.
pub const FUSION_CURRENCY: CurrencyKind = CurrencyKind::Lumees;

/// Result of one fusion attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FusionResult {
    /// Player who fused.
    pub player: PlayerId,
    /// Stack the copies came from.
    pub source: StackId,
    /// Tier of the source copies.
    pub tier: Tier,
    /// Whether a next-tier copy was produced.
    pub success: bool,
    /// Tier produced on success.
    pub new_tier: Option<Tier>,
    /// Stack that received the new copy.
    pub result_stack: Option<StackId>,
    /// Shards granted on failure.
    pub shards_awarded: u64,
    /// Shards spent by the guarantee.
    pub shards_spent: u64,
    /// Success forced by the shard guarantee.
    pub guaranteed: bool,
    /// Shards held for this tier afterwards.
    pub shards_after: u64,
    /// Currency consumed.
    pub cost: u64,
    /// Journal entry recording the attempt.
    pub entry_id: EntryId,
}

/// Runs fusion attempts against shared engine state.
pub struct FusionOrchestrator<'a> {
    config: &'a dyn ConfigProvider,
    locks: &'a dyn LockCoordinator,
    store: &'a Store,
    rng: &'a RngFactory,
}

impl<'a> FusionOrchestrator<'a> {
    /// Binds the collaborators.
    #[must_use]
    pub fn new(
        config: &'a dyn ConfigProvider,
        locks: &'a dyn LockCoordinator,
        store: &'a Store,
        rng: &'a RngFactory,
    ) -> Self {
        Self {
            config,
            locks,
            store,
            rng,
        }
    }

    /// Attempts one fusion of `source`, owned by `player`.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation`: unknown, foreign or max-tier stack, archived
    ///   player.
    /// - `InsufficientResources`: too few copies or too little currency.
    /// - `ConfigurationMissing`/`InvalidConfig`: fusion tunables.
    /// - `LockTimeout`/`DeadlineExceeded`: contention or caller deadline.
    pub fn attempt(
        &self,
        player: PlayerId,
        source: StackId,
        deadline: Option<Instant>,
    ) -> EconomyResult<FusionResult> {
        self.attempt_then(player, source, deadline, |_| {})
    }

    /// [`Self::attempt`], running `on_commit` after the commit while the
    /// player's advisory lock is still held.
    ///
    /// # Errors
    ///
    /// See [`Self::attempt`]. `on_commit` only runs on success.
    pub fn attempt_then(
        &self,
        player: PlayerId,
        source: StackId,
        deadline: Option<Instant>,
        on_commit: impl FnOnce(&FusionResult),
    ) -> EconomyResult<FusionResult> {
        // ---------------------------------------------------------------------
        // Validate (no locks)
        // ---------------------------------------------------------------------
        let tunables = Tunables::new(self.config);
        let settings = FusionSettings::load(&tunables)?;
        let lock_settings = LockSettings::load(&tunables)?;
        let ledger = Ledger::load(&tunables)?;

        let preview = self
            .store
            .stack(source)
            .ok_or_else(|| EconomyError::invalid(format!("unknown or empty {source}")))?;
        Self::validate(&settings, player, preview.owner, preview.tier, preview.quantity, source)?;
        OutcomeResolver::fusion_success_bp(&settings, preview.tier)?;

        // ---------------------------------------------------------------------
        // Lock and re-read
        // ---------------------------------------------------------------------
        let _guard = AdvisoryGuard::acquire(self.locks, player, lock_settings, deadline)?;
        let mut tx = self.store.begin(lock_settings.wait, deadline);
        tx.lock_player(player)?;
        let stack = tx.lock_stack(source)?.clone();
        Self::validate(&settings, player, stack.owner, stack.tier, stack.quantity, source)?;
        let tier = stack.tier;

        // ---------------------------------------------------------------------
        // Pay, roll, apply
        // ---------------------------------------------------------------------
        let cost = OutcomeResolver::fusion_cost(&settings, tier);
        let payment = ledger.consume(&mut tx, player, FUSION_CURRENCY, cost)?;

        let shards_held = tx.player(player)?.shards(tier);
        let mut rng = (self.rng)();
        let roll = OutcomeResolver::roll_fusion(&settings, tier, shards_held, rng.as_mut())?;

        tx.stack_mut(source)?.quantity -= settings.required_count;

        let result_stack = if roll.success {
            let next = tier + 1;
            Some(tx.add_to_stack(player, stack.base_id, next, stack.element, 1)?)
        } else {
            None
        };

        let account = tx.player_mut(player)?;
        let shards = account.fusion_shards.entry(tier).or_insert(0);
        *shards = shards
            .saturating_sub(roll.shards_spent)
            .saturating_add(roll.shards_awarded);
        let shards_after = *shards;
        account.counters.fusions_attempted += 1;
        if roll.success {
            account.counters.fusions_succeeded += 1;
        }

        tx.stage(
            JournalDraft::new(player, JournalKind::FusionAttempt)
                .with_delta(FUSION_CURRENCY, payment.delta())
                .with_context(json!({
                    "source_stack": source.0,
                    "base_id": stack.base_id,
                    "tier": tier,
                    "success": roll.success,
                    "guaranteed": roll.guaranteed,
                    "roll_bp": roll.roll_bp,
                    "rate_bp": roll.rate_bp,
                    "shards_awarded": roll.shards_awarded,
                    "shards_spent": roll.shards_spent,
                    "result_stack": result_stack.map(|id| id.0),
                })),
        );

        // ---------------------------------------------------------------------
        // Commit
        // ---------------------------------------------------------------------
        let entries = tx.commit()?;
        let entry_id = entries
            .first()
            .map(|e| e.id)
            .ok_or_else(|| EconomyError::Storage("fusion commit produced no journal entry".into()))?;

        info!(
            player = player.0,
            tier,
            success = roll.success,
            guaranteed = roll.guaranteed,
            cost,
            entry_id = entry_id.0,
            "fusion committed"
        );

        let result = FusionResult {
            player,
            source,
            tier,
            success: roll.success,
            new_tier: roll.success.then_some(tier + 1),
            result_stack,
            shards_awarded: roll.shards_awarded,
            shards_spent: roll.shards_spent,
            guaranteed: roll.guaranteed,
            shards_after,
            cost,
            entry_id,
        };
        on_commit(&result);
        Ok(result)
    }

    fn validate(
        settings: &FusionSettings,
        player: PlayerId,
        owner: PlayerId,
        tier: Tier,
        quantity: u32,
        source: StackId,
    ) -> EconomyResult<()> {
        if owner != player {
            return Err(EconomyError::invalid(format!("{source} is not owned by {player}")));
        }
        if tier >= settings.max_tier {
            return Err(EconomyError::invalid(format!(
                "tier {tier} is the highest tier and cannot be fused"
            )));
        }
        if quantity < settings.required_count {
            debug!(player = player.0, %source, quantity, "fusion rejected: not enough copies");
            return Err(EconomyError::insufficient(
                format!("copies in {source}"),
                u64::from(settings.required_count),
                u64::from(quantity),
            ));
        }
        Ok(())
    }
}
