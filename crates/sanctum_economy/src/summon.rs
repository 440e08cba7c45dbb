//! # Summons
//!
//! Batch summons: one up-front payment, then one weighted roll per unit.
//!
//! The whole batch is paid for before any roll. The class cost modifier is
//! applied once to `cost × count`, and if the player cannot afford the full
//! batch nothing is rolled. Units resolve sequentially so that an item
//! produced by one unit counts as owned for the next, and the pity counter
//! carries from unit to unit.

use std::time::Instant;

use serde_json::json;
use tracing::info;

use crate::account::{ItemId, PlayerId, StackId, Tier};
use crate::catalog::ItemCatalog;
use crate::config::{ConfigProvider, Tunables};
use crate::error::{EconomyError, EconomyResult};
use crate::journal::{EntryId, JournalDraft, JournalKind, JournalSettings, SummonGranularity};
use crate::ledger::Ledger;
use crate::lock::{AdvisoryGuard, LockCoordinator, LockSettings};
use crate::outcome::{OutcomeResolver, SummonSettings};
use crate::rng::RngFactory;
use crate::store::Store;

/// One unit of a summon batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SummonedItem {
    /// Item produced.
    pub base_id: ItemId,
    /// Tier produced.
    pub tier: Tier,
    /// Stack that received it.
    pub stack: StackId,
    /// The player did not own this item before.
    pub was_new: bool,
    /// Forced by pity.
    pub pity_triggered: bool,
}

/// Result of one summon batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummonResult {
    /// Player who summoned.
    pub player: PlayerId,
    /// Units in order.
    pub items: Vec<SummonedItem>,
    /// Any unit was forced by pity.
    pub pity_triggered: bool,
    /// Pity counter after the batch.
    pub pity_counter: u32,
    /// Currency paid for the batch.
    pub cost: u64,
    /// Journal entries recording the batch.
    pub entry_ids: Vec<EntryId>,
}

/// Runs summon batches against shared engine state.
pub struct SummonOrchestrator<'a> {
    config: &'a dyn ConfigProvider,
    locks: &'a dyn LockCoordinator,
    store: &'a Store,
    catalog: &'a ItemCatalog,
    rng: &'a RngFactory,
}

impl<'a> SummonOrchestrator<'a> {
    /// Binds the collaborators.
    #[must_use]
    pub fn new(
        config: &'a dyn ConfigProvider,
        locks: &'a dyn LockCoordinator,
        store: &'a Store,
        catalog: &'a ItemCatalog,
        rng: &'a RngFactory,
    ) -> Self {
        Self {
            config,
            locks,
            store,
            catalog,
            rng,
        }
    }

    /// Performs `count` summons for `player`.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation`: count outside `1..=max_batch`, no unlocked
    ///   tier, archived player.
    /// - `InsufficientResources`: the batch cannot be paid in full.
    /// - `ConfigurationMissing`/`InvalidConfig`: summon tunables.
    /// - `LockTimeout`/`DeadlineExceeded`: contention or caller deadline.
    pub fn perform(
        &self,
        player: PlayerId,
        count: u32,
        deadline: Option<Instant>,
    ) -> EconomyResult<SummonResult> {
        self.perform_then(player, count, deadline, |_| {})
    }

    /// [`Self::perform`], running `on_commit` after the commit while the
    /// player's advisory lock is still held.
    ///
    /// # Errors
    ///
    /// See [`Self::perform`]. `on_commit` only runs on success.
    pub fn perform_then(
        &self,
        player: PlayerId,
        count: u32,
        deadline: Option<Instant>,
        on_commit: impl FnOnce(&SummonResult),
    ) -> EconomyResult<SummonResult> {
        let tunables = Tunables::new(self.config);
        let preview = self.store.account(player)?;
        let mut settings = SummonSettings::load(&tunables, preview.class)?;
        let lock_settings = LockSettings::load(&tunables)?;
        let journal_settings = JournalSettings::load(&tunables)?;
        let ledger = Ledger::load(&tunables)?;

        if count == 0 || count > settings.max_batch {
            return Err(EconomyError::invalid(format!(
                "summon count must be between 1 and {}, got {count}",
                settings.max_batch
            )));
        }
        if OutcomeResolver::unlocked_tiers(&settings, preview.level, self.catalog).is_empty() {
            return Err(EconomyError::invalid(format!(
                "{player} has no summonable tier at level {}",
                preview.level
            )));
        }

        let _guard = AdvisoryGuard::acquire(self.locks, player, lock_settings, deadline)?;
        let mut tx = self.store.begin(lock_settings.wait, deadline);
        let account = tx.lock_player(player)?.clone();
        if account.class != preview.class {
            settings = SummonSettings::load(&tunables, account.class)?;
        }
        let unlocked = OutcomeResolver::unlocked_tiers(&settings, account.level, self.catalog);

        let cost = settings
            .cost
            .checked_mul(u64::from(count))
            .and_then(|total| settings.class_cost_factor.mul_floor(total))
            .ok_or(EconomyError::ArithmeticOverflow)?;
        let payment = ledger.consume(&mut tx, player, settings.currency, cost)?;

        let mut rng = (self.rng)();
        let mut owned = tx.owned_base_items(player)?;
        let mut counter = account.pity_counter;
        let mut items = Vec::with_capacity(usize::try_from(count).unwrap_or_default());

        for _ in 0..count {
            let roll = OutcomeResolver::roll_summon(
                &settings,
                self.catalog,
                &unlocked,
                &owned,
                counter,
                rng.as_mut(),
            )?;
            let element = self
                .catalog
                .get(roll.base_id)
                .map(|item| item.element)
                .ok_or_else(|| EconomyError::invalid(format!("item {} left the catalogue", roll.base_id)))?;
            let stack = tx.add_to_stack(player, roll.base_id, roll.tier, element, 1)?;
            owned.insert(roll.base_id);
            counter = roll.next_pity_counter;
            items.push(SummonedItem {
                base_id: roll.base_id,
                tier: roll.tier,
                stack,
                was_new: roll.was_new,
                pity_triggered: roll.pity_triggered,
            });
        }

        let row = tx.player_mut(player)?;
        row.pity_counter = counter;
        row.counters.summons_performed += u64::from(count);

        let unit_context = |item: &SummonedItem| {
            json!({
                "base_id": item.base_id,
                "tier": item.tier,
                "stack": item.stack.0,
                "was_new": item.was_new,
                "pity": item.pity_triggered,
            })
        };
        match journal_settings.summon_granularity {
            SummonGranularity::Batch => {
                tx.stage(
                    JournalDraft::new(player, JournalKind::SummonAttempt)
                        .with_delta(settings.currency, payment.delta())
                        .with_context(json!({
                            "count": count,
                            "cost": cost,
                            "pity_counter": counter,
                            "items": items.iter().map(unit_context).collect::<Vec<_>>(),
                        })),
                );
            }
            SummonGranularity::Unit => {
                for (index, item) in items.iter().enumerate() {
                    let mut draft = JournalDraft::new(player, JournalKind::SummonAttempt)
                        .with_context(json!({
                            "unit": index,
                            "count": count,
                            "item": unit_context(item),
                        }));
                    if index == 0 {
                        draft = draft.with_delta(settings.currency, payment.delta());
                    }
                    tx.stage(draft);
                }
            }
        }

        let entries = tx.commit()?;
        let pity_triggered = items.iter().any(|item| item.pity_triggered);

        info!(
            player = player.0,
            count,
            cost,
            pity = pity_triggered,
            pity_counter = counter,
            "summon committed"
        );

        let result = SummonResult {
            player,
            items,
            pity_triggered,
            pity_counter: counter,
            cost,
            entry_ids: entries.iter().map(|e| e.id).collect(),
        };
        on_commit(&result);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{PlayerAccount, PlayerClass};
    use crate::config::{ConfigValue, StaticConfig};
    use crate::currency::{Balances, CurrencyKind};
    use crate::journal::TransactionJournal;
    use crate::lock::InMemoryLockCoordinator;
    use crate::rng::{RandomSource, SeededRandom, SequenceRandom};
    use std::sync::Arc;

    struct Fixture {
        config: StaticConfig,
        locks: InMemoryLockCoordinator,
        store: Store,
        catalog: ItemCatalog,
        rng: RngFactory,
    }

    fn fixture(class: PlayerClass, grace: u64) -> Fixture {
        let store = Store::new(Arc::new(TransactionJournal::in_memory()));
        store
            .register(
                PlayerAccount::new(
                    PlayerId(1),
                    class,
                    Balances::zero().with(CurrencyKind::Grace, grace),
                ),
                None,
            )
            .unwrap();
        Fixture {
            config: StaticConfig::game_defaults(),
            locks: InMemoryLockCoordinator::new(),
            store,
            catalog: ItemCatalog::standard(),
            rng: Arc::new(|| Box::new(SeededRandom::new(42)) as Box<dyn RandomSource>),
        }
    }

    fn perform(fx: &Fixture, count: u32) -> EconomyResult<SummonResult> {
        SummonOrchestrator::new(&fx.config, &fx.locks, &fx.store, &fx.catalog, &fx.rng)
            .perform(PlayerId(1), count, None)
    }

    #[test]
    fn test_batch_pays_once_and_lands_items() {
        let fx = fixture(PlayerClass::Wanderer, 5000);
        let result = perform(&fx, 10).unwrap();

        assert_eq!(result.items.len(), 10);
        assert_eq!(result.cost, 2500);
        let account = fx.store.account(PlayerId(1)).unwrap();
        assert_eq!(account.balances[CurrencyKind::Grace], 2500);
        assert_eq!(account.counters.summons_performed, 10);

        let copies: u32 = fx.store.stacks_of(PlayerId(1)).iter().map(|s| s.quantity).sum();
        assert_eq!(copies, 10);
        // Level 1 unlocks tiers 1 and 2 only.
        assert!(result.items.iter().all(|item| item.tier <= 2));
        assert_eq!(result.entry_ids.len(), 1);
    }

    #[test]
    fn test_class_modifier_applies_to_total() {
        let fx = fixture(PlayerClass::Oracle, 5000);
        let result = perform(&fx, 5).unwrap();
        // 250 × 5 × 0.9
        assert_eq!(result.cost, 1125);
    }

    #[test]
    fn test_unaffordable_batch_rejected_whole() {
        let fx = fixture(PlayerClass::Wanderer, 2499);
        let err = perform(&fx, 10).unwrap_err();
        assert_eq!(err, EconomyError::insufficient("grace", 2500, 2499));
        assert!(fx.store.stacks_of(PlayerId(1)).is_empty());
        assert!(fx.store.journal().is_empty());
    }

    #[test]
    fn test_batch_limits() {
        let fx = fixture(PlayerClass::Wanderer, 100_000);
        assert!(matches!(perform(&fx, 0), Err(EconomyError::InvalidOperation(_))));
        assert!(matches!(perform(&fx, 11), Err(EconomyError::InvalidOperation(_))));
    }

    #[test]
    fn test_unit_granularity_journals_each_unit() {
        let fx = fixture(PlayerClass::Wanderer, 5000);
        fx.config
            .set("journal.summon_granularity", ConfigValue::Text("unit".into()));
        let result = perform(&fx, 5).unwrap();
        assert_eq!(result.entry_ids.len(), 5);

        let net = fx.store.journal().net_deltas(PlayerId(1));
        assert_eq!(net.get(&CurrencyKind::Grace), Some(&-1250));
    }

    #[test]
    fn test_pity_counter_carries_across_batches() {
        let mut fx = fixture(PlayerClass::Wanderer, 900_000);
        // Every draw lands on the same item: one new copy, then duplicates.
        fx.rng = Arc::new(|| Box::new(SequenceRandom::new([0])) as Box<dyn RandomSource>);

        let first = perform(&fx, 10).unwrap();
        assert_eq!(first.pity_counter, 9);
        assert_eq!(first.items.iter().filter(|item| item.was_new).count(), 1);

        let second = perform(&fx, 10).unwrap();
        assert_eq!(second.pity_counter, 19);
        assert!(second.items.iter().all(|item| !item.was_new && !item.pity_triggered));

        let account = fx.store.account(PlayerId(1)).unwrap();
        assert_eq!(account.pity_counter, 19);
        assert_eq!(account.counters.summons_performed, 20);
        let stacks = fx.store.stacks_of(PlayerId(1));
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].quantity, 20);
    }
}
