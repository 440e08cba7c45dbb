//! # Outcome Resolution
//!
//! Cost curves and chance rolls for fusion and summons.
//!
//! Everything here is pure given its inputs: settings are loaded per
//! operation from config, and randomness comes from an injected
//! [`RandomSource`], so unit tests can script every roll.
//!
//! ## Fusion
//!
//! ```text
//! cost(tier)    = min(base × multiplier^(tier−1), cap)
//! success       = roll < rate(tier)           roll ∈ [0, 10000) basis points
//! on failure    = shards += uniform[min, max]
//! guarantee     = shards(tier) ≥ threshold ⇒ forced success, spend threshold
//! ```
//!
//! ## Summons
//!
//! For unlocked tiers sorted from the top, the raw weight of the i-th tier
//! is `top_rate × decay^i`; weights are normalised so they always sum to 1.
//!
//! Pity: a counter counts summons that did not yield an unowned item. Once
//! it reaches the threshold, the next summon is restricted to tiers that
//! still hold unowned items and yields one of them.

use std::collections::{BTreeMap, BTreeSet};

use crate::account::{ItemId, PlayerClass, Tier};
use crate::catalog::ItemCatalog;
use crate::config::Tunables;
use crate::currency::CurrencyKind;
use crate::error::{EconomyError, EconomyResult};
use crate::fixed_point::FixedPoint;
use crate::rng::RandomSource;

/// Basis points in 100%.
pub const BASIS_POINTS: u32 = 10_000;

// =============================================================================
// Settings
// =============================================================================

/// Fusion tunables for one operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FusionSettings {
    /// Cost at tier 1.
    pub cost_base: u64,
    /// Per-tier cost multiplier.
    pub cost_multiplier: FixedPoint,
    /// Cost ceiling.
    pub cost_cap: u64,
    /// Success chance per tier, in basis points.
    pub success_bp: BTreeMap<Tier, u32>,
    /// Fewest shards granted on failure.
    pub shards_min: u64,
    /// Most shards granted on failure.
    pub shards_max: u64,
    /// Shards that force a success.
    pub shard_guarantee: u64,
    /// Copies consumed per attempt.
    pub required_count: u32,
    /// Highest tier that exists; it cannot be fused further.
    pub max_tier: Tier,
}

impl FusionSettings {
    /// Reads the `fusion.*` keys.
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` for absent cost, rate or shard keys;
    /// `InvalidConfig` if values are inconsistent.
    pub fn load(tunables: &Tunables<'_>) -> EconomyResult<Self> {
        let percent = tunables.tier_table_decimal("fusion.success_rate")?;
        let mut success_bp = BTreeMap::new();
        for (tier, p) in percent {
            let bp = p.raw() / 10_000;
            let bp = u32::try_from(bp)
                .ok()
                .filter(|bp| *bp <= BASIS_POINTS)
                .ok_or_else(|| {
                    EconomyError::InvalidConfig(format!("fusion.success_rate.{tier}: {p}% exceeds 100%"))
                })?;
            success_bp.insert(tier, bp);
        }

        let max_tier = Tier::try_from(tunables.unsigned_or("fusion.max_tier", 12)?)
            .map_err(|_| EconomyError::InvalidConfig("fusion.max_tier out of range".into()))?;
        let required_count = u32::try_from(tunables.unsigned_or("fusion.required_count", 2)?)
            .map_err(|_| EconomyError::InvalidConfig("fusion.required_count out of range".into()))?;

        let settings = Self {
            cost_base: tunables.unsigned("fusion.cost.base")?,
            cost_multiplier: tunables.decimal("fusion.cost.multiplier")?,
            cost_cap: tunables.unsigned("fusion.cost.cap")?,
            success_bp,
            shards_min: tunables.unsigned("fusion.shards.min")?,
            shards_max: tunables.unsigned("fusion.shards.max")?,
            shard_guarantee: tunables.unsigned("fusion.shards.guarantee")?,
            required_count,
            max_tier,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> EconomyResult<()> {
        let invalid = |msg: &str| Err(EconomyError::InvalidConfig(msg.to_string()));
        if self.cost_multiplier < FixedPoint::ONE {
            return invalid("fusion.cost.multiplier must be at least 1");
        }
        if self.shards_min > self.shards_max {
            return invalid("fusion.shards.min exceeds fusion.shards.max");
        }
        if self.shard_guarantee == 0 {
            return invalid("fusion.shards.guarantee must be positive");
        }
        if self.required_count == 0 {
            return invalid("fusion.required_count must be positive");
        }
        if self.max_tier < 2 {
            return invalid("fusion.max_tier must be at least 2");
        }
        let rates: Vec<u32> = self.success_bp.values().copied().collect();
        if rates.windows(2).any(|w| w[1] > w[0]) {
            return invalid("fusion.success_rate must not increase with tier");
        }
        Ok(())
    }
}

/// Summon tunables for one operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummonSettings {
    /// Weight decay per tier below the top.
    pub decay: FixedPoint,
    /// Raw weight of the highest unlocked tier.
    pub top_rate: FixedPoint,
    /// Player level needed per tier.
    pub unlock_levels: BTreeMap<Tier, u64>,
    /// Summons without a new item before pity triggers.
    pub pity_threshold: u32,
    /// Cost of one unit.
    pub cost: u64,
    /// Largest batch.
    pub max_batch: u32,
    /// Currency summons are paid in.
    pub currency: CurrencyKind,
    /// Cost factor for the caller's class.
    pub class_cost_factor: FixedPoint,
}

impl SummonSettings {
    /// Reads the `summon.*` keys and the class cost modifier.
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` for absent rate, pity or cost keys;
    /// `InvalidConfig` if values are inconsistent.
    pub fn load(tunables: &Tunables<'_>, class: PlayerClass) -> EconomyResult<Self> {
        let currency = match tunables.text_or("summon.currency", "grace")?.as_str() {
            "lumees" => CurrencyKind::Lumees,
            "grace" => CurrencyKind::Grace,
            "gems" => CurrencyKind::Gems,
            other => {
                return Err(EconomyError::InvalidConfig(format!(
                    "summon.currency: unknown currency '{other}'"
                )))
            }
        };
        let pity_threshold = u32::try_from(tunables.unsigned("summon.pity_threshold")?)
            .map_err(|_| EconomyError::InvalidConfig("summon.pity_threshold out of range".into()))?;
        let max_batch = u32::try_from(tunables.unsigned_or("summon.max_batch", 10)?)
            .map_err(|_| EconomyError::InvalidConfig("summon.max_batch out of range".into()))?;

        let settings = Self {
            decay: tunables.decimal("summon.decay")?,
            top_rate: tunables.decimal("summon.top_rate")?,
            unlock_levels: tunables.tier_table_unsigned("summon.unlock_levels")?,
            pity_threshold,
            cost: tunables.unsigned("summon.cost")?,
            max_batch,
            currency,
            class_cost_factor: tunables.summon_cost_modifier(class)?,
        };

        if settings.decay.is_zero() || settings.top_rate.is_zero() {
            return Err(EconomyError::InvalidConfig(
                "summon.decay and summon.top_rate must be positive".into(),
            ));
        }
        if settings.pity_threshold == 0 || settings.max_batch == 0 {
            return Err(EconomyError::InvalidConfig(
                "summon.pity_threshold and summon.max_batch must be positive".into(),
            ));
        }
        Ok(settings)
    }
}

// =============================================================================
// Results
// =============================================================================

/// A resolved fusion roll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FusionRoll {
    /// Whether the next tier is produced.
    pub success: bool,
    /// Success forced by the shard guarantee.
    pub guaranteed: bool,
    /// Roll in basis points, `None` when guaranteed.
    pub roll_bp: Option<u32>,
    /// Chance used, in basis points.
    pub rate_bp: u32,
    /// Shards granted (failure only).
    pub shards_awarded: u64,
    /// Shards spent by the guarantee.
    pub shards_spent: u64,
}

/// A resolved summon unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SummonRoll {
    /// Item produced.
    pub base_id: ItemId,
    /// Tier produced.
    pub tier: Tier,
    /// The player did not own this item before.
    pub was_new: bool,
    /// Forced by pity.
    pub pity_triggered: bool,
    /// Pity counter after this unit.
    pub next_pity_counter: u32,
}

// =============================================================================
// Resolver
// =============================================================================

/// Pure outcome math.
pub struct OutcomeResolver;

impl OutcomeResolver {
    /// `min(base × multiplier^(tier−1), cap)`, saturating.
    #[must_use]
    pub fn fusion_cost(settings: &FusionSettings, tier: Tier) -> u64 {
        let exp = u32::from(tier.saturating_sub(1));
        settings
            .cost_multiplier
            .saturating_pow(exp)
            .mul_floor(settings.cost_base)
            .map_or(settings.cost_cap, |cost| cost.min(settings.cost_cap))
    }

    /// Success chance for a tier, in basis points.
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` if the tier has no rate. A missing rate is
    /// never read as 100%.
    pub fn fusion_success_bp(settings: &FusionSettings, tier: Tier) -> EconomyResult<u32> {
        settings
            .success_bp
            .get(&tier)
            .copied()
            .ok_or_else(|| EconomyError::ConfigurationMissing(format!("fusion.success_rate.{tier}")))
    }

    /// Resolves one fusion attempt given the shards already held for the tier.
    ///
    /// # Errors
    ///
    /// As [`Self::fusion_success_bp`].
    pub fn roll_fusion(
        settings: &FusionSettings,
        tier: Tier,
        shards_held: u64,
        rng: &mut dyn RandomSource,
    ) -> EconomyResult<FusionRoll> {
        let rate_bp = Self::fusion_success_bp(settings, tier)?;

        if shards_held >= settings.shard_guarantee {
            return Ok(FusionRoll {
                success: true,
                guaranteed: true,
                roll_bp: None,
                rate_bp,
                shards_awarded: 0,
                shards_spent: settings.shard_guarantee,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let roll = rng.below(u64::from(BASIS_POINTS)) as u32;
        let success = roll < rate_bp;
        let shards_awarded = if success {
            0
        } else {
            rng.range_inclusive(settings.shards_min, settings.shards_max)
        };

        Ok(FusionRoll {
            success,
            guaranteed: false,
            roll_bp: Some(roll),
            rate_bp,
            shards_awarded,
            shards_spent: 0,
        })
    }

    /// Tiers the player may summon: unlocked by level and present in the
    /// catalogue. Ascending.
    #[must_use]
    pub fn unlocked_tiers(settings: &SummonSettings, level: u32, catalog: &ItemCatalog) -> Vec<Tier> {
        let available = catalog.tiers();
        settings
            .unlock_levels
            .iter()
            .filter(|(tier, required)| u64::from(level) >= **required && available.contains(tier))
            .map(|(tier, _)| *tier)
            .collect()
    }

    /// Normalised probability per tier, highest tier first.
    ///
    /// The probabilities sum to 1 for any non-empty input.
    #[must_use]
    pub fn tier_distribution(settings: &SummonSettings, tiers: &[Tier]) -> Vec<(Tier, f64)> {
        let mut ordered = tiers.to_vec();
        ordered.sort_unstable_by(|a, b| b.cmp(a));
        ordered.dedup();

        let top = settings.top_rate.to_f64();
        let decay = settings.decay.to_f64();
        let raw: Vec<(Tier, f64)> = ordered
            .iter()
            .zip(0i32..)
            .map(|(tier, i)| (*tier, top * decay.powi(i)))
            .collect();
        let total: f64 = raw.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return Vec::new();
        }
        raw.into_iter().map(|(tier, w)| (tier, w / total)).collect()
    }

    /// One weighted draw from a distribution.
    #[must_use]
    pub fn draw_tier(distribution: &[(Tier, f64)], rng: &mut dyn RandomSource) -> Option<Tier> {
        let u = rng.unit();
        let mut cumulative = 0.0;
        for (tier, p) in distribution {
            cumulative += p;
            if u < cumulative {
                return Some(*tier);
            }
        }
        // Rounding can leave the cumulative sum a hair below 1.
        distribution.last().map(|(tier, _)| *tier)
    }

    fn pick<'a>(items: &'a [ItemId], rng: &mut dyn RandomSource) -> Option<&'a ItemId> {
        let len = u64::try_from(items.len()).ok()?;
        let index = usize::try_from(rng.below(len)).ok()?;
        items.get(index)
    }

    /// Resolves one summon unit.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if no tier is unlocked.
    pub fn roll_summon(
        settings: &SummonSettings,
        catalog: &ItemCatalog,
        unlocked: &[Tier],
        owned: &BTreeSet<ItemId>,
        pity_counter: u32,
        rng: &mut dyn RandomSource,
    ) -> EconomyResult<SummonRoll> {
        if pity_counter >= settings.pity_threshold {
            let unowned_tiers: Vec<Tier> = unlocked
                .iter()
                .copied()
                .filter(|t| catalog.items_at_tier(*t).iter().any(|id| !owned.contains(id)))
                .collect();

            if !unowned_tiers.is_empty() {
                let distribution = Self::tier_distribution(settings, &unowned_tiers);
                let tier = Self::draw_tier(&distribution, rng)
                    .ok_or_else(|| EconomyError::invalid("no summonable tier"))?;
                let candidates: Vec<ItemId> = catalog
                    .items_at_tier(tier)
                    .iter()
                    .copied()
                    .filter(|id| !owned.contains(id))
                    .collect();
                let base_id = *Self::pick(&candidates, rng)
                    .ok_or_else(|| EconomyError::invalid("no summonable item"))?;
                return Ok(SummonRoll {
                    base_id,
                    tier,
                    was_new: true,
                    pity_triggered: true,
                    next_pity_counter: 0,
                });
            }
        }

        let distribution = Self::tier_distribution(settings, unlocked);
        let tier = Self::draw_tier(&distribution, rng)
            .ok_or_else(|| EconomyError::invalid("no summon tier is unlocked"))?;
        let base_id = *Self::pick(catalog.items_at_tier(tier), rng)
            .ok_or_else(|| EconomyError::invalid("no summonable item"))?;
        let was_new = !owned.contains(&base_id);
        let next_pity_counter = if was_new {
            0
        } else {
            // A complete collection leaves nothing to force; hold at the threshold.
            pity_counter.saturating_add(1).min(settings.pity_threshold)
        };

        Ok(SummonRoll {
            base_id,
            tier,
            was_new,
            pity_triggered: false,
            next_pity_counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use crate::rng::{SeededRandom, SequenceRandom};

    fn fusion_settings() -> FusionSettings {
        let config = StaticConfig::game_defaults();
        FusionSettings::load(&Tunables::new(&config)).unwrap()
    }

    fn summon_settings() -> SummonSettings {
        let config = StaticConfig::game_defaults();
        SummonSettings::load(&Tunables::new(&config), PlayerClass::Wanderer).unwrap()
    }

    #[test]
    fn test_cost_curve() {
        let settings = fusion_settings();
        assert_eq!(OutcomeResolver::fusion_cost(&settings, 1), 1000);
        assert_eq!(OutcomeResolver::fusion_cost(&settings, 2), 2200);
        assert_eq!(OutcomeResolver::fusion_cost(&settings, 3), 4840);

        let mut previous = 0;
        for tier in 1..=u8::MAX {
            let cost = OutcomeResolver::fusion_cost(&settings, tier);
            assert!(cost >= previous, "cost dropped at tier {tier}");
            assert!(cost <= settings.cost_cap);
            previous = cost;
        }
        assert_eq!(previous, settings.cost_cap);
    }

    #[test]
    fn test_missing_rate_is_an_error() {
        let settings = fusion_settings();
        let mut rng = SequenceRandom::new([0]);
        let err = OutcomeResolver::roll_fusion(&settings, 12, 0, &mut rng).unwrap_err();
        assert_eq!(err, EconomyError::ConfigurationMissing("fusion.success_rate.12".into()));
    }

    #[test]
    fn test_missing_cost_key_is_an_error() {
        let config = StaticConfig::game_defaults();
        config.remove("fusion.cost.multiplier");
        assert_eq!(
            FusionSettings::load(&Tunables::new(&config)).unwrap_err(),
            EconomyError::ConfigurationMissing("fusion.cost.multiplier".into())
        );
    }

    #[test]
    fn test_roll_against_rate() {
        let settings = fusion_settings(); // tier 1: 75%
        let mut rng = SequenceRandom::new([7499]);
        assert!(OutcomeResolver::roll_fusion(&settings, 1, 0, &mut rng).unwrap().success);

        let mut rng = SequenceRandom::new([7500, 2]);
        let roll = OutcomeResolver::roll_fusion(&settings, 1, 0, &mut rng).unwrap();
        assert!(!roll.success);
        assert_eq!(roll.shards_awarded, 3); // min 1 + 2 % 3
    }

    #[test]
    fn test_shard_guarantee_forces_success() {
        let settings = fusion_settings();
        // A roll of 9999 would fail at any configured rate.
        let mut rng = SequenceRandom::new([9999]);
        let roll = OutcomeResolver::roll_fusion(&settings, 5, 14, &mut rng).unwrap();
        assert!(roll.success);
        assert!(roll.guaranteed);
        assert_eq!(roll.shards_spent, settings.shard_guarantee);
    }

    #[test]
    fn test_increasing_rates_rejected() {
        let config = StaticConfig::game_defaults();
        let mut table = BTreeMap::new();
        table.insert(1, crate::config::ConfigValue::Integer(50));
        table.insert(2, crate::config::ConfigValue::Integer(60));
        config.set("fusion.success_rate", crate::config::ConfigValue::Table(table));
        assert!(matches!(
            FusionSettings::load(&Tunables::new(&config)),
            Err(EconomyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_distribution_sums_to_one_and_decreases() {
        let settings = summon_settings();
        for n in 1..=6u8 {
            let tiers: Vec<Tier> = (1..=n).collect();
            let dist = OutcomeResolver::tier_distribution(&settings, &tiers);
            let sum: f64 = dist.iter().map(|(_, p)| p).sum();
            assert!((sum - 1.0).abs() < 1e-9, "sum {sum} for {n} tiers");
            // Highest tier first; probability falls as tier falls.
            for pair in dist.windows(2) {
                assert!(pair[0].0 > pair[1].0);
                assert!(pair[0].1 > pair[1].1);
            }
        }
    }

    #[test]
    fn test_unlocked_tiers_follow_level() {
        let settings = summon_settings();
        let catalog = ItemCatalog::standard();
        assert_eq!(OutcomeResolver::unlocked_tiers(&settings, 1, &catalog), vec![1, 2]);
        assert_eq!(OutcomeResolver::unlocked_tiers(&settings, 20, &catalog), vec![1, 2, 3, 4]);
        assert_eq!(OutcomeResolver::unlocked_tiers(&settings, 99, &catalog).len(), 6);
    }

    #[test]
    fn test_pity_forces_unowned() {
        let settings = summon_settings();
        let catalog = ItemCatalog::standard();
        let unlocked = [1, 2];
        // Own everything at tier 2 and all but one item at tier 1.
        let mut owned: BTreeSet<ItemId> = catalog.items_at_tier(2).iter().copied().collect();
        owned.extend(catalog.items_at_tier(1).iter().skip(1).copied());
        let missing = catalog.items_at_tier(1)[0];

        let mut rng = SeededRandom::new(7);
        let roll = OutcomeResolver::roll_summon(
            &settings,
            &catalog,
            &unlocked,
            &owned,
            settings.pity_threshold,
            &mut rng,
        )
        .unwrap();
        assert!(roll.pity_triggered);
        assert!(roll.was_new);
        assert_eq!(roll.base_id, missing);
        assert_eq!(roll.next_pity_counter, 0);
    }

    #[test]
    fn test_pity_counter_increments_on_duplicates() {
        let settings = summon_settings();
        let catalog = ItemCatalog::standard();
        let owned: BTreeSet<ItemId> = catalog
            .items_at_tier(1)
            .iter()
            .chain(catalog.items_at_tier(2))
            .copied()
            .collect();
        let mut rng = SeededRandom::new(1);
        let roll = OutcomeResolver::roll_summon(&settings, &catalog, &[1, 2], &owned, 3, &mut rng).unwrap();
        assert!(!roll.was_new);
        assert_eq!(roll.next_pity_counter, 4);

        // Complete collection: counter holds at the threshold.
        let roll = OutcomeResolver::roll_summon(
            &settings,
            &catalog,
            &[1, 2],
            &owned,
            settings.pity_threshold,
            &mut rng,
        )
        .unwrap();
        assert!(!roll.pity_triggered);
        assert_eq!(roll.next_pity_counter, settings.pity_threshold);
    }

    #[test]
    fn test_empirical_tier_frequencies() {
        let settings = summon_settings();
        let dist = OutcomeResolver::tier_distribution(&settings, &[1, 2, 3]);
        let mut rng = SeededRandom::new(99);
        let mut counts: BTreeMap<Tier, u32> = BTreeMap::new();
        let draws = 100_000;
        for _ in 0..draws {
            let tier = OutcomeResolver::draw_tier(&dist, &mut rng).unwrap();
            *counts.entry(tier).or_insert(0) += 1;
        }
        for (tier, p) in &dist {
            let observed = f64::from(counts[tier]) / f64::from(draws);
            println!("tier {tier}: expected {p:.4}, observed {observed:.4}");
            assert!((observed - p).abs() < 0.01);
        }
    }
}
