//! # Economy Configuration
//!
//! Every tunable comes from an injected [`ConfigProvider`], read at call
//! time. Nothing in the engine holds a value past the end of one operation,
//! so a provider that changes underneath (hot reload in the host) is seen by
//! the next operation.
//!
//! ## Required vs. defaulted keys
//!
//! Keys that feed cost or probability math have **no default**: a missing
//! `fusion.success_rate` must fail the operation, never turn into a 100%
//! success. Caps, lock timeouts, batch limits and retention fall back to
//! documented defaults.
//!
//! ```text
//! currency.<kind>.cap            [lumees/gems: uncapped, grace: 999999]
//! player.starting.<kind>         [0]
//! modifiers.class.<class>.<kind> [1.0]
//! modifiers.summon_cost.<class>  [1.0]
//! lock.hold_ms / lock.wait_ms    [10000 / 2000]
//! fusion.cost.{base,multiplier,cap}          required
//! fusion.success_rate   (tier -> percent)    required
//! fusion.shards.{min,max,guarantee}          required
//! fusion.required_count / fusion.max_tier    [2 / 12]
//! summon.{decay,top_rate,pity_threshold,cost} required
//! summon.unlock_levels  (tier -> level)      required
//! summon.max_batch / summon.currency         [10 / grace]
//! journal.summon_granularity                 [batch]
//! journal.retention_days                     [90]
//! events.capacity / events.max_backlog       [1024 / 65536]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use parking_lot::RwLock;
use tracing::debug;

use crate::account::{PlayerClass, Tier};
use crate::currency::{Balances, CurrencyCaps, CurrencyKind};
use crate::error::{EconomyError, EconomyResult};
use crate::fixed_point::FixedPoint;

/// A single configured value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigValue {
    /// Whole number.
    Integer(i64),
    /// Decimal with six places.
    Decimal(FixedPoint),
    /// Free text.
    Text(String),
    /// Table keyed by small integers (tiers, levels).
    Table(BTreeMap<u32, ConfigValue>),
}

impl ConfigValue {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Table(_) => "table",
        }
    }
}

/// Source of named tunables.
///
/// Read-only from the engine's point of view.
pub trait ConfigProvider: Send + Sync {
    /// Looks up a dotted key such as `fusion.cost.base`.
    fn value(&self, key: &str) -> Option<ConfigValue>;
}

// =============================================================================
// Typed reader
// =============================================================================

/// Typed view over a provider.
#[derive(Clone, Copy)]
pub struct Tunables<'a> {
    provider: &'a dyn ConfigProvider,
}

impl<'a> Tunables<'a> {
    /// Wraps a provider.
    #[must_use]
    pub fn new(provider: &'a dyn ConfigProvider) -> Self {
        Self { provider }
    }

    fn required(&self, key: &str) -> EconomyResult<ConfigValue> {
        self.provider
            .value(key)
            .ok_or_else(|| EconomyError::ConfigurationMissing(key.to_string()))
    }

    fn mismatch(key: &str, want: &str, got: &ConfigValue) -> EconomyError {
        EconomyError::InvalidConfig(format!("{key}: expected {want}, found {}", got.kind_name()))
    }

    fn as_unsigned(key: &str, value: &ConfigValue) -> EconomyResult<u64> {
        match value {
            ConfigValue::Integer(v) => u64::try_from(*v).map_err(|_| {
                EconomyError::InvalidConfig(format!("{key}: {v} must not be negative"))
            }),
            other => Err(Self::mismatch(key, "integer", other)),
        }
    }

    fn as_decimal(key: &str, value: &ConfigValue) -> EconomyResult<FixedPoint> {
        match value {
            ConfigValue::Decimal(v) => Ok(*v),
            ConfigValue::Integer(v) => u64::try_from(*v)
                .map(FixedPoint::from_whole)
                .map_err(|_| EconomyError::InvalidConfig(format!("{key}: {v} must not be negative"))),
            ConfigValue::Text(s) => s.parse(),
            other @ ConfigValue::Table(_) => Err(Self::mismatch(key, "decimal", other)),
        }
    }

    /// Required non-negative integer.
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` if absent, `InvalidConfig` if not a
    /// non-negative integer.
    pub fn unsigned(&self, key: &str) -> EconomyResult<u64> {
        Self::as_unsigned(key, &self.required(key)?)
    }

    /// Non-negative integer with a default.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if present but malformed.
    pub fn unsigned_or(&self, key: &str, default: u64) -> EconomyResult<u64> {
        match self.provider.value(key) {
            Some(value) => Self::as_unsigned(key, &value),
            None => Ok(default),
        }
    }

    /// Required decimal. Integers are accepted as whole decimals.
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` if absent, `InvalidConfig` if malformed.
    pub fn decimal(&self, key: &str) -> EconomyResult<FixedPoint> {
        Self::as_decimal(key, &self.required(key)?)
    }

    /// Decimal with a default.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if present but malformed.
    pub fn decimal_or(&self, key: &str, default: FixedPoint) -> EconomyResult<FixedPoint> {
        match self.provider.value(key) {
            Some(value) => Self::as_decimal(key, &value),
            None => Ok(default),
        }
    }

    /// Text with a default.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if present but not text.
    pub fn text_or(&self, key: &str, default: &str) -> EconomyResult<String> {
        match self.provider.value(key) {
            Some(ConfigValue::Text(s)) => Ok(s),
            Some(other) => Err(Self::mismatch(key, "text", &other)),
            None => Ok(default.to_string()),
        }
    }

    fn table(&self, key: &str) -> EconomyResult<BTreeMap<u32, ConfigValue>> {
        match self.required(key)? {
            ConfigValue::Table(table) if !table.is_empty() => Ok(table),
            ConfigValue::Table(_) => Err(EconomyError::InvalidConfig(format!("{key}: empty table"))),
            other => Err(Self::mismatch(key, "table", &other)),
        }
    }

    fn tier_of(key: &str, raw: u32) -> EconomyResult<Tier> {
        Tier::try_from(raw)
            .ok()
            .filter(|t| *t >= 1)
            .ok_or_else(|| EconomyError::InvalidConfig(format!("{key}: {raw} is not a tier")))
    }

    /// Required tier table of non-negative integers.
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` if absent, `InvalidConfig` if empty or malformed.
    pub fn tier_table_unsigned(&self, key: &str) -> EconomyResult<BTreeMap<Tier, u64>> {
        self.table(key)?
            .iter()
            .map(|(tier, value)| -> EconomyResult<(Tier, u64)> {
                Ok((Self::tier_of(key, *tier)?, Self::as_unsigned(key, value)?))
            })
            .collect()
    }

    /// Required tier table of decimals.
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` if absent, `InvalidConfig` if empty or malformed.
    pub fn tier_table_decimal(&self, key: &str) -> EconomyResult<BTreeMap<Tier, FixedPoint>> {
        self.table(key)?
            .iter()
            .map(|(tier, value)| -> EconomyResult<(Tier, FixedPoint)> {
                Ok((Self::tier_of(key, *tier)?, Self::as_decimal(key, value)?))
            })
            .collect()
    }

    /// Currency caps. An explicit `"none"` removes a default cap.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if a cap is malformed.
    pub fn currency_caps(&self) -> EconomyResult<CurrencyCaps> {
        let mut caps = CurrencyCaps::defaults();
        for kind in CurrencyKind::ALL {
            let key = format!("currency.{}.cap", kind.as_str());
            match self.provider.value(&key) {
                None => {}
                Some(ConfigValue::Text(t)) if t.eq_ignore_ascii_case("none") => {
                    caps = caps.with_cap(kind, None);
                }
                Some(value) => {
                    caps = caps.with_cap(kind, Some(Self::as_unsigned(&key, &value)?));
                }
            }
        }
        Ok(caps)
    }

    /// Starting balances for new players.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if a value is malformed.
    pub fn starting_balances(&self) -> EconomyResult<Balances> {
        let mut balances = Balances::zero();
        for kind in CurrencyKind::ALL {
            balances[kind] = self.unsigned_or(&format!("player.starting.{}", kind.as_str()), 0)?;
        }
        Ok(balances)
    }

    /// Grant modifier for a class and currency. Defaults to 1.0.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if malformed.
    pub fn class_modifier(&self, class: PlayerClass, kind: CurrencyKind) -> EconomyResult<FixedPoint> {
        self.decimal_or(
            &format!("modifiers.class.{}.{}", class.as_str(), kind.as_str()),
            FixedPoint::ONE,
        )
    }

    /// Summon cost factor for a class. Defaults to 1.0.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if malformed.
    pub fn summon_cost_modifier(&self, class: PlayerClass) -> EconomyResult<FixedPoint> {
        self.decimal_or(&format!("modifiers.summon_cost.{}", class.as_str()), FixedPoint::ONE)
    }
}

// =============================================================================
// In-memory provider
// =============================================================================

/// In-memory provider. Values can be replaced at runtime.
#[derive(Debug, Default)]
pub struct StaticConfig {
    values: RwLock<HashMap<String, ConfigValue>>,
}

impl StaticConfig {
    /// Empty provider: every required key is missing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference tuning used by the simulator and tests.
    #[must_use]
    pub fn game_defaults() -> Self {
        let success_rate: BTreeMap<u32, ConfigValue> = [75, 70, 65, 60, 55, 50, 45, 40, 35, 30, 25]
            .iter()
            .zip(1u32..)
            .map(|(percent, tier)| (tier, ConfigValue::Integer(*percent)))
            .collect();
        let unlock_levels: BTreeMap<u32, ConfigValue> = [(1, 1), (2, 1), (3, 10), (4, 20), (5, 35), (6, 50)]
            .iter()
            .map(|(tier, level)| (*tier, ConfigValue::Integer(*level)))
            .collect();

        Self::new()
            .with_integer("player.starting.lumees", 10_000)
            .with_integer("player.starting.grace", 1_000)
            .with_integer("fusion.cost.base", 1_000)
            .with_decimal("fusion.cost.multiplier", FixedPoint::from_parts(2, 200_000))
            .with_integer("fusion.cost.cap", 10_000_000)
            .with_table("fusion.success_rate", success_rate)
            .with_integer("fusion.shards.min", 1)
            .with_integer("fusion.shards.max", 3)
            .with_integer("fusion.shards.guarantee", 10)
            .with_decimal("summon.decay", FixedPoint::from_parts(0, 750_000))
            .with_decimal("summon.top_rate", FixedPoint::from_parts(0, 400_000))
            .with_table("summon.unlock_levels", unlock_levels)
            .with_integer("summon.pity_threshold", 25)
            .with_integer("summon.cost", 250)
            .with_decimal("modifiers.class.invoker.lumees", FixedPoint::from_parts(1, 100_000))
            .with_decimal("modifiers.class.warden.grace", FixedPoint::from_parts(1, 100_000))
            .with_decimal("modifiers.summon_cost.oracle", FixedPoint::from_parts(0, 900_000))
    }

    /// Adds an integer.
    #[must_use]
    pub fn with_integer(self, key: &str, value: i64) -> Self {
        self.set(key, ConfigValue::Integer(value));
        self
    }

    /// Adds a decimal.
    #[must_use]
    pub fn with_decimal(self, key: &str, value: FixedPoint) -> Self {
        self.set(key, ConfigValue::Decimal(value));
        self
    }

    /// Adds text.
    #[must_use]
    pub fn with_text(self, key: &str, value: &str) -> Self {
        self.set(key, ConfigValue::Text(value.to_string()));
        self
    }

    /// Adds a table.
    #[must_use]
    pub fn with_table(self, key: &str, table: BTreeMap<u32, ConfigValue>) -> Self {
        self.set(key, ConfigValue::Table(table));
        self
    }

    /// Replaces a value in place.
    pub fn set(&self, key: &str, value: ConfigValue) {
        self.values.write().insert(key.to_string(), value);
    }

    /// Removes a value in place.
    pub fn remove(&self, key: &str) -> Option<ConfigValue> {
        self.values.write().remove(key)
    }
}

impl ConfigProvider for StaticConfig {
    fn value(&self, key: &str) -> Option<ConfigValue> {
        self.values.read().get(key).cloned()
    }
}

// =============================================================================
// TOML provider
// =============================================================================

/// Provider backed by a TOML document.
///
/// Nested tables flatten into dotted keys. A table whose keys are all
/// integers (`[fusion.success_rate]` with `1 = 75`) becomes a
/// [`ConfigValue::Table`].
#[derive(Debug, Clone)]
pub struct TomlConfig {
    values: HashMap<String, ConfigValue>,
}

impl TomlConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on syntax errors or unsupported value types.
    pub fn parse(source: &str) -> EconomyResult<Self> {
        let root: toml::Table = toml::from_str(source)
            .map_err(|e| EconomyError::InvalidConfig(format!("failed to parse config TOML: {e}")))?;

        let mut values = HashMap::new();
        flatten("", &root, &mut values)?;
        debug!(keys = values.len(), "loaded economy config");
        Ok(Self { values })
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// `Storage` if the file cannot be read, `InvalidConfig` if it does not parse.
    pub fn load(path: &Path) -> EconomyResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EconomyError::Storage(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Number of flattened keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the document held no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ConfigProvider for TomlConfig {
    fn value(&self, key: &str) -> Option<ConfigValue> {
        self.values.get(key).cloned()
    }
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut HashMap<String, ConfigValue>) -> EconomyResult<()> {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            toml::Value::Table(inner) if is_numbered(inner) => {
                let mut numbered = BTreeMap::new();
                for (n, v) in inner {
                    let index: u32 = n
                        .parse()
                        .map_err(|_| EconomyError::InvalidConfig(format!("{key}: bad index {n}")))?;
                    numbered.insert(index, scalar(&key, v)?);
                }
                out.insert(key, ConfigValue::Table(numbered));
            }
            toml::Value::Table(inner) => flatten(&key, inner, out)?,
            other => {
                let converted = scalar(&key, other)?;
                out.insert(key, converted);
            }
        }
    }
    Ok(())
}

fn is_numbered(table: &toml::Table) -> bool {
    !table.is_empty() && table.keys().all(|k| k.parse::<u32>().is_ok())
}

fn scalar(key: &str, value: &toml::Value) -> EconomyResult<ConfigValue> {
    match value {
        toml::Value::Integer(v) => Ok(ConfigValue::Integer(*v)),
        toml::Value::Float(v) => Ok(ConfigValue::Decimal(FixedPoint::from_f64(*v)?)),
        toml::Value::String(s) => Ok(ConfigValue::Text(s.clone())),
        other => Err(EconomyError::InvalidConfig(format!(
            "{key}: unsupported {} value",
            other.type_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_key_missing() {
        let config = StaticConfig::new();
        let tunables = Tunables::new(&config);
        assert_eq!(
            tunables.unsigned("fusion.cost.base"),
            Err(EconomyError::ConfigurationMissing("fusion.cost.base".into()))
        );
        assert_eq!(tunables.unsigned_or("lock.hold_ms", 10_000), Ok(10_000));
    }

    #[test]
    fn test_negative_integer_rejected() {
        let config = StaticConfig::new().with_integer("summon.cost", -5);
        let tunables = Tunables::new(&config);
        assert!(matches!(tunables.unsigned("summon.cost"), Err(EconomyError::InvalidConfig(_))));
    }

    #[test]
    fn test_decimal_accepts_integer_and_text() {
        let config = StaticConfig::new()
            .with_integer("a", 3)
            .with_text("b", "1.25");
        let tunables = Tunables::new(&config);
        assert_eq!(tunables.decimal("a").unwrap(), FixedPoint::from_whole(3));
        assert_eq!(tunables.decimal("b").unwrap(), FixedPoint::from_parts(1, 250_000));
    }

    #[test]
    fn test_values_are_read_live() {
        let config = StaticConfig::game_defaults();
        let tunables = Tunables::new(&config);
        assert_eq!(tunables.unsigned("summon.cost").unwrap(), 250);

        config.set("summon.cost", ConfigValue::Integer(300));
        assert_eq!(tunables.unsigned("summon.cost").unwrap(), 300);
    }

    #[test]
    fn test_currency_caps_override() {
        let config = StaticConfig::new()
            .with_integer("currency.lumees.cap", 50_000)
            .with_text("currency.grace.cap", "none");
        let caps = Tunables::new(&config).currency_caps().unwrap();
        assert_eq!(caps.cap(CurrencyKind::Lumees), Some(50_000));
        assert_eq!(caps.cap(CurrencyKind::Grace), None);
        assert_eq!(caps.cap(CurrencyKind::Gems), None);
    }

    #[test]
    fn test_toml_flattening() {
        let source = r#"
            [fusion.cost]
            base = 1000
            multiplier = 2.2
            cap = 5000000

            [fusion.success_rate]
            1 = 75
            2 = 70.5

            [journal]
            summon_granularity = "unit"
        "#;
        let config = TomlConfig::parse(source).unwrap();
        let tunables = Tunables::new(&config);

        assert_eq!(tunables.unsigned("fusion.cost.base").unwrap(), 1000);
        assert_eq!(
            tunables.decimal("fusion.cost.multiplier").unwrap(),
            FixedPoint::from_parts(2, 200_000)
        );
        let rates = tunables.tier_table_decimal("fusion.success_rate").unwrap();
        assert_eq!(rates[&1], FixedPoint::from_whole(75));
        assert_eq!(rates[&2], FixedPoint::from_parts(70, 500_000));
        assert_eq!(tunables.text_or("journal.summon_granularity", "batch").unwrap(), "unit");
    }

    #[test]
    fn test_toml_rejects_booleans() {
        assert!(TomlConfig::parse("flag = true").is_err());
    }
}
