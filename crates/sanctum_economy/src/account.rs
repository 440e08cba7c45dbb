//! # Player Accounts and Collectible Stacks
//!
//! Row types stored by [`crate::store::Store`]. Accounts are never deleted,
//! only archived. A stack whose quantity reaches zero stays as a row but
//! is logically absent.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::currency::Balances;

/// Stable player identifier. Ascending id order is the global lock order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player:{}", self.0)
    }
}

/// Collectible stack identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StackId(pub u64);

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack:{}", self.0)
    }
}

/// Base item identifier (catalogue key).
pub type ItemId = u32;

/// Collectible tier, 1-based.
pub type Tier = u8;

/// Player class. Drives grant modifiers and summon cost factors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerClass {
    /// No class bonus configured by default.
    #[default]
    Wanderer,
    /// Favoured on lumee income.
    Invoker,
    /// Favoured on summon costs.
    Oracle,
    /// Favoured on grace income.
    Warden,
}

impl PlayerClass {
    /// Every class.
    pub const ALL: [Self; 4] = [Self::Wanderer, Self::Invoker, Self::Oracle, Self::Warden];

    /// Config name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wanderer => "wanderer",
            Self::Invoker => "invoker",
            Self::Oracle => "oracle",
            Self::Warden => "warden",
        }
    }
}

/// Element tag carried by collectibles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Element {
    Fire,
    Water,
    Earth,
    Wind,
    Light,
    Dark,
}

/// Lifetime activity counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounters {
    /// Fusion attempts committed.
    pub fusions_attempted: u64,
    /// Fusion attempts that produced the next tier.
    pub fusions_succeeded: u64,
    /// Individual summons (units, not batches).
    pub summons_performed: u64,
}

/// A player's economic state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerAccount {
    /// Identity.
    pub id: PlayerId,
    /// Level, gates summon tiers.
    pub level: u32,
    /// Class tag.
    pub class: PlayerClass,
    /// Currency balances.
    pub balances: Balances,
    /// Summons since the last unowned item.
    pub pity_counter: u32,
    /// Fusion shards per tier.
    pub fusion_shards: BTreeMap<Tier, u64>,
    /// Activity counters.
    pub counters: ActivityCounters,
    /// Bumped on every committed mutation.
    pub version: u64,
    /// Time of the last committed mutation.
    pub updated_at: SystemTime,
    /// Soft-archived accounts reject mutations.
    pub archived: bool,
}

impl PlayerAccount {
    /// Creates a fresh account.
    #[must_use]
    pub fn new(id: PlayerId, class: PlayerClass, balances: Balances) -> Self {
        Self {
            id,
            level: 1,
            class,
            balances,
            pity_counter: 0,
            fusion_shards: BTreeMap::new(),
            counters: ActivityCounters::default(),
            version: 0,
            updated_at: SystemTime::now(),
            archived: false,
        }
    }

    /// Sets the level.
    #[must_use]
    pub const fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    /// Shards held for a tier.
    #[must_use]
    pub fn shards(&self, tier: Tier) -> u64 {
        self.fusion_shards.get(&tier).copied().unwrap_or(0)
    }
}

/// N identical copies of a (base item, tier) pair owned by one player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectibleStack {
    /// Row id.
    pub id: StackId,
    /// Owning player.
    pub owner: PlayerId,
    /// Base item.
    pub base_id: ItemId,
    /// Tier.
    pub tier: Tier,
    /// Copies held.
    pub quantity: u32,
    /// Element tag.
    pub element: Element,
}

impl CollectibleStack {
    /// Zero-quantity stacks are logically absent.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.quantity == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::CurrencyKind;

    #[test]
    fn test_new_account_defaults() {
        let account = PlayerAccount::new(
            PlayerId(7),
            PlayerClass::Oracle,
            Balances::zero().with(CurrencyKind::Lumees, 5000),
        )
        .with_level(20);

        assert_eq!(account.level, 20);
        assert_eq!(account.version, 0);
        assert_eq!(account.shards(3), 0);
        assert!(!account.archived);
        assert_eq!(account.balances[CurrencyKind::Lumees], 5000);
    }

    #[test]
    fn test_player_order_is_numeric() {
        let mut ids = vec![PlayerId(30), PlayerId(4), PlayerId(12)];
        ids.sort();
        assert_eq!(ids, vec![PlayerId(4), PlayerId(12), PlayerId(30)]);
    }
}
