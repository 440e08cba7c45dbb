//! # Currencies
//!
//! The closed set of currency kinds and the per-player balance sheet.
//!
//! | Kind | Role | Default cap |
//! |---|---|---|
//! | `Lumees` | soft currency, fusion costs | uncapped |
//! | `Grace` | premium-lite, summon costs | 999,999 |
//! | `Gems` | premium | uncapped |
//!
//! Caps are data: the default lives on the kind, the live value comes from
//! config (`currency.<kind>.cap`).

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// A currency kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyKind {
    /// Primary soft currency.
    Lumees,
    /// Capped premium-lite currency.
    Grace,
    /// Uncapped premium currency.
    Gems,
}

impl CurrencyKind {
    /// Every kind, in balance-sheet order.
    pub const ALL: [Self; 3] = [Self::Lumees, Self::Grace, Self::Gems];

    /// Number of kinds.
    pub const COUNT: usize = Self::ALL.len();

    /// Config/journal name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lumees => "lumees",
            Self::Grace => "grace",
            Self::Gems => "gems",
        }
    }

    /// Cap used when `currency.<kind>.cap` is absent. `None` is uncapped.
    #[must_use]
    pub const fn default_cap(self) -> Option<u64> {
        match self {
            Self::Grace => Some(999_999),
            Self::Lumees | Self::Gems => None,
        }
    }

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CurrencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Balances for every currency kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances([u64; CurrencyKind::COUNT]);

impl Balances {
    /// All zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0; CurrencyKind::COUNT])
    }

    /// Builder-style setter.
    #[must_use]
    pub const fn with(mut self, kind: CurrencyKind, amount: u64) -> Self {
        self.0[kind.index()] = amount;
        self
    }

    /// Balance of one kind.
    #[inline]
    #[must_use]
    pub const fn get(&self, kind: CurrencyKind) -> u64 {
        self.0[kind.index()]
    }

    /// Iterates `(kind, balance)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (CurrencyKind, u64)> + '_ {
        CurrencyKind::ALL.iter().map(move |k| (*k, self.get(*k)))
    }
}

impl Index<CurrencyKind> for Balances {
    type Output = u64;

    fn index(&self, kind: CurrencyKind) -> &u64 {
        &self.0[kind.index()]
    }
}

impl IndexMut<CurrencyKind> for Balances {
    fn index_mut(&mut self, kind: CurrencyKind) -> &mut u64 {
        &mut self.0[kind.index()]
    }
}

/// Live caps for one operation, resolved from config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurrencyCaps([Option<u64>; CurrencyKind::COUNT]);

impl CurrencyCaps {
    /// The built-in caps.
    #[must_use]
    pub fn defaults() -> Self {
        let mut caps = [None; CurrencyKind::COUNT];
        for kind in CurrencyKind::ALL {
            caps[kind.index()] = kind.default_cap();
        }
        Self(caps)
    }

    /// Overrides one cap.
    #[must_use]
    pub const fn with_cap(mut self, kind: CurrencyKind, cap: Option<u64>) -> Self {
        self.0[kind.index()] = cap;
        self
    }

    /// Cap for a kind, `None` if uncapped.
    #[inline]
    #[must_use]
    pub const fn cap(&self, kind: CurrencyKind) -> Option<u64> {
        self.0[kind.index()]
    }

    /// Clips a balance to the kind's cap.
    #[inline]
    #[must_use]
    pub fn clip(&self, kind: CurrencyKind, balance: u64) -> u64 {
        self.cap(kind).map_or(balance, |cap| balance.min(cap))
    }
}
