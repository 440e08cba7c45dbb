//! # Ledger
//!
//! The only code that changes a currency balance.
//!
//! All three primitives run inside a caller's [`StoreTransaction`] on rows
//! the caller has already locked. They neither lock nor commit, and they
//! do not journal: the orchestrator that owns the transaction does.
//!
//! ## Grant order
//!
//! ```text
//! modified = floor(amount × Π factors)
//! new      = min(old + modified, cap)      // excess is dropped, not carried
//! ```

use crate::account::PlayerId;
use crate::config::Tunables;
use crate::currency::{CurrencyCaps, CurrencyKind};
use crate::error::{EconomyError, EconomyResult};
use crate::fixed_point::FixedPoint;
use crate::store::StoreTransaction;

/// One balance mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BalanceChange {
    /// Player whose balance changed.
    pub player: PlayerId,
    /// Currency.
    pub kind: CurrencyKind,
    /// Balance before.
    pub old: u64,
    /// Balance after.
    pub new: u64,
    /// Amount dropped by the cap.
    pub clipped: u64,
}

impl BalanceChange {
    /// Signed change, saturated to the `i64` range.
    #[must_use]
    pub fn delta(&self) -> i64 {
        let delta = i128::from(self.new) - i128::from(self.old);
        i64::try_from(delta).unwrap_or(if delta < 0 { i64::MIN } else { i64::MAX })
    }
}

/// Balance primitives with the caps in force for one operation.
#[derive(Clone, Copy, Debug)]
pub struct Ledger {
    caps: CurrencyCaps,
}

impl Ledger {
    /// Ledger with explicit caps.
    #[must_use]
    pub const fn new(caps: CurrencyCaps) -> Self {
        Self { caps }
    }

    /// Ledger with the caps currently configured.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if a cap is malformed.
    pub fn load(tunables: &Tunables<'_>) -> EconomyResult<Self> {
        Ok(Self::new(tunables.currency_caps()?))
    }

    /// Caps in force.
    #[must_use]
    pub const fn caps(&self) -> &CurrencyCaps {
        &self.caps
    }

    fn ensure_active(tx: &StoreTransaction<'_>, player: PlayerId) -> EconomyResult<()> {
        if tx.player(player)?.archived {
            return Err(EconomyError::invalid(format!("{player} is archived")));
        }
        Ok(())
    }

    /// Adds `floor(amount × Π factors)` and clips to the cap.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the row is not locked or archived,
    /// `ArithmeticOverflow` if an uncapped balance would overflow.
    pub fn grant(
        &self,
        tx: &mut StoreTransaction<'_>,
        player: PlayerId,
        kind: CurrencyKind,
        amount: u64,
        factors: &[FixedPoint],
    ) -> EconomyResult<BalanceChange> {
        Self::ensure_active(tx, player)?;
        let modified = FixedPoint::product(factors)?
            .mul_floor(amount)
            .ok_or(EconomyError::ArithmeticOverflow)?;

        let account = tx.player_mut(player)?;
        let old = account.balances[kind];
        let raw = old.checked_add(modified);
        let new = match (raw, self.caps.cap(kind)) {
            (Some(raw), _) => self.caps.clip(kind, raw),
            // Overflow past a cap still lands on the cap.
            (None, Some(cap)) => cap.max(old),
            (None, None) => return Err(EconomyError::ArithmeticOverflow),
        };
        account.balances[kind] = new;

        Ok(BalanceChange {
            player,
            kind,
            old,
            new,
            clipped: modified.saturating_sub(new.saturating_sub(old)),
        })
    }

    /// Removes exactly `amount`, or nothing.
    ///
    /// # Errors
    ///
    /// `InsufficientResources` if `amount` exceeds the balance;
    /// `InvalidOperation` if the row is not locked or archived.
    pub fn consume(
        &self,
        tx: &mut StoreTransaction<'_>,
        player: PlayerId,
        kind: CurrencyKind,
        amount: u64,
    ) -> EconomyResult<BalanceChange> {
        Self::ensure_active(tx, player)?;
        let account = tx.player_mut(player)?;
        let old = account.balances[kind];
        let new = old
            .checked_sub(amount)
            .ok_or_else(|| EconomyError::insufficient(kind.as_str(), amount, old))?;
        account.balances[kind] = new;

        Ok(BalanceChange {
            player,
            kind,
            old,
            new,
            clipped: 0,
        })
    }

    /// Consume on `from`, then an unmodified grant on `to`.
    ///
    /// Both rows must already be locked, in ascending id order.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for self-transfers or unlocked rows, otherwise as
    /// [`Self::consume`] and [`Self::grant`].
    pub fn transfer(
        &self,
        tx: &mut StoreTransaction<'_>,
        from: PlayerId,
        to: PlayerId,
        kind: CurrencyKind,
        amount: u64,
    ) -> EconomyResult<(BalanceChange, BalanceChange)> {
        if from == to {
            return Err(EconomyError::invalid("cannot transfer to the same player"));
        }
        // Both rows checked before either is touched.
        tx.player(from)?;
        Self::ensure_active(tx, to)?;

        let debit = self.consume(tx, from, kind, amount)?;
        let credit = self.grant(tx, to, kind, amount, &[])?;
        Ok((debit, credit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{PlayerAccount, PlayerClass};
    use crate::currency::Balances;
    use crate::journal::TransactionJournal;
    use crate::store::Store;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(200);

    fn store_with(balances: &[(u64, u64)]) -> Store {
        let store = Store::new(Arc::new(TransactionJournal::in_memory()));
        for (id, lumees) in balances {
            store
                .register(
                    PlayerAccount::new(
                        PlayerId(*id),
                        PlayerClass::Wanderer,
                        Balances::zero()
                            .with(CurrencyKind::Lumees, *lumees)
                            .with(CurrencyKind::Grace, 999_000),
                    ),
                    None,
                )
                .unwrap();
        }
        store
    }

    #[test]
    fn test_grant_applies_factors_then_clips() {
        let store = store_with(&[(1, 0)]);
        let ledger = Ledger::new(CurrencyCaps::defaults());
        let mut tx = store.begin(WAIT, None);
        tx.lock_player(PlayerId(1)).unwrap();

        let leader = FixedPoint::from_parts(1, 200_000);
        let class = FixedPoint::from_parts(1, 100_000);
        let change = ledger
            .grant(&mut tx, PlayerId(1), CurrencyKind::Lumees, 1000, &[leader, class])
            .unwrap();
        assert_eq!(change.new, 1320);
        assert_eq!(change.delta(), 1320);

        let grace = ledger
            .grant(&mut tx, PlayerId(1), CurrencyKind::Grace, 5000, &[])
            .unwrap();
        assert_eq!(grace.old, 999_000);
        assert_eq!(grace.new, 999_999);
        assert_eq!(grace.clipped, 4001);
    }

    #[test]
    fn test_consume_is_all_or_nothing() {
        let store = store_with(&[(1, 500)]);
        let ledger = Ledger::new(CurrencyCaps::defaults());
        let mut tx = store.begin(WAIT, None);
        tx.lock_player(PlayerId(1)).unwrap();

        let err = ledger
            .consume(&mut tx, PlayerId(1), CurrencyKind::Lumees, 1000)
            .unwrap_err();
        assert_eq!(err, EconomyError::insufficient("lumees", 1000, 500));
        assert_eq!(tx.player(PlayerId(1)).unwrap().balances[CurrencyKind::Lumees], 500);
    }

    #[test]
    fn test_consume_then_grant_round_trip() {
        let store = store_with(&[(1, 777)]);
        let ledger = Ledger::new(CurrencyCaps::defaults());
        let mut tx = store.begin(WAIT, None);
        tx.lock_player(PlayerId(1)).unwrap();

        ledger.consume(&mut tx, PlayerId(1), CurrencyKind::Lumees, 300).unwrap();
        let back = ledger
            .grant(&mut tx, PlayerId(1), CurrencyKind::Lumees, 300, &[])
            .unwrap();
        assert_eq!(back.new, 777);
    }

    #[test]
    fn test_requires_row_lock() {
        let store = store_with(&[(1, 10)]);
        let ledger = Ledger::new(CurrencyCaps::defaults());
        let mut tx = store.begin(WAIT, None);
        assert!(matches!(
            ledger.grant(&mut tx, PlayerId(1), CurrencyKind::Lumees, 1, &[]),
            Err(EconomyError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_transfer() {
        let store = store_with(&[(1, 100), (2, 0)]);
        let ledger = Ledger::new(CurrencyCaps::defaults());
        let mut tx = store.begin(WAIT, None);
        tx.lock_players(&[PlayerId(2), PlayerId(1)]).unwrap();

        let (debit, credit) = ledger
            .transfer(&mut tx, PlayerId(1), PlayerId(2), CurrencyKind::Lumees, 60)
            .unwrap();
        assert_eq!(debit.new, 40);
        assert_eq!(credit.new, 60);

        assert!(ledger
            .transfer(&mut tx, PlayerId(1), PlayerId(1), CurrencyKind::Lumees, 1)
            .is_err());
        assert!(matches!(
            ledger.transfer(&mut tx, PlayerId(1), PlayerId(2), CurrencyKind::Lumees, 41),
            Err(EconomyError::InsufficientResources { .. })
        ));
    }

    #[test]
    fn test_archived_account_rejected() {
        let store = store_with(&[(1, 100)]);
        let ledger = Ledger::new(CurrencyCaps::defaults());
        let mut tx = store.begin(WAIT, None);
        tx.lock_player(PlayerId(1)).unwrap();
        tx.player_mut(PlayerId(1)).unwrap().archived = true;
        assert!(ledger
            .consume(&mut tx, PlayerId(1), CurrencyKind::Lumees, 1)
            .is_err());
    }
}
