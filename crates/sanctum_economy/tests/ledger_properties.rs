//! Ledger invariants exercised through the engine.

use std::sync::Arc;
use std::thread;

use sanctum_economy::{
    CurrencyKind, CurrencyRequest, EconomyEngine, EconomyError, JournalKind, PlayerClass, PlayerId,
    RandomSource, SeededRandom, StaticConfig,
};

const GRACE_CAP: u64 = 999_999;

fn engine_with(config: StaticConfig) -> EconomyEngine {
    EconomyEngine::new(Arc::new(config)).unwrap()
}

#[test]
fn test_random_grants_and_consumes_keep_invariants() {
    let engine = engine_with(StaticConfig::game_defaults());
    engine.register_player(PlayerId(1), PlayerClass::Warden, 1).unwrap();
    let mut rng = SeededRandom::new(0xC0FFEE);

    let mut rejected = 0;
    for _ in 0..2_000 {
        let kind = if rng.below(2) == 0 {
            CurrencyKind::Lumees
        } else {
            CurrencyKind::Grace
        };
        let amount = rng.range_inclusive(1, 200_000);
        let request = CurrencyRequest::new(PlayerId(1), kind, amount);

        if rng.below(2) == 0 {
            engine.grant_currency(&request).unwrap();
        } else {
            match engine.consume_currency(&request) {
                Ok(_) => {}
                Err(EconomyError::InsufficientResources { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        let account = engine.account(PlayerId(1)).unwrap();
        assert!(account.balances[CurrencyKind::Grace] <= GRACE_CAP);
    }
    println!("rejected consumes: {rejected}");

    // Committed balances equal the journal's net deltas.
    let account = engine.account(PlayerId(1)).unwrap();
    let net = engine.journal().net_deltas(PlayerId(1));
    for kind in [CurrencyKind::Lumees, CurrencyKind::Grace] {
        let journaled = net.get(&kind).copied().unwrap_or(0);
        assert_eq!(i64::try_from(account.balances[kind]).unwrap(), journaled);
    }
}

#[test]
fn test_consume_then_grant_restores_balance() {
    let engine = engine_with(StaticConfig::game_defaults());
    engine.register_player(PlayerId(1), PlayerClass::Wanderer, 1).unwrap();
    let before = engine.account(PlayerId(1)).unwrap().balances;

    for amount in [1, 17, 999, 10_000] {
        let request = CurrencyRequest::new(PlayerId(1), CurrencyKind::Lumees, amount);
        engine.consume_currency(&request).unwrap();
        engine.grant_currency(&request).unwrap();
        assert_eq!(engine.account(PlayerId(1)).unwrap().balances, before);
    }
}

#[test]
fn test_insufficient_consume_leaves_no_trace() {
    let engine = engine_with(StaticConfig::game_defaults().with_integer("player.starting.lumees", 500));
    engine.register_player(PlayerId(1), PlayerClass::Wanderer, 1).unwrap();
    let journal_before = engine.journal().len();

    let err = engine
        .consume_currency(&CurrencyRequest::new(PlayerId(1), CurrencyKind::Lumees, 1000))
        .unwrap_err();

    assert_eq!(
        err,
        EconomyError::InsufficientResources {
            resource: "lumees".into(),
            required: 1000,
            available: 500,
        }
    );
    assert_eq!(engine.account(PlayerId(1)).unwrap().balances[CurrencyKind::Lumees], 500);
    assert_eq!(engine.journal().len(), journal_before);
    assert!(engine
        .journal()
        .entries_for_player_kind(PlayerId(1), JournalKind::Consume)
        .is_empty());
    assert!(!err.is_retryable());
}

#[test]
fn test_capped_grant_clips_without_rollover() {
    let engine = engine_with(StaticConfig::game_defaults());
    engine.register_player(PlayerId(1), PlayerClass::Wanderer, 1).unwrap();

    let change = engine
        .grant_currency(&CurrencyRequest::new(PlayerId(1), CurrencyKind::Grace, 5_000_000))
        .unwrap();
    assert_eq!(change.new, GRACE_CAP);
    assert_eq!(change.clipped, 5_000_000 - (GRACE_CAP - 1000));

    // Already at the cap: the grant commits but changes nothing.
    let change = engine
        .grant_currency(&CurrencyRequest::new(PlayerId(1), CurrencyKind::Grace, 10))
        .unwrap();
    assert_eq!(change.delta(), 0);
}

#[test]
fn test_opposite_transfers_do_not_deadlock() {
    let engine = Arc::new(engine_with(StaticConfig::game_defaults()));
    engine.register_player(PlayerId(1), PlayerClass::Wanderer, 1).unwrap();
    engine.register_player(PlayerId(2), PlayerClass::Wanderer, 1).unwrap();

    let rounds = 200;
    let handles: Vec<_> = [(PlayerId(1), PlayerId(2)), (PlayerId(2), PlayerId(1))]
        .into_iter()
        .map(|(from, to)| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..rounds {
                    engine
                        .transfer_currency(from, to, CurrencyKind::Lumees, 25)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for id in [PlayerId(1), PlayerId(2)] {
        assert_eq!(engine.account(id).unwrap().balances[CurrencyKind::Lumees], 10_000);
    }
    assert_eq!(
        engine.journal().entries_of_kind(JournalKind::Transfer).len(),
        2 * 2 * rounds
    );
}

#[test]
fn test_self_transfer_rejected() {
    let engine = engine_with(StaticConfig::game_defaults());
    engine.register_player(PlayerId(1), PlayerClass::Wanderer, 1).unwrap();
    assert!(matches!(
        engine.transfer_currency(PlayerId(1), PlayerId(1), CurrencyKind::Lumees, 1),
        Err(EconomyError::InvalidOperation(_))
    ));
}
