//! Benchmark for the transactional path.
//!
//! Measures a full lock → mutate → journal → commit cycle through the
//! engine, plus contended transfers between two players.
//!
//! Run with: cargo bench --package sanctum_economy --bench ledger_benchmark

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sanctum_economy::{
    CurrencyKind, CurrencyRequest, EconomyEngine, PlayerClass, PlayerId, StaticConfig,
};

fn engine_with_players(players: u64) -> EconomyEngine {
    let engine = match EconomyEngine::new(Arc::new(StaticConfig::game_defaults())) {
        Ok(engine) => engine,
        Err(err) => panic!("engine: {err}"),
    };
    for id in 1..=players {
        if let Err(err) = engine.register_player(PlayerId(id), PlayerClass::Wanderer, 1) {
            panic!("register: {err}");
        }
    }
    engine
}

fn benchmark_grant_consume(c: &mut Criterion) {
    let engine = engine_with_players(1);
    let grant = CurrencyRequest::new(PlayerId(1), CurrencyKind::Lumees, 10);
    let consume = CurrencyRequest::new(PlayerId(1), CurrencyKind::Lumees, 10);

    c.bench_function("grant_then_consume", |b| {
        b.iter(|| {
            black_box(engine.grant_currency(&grant).ok());
            black_box(engine.consume_currency(&consume).ok());
        });
    });
}

fn benchmark_transfer(c: &mut Criterion) {
    let engine = engine_with_players(2);

    c.bench_function("transfer_round_trip", |b| {
        b.iter(|| {
            black_box(engine.transfer_currency(PlayerId(1), PlayerId(2), CurrencyKind::Lumees, 5).ok());
            black_box(engine.transfer_currency(PlayerId(2), PlayerId(1), CurrencyKind::Lumees, 5).ok());
        });
    });
}

criterion_group!(benches, benchmark_grant_consume, benchmark_transfer);
criterion_main!(benches);
