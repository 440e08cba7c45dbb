//! # Economy Simulation
//!
//! Registers a population of players, runs summon batches and fusions
//! against a tunables file, and prints outcome statistics.
//!
//! ```text
//! economy_sim [CONFIG] [CATALOG] [--players N] [--seed S]
//! ```
//!
//! Defaults: `data/economy.toml`, `data/catalog.toml`, 200 players, secure
//! randomness. A seed switches to a reproducible ChaCha8 stream per
//! operation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use sanctum_economy::{
    secure_factory, CurrencyKind, CurrencyRequest, EconomyEngine, EconomyError, EconomyResult,
    ItemCatalog, JournalKind, PlayerClass, PlayerId, RandomSource, RngFactory, SeededRandom, Tier,
    TomlConfig,
};

struct Options {
    config: PathBuf,
    catalog: PathBuf,
    players: u64,
    seed: Option<u64>,
}

impl Options {
    fn parse() -> EconomyResult<Self> {
        let mut options = Self {
            config: PathBuf::from("data/economy.toml"),
            catalog: PathBuf::from("data/catalog.toml"),
            players: 200,
            seed: None,
        };
        let mut positional = 0;
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut number = |flag: &str| -> EconomyResult<u64> {
                args.next()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| EconomyError::invalid(format!("{flag} expects a number")))
            };
            match arg.as_str() {
                "--players" => options.players = number("--players")?,
                "--seed" => options.seed = Some(number("--seed")?),
                path if positional == 0 => {
                    options.config = PathBuf::from(path);
                    positional += 1;
                }
                path if positional == 1 => {
                    options.catalog = PathBuf::from(path);
                    positional += 1;
                }
                other => return Err(EconomyError::invalid(format!("unexpected argument '{other}'"))),
            }
        }
        Ok(options)
    }
}

#[derive(Default)]
struct Report {
    summons: u64,
    pity_triggers: u64,
    new_items: u64,
    fusions: BTreeMap<Tier, (u64, u64, u64)>,
    rejected: BTreeMap<&'static str, u64>,
}

fn rng_factory(seed: Option<u64>) -> RngFactory {
    match seed {
        Some(seed) => {
            let counter = Arc::new(AtomicU64::new(seed));
            Arc::new(move || {
                Box::new(SeededRandom::new(counter.fetch_add(1, Ordering::Relaxed))) as Box<dyn RandomSource>
            })
        }
        None => secure_factory(),
    }
}

fn rejection_label(error: &EconomyError) -> &'static str {
    match error {
        EconomyError::InsufficientResources { .. } => "insufficient resources",
        EconomyError::LockTimeout { .. } => "lock timeout",
        EconomyError::InvalidOperation(_) => "invalid operation",
        EconomyError::ConcurrentModification { .. } => "concurrent modification",
        EconomyError::DeadlineExceeded => "deadline exceeded",
        _ => "other",
    }
}

fn simulate(engine: &EconomyEngine, players: u64) -> EconomyResult<Report> {
    let mut report = Report::default();

    for n in 1..=players {
        let player = PlayerId(n);
        let class = PlayerClass::ALL[usize::try_from(n).unwrap_or_default() % PlayerClass::ALL.len()];
        engine.register_player(player, class, 1 + u32::try_from(n % 60).unwrap_or_default())?;
        engine.grant_currency(
            &CurrencyRequest::new(player, CurrencyKind::Grace, 5_000).with_reason("simulation stipend"),
        )?;
        engine.grant_currency(
            &CurrencyRequest::new(player, CurrencyKind::Lumees, 200_000).with_reason("simulation stipend"),
        )?;

        loop {
            match engine.perform_summon(player, 10) {
                Ok(result) => {
                    report.summons += result.items.len() as u64;
                    report.pity_triggers += result.items.iter().filter(|i| i.pity_triggered).count() as u64;
                    report.new_items += result.items.iter().filter(|i| i.was_new).count() as u64;
                }
                Err(err) => {
                    *report.rejected.entry(rejection_label(&err)).or_default() += 1;
                    break;
                }
            }
        }

        // Fuse the lowest fusable stack until nothing fusable remains.
        loop {
            let Some(stack) = engine
                .stacks_of(player)
                .into_iter()
                .filter(|s| s.quantity >= 2)
                .min_by_key(|s| s.tier)
            else {
                break;
            };
            match engine.attempt_fusion(player, stack.id) {
                Ok(result) => {
                    let entry = report.fusions.entry(result.tier).or_default();
                    entry.0 += 1;
                    if result.success {
                        entry.1 += 1;
                    }
                    if result.guaranteed {
                        entry.2 += 1;
                    }
                }
                Err(err) => {
                    *report.rejected.entry(rejection_label(&err)).or_default() += 1;
                    break;
                }
            }
        }
    }
    Ok(report)
}

fn run() -> EconomyResult<()> {
    let options = Options::parse()?;
    let config = TomlConfig::load(&options.config)?;
    let catalog = ItemCatalog::load(&options.catalog)?;

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║              SANCTUM ECONOMY - OUTCOME SIMULATION                ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!("┌─ CONFIGURATION ─────────────────────────────────────────────────┐");
    println!("│ Tunables:           {} ({} keys)", options.config.display(), config.len());
    println!("│ Catalogue:          {} ({} items)", options.catalog.display(), catalog.len());
    println!("│ Players:            {}", options.players);
    match options.seed {
        Some(seed) => println!("│ Randomness:         seeded ({seed})"),
        None => println!("│ Randomness:         secure"),
    }
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    let engine = EconomyEngine::builder(Arc::new(config))
        .catalog(catalog)
        .rng(rng_factory(options.seed))
        .build()?;

    let start = Instant::now();
    let report = simulate(&engine, options.players)?;
    let elapsed = start.elapsed();

    println!("┌─ SUMMONS ───────────────────────────────────────────────────────┐");
    println!("│ Units:              {}", report.summons);
    println!("│ New items:          {}", report.new_items);
    println!("│ Pity triggers:      {}", report.pity_triggers);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    println!("┌─ FUSION ────────────────────────────────────────────────────────┐");
    println!("│ Tier   Attempts   Successes   Rate      Guaranteed");
    for (tier, (attempts, successes, guaranteed)) in &report.fusions {
        #[allow(clippy::cast_precision_loss)]
        let rate = *successes as f64 / (*attempts).max(1) as f64 * 100.0;
        println!("│ {tier:<6} {attempts:<10} {successes:<11} {rate:>6.2}%   {guaranteed}");
    }
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    let journal = engine.journal();
    println!("┌─ JOURNAL ───────────────────────────────────────────────────────┐");
    println!("│ Entries:            {}", journal.len());
    for kind in [
        JournalKind::Grant,
        JournalKind::Consume,
        JournalKind::FusionAttempt,
        JournalKind::SummonAttempt,
        JournalKind::Transfer,
    ] {
        println!("│ {:<19} {}", format!("{kind:?}:"), journal.entries_of_kind(kind).len());
    }
    println!("│ Purged (retention): {}", engine.purge_journal(SystemTime::now())?);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    println!("┌─ REJECTIONS ────────────────────────────────────────────────────┐");
    for (label, count) in &report.rejected {
        println!("│ {label:<24} {count}");
    }
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();
    println!("Completed in {:.2}s", elapsed.as_secs_f64());
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("economy_sim: {err}");
            ExitCode::FAILURE
        }
    }
}
