//! # SANCTUM Economy
//!
//! Resource transactions and probabilistic outcomes for SANCTUM.
//!
//! ## Design Principles
//!
//! 1. **No negative balances** - consumes are all-or-nothing, grants clip to caps
//! 2. **Two lock tiers** - a per-player advisory lock, then pessimistic row locks
//! 3. **All-or-nothing operations** - every mutation commits once or not at all
//! 4. **Everything audited** - each commit appends immutable journal entries
//! 5. **Injected tuning** - costs, rates and thresholds are read per operation
//!
//! ## Layers
//!
//! ```text
//! EconomyEngine ── FusionOrchestrator / SummonOrchestrator
//!       │                   │
//!       │          OutcomeResolver (pure math + RandomSource)
//!       │                   │
//!       └── Ledger ── Store / StoreTransaction ── TransactionJournal ── JournalFile
//!                        │
//!                   LockTable (rows)        LockCoordinator (advisory)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sanctum_economy::{EconomyEngine, PlayerClass, PlayerId, StaticConfig};
//!
//! let engine = EconomyEngine::new(Arc::new(StaticConfig::game_defaults()))?;
//! engine.register_player(PlayerId(1), PlayerClass::Invoker, 1)?;
//!
//! let summon = engine.perform_summon(PlayerId(1), 1)?;
//! let fusion = engine.attempt_fusion(PlayerId(1), summon.items[0].stack);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
#![allow(clippy::module_name_repetitions)]

pub mod account;
pub mod catalog;
pub mod config;
pub mod currency;
pub mod engine;
pub mod error;
pub mod events;
pub mod fixed_point;
pub mod fusion;
pub mod journal;
pub mod journal_file;
pub mod ledger;
pub mod lock;
pub mod outcome;
pub mod rng;
pub mod store;
pub mod summon;

pub use account::{CollectibleStack, Element, ItemId, PlayerAccount, PlayerClass, PlayerId, StackId, Tier};
pub use catalog::{CatalogItem, ItemCatalog};
pub use config::{ConfigProvider, ConfigValue, StaticConfig, TomlConfig, Tunables};
pub use currency::{Balances, CurrencyCaps, CurrencyKind};
pub use engine::{CurrencyRequest, EconomyEngine, EngineBuilder};
pub use error::{EconomyError, EconomyResult};
pub use events::{EventBus, EventId, EventReceiver, IdempotentConsumer, OutcomeEvent, OutcomePayload};
pub use fixed_point::FixedPoint;
pub use fusion::{FusionOrchestrator, FusionResult};
pub use journal::{EntryId, JournalEntry, JournalKind, TransactionJournal};
pub use ledger::{BalanceChange, Ledger};
pub use lock::{InMemoryLockCoordinator, LockCoordinator, LockHandle, LockKey};
pub use outcome::{FusionSettings, OutcomeResolver, SummonSettings};
pub use rng::{secure_factory, RandomSource, RngFactory, SecureRandom, SeededRandom, SequenceRandom};
pub use store::{Store, StoreTransaction};
pub use summon::{SummonOrchestrator, SummonResult, SummonedItem};
